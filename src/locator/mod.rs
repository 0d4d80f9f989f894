use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use futures::future::join_all;
use image::GrayImage;
use tracing::{debug, warn};

use crate::device::Screenshot;
use crate::model::ModelClient;

mod matching;

pub use matching::CvMatch;

/// Which stage produced (or last attempted) a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Template,
    Multiscale,
    Feature,
    SmallModel,
    RemoteModel,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Template => "template",
            Stage::Multiscale => "multiscale",
            Stage::Feature => "feature",
            Stage::SmallModel => "small-model",
            Stage::RemoteModel => "remote-model",
        }
    }
}

/// Strategy forcing for the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// CV stages only; never call a model.
    OpencvOnly,
    /// Model stages only.
    AiOnly,
    /// CV stages first, model stages as fallback.
    #[default]
    OpencvFirst,
}

/// Location answer for one target. Coordinates are absolute device pixels:
/// the vertical crop applied during capture is already added back.
#[derive(Debug, Clone, Copy)]
pub struct LocateResult {
    pub found: bool,
    pub x: i32,
    pub y: i32,
    pub confidence: f32,
    pub stage: Stage,
}

impl LocateResult {
    fn miss(stage: Stage) -> Self {
        Self {
            found: false,
            x: 0,
            y: 0,
            confidence: 0.0,
            stage,
        }
    }
}

/// What to look for: reference image variants, or a free-text description
/// that only the model stages can resolve.
#[derive(Debug, Clone)]
pub enum LocateTarget {
    Reference {
        name: String,
        candidates: Vec<PathBuf>,
    },
    Description(String),
}

impl LocateTarget {
    pub fn display(&self) -> &str {
        match self {
            LocateTarget::Reference { name, .. } => name,
            LocateTarget::Description(desc) => desc,
        }
    }
}

/// Acceptance thresholds for the CV stages.
const T_TEMPLATE: f32 = 0.75;
const T_MULTISCALE: f32 = 0.70;
const MIN_INLIERS: usize = 4;

/// Hybrid element locator. Stage order per target is fixed
/// (template → multiscale → feature → small model → remote model) with
/// short-circuit on success; multi-target calls fan the independent
/// pipelines out concurrently.
pub struct Locator {
    model: Arc<ModelClient>,
}

impl Locator {
    pub fn new(model: Arc<ModelClient>) -> Self {
        Self { model }
    }

    /// Locate one target on a screenshot.
    pub async fn locate(
        &self,
        shot: &Screenshot,
        target: &LocateTarget,
        strategy: Strategy,
    ) -> LocateResult {
        let screen = match decode_gray(&shot.png) {
            Some(img) => Arc::new(img),
            None => {
                warn!("screenshot failed to decode; locator returns not-found");
                return LocateResult::miss(Stage::Template);
            }
        };
        self.locate_prepared(shot, &screen, target, strategy).await
    }

    /// Locate several named targets concurrently. The result map preserves
    /// target names; each pipeline is independent.
    pub async fn locate_many(
        &self,
        shot: &Screenshot,
        targets: Vec<(String, LocateTarget)>,
        strategy: Strategy,
    ) -> HashMap<String, LocateResult> {
        let screen = match decode_gray(&shot.png) {
            Some(img) => Arc::new(img),
            None => {
                warn!("screenshot failed to decode; all targets not-found");
                return targets
                    .into_iter()
                    .map(|(name, _)| (name, LocateResult::miss(Stage::Template)))
                    .collect();
            }
        };

        let futures = targets.into_iter().map(|(name, target)| {
            let screen = Arc::clone(&screen);
            async move {
                let result = self
                    .locate_prepared(shot, &screen, &target, strategy)
                    .await;
                (name, result)
            }
        });
        join_all(futures).await.into_iter().collect()
    }

    async fn locate_prepared(
        &self,
        shot: &Screenshot,
        screen: &Arc<GrayImage>,
        target: &LocateTarget,
        strategy: Strategy,
    ) -> LocateResult {
        let mut cv_miss_stage = Stage::Template;

        // CV stages: only for reference targets, and not under ai_only.
        if strategy != Strategy::AiOnly {
            if let LocateTarget::Reference { name, candidates } = target {
                match self.run_cv_stages(screen, candidates).await {
                    Ok(Some(mut result)) => {
                        result.y += shot.crop_top as i32;
                        debug!(
                            "located '{}' at ({}, {}) via {} ({:.2})",
                            name,
                            result.x,
                            result.y,
                            result.stage.as_str(),
                            result.confidence
                        );
                        return result;
                    }
                    Ok(None) => cv_miss_stage = Stage::Feature,
                    Err(stage) => cv_miss_stage = stage,
                }
            }
        }

        if strategy == Strategy::OpencvOnly {
            return LocateResult::miss(cv_miss_stage);
        }

        // Model stages. A stage's internal error is not fatal; it falls
        // through to the next stage.
        let shot_b64 = base64::engine::general_purpose::STANDARD.encode(&shot.png);

        if self.model.has_local_vision() {
            let hint = target_hint(target);
            match self.model.locate_local(&hint, &shot_b64).await {
                Ok(b) if b.found => {
                    let (x, y) = b.center_px(shot.width, shot.height);
                    return LocateResult {
                        found: true,
                        x,
                        y: y + shot.crop_top as i32,
                        confidence: b.confidence,
                        stage: Stage::SmallModel,
                    };
                }
                Ok(_) => debug!("small model did not find '{}'", target.display()),
                Err(e) => debug!("small model stage error: {e}"),
            }
        }

        let (reference_b64, description) = match target {
            LocateTarget::Reference { candidates, .. } => {
                let encoded = candidates
                    .first()
                    .and_then(|p| std::fs::read(p).ok())
                    .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes));
                (encoded, None)
            }
            LocateTarget::Description(desc) => (None, Some(desc.as_str())),
        };
        match self
            .model
            .locate_remote(reference_b64.as_deref(), description, &shot_b64)
            .await
        {
            Ok(b) if b.found => {
                let (x, y) = b.center_px(shot.width, shot.height);
                LocateResult {
                    found: true,
                    x,
                    y: y + shot.crop_top as i32,
                    confidence: b.confidence,
                    stage: Stage::RemoteModel,
                }
            }
            Ok(b) => {
                debug!(
                    "remote model did not find '{}': {}",
                    target.display(),
                    b.reason.as_deref().unwrap_or("no reason")
                );
                LocateResult::miss(Stage::RemoteModel)
            }
            Err(e) => {
                warn!("remote locate stage error for '{}': {e}", target.display());
                LocateResult::miss(Stage::RemoteModel)
            }
        }
    }

    /// Stages 1–3 over every candidate variant, off the async executor.
    /// `Err(stage)` reports where an internal error stopped the CV pass;
    /// `Ok(None)` is a clean miss.
    async fn run_cv_stages(
        &self,
        screen: &Arc<GrayImage>,
        candidates: &[PathBuf],
    ) -> Result<Option<LocateResult>, Stage> {
        let screen = Arc::clone(screen);
        let candidates = candidates.to_vec();
        let outcome = tokio::task::spawn_blocking(move || {
            let templates: Vec<GrayImage> = candidates
                .iter()
                .filter_map(|path| {
                    std::fs::read(path)
                        .ok()
                        .and_then(|bytes| decode_gray(&bytes))
                })
                .collect();
            if templates.is_empty() {
                return None;
            }

            // Stage 1: exact template match, best over variants.
            for template in &templates {
                if let Some(hit) = matching::template_match(&screen, template) {
                    if hit.confidence >= T_TEMPLATE {
                        return Some(to_result(hit, Stage::Template));
                    }
                }
            }
            // Stage 2: multi-scale.
            for template in &templates {
                if let Some(hit) = matching::multiscale_match(&screen, template) {
                    if hit.confidence >= T_MULTISCALE {
                        return Some(to_result(hit, Stage::Multiscale));
                    }
                }
            }
            // Stage 3: feature points.
            for template in &templates {
                if let Some(hit) = matching::feature_match(&screen, template, MIN_INLIERS) {
                    return Some(to_result(hit, Stage::Feature));
                }
            }
            None
        })
        .await;

        match outcome {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!("cv matching task failed: {e}");
                Err(Stage::Feature)
            }
        }
    }
}

fn to_result(hit: CvMatch, stage: Stage) -> LocateResult {
    LocateResult {
        found: true,
        x: hit.x as i32,
        y: hit.y as i32,
        confidence: hit.confidence,
        stage,
    }
}

/// Human-readable hint for the small-model stage, derived from the
/// reference name when there is no free-text description.
fn target_hint(target: &LocateTarget) -> String {
    match target {
        LocateTarget::Reference { name, .. } => name.replace(['_', '-'], " "),
        LocateTarget::Description(desc) => desc.clone(),
    }
}

fn decode_gray(bytes: &[u8]) -> Option<GrayImage> {
    image::load_from_memory(bytes).ok().map(|img| img.to_luma8())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmConfig, ProviderConfig};
    use image::Luma;
    use std::time::Duration;

    fn test_model() -> Arc<ModelClient> {
        // Points at nothing; only CV paths run in these tests.
        Arc::new(ModelClient::new(
            LlmConfig {
                primary: ProviderConfig {
                    provider: "openai".into(),
                    api_url: "http://127.0.0.1:1".into(),
                    api_key: String::new(),
                    model: "test".into(),
                },
                max_tokens: 64,
                temperature: 0.0,
                timeout: Duration::from_millis(50),
                local_vision: None,
            },
            None,
        ))
    }

    fn synthetic_shot(pattern_at: (u32, u32), dir: &std::path::Path) -> (Screenshot, PathBuf) {
        let pattern = GrayImage::from_fn(40, 40, |x, y| {
            if x == y || (x / 8 + y / 8) % 2 == 0 {
                Luma([230u8])
            } else {
                Luma([20u8])
            }
        });
        let mut screen = GrayImage::from_pixel(240, 320, Luma([128u8]));
        image::imageops::overlay(
            &mut screen,
            &pattern,
            pattern_at.0.into(),
            pattern_at.1.into(),
        );

        let mut png = Vec::new();
        image::DynamicImage::ImageLuma8(screen)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let template_path = dir.join("target_icon.png");
        image::DynamicImage::ImageLuma8(pattern)
            .save(&template_path)
            .unwrap();

        (
            Screenshot {
                png,
                width: 240,
                height: 320,
                crop_top: 50,
            },
            template_path,
        )
    }

    #[tokio::test]
    async fn template_stage_hits_and_translates_crop() {
        let dir = tempfile::tempdir().unwrap();
        let (shot, template) = synthetic_shot((60, 100), dir.path());
        let locator = Locator::new(test_model());

        let target = LocateTarget::Reference {
            name: "target_icon".into(),
            candidates: vec![template],
        };
        let result = locator.locate(&shot, &target, Strategy::OpencvOnly).await;
        assert!(result.found);
        assert_eq!(result.stage, Stage::Template);
        // Center (80, 120) in cropped coords, +50 crop offset on y.
        assert!((result.x - 80).abs() <= 2);
        assert!((result.y - 170).abs() <= 2);
    }

    #[tokio::test]
    async fn missing_reference_is_clean_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (shot, _) = synthetic_shot((60, 100), dir.path());
        let locator = Locator::new(test_model());

        let target = LocateTarget::Reference {
            name: "nonexistent".into(),
            candidates: vec![dir.path().join("missing.png")],
        };
        let result = locator.locate(&shot, &target, Strategy::OpencvOnly).await;
        assert!(!result.found);
    }

    #[tokio::test]
    async fn multi_target_preserves_names() {
        let dir = tempfile::tempdir().unwrap();
        let (shot, template) = synthetic_shot((60, 100), dir.path());
        let locator = Locator::new(test_model());

        let targets = vec![
            (
                "icon".to_string(),
                LocateTarget::Reference {
                    name: "target_icon".into(),
                    candidates: vec![template],
                },
            ),
            (
                "ghost".to_string(),
                LocateTarget::Reference {
                    name: "ghost".into(),
                    candidates: vec![dir.path().join("ghost.png")],
                },
            ),
        ];
        let results = locator
            .locate_many(&shot, targets, Strategy::OpencvOnly)
            .await;
        assert_eq!(results.len(), 2);
        assert!(results["icon"].found);
        assert!(!results["ghost"].found);
    }

    #[tokio::test]
    async fn dynamic_target_skips_cv_under_opencv_only() {
        let dir = tempfile::tempdir().unwrap();
        let (shot, _) = synthetic_shot((60, 100), dir.path());
        let locator = Locator::new(test_model());

        let target = LocateTarget::Description("the send button".into());
        let result = locator.locate(&shot, &target, Strategy::OpencvOnly).await;
        assert!(!result.found);
    }
}
