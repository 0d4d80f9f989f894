use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

/// Handler metadata loaded once per app directory at startup.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: String,
    #[serde(rename = "packageId")]
    pub package_id: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub description: String,
}

/// A discovered app module: its metadata plus its on-disk directory (image
/// root, alias table, templates).
#[derive(Debug, Clone)]
pub struct DiscoveredModule {
    pub info: ModuleInfo,
    pub dir: PathBuf,
    /// Task patterns declared by templates in this module, used for the
    /// template component of the routing score.
    pub task_patterns: Vec<String>,
}

/// Name of the fallback handler used when nothing scores high enough.
pub const SYSTEM_MODULE: &str = "system";

/// Minimum routing score; below it the `system` handler takes the task.
const SCORE_FLOOR: f32 = 0.3;

const TEMPLATE_WEIGHT: f32 = 0.5;
const KEYWORD_HIT: f32 = 0.1;
const KEYWORD_EXACT_BONUS: f32 = 0.2;
const KEYWORD_CAP: f32 = 0.4;
const PACKAGE_WEIGHT: f32 = 0.1;

/// Registry of discovered app modules. Immutable after startup; routing is
/// pure scoring over the utterance.
pub struct ModuleRegistry {
    modules: Vec<DiscoveredModule>,
}

impl ModuleRegistry {
    /// Scan `apps_dir` for sub-directories carrying a `manifest.yaml`.
    /// A malformed manifest skips that module rather than failing discovery.
    pub fn discover(apps_dir: &Path) -> Self {
        let mut modules = Vec::new();
        let entries = match std::fs::read_dir(apps_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("apps directory {} unreadable: {}", apps_dir.display(), e);
                return Self { modules };
            }
        };

        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            let manifest = dir.join("manifest.yaml");
            let content = match std::fs::read_to_string(&manifest) {
                Ok(c) => c,
                Err(_) => continue,
            };
            match serde_yaml::from_str::<ModuleInfo>(&content) {
                Ok(info) => {
                    let task_patterns = crate::workflow::load_templates(&dir)
                        .into_iter()
                        .flat_map(|t| t.patterns)
                        .collect();
                    debug!("discovered module '{}' in {}", info.name, dir.display());
                    modules.push(DiscoveredModule {
                        info,
                        dir,
                        task_patterns,
                    });
                }
                Err(e) => warn!("skipping {}: bad manifest: {}", manifest.display(), e),
            }
        }
        modules.sort_by(|a, b| a.info.name.cmp(&b.info.name));
        info!("module registry: {} handler(s) discovered", modules.len());
        Self { modules }
    }

    pub fn from_modules(modules: Vec<DiscoveredModule>) -> Self {
        Self { modules }
    }

    pub fn modules(&self) -> &[DiscoveredModule] {
        &self.modules
    }

    pub fn get(&self, name: &str) -> Option<&DiscoveredModule> {
        self.modules.iter().find(|m| m.info.name == name)
    }

    /// Score one module against an utterance.
    ///
    /// Template patterns are worth 0.5 when any matches; keyword hits add
    /// 0.1 each with a 0.2 exact-match bonus, capped at 0.4; a literal
    /// package-id mention adds 0.1.
    pub fn score(module: &DiscoveredModule, utterance: &str) -> f32 {
        let mut score = 0.0;

        if module
            .task_patterns
            .iter()
            .any(|p| pattern_matches(p, utterance))
        {
            score += TEMPLATE_WEIGHT;
        }

        let mut keyword_score = 0.0f32;
        for keyword in &module.info.keywords {
            if keyword.is_empty() {
                continue;
            }
            if utterance == keyword {
                keyword_score += KEYWORD_HIT + KEYWORD_EXACT_BONUS;
            } else if utterance.contains(keyword.as_str()) {
                keyword_score += KEYWORD_HIT;
            }
        }
        score += keyword_score.min(KEYWORD_CAP);

        if !module.info.package_id.is_empty() && utterance.contains(&module.info.package_id) {
            score += PACKAGE_WEIGHT;
        }

        score
    }

    /// Keyword routing: the best-scoring module name, or `system` when no
    /// score reaches the floor. Used only when type-based routing does not
    /// apply.
    pub fn route_by_keywords(&self, utterance: &str) -> String {
        let mut best: Option<(&DiscoveredModule, f32)> = None;
        for module in &self.modules {
            let score = Self::score(module, utterance);
            debug!("routing score {:.2} for '{}'", score, module.info.name);
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((module, score));
            }
        }
        match best {
            Some((module, score)) if score >= SCORE_FLOOR => module.info.name.clone(),
            _ => SYSTEM_MODULE.to_string(),
        }
    }
}

/// Template patterns are plain regexes; an invalid pattern never matches.
fn pattern_matches(pattern: &str, utterance: &str) -> bool {
    match regex::Regex::new(pattern) {
        Ok(re) => re.is_match(utterance),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, package: &str, keywords: &[&str], patterns: &[&str]) -> DiscoveredModule {
        DiscoveredModule {
            info: ModuleInfo {
                name: name.into(),
                package_id: package.into(),
                keywords: keywords.iter().map(|s| s.to_string()).collect(),
                description: String::new(),
            },
            dir: PathBuf::from("/tmp"),
            task_patterns: patterns.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn registry() -> ModuleRegistry {
        ModuleRegistry::from_modules(vec![
            module(
                "wechat",
                "com.tencent.mm",
                &["微信", "发消息", "朋友圈"],
                &["发.*消息", "发朋友圈"],
            ),
            module("browser", "com.android.chrome", &["浏览器", "网页"], &[]),
        ])
    }

    #[test]
    fn keyword_hit_routes_to_module() {
        let r = registry();
        assert_eq!(r.route_by_keywords("帮我用微信发消息给张三"), "wechat");
    }

    #[test]
    fn template_pattern_counts_half_weight() {
        let r = registry();
        let m = r.get("wechat").unwrap();
        let score = ModuleRegistry::score(m, "发朋友圈说天气不错");
        // template 0.5 + keyword hits (朋友圈, 发消息? no → 朋友圈 only) 0.1
        assert!(score >= 0.6, "score {score}");
    }

    #[test]
    fn exact_keyword_gets_bonus() {
        let r = registry();
        let m = r.get("wechat").unwrap();
        let exact = ModuleRegistry::score(m, "微信");
        let partial = ModuleRegistry::score(m, "微信点一下");
        assert!(exact > partial);
    }

    #[test]
    fn keyword_component_is_capped() {
        let m = module(
            "many",
            "com.example",
            &["a", "b", "c", "d", "e", "f"],
            &[],
        );
        let score = ModuleRegistry::score(&m, "abcdef");
        assert!(score <= KEYWORD_CAP + f32::EPSILON, "score {score}");
    }

    #[test]
    fn package_mention_scores() {
        let r = registry();
        let m = r.get("browser").unwrap();
        let score = ModuleRegistry::score(m, "打开 com.android.chrome");
        assert!((score - PACKAGE_WEIGHT).abs() < f32::EPSILON);
    }

    #[test]
    fn low_scores_fall_back_to_system() {
        let r = registry();
        assert_eq!(r.route_by_keywords("今天星期几"), SYSTEM_MODULE);
    }

    #[test]
    fn discovery_skips_dirs_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("wechat");
        std::fs::create_dir_all(&app).unwrap();
        std::fs::write(
            app.join("manifest.yaml"),
            "name: wechat\npackageId: com.tencent.mm\nkeywords: [微信]\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("not_a_module")).unwrap();

        let registry = ModuleRegistry::discover(dir.path());
        assert_eq!(registry.modules().len(), 1);
        assert_eq!(registry.modules()[0].info.package_id, "com.tencent.mm");
    }
}
