//! CPU-side matching stages: exact template match, multi-scale template
//! match, and feature-point match with offset voting. All functions operate
//! on grayscale images and return a center point in screenshot coordinates
//! with a confidence score; thresholds live with the caller.

use image::imageops::FilterType;
use image::GrayImage;
use imageproc::corners::corners_fast9;
use imageproc::template_matching::{find_extremes, match_template, MatchTemplateMethod};

/// A candidate hit: center of the matched region in screenshot pixels.
#[derive(Debug, Clone, Copy)]
pub struct CvMatch {
    pub x: u32,
    pub y: u32,
    pub confidence: f32,
}

/// Scale set for the multi-scale stage.
const SCALES: &[f32] = &[0.5, 0.6, 0.7, 0.8, 0.9, 1.0, 1.1, 1.2, 1.3, 1.4, 1.5];

/// FAST corner threshold and per-corner patch radius for the feature stage.
const FAST_THRESHOLD: u8 = 32;
const PATCH_RADIUS: u32 = 8;
const MAX_CORNERS: usize = 12;
/// Offsets within this distance vote for the same placement.
const VOTE_TOLERANCE: i64 = 6;

fn fits(screen: &GrayImage, template: &GrayImage) -> bool {
    template.width() >= 8
        && template.height() >= 8
        && template.width() <= screen.width()
        && template.height() <= screen.height()
}

/// Exact-scale template match. Best normalized cross-correlation response
/// and its center.
pub fn template_match(screen: &GrayImage, template: &GrayImage) -> Option<CvMatch> {
    if !fits(screen, template) {
        return None;
    }
    let response = match_template(
        screen,
        template,
        MatchTemplateMethod::CrossCorrelationNormalized,
    );
    let extremes = find_extremes(&response);
    let (mx, my) = extremes.max_value_location;
    Some(CvMatch {
        x: mx + template.width() / 2,
        y: my + template.height() / 2,
        confidence: extremes.max_value,
    })
}

/// Multi-scale template match across the 0.5–1.5 scale set. Returns the best
/// response over all scales; 1.0 is skipped because the exact stage already
/// covered it.
pub fn multiscale_match(screen: &GrayImage, template: &GrayImage) -> Option<CvMatch> {
    let mut best: Option<CvMatch> = None;
    for &scale in SCALES {
        if (scale - 1.0).abs() < f32::EPSILON {
            continue;
        }
        let w = (template.width() as f32 * scale).round() as u32;
        let h = (template.height() as f32 * scale).round() as u32;
        if w < 8 || h < 8 {
            continue;
        }
        let scaled = image::imageops::resize(template, w, h, FilterType::Triangle);
        if let Some(hit) = template_match(screen, &scaled) {
            if best.map(|b| hit.confidence > b.confidence).unwrap_or(true) {
                best = Some(hit);
            }
        }
    }
    best
}

/// Feature-point match: FAST corners on the template, each corner's patch
/// matched against the screenshot, placements voted by offset agreement.
/// Succeeds when at least `min_inliers` patches agree on one placement.
/// Tolerant of moderate scale drift that defeats whole-template matching.
pub fn feature_match(
    screen: &GrayImage,
    template: &GrayImage,
    min_inliers: usize,
) -> Option<CvMatch> {
    if !fits(screen, template) {
        return None;
    }

    let mut corners = corners_fast9(template, FAST_THRESHOLD);
    if corners.len() < min_inliers {
        return None;
    }
    corners.sort_by(|a, b| b.score.total_cmp(&a.score));
    corners.truncate(MAX_CORNERS);

    // Each corner votes with the template-origin offset its best patch match
    // implies. (found_loc - corner_topleft) is where the template origin
    // would sit on the screen if this corner matched truthfully.
    let mut votes: Vec<(i64, i64, f32)> = Vec::new();
    for corner in &corners {
        let (cx, cy) = (corner.x, corner.y);
        if cx < PATCH_RADIUS
            || cy < PATCH_RADIUS
            || cx + PATCH_RADIUS >= template.width()
            || cy + PATCH_RADIUS >= template.height()
        {
            continue;
        }
        let patch = image::imageops::crop_imm(
            template,
            cx - PATCH_RADIUS,
            cy - PATCH_RADIUS,
            PATCH_RADIUS * 2,
            PATCH_RADIUS * 2,
        )
        .to_image();
        let Some(hit) = template_match(screen, &patch) else {
            continue;
        };
        if hit.confidence < 0.8 {
            continue;
        }
        let origin_x = hit.x as i64 - PATCH_RADIUS as i64 - (cx as i64 - PATCH_RADIUS as i64);
        let origin_y = hit.y as i64 - PATCH_RADIUS as i64 - (cy as i64 - PATCH_RADIUS as i64);
        votes.push((origin_x, origin_y, hit.confidence));
    }

    if votes.len() < min_inliers {
        return None;
    }

    // Modal cluster: the vote with the most agreeing neighbors.
    let mut best_cluster: Option<(usize, i64, i64, f32)> = None;
    for &(ox, oy, _) in &votes {
        let cluster: Vec<_> = votes
            .iter()
            .filter(|&&(vx, vy, _)| (vx - ox).abs() <= VOTE_TOLERANCE && (vy - oy).abs() <= VOTE_TOLERANCE)
            .collect();
        let count = cluster.len();
        if best_cluster.map(|(c, ..)| count > c).unwrap_or(true) {
            let mean_conf =
                cluster.iter().map(|&&(_, _, c)| c).sum::<f32>() / count.max(1) as f32;
            let mean_x = cluster.iter().map(|&&(x, _, _)| x).sum::<i64>() / count as i64;
            let mean_y = cluster.iter().map(|&&(_, y, _)| y).sum::<i64>() / count as i64;
            best_cluster = Some((count, mean_x, mean_y, mean_conf));
        }
    }

    let (count, ox, oy, conf) = best_cluster?;
    if count < min_inliers {
        return None;
    }
    let center_x = ox + template.width() as i64 / 2;
    let center_y = oy + template.height() as i64 / 2;
    if center_x < 0 || center_y < 0 {
        return None;
    }
    Some(CvMatch {
        x: center_x as u32,
        y: center_y as u32,
        confidence: conf,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    /// A screen with a distinctive block pattern pasted at (x, y).
    fn screen_with_pattern(x: u32, y: u32) -> (GrayImage, GrayImage) {
        let pattern = GrayImage::from_fn(40, 40, |px, py| {
            // Checkerboard with a bright diagonal: plenty of corners.
            if px == py || (px / 8 + py / 8) % 2 == 0 {
                Luma([230u8])
            } else {
                Luma([20u8])
            }
        });
        let mut screen = GrayImage::from_pixel(200, 300, Luma([128u8]));
        image::imageops::overlay(&mut screen, &pattern, x.into(), y.into());
        (screen, pattern)
    }

    #[test]
    fn template_match_finds_pasted_pattern() {
        let (screen, pattern) = screen_with_pattern(60, 120);
        let hit = template_match(&screen, &pattern).unwrap();
        assert!(hit.confidence > 0.9, "confidence {}", hit.confidence);
        assert!((hit.x as i32 - 80).abs() <= 2);
        assert!((hit.y as i32 - 140).abs() <= 2);
    }

    #[test]
    fn template_match_rejects_oversized_template() {
        let screen = GrayImage::from_pixel(50, 50, Luma([0u8]));
        let template = GrayImage::from_pixel(80, 80, Luma([0u8]));
        assert!(template_match(&screen, &template).is_none());
    }

    #[test]
    fn multiscale_finds_resized_pattern() {
        let (screen, pattern) = screen_with_pattern(60, 120);
        // Shrink the reference: exact-scale match degrades, multi-scale
        // recovers it by growing the template back.
        let small = image::imageops::resize(&pattern, 32, 32, FilterType::Triangle);
        let hit = multiscale_match(&screen, &small).unwrap();
        assert!(hit.confidence > 0.8, "confidence {}", hit.confidence);
        assert!((hit.x as i32 - 80).abs() <= 6);
        assert!((hit.y as i32 - 140).abs() <= 6);
    }

    #[test]
    fn feature_match_votes_converge_on_pattern() {
        let (screen, pattern) = screen_with_pattern(100, 50);
        let hit = feature_match(&screen, &pattern, 3).unwrap();
        assert!((hit.x as i32 - 120).abs() <= 8);
        assert!((hit.y as i32 - 70).abs() <= 8);
    }

    #[test]
    fn feature_match_fails_on_featureless_template() {
        let screen = GrayImage::from_pixel(200, 200, Luma([128u8]));
        let flat = GrayImage::from_pixel(40, 40, Luma([128u8]));
        assert!(feature_match(&screen, &flat, 3).is_none());
    }
}
