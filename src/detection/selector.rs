//! 瞄准目标选择器
//! Aiming target selection
//!
//! - 与画面中心像素距离最小的目标优先
//! - 距离相同时优先上一帧的目标ID
//! - 仍有多个时取横向宽度最大者

use super::types::{AimTarget, StableId, Track};

/// 视为距离相等的容差
const TIE_EPSILON: f64 = 1e-9;

#[derive(Clone, Copy, Debug)]
struct Candidate {
    id: StableId,
    center: (i32, i32),
    dist: f64,
    width: f32,
}

/// 目标选择器,记忆上一帧选中的ID
#[derive(Clone, Debug, Default)]
pub struct TargetSelector {
    previous_target_id: Option<StableId>,
}

impl TargetSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn previous_target_id(&self) -> Option<StableId> {
        self.previous_target_id
    }

    /// 选择本帧的瞄准目标,无目标时返回 None 并清除记忆
    pub fn select(&mut self, tracks: &[Track], image_center: (i32, i32)) -> Option<AimTarget> {
        if tracks.is_empty() {
            self.previous_target_id = None;
            return None;
        }

        let (center_x, center_y) = image_center;
        let candidates: Vec<Candidate> = tracks
            .iter()
            .map(|t| {
                let center = t.bbox.center_px();
                let dx = f64::from(center.0 - center_x);
                let dy = f64::from(center.1 - center_y);
                Candidate {
                    id: t.id,
                    center,
                    dist: dx.hypot(dy),
                    width: t.bbox.width(),
                }
            })
            .collect();

        let min_dist = candidates
            .iter()
            .map(|c| c.dist)
            .fold(f64::INFINITY, f64::min);
        let tie: Vec<Candidate> = candidates
            .into_iter()
            .filter(|c| (c.dist - min_dist).abs() < TIE_EPSILON)
            .collect();

        let chosen = if tie.len() == 1 {
            tie[0]
        } else {
            let sticky: Vec<Candidate> = tie
                .iter()
                .copied()
                .filter(|c| Some(c.id) == self.previous_target_id)
                .collect();
            match sticky.len() {
                1 => sticky[0],
                0 => widest(&tie)?,
                _ => widest(&sticky)?,
            }
        };

        self.previous_target_id = Some(chosen.id);
        Some(AimTarget {
            track_id: chosen.id,
            pixel: chosen.center,
        })
    }
}

/// 宽度最大者;宽度相同时取靠前的一个
fn widest(candidates: &[Candidate]) -> Option<Candidate> {
    candidates.iter().copied().reduce(|best, c| {
        if c.width > best.width {
            c
        } else {
            best
        }
    })
}
