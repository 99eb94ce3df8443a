//! ByteTrack 算法实现
//! ByteTrack: Simple and effective multi-object tracking
//!
//! 核心思想:
//! 1. 高低分检测框分开处理
//! 2. 高分框优先匹配 (IOU)
//! 3. 低分框救援丢失的轨迹
//! 4. 纯运动模型,无需外观特征

use super::tracker::{ExternalTrack, KalmanBoxFilter, MotionTracker};
use super::types::{BBox, Detection};
use crate::config::{KalmanConfig, TrackerConfig};

/// ByteTrack 内部轨迹句柄
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ByteTrackHandle(u32);

#[derive(Clone, Debug)]
struct ByteTrack {
    handle: ByteTrackHandle,

    /// 卡尔曼滤波平滑后的边界框
    bbox: BBox,

    kalman: KalmanBoxFilter,

    /// 连续丢失帧数
    frames_lost: u32,
}

impl ByteTrack {
    fn new(handle: ByteTrackHandle, bbox: &BBox, kalman: &KalmanConfig) -> Self {
        let kalman = KalmanBoxFilter::new(bbox, kalman);
        Self {
            handle,
            bbox: kalman.state_bbox(),
            kalman,
            frames_lost: 0,
        }
    }

    fn predict(&mut self) {
        self.kalman.predict();
        self.bbox = self.kalman.state_bbox();
    }

    fn update(&mut self, bbox: &BBox) {
        self.kalman.update(bbox);
        self.bbox = self.kalman.state_bbox();
        self.frames_lost = 0;
    }

    fn mark_lost(&mut self) {
        self.frames_lost += 1;
    }
}

/// ByteTrack 追踪器
pub struct ByteTracker {
    tracks: Vec<ByteTrack>,

    next_handle: u32,

    /// 最大允许丢失帧数
    max_lost_frames: u32,

    /// 丢失不超过此帧数的轨迹才会输出
    output_max_lost: u32,

    high_score_threshold: f32,

    /// 低分检测阈值 (用于救援)
    low_score_threshold: f32,

    high_iou_threshold: f32,
    low_iou_threshold: f32,

    kalman: KalmanConfig,
}

impl ByteTracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            tracks: Vec::new(),
            next_handle: 1,
            max_lost_frames: config.max_lost_frames,
            output_max_lost: config.output_max_lost,
            high_score_threshold: config.high_score_threshold,
            low_score_threshold: config.low_score_threshold,
            high_iou_threshold: config.high_iou_threshold,
            low_iou_threshold: config.low_iou_threshold,
            kalman: config.kalman.clone(),
        }
    }

    /// 当前轨迹数 (含丢失中的轨迹)
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// 更新跟踪 (ByteTrack 三步匹配)
    fn associate(&mut self, detections: &[Detection]) {
        // 1. 所有轨迹先预测
        for track in &mut self.tracks {
            track.predict();
        }

        // 2. 分离高低分检测框
        let mut high_dets: Vec<usize> = Vec::new();
        let mut low_dets: Vec<usize> = Vec::new();
        for (idx, det) in detections.iter().enumerate() {
            if det.score >= self.high_score_threshold {
                high_dets.push(idx);
            } else if det.score >= self.low_score_threshold {
                low_dets.push(idx);
            }
        }

        // 3. 第一轮匹配: 高分检测 + 所有轨迹
        let mut matched_det = vec![false; detections.len()];
        let mut matched_track = vec![false; self.tracks.len()];

        let all_tracks: Vec<usize> = (0..self.tracks.len()).collect();
        let assignments =
            self.match_detections(detections, &high_dets, &all_tracks, self.high_iou_threshold);
        for (det_idx, track_idx) in assignments {
            matched_det[det_idx] = true;
            matched_track[track_idx] = true;
            self.tracks[track_idx].update(&detections[det_idx].bbox);
        }

        // 4. 第二轮匹配: 低分检测 + 未匹配的轨迹 (救援)
        let unmatched_tracks: Vec<usize> = (0..self.tracks.len())
            .filter(|&idx| !matched_track[idx])
            .collect();
        let low_assignments = self.match_detections(
            detections,
            &low_dets,
            &unmatched_tracks,
            self.low_iou_threshold,
        );
        for (det_idx, track_idx) in low_assignments {
            matched_det[det_idx] = true;
            matched_track[track_idx] = true;
            self.tracks[track_idx].update(&detections[det_idx].bbox);
        }

        // 5. 未匹配的轨迹 → 标记丢失
        for (track_idx, &matched) in matched_track.iter().enumerate() {
            if !matched {
                self.tracks[track_idx].mark_lost();
            }
        }

        // 6. 未匹配的高分检测 → 新建轨迹
        for &det_idx in &high_dets {
            if !matched_det[det_idx] {
                let handle = ByteTrackHandle(self.next_handle);
                self.next_handle = self.next_handle.wrapping_add(1);
                self.tracks
                    .push(ByteTrack::new(handle, &detections[det_idx].bbox, &self.kalman));
            }
        }

        // 7. 删除丢失太久的轨迹
        let max_lost = self.max_lost_frames;
        self.tracks.retain(|t| t.frames_lost <= max_lost);
    }

    /// IOU 贪心匹配,返回 (检测索引, 轨迹索引)
    fn match_detections(
        &self,
        detections: &[Detection],
        det_indices: &[usize],
        track_indices: &[usize],
        iou_threshold: f32,
    ) -> Vec<(usize, usize)> {
        if det_indices.is_empty() || track_indices.is_empty() {
            return Vec::new();
        }

        let mut candidates = Vec::new();
        for (local_det, &det_idx) in det_indices.iter().enumerate() {
            for (local_track, &track_idx) in track_indices.iter().enumerate() {
                let predicted = self.tracks[track_idx].kalman.predicted_bbox();
                let iou = detections[det_idx].bbox.iou(&predicted);
                if iou >= iou_threshold {
                    candidates.push((1.0 - iou, det_idx, local_det, track_idx, local_track));
                }
            }
        }

        // 按代价排序
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut assignments = Vec::new();
        let mut used_det = vec![false; det_indices.len()];
        let mut used_track = vec![false; track_indices.len()];
        for (_, det_idx, local_det, track_idx, local_track) in candidates {
            if !used_det[local_det] && !used_track[local_track] {
                assignments.push((det_idx, track_idx));
                used_det[local_det] = true;
                used_track[local_track] = true;
            }
        }
        assignments
    }
}

impl MotionTracker for ByteTracker {
    type Handle = ByteTrackHandle;

    fn step(&mut self, detections: &[Detection]) -> Vec<ExternalTrack<ByteTrackHandle>> {
        self.associate(detections);
        self.tracks
            .iter()
            .filter(|t| t.frames_lost <= self.output_max_lost)
            .map(|t| ExternalTrack {
                handle: t.handle,
                bbox: t.bbox,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, score: f32) -> Detection {
        Detection::new(BBox::new(x, y, x + 60.0, y + 80.0), score, 0)
    }

    #[test]
    fn test_moving_target_keeps_handle() {
        let mut tracker = ByteTracker::new(&TrackerConfig::default());
        let first = tracker.step(&[det(100.0, 100.0, 0.9)]);
        assert_eq!(first.len(), 1);
        let handle = first[0].handle;

        for i in 1..15 {
            let out = tracker.step(&[det(100.0 + i as f32 * 3.0, 100.0, 0.9)]);
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].handle, handle);
        }
    }

    #[test]
    fn test_low_score_detection_rescues_track() {
        let mut tracker = ByteTracker::new(&TrackerConfig::default());
        let handle = tracker.step(&[det(200.0, 200.0, 0.9)])[0].handle;

        // 低分框不会新建轨迹,但可以延续已有轨迹
        let out = tracker.step(&[det(201.0, 200.0, 0.2)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].handle, handle);

        let mut fresh = ByteTracker::new(&TrackerConfig::default());
        assert!(fresh.step(&[det(0.0, 0.0, 0.2)]).is_empty());
    }

    #[test]
    fn test_lost_track_hidden_then_dropped() {
        let config = TrackerConfig {
            max_lost_frames: 3,
            output_max_lost: 0,
            ..TrackerConfig::default()
        };
        let mut tracker = ByteTracker::new(&config);
        tracker.step(&[det(10.0, 10.0, 0.9)]);

        assert!(tracker.step(&[]).is_empty());
        assert_eq!(tracker.track_count(), 1);

        for _ in 0..3 {
            tracker.step(&[]);
        }
        assert_eq!(tracker.track_count(), 0);
    }

    #[test]
    fn test_two_targets_get_distinct_handles() {
        let mut tracker = ByteTracker::new(&TrackerConfig::default());
        let out = tracker.step(&[det(0.0, 0.0, 0.9), det(500.0, 300.0, 0.8)]);
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].handle, out[1].handle);
    }
}
