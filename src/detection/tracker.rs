//! 多目标跟踪公共组件
//! Common components for multi-object tracking
//!
//! - `MotionTracker`: 运动关联算法接口 (ByteTrack 等),输出带不透明句柄的轨迹
//! - `Tracker`:       句柄 → 稳定ID 映射 + 逐帧类别投票
//! - `KalmanBoxFilter`: 单个边界框的位置/尺寸平滑

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::time::Instant;

use tracing::{debug, trace};

use super::types::{BBox, Detection, StableId, Track};
use crate::config::{KalmanConfig, TrackerConfig};

// ========== 运动跟踪器接口 ==========

/// 运动跟踪器输出的单条轨迹
#[derive(Clone, Debug, PartialEq)]
pub struct ExternalTrack<H> {
    pub handle: H,
    pub bbox: BBox,
}

/// 多目标运动跟踪器 Trait
///
/// 句柄类型对外不透明,只在 `Tracker` 内部用作映射键。
pub trait MotionTracker {
    type Handle: Eq + Hash + Clone;

    /// 输入当前帧检测,返回当前活跃轨迹
    fn step(&mut self, detections: &[Detection]) -> Vec<ExternalTrack<Self::Handle>>;
}

// ========== 稳定ID跟踪器 ==========

#[derive(Clone, Copy, Debug)]
struct IdEntry {
    id: StableId,
    last_cycle: u64,
}

/// 跟踪器: 把运动跟踪器的句柄换成单调递增的稳定ID,并逐帧投票类别
pub struct Tracker<M: MotionTracker> {
    motion: M,
    ids: HashMap<M::Handle, IdEntry>,
    next_id: u64,
    cycle: u64,
    class_vote_iou: f32,
    max_id_entries: Option<usize>,
}

impl<M: MotionTracker> Tracker<M> {
    pub fn new(motion: M, config: &TrackerConfig) -> Self {
        Self {
            motion,
            ids: HashMap::new(),
            next_id: 1,
            cycle: 0,
            class_vote_iou: config.class_vote_iou,
            max_id_entries: config.max_id_table_entries,
        }
    }

    /// 以当前时间作为观测时刻更新
    pub fn update(&mut self, detections: &[Detection]) -> Vec<Track> {
        self.update_at(detections, Instant::now())
    }

    /// 更新跟踪,`seen_at` 为本帧采集时刻
    pub fn update_at(&mut self, detections: &[Detection], seen_at: Instant) -> Vec<Track> {
        self.cycle += 1;
        let external = self.motion.step(detections);

        let mut emitted: HashSet<StableId> = HashSet::with_capacity(external.len());
        let mut tracks = Vec::with_capacity(external.len());

        for ext in external {
            let id = self.stable_id(&ext.handle);
            // 同一句柄在一帧内重复出现时只输出一次
            if !emitted.insert(id) {
                trace!("跳过重复句柄 {}", id);
                continue;
            }
            tracks.push(Track {
                id,
                bbox: ext.bbox,
                class_id: vote_class(&ext.bbox, detections, self.class_vote_iou),
                last_seen_at: seen_at,
            });
        }

        self.evict_stale();
        tracks
    }

    /// 已分配的稳定ID数量 (映射表大小)
    pub fn id_table_len(&self) -> usize {
        self.ids.len()
    }

    fn stable_id(&mut self, handle: &M::Handle) -> StableId {
        let cycle = self.cycle;
        if let Some(entry) = self.ids.get_mut(handle) {
            entry.last_cycle = cycle;
            return entry.id;
        }

        let id = StableId(self.next_id);
        self.next_id += 1;
        self.ids.insert(
            handle.clone(),
            IdEntry {
                id,
                last_cycle: cycle,
            },
        );
        debug!("🆕 新目标 {}", id);
        id
    }

    /// 映射表超过上限时淘汰最久未出现的句柄 (本帧出现的句柄永不淘汰)
    fn evict_stale(&mut self) {
        let Some(cap) = self.max_id_entries else {
            return;
        };
        if self.ids.len() <= cap {
            return;
        }

        let mut stale: Vec<(M::Handle, u64)> = self
            .ids
            .iter()
            .filter(|(_, e)| e.last_cycle < self.cycle)
            .map(|(h, e)| (h.clone(), e.last_cycle))
            .collect();
        stale.sort_by_key(|(_, last)| *last);

        let excess = self.ids.len() - cap;
        for (handle, _) in stale.into_iter().take(excess) {
            self.ids.remove(&handle);
        }
        debug!("🧹 ID映射表淘汰后剩余 {} 项", self.ids.len());
    }
}

/// 类别投票: IOU最大的检测框超过阈值时采用其类别,否则未知
///
/// IOU相同时取输入顺序靠前的检测框。
pub fn vote_class(bbox: &BBox, detections: &[Detection], iou_threshold: f32) -> Option<u32> {
    let mut best: Option<(f32, u32)> = None;
    for det in detections {
        let iou = bbox.iou(&det.bbox);
        if best.map_or(true, |(b, _)| iou > b) {
            best = Some((iou, det.class_id));
        }
    }
    best.filter(|(iou, _)| *iou > iou_threshold)
        .map(|(_, class_id)| class_id)
}

// ========== 卡尔曼滤波器 ==========

/// 简化卡尔曼滤波器 (用于单个边界框的位置和尺寸平滑)
/// 状态向量: [x_center, y_center, width, height, vx, vy, vw, vh]
#[derive(Clone, Debug)]
pub struct KalmanBoxFilter {
    state: [f32; 8],

    /// 估计误差协方差 (简化为对角阵)
    p: [f32; 8],

    q: f32,
    r: f32,

    /// 每帧保留的速度比例
    velocity_decay: f32,

    /// 静止阈值 (像素/帧)
    stationary_threshold: f32,

    stationary_count: u32,
}

impl KalmanBoxFilter {
    pub fn new(bbox: &BBox, config: &KalmanConfig) -> Self {
        let (cx, cy) = bbox.center();
        Self {
            state: [cx, cy, bbox.width(), bbox.height(), 0.0, 0.0, 0.0, 0.0],
            p: [10.0; 8],
            q: config.process_noise,
            r: config.observation_noise,
            velocity_decay: config.velocity_decay,
            stationary_threshold: config.stationary_threshold,
            stationary_count: 0,
        }
    }

    /// 预测下一帧状态 (匀速运动模型 + 速度衰减)
    pub fn predict(&mut self) {
        let speed = (self.state[4] * self.state[4] + self.state[5] * self.state[5]).sqrt();
        let is_stationary = speed < self.stationary_threshold;

        if is_stationary {
            self.stationary_count += 1;
            // 连续静止3帧后大幅衰减速度
            let decay = if self.stationary_count > 3 {
                0.7
            } else {
                self.velocity_decay
            };
            for v in &mut self.state[4..8] {
                *v *= decay;
            }
        } else {
            self.stationary_count = 0;
            self.state[4] *= self.velocity_decay;
            self.state[5] *= self.velocity_decay;
            self.state[6] *= 0.98; // 尺寸变化更慢
            self.state[7] *= 0.98;
        }

        for i in 0..4 {
            self.state[i] += self.state[i + 4];
        }

        let q_factor = if is_stationary { 0.5 } else { 1.0 };
        for p in &mut self.p {
            *p += self.q * q_factor;
        }
    }

    /// 融合观测值,根据残差自适应调整观测噪声
    pub fn update(&mut self, bbox: &BBox) {
        let (cx, cy) = bbox.center();
        let y = [
            cx - self.state[0],
            cy - self.state[1],
            bbox.width() - self.state[2],
            bbox.height() - self.state[3],
        ];

        let residual_norm = (y[0] * y[0] + y[1] * y[1]).sqrt();
        let adaptive_r = if residual_norm < self.stationary_threshold {
            self.r * 0.3
        } else if residual_norm < 10.0 {
            self.r
        } else {
            // 大幅跳变: 更信任预测值
            self.r * 3.0
        };

        let mut k = [0.0f32; 8];
        for i in 0..8 {
            let r = if i < 4 { adaptive_r } else { adaptive_r * 10.0 };
            k[i] = self.p[i] / (self.p[i] + r);
        }

        for i in 0..4 {
            self.state[i] += k[i] * y[i];
        }

        let velocity_gain = if residual_norm < self.stationary_threshold {
            0.3
        } else {
            1.0
        };
        for i in 0..4 {
            self.state[i + 4] += k[i + 4] * y[i] * velocity_gain;
        }

        for i in 0..8 {
            self.p[i] *= 1.0 - k[i];
        }

        if residual_norm >= self.stationary_threshold {
            self.stationary_count = 0;
        }
    }

    /// 当前状态的边界框
    pub fn state_bbox(&self) -> BBox {
        BBox::from_cxcywh(
            self.state[0],
            self.state[1],
            self.state[2].max(1.0),
            self.state[3].max(1.0),
        )
    }

    /// 预测的边界框 (用于匹配)
    pub fn predicted_bbox(&self) -> BBox {
        BBox::from_cxcywh(
            self.state[0] + self.state[4],
            self.state[1] + self.state[5],
            (self.state[2] + self.state[6]).max(1.0),
            (self.state[3] + self.state[7]).max(1.0),
        )
    }

    pub fn velocity(&self) -> (f32, f32) {
        (self.state[4], self.state[5])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// 脚本化运动跟踪器: 每次 step 按顺序返回预设的轨迹
    struct Scripted {
        frames: Vec<Vec<ExternalTrack<String>>>,
        cursor: usize,
    }

    impl Scripted {
        fn new(frames: Vec<Vec<(&str, BBox)>>) -> Self {
            let frames = frames
                .into_iter()
                .map(|f| {
                    f.into_iter()
                        .map(|(h, bbox)| ExternalTrack {
                            handle: h.to_string(),
                            bbox,
                        })
                        .collect()
                })
                .collect();
            Self { frames, cursor: 0 }
        }
    }

    impl MotionTracker for Scripted {
        type Handle = String;

        fn step(&mut self, _detections: &[Detection]) -> Vec<ExternalTrack<String>> {
            let out = self.frames.get(self.cursor).cloned().unwrap_or_default();
            self.cursor += 1;
            out
        }
    }

    fn bbox(x: f32) -> BBox {
        BBox::new(x, 0.0, x + 10.0, 10.0)
    }

    #[test]
    fn test_stable_ids_follow_handles() {
        let motion = Scripted::new(vec![
            vec![("a9f", bbox(0.0)), ("77c", bbox(50.0))],
            vec![("77c", bbox(52.0))],
            vec![("e01", bbox(90.0)), ("a9f", bbox(3.0))],
        ]);
        let mut tracker = Tracker::new(motion, &TrackerConfig::default());

        let t1 = tracker.update(&[]);
        assert_eq!(t1[0].id, StableId(1));
        assert_eq!(t1[1].id, StableId(2));

        let t2 = tracker.update(&[]);
        assert_eq!(t2.len(), 1);
        assert_eq!(t2[0].id, StableId(2));

        let t3 = tracker.update(&[]);
        assert_eq!(t3[0].id, StableId(3));
        assert_eq!(t3[1].id, StableId(1));
        assert_eq!(tracker.id_table_len(), 3);
    }

    #[test]
    fn test_duplicate_handle_emitted_once() {
        let motion = Scripted::new(vec![vec![("x", bbox(0.0)), ("x", bbox(1.0))]]);
        let mut tracker = Tracker::new(motion, &TrackerConfig::default());
        let tracks = tracker.update(&[]);
        assert_eq!(tracks.len(), 1);
    }

    #[test]
    fn test_class_vote_above_threshold() {
        let track_box = BBox::new(0.0, 0.0, 10.0, 10.0);
        let dets = [
            Detection::new(BBox::new(100.0, 100.0, 110.0, 110.0), 0.9, 4),
            Detection::new(BBox::new(1.0, 0.0, 11.0, 10.0), 0.8, 7),
        ];
        assert_eq!(vote_class(&track_box, &dets, 0.3), Some(7));
    }

    #[test]
    fn test_class_vote_below_threshold_is_unknown() {
        let track_box = BBox::new(0.0, 0.0, 10.0, 10.0);
        // IOU = 25 / 175 < 0.3
        let dets = [Detection::new(BBox::new(5.0, 5.0, 15.0, 15.0), 0.9, 2)];
        assert_eq!(vote_class(&track_box, &dets, 0.3), None);
        assert_eq!(vote_class(&track_box, &[], 0.3), None);
    }

    #[test]
    fn test_class_vote_tie_takes_first_detection() {
        let track_box = BBox::new(0.0, 0.0, 10.0, 10.0);
        let dets = [
            Detection::new(track_box, 0.5, 1),
            Detection::new(track_box, 0.9, 2),
        ];
        assert_eq!(vote_class(&track_box, &dets, 0.3), Some(1));
    }

    #[test]
    fn test_class_is_not_sticky() {
        let b = BBox::new(0.0, 0.0, 10.0, 10.0);
        let motion = Scripted::new(vec![vec![("h", b)], vec![("h", b)]]);
        let mut tracker = Tracker::new(motion, &TrackerConfig::default());

        let first = tracker.update(&[Detection::new(b, 0.9, 3)]);
        assert_eq!(first[0].class_id, Some(3));

        let second = tracker.update(&[]);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].class_id, None);
    }

    #[test]
    fn test_id_table_cap_evicts_oldest_unseen() {
        let config = TrackerConfig {
            max_id_table_entries: Some(2),
            ..TrackerConfig::default()
        };
        let motion = Scripted::new(vec![
            vec![("a", bbox(0.0))],
            vec![("b", bbox(20.0))],
            vec![("c", bbox(40.0))],
            vec![("a", bbox(0.0))],
        ]);
        let mut tracker = Tracker::new(motion, &config);
        tracker.update(&[]);
        tracker.update(&[]);
        let third = tracker.update(&[]);
        assert_eq!(third[0].id, StableId(3));
        assert_eq!(tracker.id_table_len(), 2);

        // "a" 已被淘汰,重新出现时分配新ID,不与旧ID冲突
        let fourth = tracker.update(&[]);
        assert_eq!(fourth[0].id, StableId(4));
    }

    #[test]
    fn test_random_detections_never_duplicate_ids() {
        use crate::detection::bytetrack::ByteTracker;

        let config = TrackerConfig::default();
        let mut tracker = Tracker::new(ByteTracker::new(&config), &config);
        let mut rng = StdRng::seed_from_u64(7);

        for _ in 0..200 {
            let n = rng.gen_range(0..8);
            let dets: Vec<Detection> = (0..n)
                .map(|_| {
                    let x = rng.gen_range(0.0..1200.0);
                    let y = rng.gen_range(0.0..650.0);
                    let w = rng.gen_range(5.0..80.0);
                    let h = rng.gen_range(5.0..80.0);
                    Detection::new(BBox::new(x, y, x + w, y + h), rng.gen_range(0.0..1.0), 0)
                })
                .collect();
            let tracks = tracker.update(&dets);
            let unique: HashSet<StableId> = tracks.iter().map(|t| t.id).collect();
            assert_eq!(unique.len(), tracks.len());
        }
    }

    #[test]
    fn test_kalman_converges_to_static_box() {
        let b = BBox::new(100.0, 100.0, 140.0, 180.0);
        let mut kf = KalmanBoxFilter::new(&b, &KalmanConfig::default());
        for _ in 0..20 {
            kf.predict();
            kf.update(&b);
        }
        let s = kf.state_bbox();
        assert!((s.x1 - b.x1).abs() < 1.0);
        assert!((s.y2 - b.y2).abs() < 1.0);
        let (vx, vy) = kf.velocity();
        assert!(vx.abs() < 0.5 && vy.abs() < 0.5);
    }
}
