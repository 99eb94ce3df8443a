//! 检测流水线 (Detection Pipeline)
//! 职责: 读取最新帧 → 检测 → 过滤 → 跟踪 → 选目标 → 三维坐标 → 发布结果
//!
//! 拿不到新帧时短暂休眠后重试,相机卡死不会卡住检测线程。

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::detector::{DetectionFilter, DetectionSource};
use super::selector::TargetSelector;
use super::tracker::{MotionTracker, Tracker};
use super::types::{AimTarget, Track};
use crate::aiming::{elevation_deg, Point3, SpatialTransform};
use crate::config::PipelineConfig;
use crate::input::{Frame, FrameBuffer};
use crate::register::Register;

/// 检测结果 (检测线程 → 主循环)
#[derive(Clone, Debug, Default)]
pub struct PipelineOutput {
    /// 对应的帧序号
    pub frame_sequence: u64,
    pub tracks: Vec<Track>,
    pub target: Option<AimTarget>,
    /// 目标在机器人坐标系下的位置,深度无效时为 None
    pub target_position: Option<Point3>,
    pub target_elevation_deg: Option<f64>,
    pub detections: usize,
    pub inference_ms: f64,
    pub tracker_ms: f64,
    pub fps: f64,
}

/// 检测结果寄存器
pub type OutputSlot = Register<Option<Arc<PipelineOutput>>>;

pub struct DetectionPipeline<M: MotionTracker> {
    detector: Box<dyn DetectionSource>,
    filter: DetectionFilter,
    tracker: Tracker<M>,
    selector: TargetSelector,
    transform: SpatialTransform,
    idle_poll: Duration,
    stats_log_every: u64,
    /// 上次检查过的帧尺寸
    checked_size: Option<(u32, u32)>,

    // 统计
    processed: u64,
    count: u64,
    last: Instant,
    current_fps: f64,
}

impl<M: MotionTracker> DetectionPipeline<M> {
    pub fn new(
        detector: Box<dyn DetectionSource>,
        tracker: Tracker<M>,
        transform: SpatialTransform,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            detector,
            filter: DetectionFilter::from_config(config),
            tracker,
            selector: TargetSelector::new(),
            transform,
            idle_poll: Duration::from_millis(config.idle_poll_ms.max(1)),
            stats_log_every: config.stats_log_every.max(1),
            checked_size: None,
            processed: 0,
            count: 0,
            last: Instant::now(),
            current_fps: 0.0,
        }
    }

    /// 处理单帧
    pub fn process_frame(&mut self, frame: &Frame) -> PipelineOutput {
        // 1. 检测 (不持有任何锁)
        let t_infer = Instant::now();
        let detections = match self.detector.predict(&frame.color) {
            Ok(dets) => dets,
            Err(e) => {
                warn!("⚠️ 检测失败 ({}): {:#}", self.detector.name(), e);
                Vec::new()
            }
        };
        let inference_ms = t_infer.elapsed().as_secs_f64() * 1000.0;

        // 2. 类别/尺寸过滤
        let detections = self.filter.apply(detections);

        // 3. 跟踪
        let t_track = Instant::now();
        let tracks = self.tracker.update_at(&detections, frame.captured_at);
        let tracker_ms = t_track.elapsed().as_secs_f64() * 1000.0;

        // 4. 选目标
        let target = self.selector.select(&tracks, frame.center());

        // 5. 三维坐标
        self.check_frame_size(frame);
        let target_position = target
            .map(|t| self.transform.project(&frame.depth, t.pixel))
            .filter(Point3::is_valid);
        let target_elevation_deg = target_position.as_ref().map(elevation_deg);

        self.update_stats();
        if self.processed % self.stats_log_every == 0 {
            debug!(
                "🎯 检测+跟踪: {}个检测 {}个目标 | {:.1}fps (推理:{:.1}ms | 跟踪:{:.2}ms)",
                detections.len(),
                tracks.len(),
                self.current_fps,
                inference_ms,
                tracker_ms
            );
        }

        PipelineOutput {
            frame_sequence: frame.sequence,
            detections: detections.len(),
            tracks,
            target,
            target_position,
            target_elevation_deg,
            inference_ms,
            tracker_ms,
            fps: self.current_fps,
        }
    }

    /// 检测循环,直到 stop 置位
    pub fn run(&mut self, frames: &FrameBuffer, output: &OutputSlot, stop: &AtomicBool) {
        info!("🔍 检测线程启动 ({})", self.detector.name());
        let mut last_sequence = None;

        while !stop.load(Ordering::Relaxed) {
            let frame = match frames.latest() {
                Some(f) if Some(f.sequence) != last_sequence => f,
                _ => {
                    thread::sleep(self.idle_poll);
                    continue;
                }
            };
            last_sequence = Some(frame.sequence);

            let result = self.process_frame(&frame);
            output.set(Some(Arc::new(result)));
        }

        info!("🔍 检测线程退出 (共处理{}帧)", self.processed);
    }

    /// 帧尺寸与内参不一致时告警 (每种尺寸一次);返回是否一致
    fn check_frame_size(&mut self, frame: &Frame) -> bool {
        let size = (frame.width(), frame.height());
        let matches = self.transform.matches_frame(size.0, size.1);
        if self.checked_size != Some(size) {
            self.checked_size = Some(size);
            if !matches {
                warn!(
                    "⚠️ 帧尺寸 {}x{} 与相机内参不一致, 三维坐标可能不准",
                    size.0, size.1
                );
            }
        }
        matches
    }

    fn update_stats(&mut self) {
        self.processed += 1;
        self.count += 1;
        let now = Instant::now();
        if now.duration_since(self.last).as_secs() >= 1 {
            self.current_fps = self.count as f64 / now.duration_since(self.last).as_secs_f64();
            self.count = 0;
            self.last = now;
        }
    }
}

/// 启动检测线程
pub fn spawn_pipeline<M>(
    mut pipeline: DetectionPipeline<M>,
    frames: Arc<FrameBuffer>,
    output: Arc<OutputSlot>,
    stop: Arc<AtomicBool>,
) -> io::Result<JoinHandle<()>>
where
    M: MotionTracker + Send + 'static,
    M::Handle: Send,
{
    thread::Builder::new()
        .name("detection".to_string())
        .spawn(move || pipeline.run(&frames, &output, &stop))
}
