/// 检测系统 (Detection System)
///
/// 独立工作线程,负责智能分析
/// - Detector: 目标检测 (外部模型 / 色块检测)
/// - Tracker:  目标追踪 + 稳定ID + 类别投票
/// - Selector: 选择瞄准目标
pub mod bytetrack;
pub mod detector;
pub mod pipeline;
pub mod selector;
pub mod tracker;
pub mod types;

pub use bytetrack::{ByteTrackHandle, ByteTracker};
pub use detector::{ColorBlobDetector, DetectionFilter, DetectionSource};
pub use pipeline::{spawn_pipeline, DetectionPipeline, OutputSlot, PipelineOutput};
pub use selector::TargetSelector;
pub use tracker::{vote_class, ExternalTrack, KalmanBoxFilter, MotionTracker, Tracker};
pub use types::{AimTarget, BBox, Detection, StableId, Track};
