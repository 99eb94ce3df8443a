// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
pub mod aiming; // 空间坐标变换
pub mod app; // 主循环与显示接口
pub mod config; // 配置参数
pub mod detection; // 智能检测系统
pub mod input; // 图像输入系统
pub mod register; // 单槽共享寄存器
pub mod robot; // 下位机通信

pub use crate::aiming::{Intrinsics, Point3, SpatialTransform};
pub use crate::app::{AutoAimSystem, LogPresenter, Presenter, UiCommand};
pub use crate::config::{AutoAimConfig, ConfigError};
pub use crate::detection::{
    AimTarget, BBox, Detection, DetectionPipeline, DetectionSource, MotionTracker, PipelineOutput,
    StableId, TargetSelector, Track, Tracker,
};
pub use crate::input::{CaptureError, ColorSource, Frame, FrameBuffer, FrameSource};
pub use crate::register::Register;
pub use crate::robot::{
    LineTransport, LinkStatus, OutboundCommand, RobotLink, RobotState, RobotStateId,
    TelegramError,
};
