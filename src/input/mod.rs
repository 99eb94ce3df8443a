/// 图像输入系统 (Image Input System)
///
/// 独立采集线程,负责彩色/深度帧的获取与发布
/// - Frame:       彩色 + 深度帧对
/// - FrameBuffer: 单槽帧缓冲 (只保留最新一帧)
/// - FrameSource: 图像源接口及其实现 (合成画面 / 图片目录 / 仅彩色相机)
/// - Capture:     采集线程
pub mod capture;
pub mod frame;
pub mod frame_buffer;
pub mod source;

pub use capture::spawn_capture;
pub use frame::{DepthImage, Frame};
pub use frame_buffer::FrameBuffer;
pub use source::{
    build_frame_source, CaptureError, ColorOnly, ColorSource, FrameSource, ImageDirSource,
    SyntheticSource,
};
