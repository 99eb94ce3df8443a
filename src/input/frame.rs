use std::time::Instant;

use image::RgbImage;
use ndarray::Array2;

/// 深度图 (行 = y, 列 = x),单位毫米,0 表示无效
pub type DepthImage = Array2<u16>;

/// 彩色 + 深度帧对 (采集线程 → 检测线程 + 主循环)
#[derive(Clone, Debug)]
pub struct Frame {
    pub color: RgbImage,
    pub depth: DepthImage,
    pub captured_at: Instant,
    /// 帧序号
    pub sequence: u64,
}

impl Frame {
    pub fn new(color: RgbImage, depth: DepthImage, sequence: u64) -> Self {
        Self {
            color,
            depth,
            captured_at: Instant::now(),
            sequence,
        }
    }

    pub fn width(&self) -> u32 {
        self.color.width()
    }

    pub fn height(&self) -> u32 {
        self.color.height()
    }

    /// 彩色图中心像素
    pub fn center(&self) -> (i32, i32) {
        ((self.width() / 2) as i32, (self.height() / 2) as i32)
    }
}
