//! 检测与跟踪数据结构定义
//! Data structures shared by detection, tracking and target selection

use std::fmt;
use std::time::Instant;

/// 轴对齐边界框 (像素坐标, x1,y1 左上 / x2,y2 右下)
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// 由中心点和尺寸构造
    pub fn from_cxcywh(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// 浮点中心点
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// 整数像素中心 (向下取整)
    pub fn center_px(&self) -> (i32, i32) {
        let (cx, cy) = self.center();
        (cx.floor() as i32, cy.floor() as i32)
    }

    /// 计算两个边界框的IOU (Intersection over Union)
    pub fn iou(&self, other: &BBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 <= x1 || y2 <= y1 {
            return 0.0;
        }

        let intersection = (x2 - x1) * (y2 - y1);
        let union = self.area() + other.area() - intersection;

        if union <= 0.0 {
            return 0.0;
        }

        intersection / union
    }
}

/// 单帧检测结果 (检测器 → 跟踪器,用完即弃)
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Detection {
    pub bbox: BBox,
    pub score: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn new(bbox: BBox, score: f32, class_id: u32) -> Self {
        Self {
            bbox,
            score,
            class_id,
        }
    }
}

/// 进程内唯一的稳定跟踪ID
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StableId(pub u64);

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 跟踪对象 (跟踪器输出)
#[derive(Clone, Debug, PartialEq)]
pub struct Track {
    pub id: StableId,
    pub bbox: BBox,
    /// 本帧投票得到的类别,不跨帧保留
    pub class_id: Option<u32>,
    pub last_seen_at: Instant,
}

/// 瞄准目标
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AimTarget {
    pub track_id: StableId,
    pub pixel: (i32, i32),
}
