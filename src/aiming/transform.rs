//! 深度反投影与坐标变换
//! Depth back-projection into the robot frame
//!
//! 相机坐标系 → 机器人中心坐标系只做平移 (相机与机器人坐标轴对齐),不含旋转。

use serde::{Deserialize, Serialize};

use crate::input::DepthImage;

/// 深度图中表示"无效测量"的值
pub const INVALID_DEPTH: u16 = 0;

/// 针孔相机内参 (与深度图对齐)
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Intrinsics {
    pub width: u32,
    pub height: u32,
    /// 主点 x
    pub ppx: f64,
    /// 主点 y
    pub ppy: f64,
    pub fx: f64,
    pub fy: f64,
}

impl Default for Intrinsics {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            ppx: 640.0,
            ppy: 360.0,
            fx: 910.0,
            fy: 910.0,
        }
    }
}

impl Intrinsics {
    /// 内参是否按该分辨率标定
    pub fn matches(&self, width: u32, height: u32) -> bool {
        self.width == width && self.height == height
    }
}

/// 三维点 [m]
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub const ZERO: Point3 = Point3 {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// (0,0,0) 表示没有可靠深度
    pub fn is_valid(&self) -> bool {
        *self != Self::ZERO
    }
}

/// 像素 (x, y) + 深度图 → 机器人坐标系点
///
/// 像素越界或深度为无效值时返回 (0,0,0)。
pub fn project(
    depth: &DepthImage,
    pixel: (i32, i32),
    intrinsics: &Intrinsics,
    offset: [f64; 3],
) -> Point3 {
    let (x, y) = pixel;
    let (rows, cols) = depth.dim();
    if x < 0 || y < 0 || y as usize >= rows || x as usize >= cols {
        return Point3::ZERO;
    }

    let raw = depth[[y as usize, x as usize]];
    if raw == INVALID_DEPTH {
        return Point3::ZERO;
    }

    // 深度单位: 毫米 → 米
    let distance_m = f64::from(raw) / 1000.0;
    let xc = (f64::from(x) - intrinsics.ppx) / intrinsics.fx * distance_m;
    let yc = (f64::from(y) - intrinsics.ppy) / intrinsics.fy * distance_m;

    Point3::new(xc + offset[0], yc + offset[1], distance_m + offset[2])
}

/// 仰角 [deg]: atan2(Y, hypot(X, Z)),水平距离为0时返回0
pub fn elevation_deg(point: &Point3) -> f64 {
    let horizontal = point.x.hypot(point.z);
    if horizontal == 0.0 {
        return 0.0;
    }
    point.y.atan2(horizontal).to_degrees()
}

/// 绑定了内参和相机偏移的变换
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SpatialTransform {
    intrinsics: Intrinsics,
    offset: [f64; 3],
}

impl SpatialTransform {
    pub fn new(intrinsics: Intrinsics, offset: [f64; 3]) -> Self {
        Self { intrinsics, offset }
    }

    pub fn project(&self, depth: &DepthImage, pixel: (i32, i32)) -> Point3 {
        project(depth, pixel, &self.intrinsics, self.offset)
    }

    pub fn matches_frame(&self, width: u32, height: u32) -> bool {
        self.intrinsics.matches(width, height)
    }
}
