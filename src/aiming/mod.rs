/// 空间变换 (Spatial Transform)
///
/// 像素中心 + 深度 → 机器人坐标系三维点
pub mod transform;

pub use transform::{elevation_deg, project, Intrinsics, Point3, SpatialTransform};
