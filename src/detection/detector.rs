//! 检测器 (Detector)
//! 职责: 彩色图 → 检测框列表
//!
//! 神经网络推理由外部实现 `DetectionSource` 提供;这里给出检测结果的过滤规则,
//! 以及一个不依赖模型的色块检测器 (配合合成画面联调)。

use image::RgbImage;

use super::types::{BBox, Detection};
use crate::config::{BlobDetectorConfig, PipelineConfig};

/// 外部检测器接口,可能较慢,只在检测线程中调用
pub trait DetectionSource: Send {
    fn predict(&mut self, color: &RgbImage) -> anyhow::Result<Vec<Detection>>;

    fn name(&self) -> &str {
        "detector"
    }
}

/// 检测结果过滤: 类别 / 置信度 / 最小尺寸
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionFilter {
    /// 空表示接受全部类别
    pub target_classes: Vec<u32>,
    pub min_score: f32,
    pub min_width: f32,
    pub min_height: f32,
}

impl DetectionFilter {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            target_classes: config.target_classes.clone(),
            min_score: config.min_score,
            min_width: config.min_box_width,
            min_height: config.min_box_height,
        }
    }

    pub fn accepts(&self, det: &Detection) -> bool {
        (self.target_classes.is_empty() || self.target_classes.contains(&det.class_id))
            && det.score >= self.min_score
            && det.bbox.width() >= self.min_width
            && det.bbox.height() >= self.min_height
    }

    pub fn apply(&self, detections: Vec<Detection>) -> Vec<Detection> {
        detections.into_iter().filter(|d| self.accepts(d)).collect()
    }
}

/// 色块检测器: 找出与目标颜色相近的像素的外接框
#[derive(Clone, Debug)]
pub struct ColorBlobDetector {
    config: BlobDetectorConfig,
}

impl ColorBlobDetector {
    pub fn new(config: BlobDetectorConfig) -> Self {
        Self { config }
    }

    fn matches(&self, pixel: &[u8; 3]) -> bool {
        pixel
            .iter()
            .zip(self.config.target_rgb.iter())
            .all(|(&p, &t)| p.abs_diff(t) <= self.config.tolerance)
    }
}

impl DetectionSource for ColorBlobDetector {
    fn predict(&mut self, color: &RgbImage) -> anyhow::Result<Vec<Detection>> {
        let stride = self.config.stride.max(1);
        let (w, h) = color.dimensions();

        let mut hits = 0usize;
        let (mut min_x, mut min_y) = (u32::MAX, u32::MAX);
        let (mut max_x, mut max_y) = (0u32, 0u32);

        for y in (0..h).step_by(stride as usize) {
            for x in (0..w).step_by(stride as usize) {
                if self.matches(&color.get_pixel(x, y).0) {
                    hits += 1;
                    min_x = min_x.min(x);
                    min_y = min_y.min(y);
                    max_x = max_x.max(x);
                    max_y = max_y.max(y);
                }
            }
        }

        // 采样命中数换算回像素数
        let pixels = hits * (stride * stride) as usize;
        if hits == 0 || pixels < self.config.min_pixels {
            return Ok(Vec::new());
        }

        let bbox = BBox::new(
            min_x as f32,
            min_y as f32,
            (max_x + stride).min(w) as f32,
            (max_y + stride).min(h) as f32,
        );
        let score = (pixels as f32 / bbox.area().max(1.0)).clamp(0.0, 1.0);
        Ok(vec![Detection::new(bbox, score, self.config.class_id)])
    }

    fn name(&self) -> &str {
        "color_blob"
    }
}
