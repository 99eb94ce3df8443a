//! 图像源接口与实现
//! Frame sources: synthetic test pattern, image directory replay, color-only adapter
//!
//! 图像源在启动时由配置选定 (`build_frame_source`),之后只通过 trait 使用。

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use image::{Rgb, RgbImage};
use ndarray::Array2;
use thiserror::Error;
use tracing::info;

use super::frame::DepthImage;
use crate::aiming::transform::INVALID_DEPTH;
use crate::config::{CameraConfig, FrameSourceConfig};

#[derive(Debug, Error)]
pub enum CaptureError {
    /// 调用顺序错误 (未 start 就取图),属于编程错误
    #[error("图像源未启动, 请先调用 start()")]
    NotStarted,
    #[error("图像源I/O错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("图像解码失败: {0}")]
    Image(#[from] image::ImageError),
    #[error("图像目录 {0} 中没有可用图片")]
    EmptyDirectory(PathBuf),
}

impl CaptureError {
    /// 是否为不可恢复的错误
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::NotStarted | CaptureError::EmptyDirectory(_))
    }
}

/// 彩色 + 深度图像源
///
/// `get_images` 可以阻塞等待下一帧;每次返回后采集线程检查停止标志。
/// 关闭系统时不会无限等待卡住的图像源。
pub trait FrameSource: Send {
    fn start(&mut self) -> Result<(), CaptureError>;

    /// 获取一帧;任一图像缺失时返回 None
    fn get_images(&mut self) -> Result<(Option<RgbImage>, Option<DepthImage>), CaptureError>;

    fn close(&mut self);

    fn name(&self) -> &str;
}

/// 仅彩色图像源 (USB相机等)
pub trait ColorSource: Send {
    fn start(&mut self) -> Result<(), CaptureError>;

    fn get_image(&mut self) -> Result<Option<RgbImage>, CaptureError>;

    fn close(&mut self);

    fn name(&self) -> &str;
}

/// 为仅彩色图像源补上深度图: 恒定深度,或整帧无效
pub struct ColorOnly<S> {
    inner: S,
    depth_mm: Option<u16>,
}

impl<S: ColorSource> ColorOnly<S> {
    pub fn new(inner: S, depth_mm: Option<u16>) -> Self {
        Self { inner, depth_mm }
    }
}

impl<S: ColorSource> FrameSource for ColorOnly<S> {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.inner.start()
    }

    fn get_images(&mut self) -> Result<(Option<RgbImage>, Option<DepthImage>), CaptureError> {
        let Some(color) = self.inner.get_image()? else {
            return Ok((None, None));
        };
        let fill = self.depth_mm.unwrap_or(INVALID_DEPTH);
        let depth = Array2::from_elem((color.height() as usize, color.width() as usize), fill);
        Ok((Some(color), Some(depth)))
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// 帧率上下限 (fps)
const MIN_FPS: f64 = 0.1;
const MAX_FPS: f64 = 1000.0;

/// 帧率节拍器
#[derive(Debug)]
struct Pacer {
    interval: Duration,
    next_due: Instant,
}

impl Pacer {
    fn new(fps: f64) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 {
            fps.clamp(MIN_FPS, MAX_FPS)
        } else {
            30.0
        };
        Self {
            interval: Duration::from_secs_f64(1.0 / fps),
            next_due: Instant::now(),
        }
    }

    fn wait(&mut self) {
        let now = Instant::now();
        if self.next_due > now {
            thread::sleep(self.next_due - now);
        }
        self.next_due = self.next_due.max(now) + self.interval;
    }
}

// ========== 合成测试画面 ==========

/// 合成画面: 灰色背景上水平往返移动的红色方块,深度为恒定平面
pub struct SyntheticSource {
    width: u32,
    height: u32,
    depth_mm: u16,
    pacer: Pacer,
    running: bool,
    tick: u64,
}

impl SyntheticSource {
    pub const TARGET_SIZE: u32 = 120;

    pub fn new(width: u32, height: u32, fps: f64, depth_mm: u16) -> Self {
        Self {
            width,
            height,
            depth_mm,
            pacer: Pacer::new(fps),
            running: false,
            tick: 0,
        }
    }

    /// 第 tick 帧时方块左上角
    fn target_origin(&self, tick: u64) -> (u32, u32) {
        let span = self.width.saturating_sub(Self::TARGET_SIZE).max(1);
        let phase = (tick as f64 * 0.05).sin() * 0.5 + 0.5;
        let x = (phase * f64::from(span)) as u32;
        let y = self.height.saturating_sub(Self::TARGET_SIZE) / 2;
        (x, y)
    }

    fn render(&self, tick: u64) -> RgbImage {
        let mut img = RgbImage::from_pixel(self.width, self.height, Rgb([40, 40, 40]));
        let (ox, oy) = self.target_origin(tick);
        for y in oy..(oy + Self::TARGET_SIZE).min(self.height) {
            for x in ox..(ox + Self::TARGET_SIZE).min(self.width) {
                img.put_pixel(x, y, Rgb([255, 0, 0]));
            }
        }
        img
    }
}

impl FrameSource for SyntheticSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.running = true;
        info!("🎨 合成图像源启动: {}x{}", self.width, self.height);
        Ok(())
    }

    fn get_images(&mut self) -> Result<(Option<RgbImage>, Option<DepthImage>), CaptureError> {
        if !self.running {
            return Err(CaptureError::NotStarted);
        }
        self.pacer.wait();
        let color = self.render(self.tick);
        let depth = Array2::from_elem(
            (self.height as usize, self.width as usize),
            self.depth_mm,
        );
        self.tick += 1;
        Ok((Some(color), Some(depth)))
    }

    fn close(&mut self) {
        self.running = false;
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

// ========== 图片目录回放 ==========

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// 按文件名顺序循环回放目录中的彩色图片
pub struct ImageDirSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    cursor: usize,
    pacer: Pacer,
    running: bool,
}

impl ImageDirSource {
    pub fn new(dir: impl Into<PathBuf>, fps: f64) -> Self {
        Self {
            dir: dir.into(),
            files: Vec::new(),
            cursor: 0,
            pacer: Pacer::new(fps),
            running: false,
        }
    }

    fn list_images(dir: &Path) -> Result<Vec<PathBuf>, CaptureError> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

impl ColorSource for ImageDirSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.files = Self::list_images(&self.dir)?;
        if self.files.is_empty() {
            return Err(CaptureError::EmptyDirectory(self.dir.clone()));
        }
        self.cursor = 0;
        self.running = true;
        info!(
            "🖼️ 图片目录图像源启动: {} ({} 张)",
            self.dir.display(),
            self.files.len()
        );
        Ok(())
    }

    fn get_image(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        if !self.running {
            return Err(CaptureError::NotStarted);
        }
        self.pacer.wait();
        let path = &self.files[self.cursor % self.files.len()];
        self.cursor = self.cursor.wrapping_add(1);
        Ok(Some(image::open(path)?.to_rgb8()))
    }

    fn close(&mut self) {
        self.running = false;
        self.files.clear();
    }

    fn name(&self) -> &str {
        "image_dir"
    }
}

/// 根据配置构造图像源
pub fn build_frame_source(config: &CameraConfig) -> Box<dyn FrameSource> {
    match &config.source {
        FrameSourceConfig::Synthetic { depth_mm } => Box::new(SyntheticSource::new(
            config.width,
            config.height,
            config.fps,
            *depth_mm,
        )),
        FrameSourceConfig::ImageDir { path, depth_mm } => Box::new(ColorOnly::new(
            ImageDirSource::new(path.clone(), config.fps),
            *depth_mm,
        )),
    }
}
