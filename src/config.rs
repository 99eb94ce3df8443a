//! 系统配置 - 通过JSON文件调整参数

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::aiming::Intrinsics;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件 {path} 失败: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("配置文件 {path} 解析失败: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// 顶层配置
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoAimConfig {
    pub camera: CameraConfig,
    pub intrinsics: Intrinsics,
    /// 相机原点相对机器人中心的偏移 [m]
    pub camera_offset_m: [f64; 3],
    pub detector: BlobDetectorConfig,
    pub pipeline: PipelineConfig,
    pub tracker: TrackerConfig,
    pub link: LinkConfig,
    pub app: AppConfig,
}

impl AutoAimConfig {
    /// 从JSON文件加载配置;文件不存在时写出默认配置,解析失败时使用默认值
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load_strict(path) {
            Ok(config) => {
                info!("✅ 配置已从 {} 加载", path.display());
                config
            }
            Err(ConfigError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                info!("📝 配置文件不存在,创建默认配置...");
                let config = Self::default();
                if let Err(e) = config.save(path) {
                    warn!("⚠️ {}", e);
                }
                config
            }
            Err(e) => {
                warn!("⚠️ {}, 使用默认值", e);
                Self::default()
            }
        }
    }

    /// 加载配置,任何失败都返回错误
    pub fn load_strict(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }

    /// 打印当前配置
    pub fn log_summary(&self) {
        info!("🎛️  当前配置:");
        info!("  图像源: {:?}", self.camera.source);
        info!("  分辨率: {}x{}", self.camera.width, self.camera.height);
        info!("  目标类别: {:?}", self.pipeline.target_classes);
        info!("  类别投票IOU: {:.2}", self.tracker.class_vote_iou);
        info!("  下位机地址: {}", self.link.address);
        info!("  连接超时: {}ms", self.link.connect_timeout_ms);
        info!("  重连间隔: {}ms", self.link.reconnect_backoff_ms);
    }

    /// 画面中心像素
    pub fn image_center(&self) -> (i32, i32) {
        (
            (self.camera.width / 2) as i32,
            (self.camera.height / 2) as i32,
        )
    }
}

/// 图像源选择 (启动时由配置决定)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameSourceConfig {
    /// 合成测试画面: 移动的色块 + 恒定深度平面
    Synthetic { depth_mm: u16 },
    /// 从目录循环回放彩色图片;未给出深度时整帧深度无效
    ImageDir {
        path: PathBuf,
        depth_mm: Option<u16>,
    },
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        Self::Synthetic { depth_mm: 2000 }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub source: FrameSourceConfig,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// 图像源打不开时的重试间隔 (无限重试,直到成功或停止)
    pub start_retry_ms: u64,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            source: FrameSourceConfig::default(),
            width: 1280,
            height: 720,
            fps: 30.0,
            start_retry_ms: 1000,
        }
    }
}

/// 色块检测器参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobDetectorConfig {
    pub target_rgb: [u8; 3],
    /// 每通道允许的最大偏差
    pub tolerance: u8,
    /// 少于此像素数视为无目标
    pub min_pixels: usize,
    /// 采样步长 (像素)
    pub stride: u32,
    pub class_id: u32,
}

impl Default for BlobDetectorConfig {
    fn default() -> Self {
        Self {
            target_rgb: [255, 0, 0],
            tolerance: 60,
            min_pixels: 50,
            stride: 2,
            class_id: 0,
        }
    }
}

/// 检测流水线参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// 只保留这些类别 (空 = 全部)
    pub target_classes: Vec<u32>,
    pub min_score: f32,
    pub min_box_width: f32,
    pub min_box_height: f32,
    /// 无新帧时的轮询间隔
    pub idle_poll_ms: u64,
    /// 每隔多少帧打印一次统计
    pub stats_log_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_classes: vec![0],
            min_score: 0.1,
            min_box_width: 0.0,
            min_box_height: 0.0,
            idle_poll_ms: 10,
            stats_log_every: 60,
        }
    }
}

/// 跟踪器参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// 类别投票的IOU阈值
    pub class_vote_iou: f32,
    /// 句柄映射表上限 (None = 不淘汰)
    pub max_id_table_entries: Option<usize>,

    // === ByteTrack参数 ===
    pub max_lost_frames: u32,
    pub output_max_lost: u32,
    pub high_score_threshold: f32,
    pub low_score_threshold: f32,
    pub high_iou_threshold: f32,
    pub low_iou_threshold: f32,

    pub kalman: KalmanConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            class_vote_iou: 0.3,
            max_id_table_entries: None,
            max_lost_frames: 30,
            output_max_lost: 0,
            high_score_threshold: 0.4,
            low_score_threshold: 0.1,
            high_iou_threshold: 0.4,
            low_iou_threshold: 0.3,
            kalman: KalmanConfig::default(),
        }
    }
}

/// 卡尔曼滤波参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KalmanConfig {
    /// 过程噪声 q (0.1-1.0, 越小越平滑)
    pub process_noise: f32,
    /// 观测噪声 r (越大越平滑)
    pub observation_noise: f32,
    pub velocity_decay: f32,
    /// 静止判定阈值 (像素/帧)
    pub stationary_threshold: f32,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_noise: 0.1,
            observation_noise: 0.5,
            velocity_decay: 0.95,
            stationary_threshold: 2.0,
        }
    }
}

/// 下位机通信参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// 串口-TCP桥地址 (如 ser2net)
    pub address: String,
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub send_interval_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7000".to_string(),
            connect_timeout_ms: 1000,
            read_timeout_ms: 1000,
            reconnect_backoff_ms: 1000,
            send_interval_ms: 20,
        }
    }
}

/// 主循环参数
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cycle_interval_ms: u64,
    /// 运行指定周期数后退出 (None = 一直运行)
    pub max_cycles: Option<u64>,
    /// 下位机关闭自动瞄准时发送居中默认指令
    pub follow_auto_aim_flag: bool,
    /// 显示器每隔多少周期输出一次状态
    pub presenter_log_every: u64,
    /// 关闭时等待每个工作线程的上限;超时的线程被放弃
    pub shutdown_timeout_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 10,
            max_cycles: None,
            follow_auto_aim_flag: false,
            presenter_log_every: 30,
            shutdown_timeout_ms: 2000,
        }
    }
}
