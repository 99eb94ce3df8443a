//! 主循环 (MainLoop)
//!
//! 组装 采集线程 + 检测线程 + 下位机链路,每个显示周期:
//! 最新帧 → 下位机状态 → 检测结果 → 下行指令 → 显示 → 界面指令

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{error, info, warn};

use super::presenter::{Presenter, UiCommand};
use crate::aiming::SpatialTransform;
use crate::config::{AppConfig, AutoAimConfig};
use crate::detection::{
    spawn_pipeline, ByteTracker, ColorBlobDetector, DetectionPipeline, DetectionSource,
    OutputSlot, PipelineOutput, Tracker,
};
use crate::input::{build_frame_source, spawn_capture, FrameBuffer, FrameSource};
use crate::robot::{Loopback, OutboundCommand, RobotLink, RobotState, TcpOpener, TransportOpener};

/// `link.address` 取此值时使用进程内回环 (无下位机联调)
pub const LOOPBACK_ADDRESS: &str = "loopback";

const JOIN_POLL: Duration = Duration::from_millis(10);

/// 根据地址选择传输
pub fn build_opener(address: &str, connect_timeout: Duration) -> Arc<dyn TransportOpener> {
    if address == LOOPBACK_ADDRESS {
        Arc::new(Loopback::new())
    } else {
        Arc::new(TcpOpener::new(address, connect_timeout))
    }
}

/// 本周期的下行指令
///
/// 没有目标 (或下位机关闭了自动瞄准且要求跟随该标志) 时发送默认指令。
pub fn compose_command(
    output: Option<&PipelineOutput>,
    robot: &RobotState,
    default_command: OutboundCommand,
    follow_auto_aim_flag: bool,
) -> OutboundCommand {
    if follow_auto_aim_flag && !robot.auto_aim {
        return default_command;
    }
    let Some(output) = output else {
        return default_command;
    };
    let Some(target) = output.target else {
        return default_command;
    };
    let depth_mm = output
        .target_position
        .map(|p| (p.z * 1000.0).round().clamp(0.0, f64::from(i32::MAX)) as i32)
        .unwrap_or(0);
    OutboundCommand::new(target.pixel.0, target.pixel.1, depth_mm)
}

/// 自动瞄准系统
pub struct AutoAimSystem {
    frames: Arc<FrameBuffer>,
    output: Arc<OutputSlot>,
    link: RobotLink,
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    default_command: OutboundCommand,
    app: AppConfig,
    closed: bool,
}

impl AutoAimSystem {
    /// 按配置构造图像源、色块检测器和传输
    pub fn from_config(config: &AutoAimConfig) -> anyhow::Result<Self> {
        let source = build_frame_source(&config.camera);
        let detector = Box::new(ColorBlobDetector::new(config.detector.clone()));
        let opener = build_opener(
            &config.link.address,
            Duration::from_millis(config.link.connect_timeout_ms.max(1)),
        );
        Self::start(config, source, detector, opener)
    }

    /// 启动全部线程
    pub fn start(
        config: &AutoAimConfig,
        source: Box<dyn FrameSource>,
        detector: Box<dyn DetectionSource>,
        opener: Arc<dyn TransportOpener>,
    ) -> anyhow::Result<Self> {
        let default_command = OutboundCommand::centered(config.camera.width, config.camera.height);
        info!("🚀 启动自动瞄准系统 (下位机: {})", opener.describe());

        let link = RobotLink::open(opener, &config.link, default_command)
            .context("failed to start robot link threads")?;

        let mut system = Self {
            frames: Arc::new(FrameBuffer::new()),
            output: Arc::new(OutputSlot::default()),
            link,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            default_command,
            app: config.app.clone(),
            closed: false,
        };

        let capture = spawn_capture(
            source,
            system.frames.clone(),
            system.stop.clone(),
            Duration::from_millis(config.camera.start_retry_ms),
        )
        .context("failed to spawn capture thread");
        system.adopt(capture)?;

        let tracker = Tracker::new(ByteTracker::new(&config.tracker), &config.tracker);
        let transform = SpatialTransform::new(config.intrinsics, config.camera_offset_m);
        let pipeline = DetectionPipeline::new(detector, tracker, transform, &config.pipeline);
        let detection = spawn_pipeline(
            pipeline,
            system.frames.clone(),
            system.output.clone(),
            system.stop.clone(),
        )
        .context("failed to spawn detection thread");
        system.adopt(detection)?;

        Ok(system)
    }

    fn adopt(&mut self, handle: anyhow::Result<JoinHandle<()>>) -> anyhow::Result<()> {
        match handle {
            Ok(handle) => {
                self.threads.push(handle);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// 执行一个周期,返回界面指令
    pub fn step(&self, presenter: &mut dyn Presenter) -> UiCommand {
        let frame = self.frames.latest();
        let robot = self.link.robot_state();
        let output = self.output.get();

        // 默认指令指向实际画面的中心,与选择器使用同一尺寸
        let default_command = frame.as_ref().map_or(self.default_command, |f| {
            OutboundCommand::centered(f.width(), f.height())
        });
        let command = compose_command(
            output.as_deref(),
            &robot,
            default_command,
            self.app.follow_auto_aim_flag,
        );
        self.link.set_command(command);

        match frame {
            Some(frame) => {
                presenter.show(&frame, &robot, output.as_deref());
                presenter.ui_command()
            }
            None => UiCommand::None,
        }
    }

    /// 主循环,直到界面要求退出或达到周期上限;返回执行的周期数
    pub fn spin(&mut self, presenter: &mut dyn Presenter) -> u64 {
        let interval = Duration::from_millis(self.app.cycle_interval_ms);
        let mut cycles = 0u64;
        info!("🔁 主循环启动");

        loop {
            let command = self.step(presenter);
            cycles += 1;

            if command == UiCommand::Quit {
                info!("👋 收到退出指令");
                break;
            }
            if self.app.max_cycles.is_some_and(|max| cycles >= max) {
                info!("⏹️ 达到周期上限 {}", cycles);
                break;
            }
            thread::sleep(interval);
        }

        presenter.close();
        cycles
    }

    pub fn link(&self) -> &RobotLink {
        &self.link
    }

    pub fn frames(&self) -> &FrameBuffer {
        &self.frames
    }

    pub fn latest_output(&self) -> Option<Arc<PipelineOutput>> {
        self.output.get()
    }

    /// 停止全部线程,可重复调用
    ///
    /// 工作线程最多等待 `shutdown_timeout_ms`;卡在图像源里的线程被放弃,
    /// 它在图像源返回后自行退出。
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop.store(true, Ordering::SeqCst);

        let timeout = Duration::from_millis(self.app.shutdown_timeout_ms);
        let deadline = Instant::now() + timeout;
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("?").to_string();
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(JOIN_POLL);
            }
            if !handle.is_finished() {
                warn!("⚠️ {} 线程未在{}ms内退出, 放弃等待", name, timeout.as_millis());
                continue;
            }
            if handle.join().is_err() {
                error!("❌ {} 线程异常退出", name);
            }
        }
        self.link.close();
        info!("✅ 自动瞄准系统已关闭");
    }
}

impl Drop for AutoAimSystem {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aiming::Point3;
    use crate::config::FrameSourceConfig;
    use crate::detection::{AimTarget, StableId};
    use crate::input::{CaptureError, DepthImage, Frame, SyntheticSource};
    use image::RgbImage;
    use crate::robot::LinkStatus;
    use std::time::Instant;

    fn output_with_target(position: Option<Point3>) -> PipelineOutput {
        PipelineOutput {
            target: Some(AimTarget {
                track_id: StableId(1),
                pixel: (700, 300),
            }),
            target_position: position,
            ..PipelineOutput::default()
        }
    }

    #[test]
    fn test_compose_command_defaults_without_target() {
        let default = OutboundCommand::centered(1280, 720);
        let robot = RobotState::default();
        assert_eq!(compose_command(None, &robot, default, false), default);
        assert_eq!(
            compose_command(Some(&PipelineOutput::default()), &robot, default, false),
            default
        );
    }

    #[test]
    fn test_compose_command_uses_target_depth() {
        let default = OutboundCommand::centered(1280, 720);
        let robot = RobotState::default();
        let out = output_with_target(Some(Point3::new(0.1, -0.2, 1.8504)));
        assert_eq!(
            compose_command(Some(&out), &robot, default, false),
            OutboundCommand::new(700, 300, 1850)
        );

        let out = output_with_target(None);
        assert_eq!(
            compose_command(Some(&out), &robot, default, false),
            OutboundCommand::new(700, 300, 0)
        );
    }

    #[test]
    fn test_compose_command_follows_auto_aim_flag() {
        let default = OutboundCommand::centered(1280, 720);
        let out = output_with_target(None);
        let mut robot = RobotState::default();
        assert_eq!(compose_command(Some(&out), &robot, default, true), default);

        robot.auto_aim = true;
        assert_eq!(
            compose_command(Some(&out), &robot, default, true),
            OutboundCommand::new(700, 300, 0)
        );
    }

    /// 看到目标后请求退出
    struct QuitOnTarget {
        shown: u64,
        saw_target: bool,
    }

    impl Presenter for QuitOnTarget {
        fn show(&mut self, _frame: &Frame, _robot: &RobotState, output: Option<&PipelineOutput>) {
            self.shown += 1;
            self.saw_target |= output.is_some_and(|o| o.target.is_some());
        }

        fn ui_command(&mut self) -> UiCommand {
            if self.saw_target {
                UiCommand::Quit
            } else {
                UiCommand::None
            }
        }
    }

    fn test_config() -> AutoAimConfig {
        let mut config = AutoAimConfig::default();
        config.camera.width = 320;
        config.camera.height = 240;
        config.camera.fps = 200.0;
        config.camera.source = FrameSourceConfig::Synthetic { depth_mm: 1500 };
        config.link.address = LOOPBACK_ADDRESS.to_string();
        config.link.reconnect_backoff_ms = 50;
        config.link.read_timeout_ms = 20;
        config.link.send_interval_ms = 5;
        config.app.cycle_interval_ms = 2;
        config.app.shutdown_timeout_ms = 200;
        config.app.max_cycles = Some(5_000);
        config
    }

    #[test]
    fn test_end_to_end_aims_at_synthetic_target() {
        let config = test_config();
        let loopback = Loopback::new();
        let source = Box::new(SyntheticSource::new(320, 240, 200.0, 1500));
        let detector = Box::new(ColorBlobDetector::new(config.detector.clone()));
        let mut system =
            AutoAimSystem::start(&config, source, detector, Arc::new(loopback.clone())).unwrap();

        loopback.push("2,4,0,0,0,0,0,0\n");
        let mut presenter = QuitOnTarget {
            shown: 0,
            saw_target: false,
        };
        let cycles = system.spin(&mut presenter);
        assert!(presenter.saw_target, "no target after {} cycles", cycles);

        // 下行指令带上目标深度
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut aimed = false;
        while !aimed && Instant::now() < deadline {
            if let Some(line) = loopback.recv_written(Duration::from_millis(50)) {
                aimed = line.ends_with(",1500,0");
            }
        }
        assert!(aimed);

        system.close();
        system.close();
        assert_eq!(system.link().status(), LinkStatus::Disconnected);
    }

    #[test]
    fn test_spin_stops_at_max_cycles() {
        let mut config = test_config();
        config.app.max_cycles = Some(3);
        let source = build_frame_source(&config.camera);
        let detector = Box::new(ColorBlobDetector::new(config.detector.clone()));
        let mut system =
            AutoAimSystem::start(&config, source, detector, Arc::new(Loopback::new())).unwrap();

        let mut presenter = QuitOnTarget {
            shown: 0,
            saw_target: false,
        };
        // 目标出现即退出,否则最多3个周期
        let cycles = system.spin(&mut presenter);
        assert!(cycles <= 3);
        assert!(presenter.shown <= cycles);
        system.close();
    }

    #[test]
    fn test_default_command_follows_frame_size() {
        // 配置写的是1280x720,实际图像源是320x240
        let mut config = test_config();
        config.camera.width = 1280;
        config.camera.height = 720;
        config.detector.target_rgb = [0, 255, 0];
        let source = Box::new(SyntheticSource::new(320, 240, 200.0, 1500));
        let detector = Box::new(ColorBlobDetector::new(config.detector.clone()));
        let mut system =
            AutoAimSystem::start(&config, source, detector, Arc::new(Loopback::new())).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while system.frames().latest().is_none() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(system.frames().latest().is_some());

        let mut presenter = QuitOnTarget {
            shown: 0,
            saw_target: false,
        };
        system.step(&mut presenter);
        assert!(!presenter.saw_target);
        assert_eq!(system.link().pending_command(), OutboundCommand::new(160, 120, 0));
        system.close();
    }

    /// 启动后第一次取图就卡住的相机
    struct Stalled;

    impl FrameSource for Stalled {
        fn start(&mut self) -> Result<(), CaptureError> {
            Ok(())
        }
        fn get_images(
            &mut self,
        ) -> Result<(Option<RgbImage>, Option<DepthImage>), CaptureError> {
            thread::sleep(Duration::from_secs(10));
            Ok((None, None))
        }
        fn close(&mut self) {}
        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[test]
    fn test_close_does_not_wait_for_stalled_camera() {
        let config = test_config();
        let detector = Box::new(ColorBlobDetector::new(config.detector.clone()));
        let mut system =
            AutoAimSystem::start(&config, Box::new(Stalled), detector, Arc::new(Loopback::new()))
                .unwrap();
        thread::sleep(Duration::from_millis(50));

        let start = Instant::now();
        system.close();
        let elapsed = start.elapsed();
        assert!(elapsed < Duration::from_secs(2), "close took {:?}", elapsed);
        assert_eq!(system.link().status(), LinkStatus::Disconnected);
    }
}
