//! 采集线程
//! Capture thread: FrameSource → FrameBuffer

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::frame::Frame;
use super::frame_buffer::FrameBuffer;
use super::source::FrameSource;

/// 瞬时错误后的短暂退避
const ERROR_BACKOFF: Duration = Duration::from_millis(50);
/// 重试等待期间检查停止标志的粒度
const STOP_POLL: Duration = Duration::from_millis(20);

/// 启动采集线程;线程退出前会关闭图像源
///
/// 图像源打不开 (非致命错误) 时每隔 `start_retry` 重试一次,直到成功或收到停止。
pub fn spawn_capture(
    mut source: Box<dyn FrameSource>,
    buffer: Arc<FrameBuffer>,
    stop: Arc<AtomicBool>,
    start_retry: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            if start_with_retry(source.as_mut(), &stop, start_retry) {
                run_capture(source.as_mut(), &buffer, &stop);
            }
            source.close();
            info!("📷 采集线程退出 ({})", source.name());
        })
}

fn start_with_retry(source: &mut dyn FrameSource, stop: &AtomicBool, delay: Duration) -> bool {
    let mut attempts = 0u64;
    while !stop.load(Ordering::Relaxed) {
        match source.start() {
            Ok(()) => {
                info!("✅ 图像源 {} 启动成功", source.name());
                return true;
            }
            Err(e) if e.is_fatal() => {
                error!("❌ 图像源启动失败: {}", e);
                return false;
            }
            Err(e) => {
                attempts += 1;
                warn!(
                    "⚠️ 图像源无法打开, {}ms后重试... (第{}次): {}",
                    delay.as_millis(),
                    attempts,
                    e
                );
                sleep_unless_stopped(delay, stop);
            }
        }
    }
    false
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !stop.load(Ordering::Relaxed) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        thread::sleep(remaining.min(STOP_POLL));
    }
}

fn run_capture(source: &mut dyn FrameSource, buffer: &FrameBuffer, stop: &AtomicBool) {
    let mut sequence = 0u64;
    let mut count = 0u32;
    let mut last = Instant::now();

    while !stop.load(Ordering::Relaxed) {
        match source.get_images() {
            Ok((Some(color), Some(depth))) => {
                sequence += 1;
                buffer.publish(Frame::new(color, depth, sequence));
                count += 1;
            }
            Ok(_) => {
                debug!("帧不完整,跳过");
            }
            Err(e) if e.is_fatal() => {
                error!("❌ 采集线程终止: {}", e);
                break;
            }
            Err(e) => {
                warn!("⚠️ 取图失败: {}", e);
                thread::sleep(ERROR_BACKOFF);
            }
        }

        if last.elapsed() >= Duration::from_secs(1) {
            let fps = f64::from(count) / last.elapsed().as_secs_f64();
            debug!("📺 采集统计: {}帧 | {:.1}fps", sequence, fps);
            count = 0;
            last = Instant::now();
        }
    }
}
