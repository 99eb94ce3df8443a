//! 下位机链路 (RobotLink)
//!
//! 状态机: Disconnected → Connecting → Connected
//! - 接收线程: 读电报 → 解析 → 替换 RobotState;断线后按固定间隔重连
//! - 发送线程: 周期性发送最新的待发指令 (单槽,只保留最新一条)
//!
//! 读写任一方向出错都会关闭传输并回到 Disconnected,两个方向共用同一个连接。

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::protocol::{OutboundCommand, RobotState};
use super::transport::{is_timeout, LineTransport, TransportOpener};
use crate::config::LinkConfig;
use crate::register::Register;

/// 退避等待时检查 stop 的间隔
const STOP_POLL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
        };
        f.write_str(name)
    }
}

/// 链路计数
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub telegrams_accepted: u64,
    pub telegrams_dropped: u64,
    pub commands_sent: u64,
    pub reconnects: u64,
}

struct LinkShared {
    opener: Arc<dyn TransportOpener>,
    transport: Register<Option<Arc<dyn LineTransport>>>,
    status: Register<LinkStatus>,
    state: Register<RobotState>,
    command: Register<OutboundCommand>,
    stop: AtomicBool,
    read_timeout: Duration,
    backoff: Duration,
    send_interval: Duration,

    accepted: AtomicU64,
    dropped: AtomicU64,
    sent: AtomicU64,
    reconnects: AtomicU64,
}

fn same_transport(a: &Arc<dyn LineTransport>, b: &Arc<dyn LineTransport>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

impl LinkShared {
    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn current(&self) -> Option<Arc<dyn LineTransport>> {
        self.transport.get()
    }

    /// 尝试打开传输
    fn connect(&self) -> bool {
        self.status.set(LinkStatus::Connecting);
        match self.opener.open() {
            Ok(transport) => {
                self.transport.set(Some(transport));
                self.status.set(LinkStatus::Connected);
                info!("🔌 下位机已连接 ({})", self.opener.describe());
                true
            }
            Err(e) => {
                self.status.set(LinkStatus::Disconnected);
                warn!("⚠️ 下位机连接失败 ({}): {}", self.opener.describe(), e);
                false
            }
        }
    }

    /// 关闭出错的连接;若已被替换为新连接则不动
    fn disconnect(&self, failed: &Arc<dyn LineTransport>, reason: &io::Error) {
        let was_current = self.transport.with_lock(|slot| match slot {
            Some(current) if same_transport(current, failed) => {
                *slot = None;
                true
            }
            _ => false,
        });
        failed.close();
        if was_current {
            self.status.set(LinkStatus::Disconnected);
            warn!("🔌 下位机断开: {}", reason);
        }
    }

    /// 可被 stop 打断的等待
    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep((deadline - now).min(STOP_POLL));
        }
    }

    fn handle_record(&self, record: &[u8]) {
        match RobotState::decode(record) {
            Ok(state) => {
                self.state.set(state);
                self.accepted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "⚠️ 丢弃电报 {:?}: {}",
                    String::from_utf8_lossy(record),
                    e
                );
            }
        }
    }

    fn receive_loop(&self) {
        info!("📡 接收线程启动");
        while !self.stopped() {
            let Some(transport) = self.current() else {
                self.sleep(self.backoff);
                if self.stopped() {
                    break;
                }
                if self.connect() {
                    self.reconnects.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            };

            match transport.read_line(self.read_timeout) {
                Ok(record) => self.handle_record(&record),
                Err(e) if is_timeout(&e) => {
                    debug!("读取超时,丢弃半条记录");
                }
                Err(e) => {
                    if !self.stopped() {
                        self.disconnect(&transport, &e);
                    }
                }
            }
        }
        info!("📡 接收线程退出");
    }

    fn send_loop(&self) {
        info!("📤 发送线程启动");
        while !self.stopped() {
            if let Some(transport) = self.current() {
                let command = self.command.get();
                match transport.write(command.encode().as_bytes()) {
                    Ok(()) => {
                        self.sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        if !self.stopped() {
                            self.disconnect(&transport, &e);
                        }
                    }
                }
            }
            self.sleep(self.send_interval);
        }
        info!("📤 发送线程退出");
    }
}

/// 与下位机的双向链路
pub struct RobotLink {
    shared: Arc<LinkShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RobotLink {
    /// 打开链路并启动收发线程
    ///
    /// 首次连接失败不算错误,进入 Disconnected 后由接收线程重连。
    pub fn open(
        opener: Arc<dyn TransportOpener>,
        config: &LinkConfig,
        default_command: OutboundCommand,
    ) -> io::Result<Self> {
        let shared = Arc::new(LinkShared {
            opener,
            transport: Register::new(None),
            status: Register::new(LinkStatus::Disconnected),
            state: Register::new(RobotState::default()),
            command: Register::new(default_command),
            stop: AtomicBool::new(false),
            read_timeout: Duration::from_millis(config.read_timeout_ms.max(1)),
            backoff: Duration::from_millis(config.reconnect_backoff_ms),
            send_interval: Duration::from_millis(config.send_interval_ms.max(1)),
            accepted: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        });

        shared.connect();

        let link = Self {
            shared: shared.clone(),
            threads: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        let rx = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("robot-rx".to_string())
                .spawn(move || shared.receive_loop())
        };
        link.push_thread(rx)?;

        let tx = thread::Builder::new()
            .name("robot-tx".to_string())
            .spawn(move || shared.send_loop());
        link.push_thread(tx)?;

        Ok(link)
    }

    fn push_thread(&self, handle: io::Result<JoinHandle<()>>) -> io::Result<()> {
        match handle {
            Ok(handle) => {
                self.threads
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(handle);
                Ok(())
            }
            Err(e) => {
                self.close();
                Err(e)
            }
        }
    }

    /// 覆盖待发指令
    pub fn set_command(&self, command: OutboundCommand) {
        self.shared.command.set(command);
    }

    pub fn pending_command(&self) -> OutboundCommand {
        self.shared.command.get()
    }

    /// 当前状态快照
    pub fn robot_state(&self) -> RobotState {
        self.shared.state.get()
    }

    pub fn status(&self) -> LinkStatus {
        self.shared.status.get()
    }

    pub fn stats(&self) -> LinkStats {
        LinkStats {
            telegrams_accepted: self.shared.accepted.load(Ordering::Relaxed),
            telegrams_dropped: self.shared.dropped.load(Ordering::Relaxed),
            commands_sent: self.shared.sent.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
        }
    }

    /// 停止收发线程并关闭传输,可重复调用
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop.store(true, Ordering::SeqCst);

        // 关闭传输以打断阻塞中的读
        if let Some(transport) = self.shared.transport.replace(None) {
            transport.close();
        }

        let threads: Vec<_> = self
            .threads
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in threads {
            if handle.join().is_err() {
                error!("❌ 链路线程异常退出");
            }
        }
        // 接收线程退出前可能刚完成一次重连
        if let Some(transport) = self.shared.transport.replace(None) {
            transport.close();
        }

        self.shared.status.set(LinkStatus::Disconnected);
        info!("🔌 下位机链路已关闭");
    }
}

impl Drop for RobotLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::robot::protocol::RobotStateId;
    use crate::robot::transport::Loopback;

    fn fast_config() -> LinkConfig {
        LinkConfig {
            read_timeout_ms: 20,
            reconnect_backoff_ms: 50,
            send_interval_ms: 5,
            ..LinkConfig::default()
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    fn open(loopback: &Loopback) -> RobotLink {
        RobotLink::open(
            Arc::new(loopback.clone()),
            &fast_config(),
            OutboundCommand::centered(1280, 720),
        )
        .unwrap()
    }

    #[test]
    fn test_telegram_updates_state() {
        let loopback = Loopback::new();
        let link = open(&loopback);
        assert_eq!(link.robot_state(), RobotState::default());

        loopback.push("2,5,120,1500,3,4,1,0\n");
        assert!(wait_until(|| link.robot_state().state_id == RobotStateId::Normal));
        let state = link.robot_state();
        assert!(state.ready_to_fire && state.auto_aim);
        assert!((state.pitch_deg - 12.0).abs() < 1e-9);
        link.close();
    }

    #[test]
    fn test_malformed_telegram_keeps_state() {
        let loopback = Loopback::new();
        let link = open(&loopback);
        loopback.push("2,5,120,1500,3,4,1,0\n");
        assert!(wait_until(|| link.stats().telegrams_accepted == 1));
        let before = link.robot_state();

        loopback.push("2,5,120\n");
        loopback.push("9,0,0,0,0,0,0,0\n");
        loopback.push(vec![0xff, b'\n']);
        assert!(wait_until(|| link.stats().telegrams_dropped == 3));
        assert_eq!(link.robot_state(), before);
        assert_eq!(link.status(), LinkStatus::Connected);
        link.close();
    }

    #[test]
    fn test_default_command_is_sent() {
        let loopback = Loopback::new();
        let link = open(&loopback);
        assert_eq!(
            loopback.recv_written(Duration::from_secs(5)).as_deref(),
            Some("640,360,0,0")
        );
        link.close();
    }

    #[test]
    fn test_latest_command_wins() {
        let loopback = Loopback::new();
        let link = open(&loopback);
        link.set_command(OutboundCommand::new(1, 2, 3));
        link.set_command(OutboundCommand::new(100, 200, 1500));
        assert_eq!(link.pending_command(), OutboundCommand::new(100, 200, 1500));

        assert!(wait_until(|| {
            loopback.recv_written(Duration::from_millis(50)).as_deref() == Some("100,200,1500,0")
        }));
        link.close();
    }

    #[test]
    fn test_reconnect_after_transport_close() {
        let loopback = Loopback::new();
        let link = open(&loopback);
        assert_eq!(link.status(), LinkStatus::Connected);
        loopback.push("2,0,0,0,0,0,0,0\n");
        assert!(wait_until(|| link.robot_state().state_id == RobotStateId::Normal));

        loopback.set_available(false);
        loopback.drop_connection();
        assert!(wait_until(|| link.status() != LinkStatus::Connected));
        // 断线期间状态保持最后一次的值
        assert_eq!(link.robot_state().state_id, RobotStateId::Normal);

        loopback.set_available(true);
        assert!(wait_until(|| link.status() == LinkStatus::Connected));
        assert_eq!(loopback.open_count(), 2);

        loopback.push("4,0,0,0,0,0,0,0\n");
        assert!(wait_until(|| link.robot_state().state_id == RobotStateId::Emergency));
        link.close();
    }

    #[test]
    fn test_initial_open_failure_retries() {
        let loopback = Loopback::new();
        loopback.set_available(false);
        let link = open(&loopback);
        assert_ne!(link.status(), LinkStatus::Connected);

        loopback.set_available(true);
        assert!(wait_until(|| link.status() == LinkStatus::Connected));
        assert!(link.stats().reconnects >= 1);
        link.close();
    }

    #[test]
    fn test_close_is_idempotent_and_interrupts_read() {
        let loopback = Loopback::new();
        let config = LinkConfig {
            read_timeout_ms: 60_000,
            ..fast_config()
        };
        let link = RobotLink::open(
            Arc::new(loopback.clone()),
            &config,
            OutboundCommand::default(),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        link.close();
        link.close();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(link.status(), LinkStatus::Disconnected);
    }
}
