//! 行传输层 (串口抽象)
//! Line transport: newline-terminated records over a byte stream
//!
//! - `TcpLineTransport`: 串口-TCP桥 (ser2net 等)
//! - `Loopback`: 进程内回环,用于联调和测试

use std::io::{self, BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};
use tracing::debug;

/// 一条记录的传输通道
///
/// `close` 必须能打断阻塞中的 `read_line`。
pub trait LineTransport: Send + Sync {
    /// 读取一行 (已去掉换行)
    ///
    /// 超时内没有读到换行时返回 `TimedOut`/`WouldBlock`,已读到的部分数据丢弃。
    fn read_line(&self, timeout: Duration) -> io::Result<Vec<u8>>;

    fn write(&self, bytes: &[u8]) -> io::Result<()>;

    fn close(&self);
}

/// 打开 (或重新打开) 传输通道
pub trait TransportOpener: Send + Sync {
    fn open(&self) -> io::Result<Arc<dyn LineTransport>>;

    fn describe(&self) -> String;
}

/// 超时类错误: 丢弃半条记录后继续读
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn strip_newline(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

// ========== TCP ==========

pub struct TcpLineTransport {
    reader: Mutex<BufReader<TcpStream>>,
    writer: Mutex<TcpStream>,
    /// 只用于 shutdown,不加锁,保证能打断阻塞的读
    control: TcpStream,
    peer: String,
}

impl TcpLineTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_string());
        Ok(Self {
            reader: Mutex::new(BufReader::new(stream.try_clone()?)),
            writer: Mutex::new(stream.try_clone()?),
            control: stream,
            peer,
        })
    }
}

impl LineTransport for TcpLineTransport {
    fn read_line(&self, timeout: Duration) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().unwrap_or_else(|p| p.into_inner());
        // 超时按整条记录计算,对端逐字节慢发也不会无限等待
        let deadline = Instant::now() + timeout.max(Duration::from_millis(1));
        let mut line = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no complete record before deadline",
                ));
            }
            reader.get_ref().set_read_timeout(Some(remaining))?;

            let (used, complete) = {
                let available = match reader.fill_buf() {
                    Ok(buf) => buf,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                if available.is_empty() {
                    let msg = if line.is_empty() {
                        "peer closed"
                    } else {
                        "peer closed mid-record"
                    };
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, msg));
                }
                match available.iter().position(|&b| b == b'\n') {
                    Some(i) => {
                        line.extend_from_slice(&available[..=i]);
                        (i + 1, true)
                    }
                    None => {
                        line.extend_from_slice(available);
                        (available.len(), false)
                    }
                }
            };
            reader.consume(used);
            if complete {
                return Ok(strip_newline(line));
            }
        }
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        writer.write_all(bytes)?;
        writer.flush()
    }

    fn close(&self) {
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            debug!("shutdown {}: {}", self.peer, e);
        }
    }
}

/// 连接串口-TCP桥
#[derive(Clone, Debug)]
pub struct TcpOpener {
    address: String,
    connect_timeout: Duration,
}

impl TcpOpener {
    pub fn new(address: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            address: address.into(),
            connect_timeout,
        }
    }
}

impl TransportOpener for TcpOpener {
    fn open(&self) -> io::Result<Arc<dyn LineTransport>> {
        let mut last_err = io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("cannot resolve {}", self.address),
        );
        for addr in self.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(Arc::new(TcpLineTransport::new(stream)?)),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

// ========== Loopback ==========

/// 缓存的下行记录上限,超出后丢弃新记录
const LOOPBACK_WRITTEN_CAPACITY: usize = 1024;

struct LoopbackShared {
    available: AtomicBool,
    opens: AtomicUsize,
    inbound_tx: Sender<Vec<u8>>,
    inbound_rx: Receiver<Vec<u8>>,
    written_tx: Sender<Vec<u8>>,
    written_rx: Receiver<Vec<u8>>,
    current: Mutex<Option<Arc<LoopbackTransport>>>,
}

/// 进程内回环: 一端是 RobotLink,另一端由调用方模拟下位机
#[derive(Clone)]
pub struct Loopback {
    shared: Arc<LoopbackShared>,
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Loopback {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = unbounded();
        let (written_tx, written_rx) = bounded(LOOPBACK_WRITTEN_CAPACITY);
        Self {
            shared: Arc::new(LoopbackShared {
                available: AtomicBool::new(true),
                opens: AtomicUsize::new(0),
                inbound_tx,
                inbound_rx,
                written_tx,
                written_rx,
                current: Mutex::new(None),
            }),
        }
    }

    /// 模拟下位机发送一条记录 (原样,包含换行)
    pub fn push(&self, record: impl Into<Vec<u8>>) {
        // 接收端与 self 同生命周期,发送不会失败
        let _ = self.shared.inbound_tx.send(record.into());
    }

    /// 设备是否可以打开
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// 模拟断线: 关闭当前连接
    pub fn drop_connection(&self) {
        let current = self
            .shared
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(transport) = current {
            transport.close();
        }
    }

    /// 成功打开的次数
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// 等待下一条主机写出的记录 (已去掉换行)
    pub fn recv_written(&self, timeout: Duration) -> Option<String> {
        self.shared
            .written_rx
            .recv_timeout(timeout)
            .ok()
            .map(|line| String::from_utf8_lossy(&strip_newline(line)).into_owned())
    }
}

impl TransportOpener for Loopback {
    fn open(&self) -> io::Result<Arc<dyn LineTransport>> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "loopback unavailable",
            ));
        }
        let (wake_tx, wake_rx) = bounded(1);
        let transport = Arc::new(LoopbackTransport {
            closed: AtomicBool::new(false),
            inbound: self.shared.inbound_rx.clone(),
            written: self.shared.written_tx.clone(),
            wake_tx,
            wake_rx,
        });
        *self
            .shared
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(transport.clone());
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        Ok(transport)
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}

pub struct LoopbackTransport {
    closed: AtomicBool,
    inbound: Receiver<Vec<u8>>,
    written: Sender<Vec<u8>>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl LoopbackTransport {
    fn closed_error() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "loopback closed")
    }
}

impl LineTransport for LoopbackTransport {
    fn read_line(&self, timeout: Duration) -> io::Result<Vec<u8>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Self::closed_error());
        }
        select! {
            recv(self.inbound) -> record => match record {
                // 没有换行的记录按半条处理: 丢弃并报超时
                Ok(record) if record.last() == Some(&b'\n') => Ok(strip_newline(record)),
                Ok(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "partial record")),
                Err(_) => Err(Self::closed_error()),
            },
            recv(self.wake_rx) -> _ => Err(Self::closed_error()),
            default(timeout) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timeout")),
        }
    }

    fn write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback closed"));
        }
        // 缓存已满时丢弃
        let _ = self.written.try_send(bytes.to_vec());
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.wake_tx.try_send(());
        }
    }
}
