/// 下位机通信 (Robot Link)
///
/// - protocol:  电报编解码 / 下行指令
/// - transport: 行传输层 (TCP 串口桥 / 进程内回环)
/// - link:      连接状态机 + 收发线程
pub mod link;
pub mod protocol;
pub mod transport;

pub use link::{LinkStats, LinkStatus, RobotLink};
pub use protocol::{OutboundCommand, RobotState, RobotStateId, TelegramError};
pub use transport::{
    is_timeout, LineTransport, Loopback, LoopbackTransport, TcpLineTransport, TcpOpener,
    TransportOpener,
};
