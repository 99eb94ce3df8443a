/// 应用层 (Application)
///
/// - application: 系统组装 + 主循环
/// - presenter:   显示接口
pub mod application;
pub mod presenter;

pub use application::{build_opener, compose_command, AutoAimSystem, LOOPBACK_ADDRESS};
pub use presenter::{LogPresenter, Presenter, UiCommand};
