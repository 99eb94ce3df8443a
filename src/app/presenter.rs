//! 显示接口 (Presenter)
//!
//! 图形界面不在本 crate 内;`LogPresenter` 以日志代替画面。

use tracing::info;

use crate::detection::PipelineOutput;
use crate::input::Frame;
use crate::robot::RobotState;

/// 界面指令
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UiCommand {
    #[default]
    None,
    Quit,
}

pub trait Presenter {
    fn show(&mut self, frame: &Frame, robot: &RobotState, output: Option<&PipelineOutput>);

    fn ui_command(&mut self) -> UiCommand;

    fn close(&mut self) {}
}

/// 每隔若干周期输出一行状态
pub struct LogPresenter {
    every: u64,
    shown: u64,
}

impl LogPresenter {
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            shown: 0,
        }
    }
}

impl Presenter for LogPresenter {
    fn show(&mut self, frame: &Frame, robot: &RobotState, output: Option<&PipelineOutput>) {
        self.shown += 1;
        if self.shown % self.every != 0 {
            return;
        }

        let target = output
            .and_then(|o| o.target.map(|t| (t, o.target_position)))
            .map(|(t, pos)| match pos {
                Some(p) => format!(
                    "{} @({}, {}) [{:.2}, {:.2}, {:.2}]m",
                    t.track_id, t.pixel.0, t.pixel.1, p.x, p.y, p.z
                ),
                None => format!("{} @({}, {}) 无深度", t.track_id, t.pixel.0, t.pixel.1),
            })
            .unwrap_or_else(|| "无".to_string());
        let (tracks, fps) = output.map_or((0, 0.0), |o| (o.tracks.len(), o.fps));

        info!(
            "📺 帧#{} | 目标: {} | 跟踪{}个 | 检测{:.1}fps | 下位机: {} pitch={:.1}° v={:.2}m/s 自动瞄准={}",
            frame.sequence,
            target,
            tracks,
            fps,
            robot.state_id,
            robot.pitch_deg,
            robot.muzzle_velocity,
            robot.auto_aim
        );
    }

    fn ui_command(&mut self) -> UiCommand {
        UiCommand::None
    }
}
