//! 下位机通信协议
//! Telegram codec: `state_id,flags,pitch_x10,muzzle_x1000,left,right,video_id,reserved`
//!
//! 上行 (下位机 → 主机) 为 8 个逗号分隔字段,ASCII,以 `\n` 结尾;
//! 下行 (主机 → 下位机) 为 `x,y,depth,reserved\n`。

use std::fmt;

use thiserror::Error;

/// 上行电报字段数
pub const TELEGRAM_FIELDS: usize = 8;

const FLAG_READY_TO_FIRE: u8 = 1 << 0;
const FLAG_RECORD_VIDEO: u8 = 1 << 1;
const FLAG_AUTO_AIM: u8 = 1 << 2;

/// 电报解析错误,出错的电报直接丢弃
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TelegramError {
    #[error("telegram is not ASCII")]
    NotAscii,
    #[error("expected 8 fields, got {0}")]
    FieldCount(usize),
    #[error("field `{field}` is not numeric: {value:?}")]
    NotNumeric { field: &'static str, value: String },
    #[error("unknown robot state id {0}")]
    UnknownState(i64),
}

/// 机器人状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RobotStateId {
    #[default]
    Unknown = 0,
    Initializing = 1,
    Normal = 2,
    Defeated = 3,
    Emergency = 4,
    CommError = 5,
}

impl TryFrom<i64> for RobotStateId {
    type Error = TelegramError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Initializing),
            2 => Ok(Self::Normal),
            3 => Ok(Self::Defeated),
            4 => Ok(Self::Emergency),
            5 => Ok(Self::CommError),
            other => Err(TelegramError::UnknownState(other)),
        }
    }
}

impl fmt::Display for RobotStateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "Unknown",
            Self::Initializing => "Initializing",
            Self::Normal => "Normal",
            Self::Defeated => "Defeated",
            Self::Emergency => "Emergency",
            Self::CommError => "CommError",
        };
        f.write_str(name)
    }
}

/// 下位机上报的状态快照,每次成功解析整体替换
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RobotState {
    pub state_id: RobotStateId,
    pub ready_to_fire: bool,
    pub record_video: bool,
    pub auto_aim: bool,
    /// 俯仰角 [deg]
    pub pitch_deg: f64,
    /// 初速 [m/s]
    pub muzzle_velocity: f64,
    pub reloaded_left_disks: i32,
    pub reloaded_right_disks: i32,
    pub video_id: i32,
    pub reserved: i32,
}

impl RobotState {
    /// 解析一条电报 (不含换行也可)
    pub fn parse_telegram(record: &str) -> Result<Self, TelegramError> {
        if !record.is_ascii() {
            return Err(TelegramError::NotAscii);
        }

        let fields: Vec<&str> = record
            .trim_end_matches(&['\n', '\r'][..])
            .split(',')
            .map(str::trim)
            .collect();
        if fields.len() != TELEGRAM_FIELDS {
            return Err(TelegramError::FieldCount(fields.len()));
        }

        let state_id = RobotStateId::try_from(int_field("state_id", fields[0])?)?;
        let flags = int_field("flags", fields[1])?;
        let flags = u8::try_from(flags).map_err(|_| TelegramError::NotNumeric {
            field: "flags",
            value: fields[1].to_string(),
        })?;

        Ok(Self {
            state_id,
            ready_to_fire: flags & FLAG_READY_TO_FIRE != 0,
            record_video: flags & FLAG_RECORD_VIDEO != 0,
            auto_aim: flags & FLAG_AUTO_AIM != 0,
            pitch_deg: float_field("pitch_x10", fields[2])? / 10.0,
            muzzle_velocity: float_field("muzzle_velocity_x1000", fields[3])? / 1000.0,
            reloaded_left_disks: small_int_field("left_disks", fields[4])?,
            reloaded_right_disks: small_int_field("right_disks", fields[5])?,
            video_id: small_int_field("video_id", fields[6])?,
            reserved: small_int_field("reserved", fields[7])?,
        })
    }

    /// 原始字节 → 状态 (先做 ASCII 校验)
    pub fn decode(record: &[u8]) -> Result<Self, TelegramError> {
        if !record.is_ascii() {
            return Err(TelegramError::NotAscii);
        }
        let text = std::str::from_utf8(record).map_err(|_| TelegramError::NotAscii)?;
        Self::parse_telegram(text)
    }

    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.ready_to_fire {
            flags |= FLAG_READY_TO_FIRE;
        }
        if self.record_video {
            flags |= FLAG_RECORD_VIDEO;
        }
        if self.auto_aim {
            flags |= FLAG_AUTO_AIM;
        }
        flags
    }

    /// 编码为上行电报 (下位机模拟器用),角度和初速按定点取整
    pub fn to_telegram(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{}\n",
            self.state_id as i64,
            self.flags(),
            (self.pitch_deg * 10.0).round() as i64,
            (self.muzzle_velocity * 1000.0).round() as i64,
            self.reloaded_left_disks,
            self.reloaded_right_disks,
            self.video_id,
            self.reserved
        )
    }
}

fn not_numeric(field: &'static str, value: &str) -> TelegramError {
    TelegramError::NotNumeric {
        field,
        value: value.to_string(),
    }
}

fn int_field(field: &'static str, value: &str) -> Result<i64, TelegramError> {
    value.parse::<i64>().map_err(|_| not_numeric(field, value))
}

fn small_int_field(field: &'static str, value: &str) -> Result<i32, TelegramError> {
    value.parse::<i32>().map_err(|_| not_numeric(field, value))
}

/// 整数或小数均可
fn float_field(field: &'static str, value: &str) -> Result<f64, TelegramError> {
    value
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| not_numeric(field, value))
}

/// 下行瞄准指令
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutboundCommand {
    pub x: i32,
    pub y: i32,
    /// 目标深度 [mm],0 表示未知
    pub depth: i32,
    pub reserved: i32,
}

impl OutboundCommand {
    pub fn new(x: i32, y: i32, depth: i32) -> Self {
        Self {
            x,
            y,
            depth,
            reserved: 0,
        }
    }

    /// 默认指令: 图像中心、深度为0 (正前方)
    pub fn centered(width: u32, height: u32) -> Self {
        Self::new((width / 2) as i32, (height / 2) as i32, 0)
    }

    /// 编码为 `x,y,depth,reserved\n`
    pub fn encode(&self) -> String {
        format!("{},{},{},{}\n", self.x, self.y, self.depth, self.reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reference_telegram() {
        let state = RobotState::parse_telegram("2,5,120,1500,3,4,1,0").unwrap();
        assert_eq!(state.state_id, RobotStateId::Normal);
        assert!(state.ready_to_fire);
        assert!(!state.record_video);
        assert!(state.auto_aim);
        assert!((state.pitch_deg - 12.0).abs() < 1e-9);
        assert!((state.muzzle_velocity - 1.5).abs() < 1e-9);
        assert_eq!(state.reloaded_left_disks, 3);
        assert_eq!(state.reloaded_right_disks, 4);
        assert_eq!(state.video_id, 1);
        assert_eq!(state.reserved, 0);
    }

    #[test]
    fn test_to_telegram_matches_wire_format() {
        let state = RobotState::parse_telegram("2,5,120,1500,3,4,1,0\r\n").unwrap();
        assert_eq!(state.to_telegram(), "2,5,120,1500,3,4,1,0\n");
    }

    #[test]
    fn test_decimal_pitch() {
        let state = RobotState::parse_telegram("1,0,-35.5,0,0,0,0,0\n").unwrap();
        assert_eq!(state.state_id, RobotStateId::Initializing);
        assert!((state.pitch_deg + 3.55).abs() < 1e-9);
    }

    #[test]
    fn test_truncated_telegram_is_rejected() {
        assert_eq!(
            RobotState::parse_telegram("2,5,120\n"),
            Err(TelegramError::FieldCount(3))
        );
        assert_eq!(
            RobotState::parse_telegram("2,5,120,1500,3,4,1,0,9"),
            Err(TelegramError::FieldCount(9))
        );
    }

    #[test]
    fn test_non_numeric_field_is_rejected() {
        let err = RobotState::parse_telegram("2,x,120,1500,3,4,1,0").unwrap_err();
        assert!(matches!(err, TelegramError::NotNumeric { field: "flags", .. }));

        let err = RobotState::parse_telegram("2,5,nan,1500,3,4,1,0").unwrap_err();
        assert!(matches!(err, TelegramError::NotNumeric { field: "pitch_x10", .. }));

        let err = RobotState::parse_telegram("2,5,120,1500,,4,1,0").unwrap_err();
        assert!(matches!(err, TelegramError::NotNumeric { field: "left_disks", .. }));
    }

    #[test]
    fn test_unknown_state_id_is_rejected() {
        assert_eq!(
            RobotState::parse_telegram("9,0,0,0,0,0,0,0"),
            Err(TelegramError::UnknownState(9))
        );
    }

    #[test]
    fn test_flags_out_of_byte_range() {
        let err = RobotState::parse_telegram("2,256,0,0,0,0,0,0").unwrap_err();
        assert!(matches!(err, TelegramError::NotNumeric { field: "flags", .. }));
    }

    #[test]
    fn test_non_ascii_record_is_rejected() {
        assert_eq!(
            RobotState::decode("2,5,120,1500,3,4,1,０".as_bytes()),
            Err(TelegramError::NotAscii)
        );
        assert_eq!(
            RobotState::decode(&[0xff, b',', b'1']),
            Err(TelegramError::NotAscii)
        );
    }

    #[test]
    fn test_default_state() {
        let state = RobotState::default();
        assert_eq!(state.state_id, RobotStateId::Unknown);
        assert_eq!(state.flags(), 0);
        assert_eq!(state.to_telegram(), "0,0,0,0,0,0,0,0\n");
    }

    #[test]
    fn test_outbound_command_encoding() {
        assert_eq!(OutboundCommand::new(640, 360, 1850).encode(), "640,360,1850,0\n");
        assert_eq!(OutboundCommand::centered(1280, 720).encode(), "640,360,0,0\n");
    }
}
