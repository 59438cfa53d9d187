//! ==============================================================================
//! commands.rs - socket command codebook
//! ==============================================================================
//!
//! purpose:
//!     symbolic names for the integer command codes understood by the sensor
//!     node firmware. code = position in the list + 1.
//!
//! ATTENTION:
//!     this list mirrors the CMDS enum in the firmware socket handler. never
//!     reorder or remove entries, only append.
//!
//! ==============================================================================

use crate::error::UnknownCommand;

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SocketCommand {
    GetAll = 1,
    CalibrateTime,
    NewLogRcvd,
    RelayCtrl,
    RelayTimer,
    RelayTimerDay,
    AttachRelays,
    SetTempHum,
    SetSoil,
    SetLight,
    SetSpecIntegrationTime,
    SetSpecGain,
    ClearAverages,
    ClearAvgSetTime,
    SaveAndRestart,
    GetTrends,
}

impl SocketCommand {
    /// Firmware order. Index + 1 is the wire code.
    pub const ALL: [SocketCommand; 16] = [
        Self::GetAll,
        Self::CalibrateTime,
        Self::NewLogRcvd,
        Self::RelayCtrl,
        Self::RelayTimer,
        Self::RelayTimerDay,
        Self::AttachRelays,
        Self::SetTempHum,
        Self::SetSoil,
        Self::SetLight,
        Self::SetSpecIntegrationTime,
        Self::SetSpecGain,
        Self::ClearAverages,
        Self::ClearAvgSetTime,
        Self::SaveAndRestart,
        Self::GetTrends,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let idx = usize::from(code).checked_sub(1)?;
        Self::ALL.get(idx).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::GetAll => "GET_ALL",
            Self::CalibrateTime => "CALIBRATE_TIME",
            Self::NewLogRcvd => "NEW_LOG_RCVD",
            Self::RelayCtrl => "RELAY_CTRL",
            Self::RelayTimer => "RELAY_TIMER",
            Self::RelayTimerDay => "RELAY_TIMER_DAY",
            Self::AttachRelays => "ATTACH_RELAYS",
            Self::SetTempHum => "SET_TEMPHUM",
            Self::SetSoil => "SET_SOIL",
            Self::SetLight => "SET_LIGHT",
            Self::SetSpecIntegrationTime => "SET_SPEC_INTEGRATION_TIME",
            Self::SetSpecGain => "SET_SPEC_GAIN",
            Self::ClearAverages => "CLEAR_AVERAGES",
            Self::ClearAvgSetTime => "CLEAR_AVG_SET_TIME",
            Self::SaveAndRestart => "SAVE_AND_RESTART",
            Self::GetTrends => "GET_TRENDS",
        }
    }

    /// Outbound text frame: `<code>/<sub>/<id>`.
    pub fn frame(self, sub: impl fmt::Display, id: u8) -> String {
        format!("{}/{}/{}", self.code(), sub, id)
    }
}

impl fmt::Display for SocketCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SocketCommand {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownCommand(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_firmware_order() {
        assert_eq!(SocketCommand::GetAll.code(), 1);
        assert_eq!(SocketCommand::RelayCtrl.code(), 4);
        assert_eq!(SocketCommand::ClearAverages.code(), 13);
        assert_eq!(SocketCommand::GetTrends.code(), 16);
        for (idx, cmd) in SocketCommand::ALL.iter().enumerate() {
            assert_eq!(usize::from(cmd.code()), idx + 1);
            assert_eq!(SocketCommand::from_code(cmd.code()), Some(*cmd));
        }
    }

    #[test]
    fn out_of_range_codes_are_unknown() {
        assert_eq!(SocketCommand::from_code(0), None);
        assert_eq!(SocketCommand::from_code(17), None);
    }

    #[test]
    fn frame_layout() {
        assert_eq!(SocketCommand::GetAll.frame(0, 7), "1/0/7");
        assert_eq!(SocketCommand::SetSoil.frame("2", 255), "9/2/255");
    }

    #[test]
    fn parse_by_symbolic_name() {
        assert_eq!("RELAY_CTRL".parse::<SocketCommand>(), Ok(SocketCommand::RelayCtrl));
        assert_eq!("get_all".parse::<SocketCommand>(), Ok(SocketCommand::GetAll));
        assert!("REBOOT".parse::<SocketCommand>().is_err());
    }

    #[test]
    fn unknown_name_error_carries_the_input() {
        let err = "REBOOT".parse::<SocketCommand>().unwrap_err();
        assert_eq!(err, UnknownCommand("REBOOT".to_string()));
        assert_eq!(err.to_string(), r#"unknown socket command "REBOOT""#);

        let hub_err: crate::error::HubError = err.into();
        assert!(matches!(hub_err, crate::error::HubError::Command(_)));
    }
}
