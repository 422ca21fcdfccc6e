//! The coordinator wire contract.
//!
//! Inbound [`Command`] and outbound [`Report`] envelopes are tagged JSON
//! objects (`{"type": "...", ...}`). They are transient: never persisted,
//! rebuilt from live state whenever needed.

use serde::{Deserialize, Serialize};

use crate::schedule::{ClockTime, PrayerName, ScheduleTable};
use crate::{CustomerInfo, DeviceId, DeviceIdentity, DeviceStatus, HealthSnapshot};

/// A command pushed by the coordinator to the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    VolumeUpdate {
        volume: i64,
    },
    MuteUpdate {
        muted: bool,
    },
    #[serde(rename_all = "camelCase")]
    PrayerTimesUpdate {
        prayer_times: ScheduleTable,
    },
    RemoteMaintenance,
    AudioTest,
    CustomerAssignment {
        customer: CustomerInfo,
    },
}

impl Command {
    /// The wire name of this command, echoed back in acknowledgements.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::VolumeUpdate { .. } => "volume_update",
            Command::MuteUpdate { .. } => "mute_update",
            Command::PrayerTimesUpdate { .. } => "prayer_times_update",
            Command::RemoteMaintenance => "remote_maintenance",
            Command::AudioTest => "audio_test",
            Command::CustomerAssignment { .. } => "customer_assignment",
        }
    }
}

/// Outcome carried by a `command_ack` report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckOutcome {
    Completed,
    Failed,
}

/// A report sent by the device to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Report {
    /// Sent once on every new connected session.
    #[serde(rename_all = "camelCase")]
    DeviceRegister {
        device_id: DeviceId,
        device_info: DeviceIdentity,
        status: DeviceStatus,
        timestamp: jiff::Timestamp,
    },
    /// Sent on status change and periodically as the session heartbeat.
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        device_id: DeviceId,
        status: DeviceStatus,
        system_info: Option<HealthSnapshot>,
        timestamp: jiff::Timestamp,
    },
    /// Sent after every playback attempt, audible or skipped.
    #[serde(rename_all = "camelCase")]
    PrayerPlayed {
        device_id: DeviceId,
        prayer: PrayerName,
        time: ClockTime,
        manual: bool,
        timestamp: jiff::Timestamp,
    },
    /// Sent after handling any actionable inbound command.
    #[serde(rename_all = "camelCase")]
    CommandAck {
        device_id: DeviceId,
        command: Box<str>,
        status: AckOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<Box<str>>,
        timestamp: jiff::Timestamp,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_decode_from_coordinator_json() {
        let cmd: Command = serde_json::from_str(r#"{"type":"volume_update","volume":80}"#).unwrap();
        assert_eq!(cmd, Command::VolumeUpdate { volume: 80 });
        assert_eq!(cmd.kind(), "volume_update");

        let cmd: Command = serde_json::from_str(
            r#"{"type":"prayer_times_update","prayerTimes":{"fajr":"05:15","dhuhr":"12:30","asr":"15:45","maghrib":"18:42","isha":"20:15"}}"#,
        )
        .unwrap();
        assert!(matches!(cmd, Command::PrayerTimesUpdate { .. }));

        let cmd: Command = serde_json::from_str(r#"{"type":"remote_maintenance"}"#).unwrap();
        assert_eq!(cmd, Command::RemoteMaintenance);

        assert!(serde_json::from_str::<Command>(r#"{"type":"self_destruct"}"#).is_err());
    }

    #[test]
    fn ack_report_carries_command_type_and_outcome() {
        let report = Report::CommandAck {
            device_id: DeviceId("MNRT-00000001".into()),
            command: "audio_test".into(),
            status: AckOutcome::Failed,
            error: Some("no audio sink".into()),
            timestamp: jiff::Timestamp::UNIX_EPOCH,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "command_ack");
        assert_eq!(json["command"], "audio_test");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["deviceId"], "MNRT-00000001");
    }

    #[test]
    fn status_update_uses_wire_status_names() {
        let report = Report::StatusUpdate {
            device_id: DeviceId("MNRT-00000001".into()),
            status: DeviceStatus::Maintenance,
            system_info: None,
            timestamp: jiff::Timestamp::UNIX_EPOCH,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["type"], "status_update");
        assert_eq!(json["status"], "maintenance");
    }
}
