use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod schedule;

pub use envelope::{AckOutcome, Command, Report};
pub use schedule::{ClockTime, ClockTimeError, PrayerName, ScheduleTable};

// Owned strings in these records are immutable after construction, so we
// store them as `Box<str>` to keep the structs compact.
type BoxStr = Box<str>;

/// Stable identity of a device, derived from hardware at first boot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub BoxStr);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operational status a device advertises to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Still starting up, not yet serving.
    Initializing,
    /// Healthy and serving normally.
    Ready,
    /// Degraded; still attempting its duties.
    Error,
    /// Intentionally withdrawn pending technician action.
    Maintenance,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Initializing => "initializing",
            DeviceStatus::Ready => "ready",
            DeviceStatus::Error => "error",
            DeviceStatus::Maintenance => "maintenance",
        }
    }
}

/// Health classification produced by the system monitor.
///
/// Deliberately narrower than [`DeviceStatus`]: the monitor can degrade a
/// device or recover it, but never move it in or out of maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ready,
    Error,
}

/// The persisted identity record, written once at first boot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceIdentity {
    pub device_id: DeviceId,
    pub serial_number: BoxStr,
    pub mac_address: BoxStr,
    /// Hardware model string, e.g. "Raspberry Pi 4 Model B Rev 1.4".
    pub model: BoxStr,
    pub created_at: jiff::Timestamp,
}

/// Customer metadata pushed by the coordinator. Display-only: the agent
/// stores it and surfaces it on the local status endpoint, nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerInfo {
    pub full_name: BoxStr,
    #[serde(default)]
    pub address: Option<BoxStr>,
    #[serde(default)]
    pub phone: Option<BoxStr>,
}

/// Point-in-time vitals sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    /// CPU temperature in degrees Celsius.
    pub cpu_temp_c: f64,
    /// CPU utilization percentage.
    pub cpu_usage_pct: f64,
    /// Memory utilization percentage.
    pub memory_usage_pct: f64,
    /// Root filesystem utilization percentage.
    pub disk_usage_pct: f64,
    /// Core supply voltage, when the platform exposes it.
    pub supply_voltage_v: Option<f64>,
    /// Whether the upstream internet probe succeeded.
    pub internet_connected: bool,
    /// WiFi signal level in dBm, when connected over WiFi.
    pub wifi_signal_dbm: Option<i16>,
    /// One-minute load average.
    pub load_average: f64,
    /// Seconds since boot.
    pub uptime_seconds: u64,
    pub timestamp: jiff::Timestamp,
}

/// One threshold check inside a [`HealthReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckVerdict {
    pub value: f64,
    pub threshold: f64,
    pub ok: bool,
}

/// A snapshot annotated with per-check verdicts, for coordinator-side
/// diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub cpu_temperature: CheckVerdict,
    pub disk_usage: CheckVerdict,
    pub memory_usage: CheckVerdict,
    /// Absent on platforms without a voltage sensor.
    pub supply_voltage: Option<CheckVerdict>,
    pub internet_connected: bool,
    pub timestamp: jiff::Timestamp,
}

/// Snapshot of the audio output state. Owned by the audio guard; read-only
/// everywhere else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioState {
    pub volume_percent: u8,
    pub muted: bool,
    pub currently_playing: bool,
}
