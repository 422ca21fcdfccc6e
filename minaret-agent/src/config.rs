use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use minaret_core::ScheduleTable;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub server: ServerConfig,
    pub coordinator: CoordinatorConfig,
    pub audio: AudioConfig,
    pub health: HealthConfig,
    pub wifi: WifiConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Where the persisted identity record lives.
    pub identity_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address for the local technician HTTP API to listen on.
    pub http_addr: SocketAddr,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    /// Address of the coordinator link endpoint.
    pub addr: SocketAddr,
    /// Per-attempt connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Flat delay between reconnect attempts in seconds.
    pub reconnect_delay_secs: u64,
    /// Interval between heartbeats in seconds.
    pub heartbeat_interval_secs: u64,
    /// Optional URL serving today's schedule table as JSON. When unset the
    /// engine keeps re-arming from its last known table at rollover.
    pub schedule_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    /// Directory holding the prayer audio assets.
    pub audio_dir: PathBuf,
    /// Mixer volume applied on startup. Volume is volatile by design.
    pub default_volume: u8,
    pub backend: AudioBackendConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AudioBackendConfig {
    /// Play through the ALSA tools (`aplay`/`amixer`/`speaker-test`).
    Alsa {
        /// Name of the mixer control to drive, usually "Master".
        mixer_control: String,
    },
    /// Log playback instead of producing sound. For development hosts
    /// without an audio sink.
    Mock,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Seconds between vitals samples.
    pub interval_secs: u64,
    /// Address probed over TCP to judge internet reachability.
    pub probe_addr: SocketAddr,
    /// Seconds before the reachability probe gives up.
    pub probe_timeout_secs: u64,
    pub cpu_temp_max_c: f64,
    pub disk_usage_max_pct: f64,
    pub memory_usage_max_pct: f64,
    pub supply_voltage_min_v: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WifiConfig {
    /// Wireless interface to manage.
    pub interface: String,
    /// Seconds to let a new connection settle before verifying it.
    pub settle_delay_secs: u64,
    pub access_point: AccessPointConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub passphrase: String,
    /// Static address taken by the interface while the AP runs.
    pub address: String,
    pub hostapd_conf_path: PathBuf,
    pub dnsmasq_conf_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    /// Table used until the coordinator supplies one.
    pub fallback_times: ScheduleTable,
}

impl Config {
    pub fn load(path: &Path) -> color_eyre::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                identity_path: "/etc/minaret/device.json".into(),
            },
            server: ServerConfig {
                http_addr: "0.0.0.0:3000".parse().unwrap(),
            },
            coordinator: CoordinatorConfig {
                addr: "127.0.0.1:5000".parse().unwrap(),
                connect_timeout_secs: 10,
                reconnect_delay_secs: 5,
                heartbeat_interval_secs: 30,
                schedule_url: None,
            },
            audio: AudioConfig {
                audio_dir: "audio".into(),
                default_volume: 75,
                backend: AudioBackendConfig::Alsa {
                    mixer_control: "Master".to_string(),
                },
            },
            health: HealthConfig {
                interval_secs: 30,
                probe_addr: "8.8.8.8:53".parse().unwrap(),
                probe_timeout_secs: 5,
                cpu_temp_max_c: 70.0,
                disk_usage_max_pct: 90.0,
                memory_usage_max_pct: 90.0,
                supply_voltage_min_v: 4.63,
            },
            wifi: WifiConfig {
                interface: "wlan0".to_string(),
                settle_delay_secs: 3,
                access_point: AccessPointConfig {
                    ssid: "Minaret-Setup".to_string(),
                    passphrase: "minaretsetup".to_string(),
                    address: "192.168.4.1".to_string(),
                    hostapd_conf_path: "/etc/hostapd/hostapd.conf".into(),
                    dnsmasq_conf_path: "/etc/dnsmasq.conf".into(),
                },
            },
            schedule: ScheduleConfig {
                fallback_times: ScheduleTable {
                    fajr: "05:15".parse().unwrap(),
                    dhuhr: "12:30".parse().unwrap(),
                    asr: "15:45".parse().unwrap(),
                    maghrib: "18:42".parse().unwrap(),
                    isha: "20:15".parse().unwrap(),
                },
            },
        }
    }
}
