//! Periodic vitals sampling and edge-triggered health classification.
//!
//! Every tick produces a [`HealthSnapshot`]; the classified status is
//! emitted only when it differs from the previous tick. A degraded device
//! keeps running and keeps calling prayer.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use minaret_core::{CheckVerdict, HealthReport, HealthSnapshot, HealthStatus};
use sysinfo::{Disks, System};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::HealthConfig;

const THERMAL_ZONE_PATH: &str = "/sys/class/thermal/thermal_zone0/temp";
const WIRELESS_PROC_PATH: &str = "/proc/net/wireless";

/// Thresholds against which a snapshot is judged.
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub cpu_temp_max_c: f64,
    pub disk_usage_max_pct: f64,
    pub memory_usage_max_pct: f64,
    pub supply_voltage_min_v: f64,
}

impl From<&HealthConfig> for HealthThresholds {
    fn from(config: &HealthConfig) -> Self {
        Self {
            cpu_temp_max_c: config.cpu_temp_max_c,
            disk_usage_max_pct: config.disk_usage_max_pct,
            memory_usage_max_pct: config.memory_usage_max_pct,
            supply_voltage_min_v: config.supply_voltage_min_v,
        }
    }
}

#[derive(Clone)]
pub struct HealthMonitor {
    config: HealthConfig,
    wifi_interface: String,
    last: Arc<Mutex<Option<HealthSnapshot>>>,
    stop: CancellationToken,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, wifi_interface: String) -> Self {
        Self {
            config,
            wifi_interface,
            last: Arc::new(Mutex::new(None)),
            stop: CancellationToken::new(),
        }
    }

    /// Spawn the sampling task.
    ///
    /// The returned channel yields a status only on transitions. The task
    /// stops when either the given token or [`HealthMonitor::stop`] fires.
    pub fn start(&self, cancel: &CancellationToken) -> mpsc::Receiver<HealthStatus> {
        let (tx, rx) = mpsc::channel(8);
        let monitor = self.clone();
        let parent = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => {}
                _ = monitor.stop.cancelled() => {}
                _ = monitor.run(tx) => {}
            }
            info!("Health monitor stopped");
        });
        rx
    }

    /// Idempotent; safe from any shutdown path.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub async fn last_snapshot(&self) -> Option<HealthSnapshot> {
        self.last.lock().await.clone()
    }

    /// The last snapshot annotated with per-check verdicts.
    pub async fn health_report(&self) -> Option<HealthReport> {
        let snapshot = self.last_snapshot().await?;
        Some(annotate(&snapshot, &HealthThresholds::from(&self.config)))
    }

    async fn run(&self, tx: mpsc::Sender<HealthStatus>) {
        info!(interval_secs = self.config.interval_secs, "Health monitor started");

        let thresholds = HealthThresholds::from(&self.config);
        let mut system = System::new();
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        let mut previous: Option<HealthStatus> = None;

        loop {
            interval.tick().await;

            let snapshot = self.sample(&mut system).await;
            let status = classify(&snapshot, &thresholds);
            *self.last.lock().await = Some(snapshot);

            if previous != Some(status) {
                info!(status = ?status, "Health status changed");
                if tx.send(status).await.is_err() {
                    break;
                }
                previous = Some(status);
            } else {
                debug!(status = ?status, "Health unchanged");
            }
        }
    }

    async fn sample(&self, system: &mut System) -> HealthSnapshot {
        system.refresh_cpu_usage();
        system.refresh_memory();

        let cpu_usage_pct = f64::from(system.global_cpu_info().cpu_usage());
        let memory_usage_pct = if system.total_memory() > 0 {
            system.used_memory() as f64 / system.total_memory() as f64 * 100.0
        } else {
            0.0
        };

        let disks = Disks::new_with_refreshed_list();
        let disk_usage_pct = disks
            .iter()
            .find(|disk| disk.mount_point() == Path::new("/"))
            .map(|disk| {
                let total = disk.total_space() as f64;
                if total > 0.0 {
                    (total - disk.available_space() as f64) / total * 100.0
                } else {
                    0.0
                }
            })
            .unwrap_or(0.0);

        let internet_connected = probe_internet(
            self.config.probe_addr,
            Duration::from_secs(self.config.probe_timeout_secs.max(1)),
        )
        .await;

        HealthSnapshot {
            cpu_temp_c: read_cpu_temp(Path::new(THERMAL_ZONE_PATH)).unwrap_or(0.0),
            cpu_usage_pct,
            memory_usage_pct,
            disk_usage_pct,
            supply_voltage_v: read_supply_voltage().await,
            internet_connected,
            wifi_signal_dbm: read_wifi_signal(Path::new(WIRELESS_PROC_PATH), &self.wifi_interface),
            load_average: System::load_average().one,
            uptime_seconds: System::uptime(),
            timestamp: jiff::Timestamp::now(),
        }
    }
}

/// Overall status for one snapshot.
///
/// Temperature, undervoltage and internet loss degrade immediately; a
/// couple of soft issues (disk or memory pressure) are tolerated and only
/// logged.
pub fn classify(snapshot: &HealthSnapshot, thresholds: &HealthThresholds) -> HealthStatus {
    let mut issues: Vec<String> = Vec::new();
    let mut critical = false;

    if snapshot.cpu_temp_c > thresholds.cpu_temp_max_c {
        issues.push(format!("high CPU temperature: {:.1}C", snapshot.cpu_temp_c));
        critical = true;
    }
    if let Some(voltage) = snapshot.supply_voltage_v {
        if voltage > 0.0 && voltage < thresholds.supply_voltage_min_v {
            issues.push(format!("low supply voltage: {voltage:.2}V"));
            critical = true;
        }
    }
    if !snapshot.internet_connected {
        issues.push("no internet connection".to_string());
        critical = true;
    }
    if snapshot.disk_usage_pct > thresholds.disk_usage_max_pct {
        issues.push(format!("high disk usage: {:.1}%", snapshot.disk_usage_pct));
    }
    if snapshot.memory_usage_pct > thresholds.memory_usage_max_pct {
        issues.push(format!("high memory usage: {:.1}%", snapshot.memory_usage_pct));
    }

    if issues.is_empty() {
        return HealthStatus::Ready;
    }
    if !critical && issues.len() <= 2 {
        info!(?issues, "Minor issues detected, device stays ready");
        return HealthStatus::Ready;
    }
    warn!(?issues, "System issues detected");
    HealthStatus::Error
}

fn annotate(snapshot: &HealthSnapshot, thresholds: &HealthThresholds) -> HealthReport {
    HealthReport {
        overall: classify(snapshot, thresholds),
        cpu_temperature: CheckVerdict {
            value: snapshot.cpu_temp_c,
            threshold: thresholds.cpu_temp_max_c,
            ok: snapshot.cpu_temp_c <= thresholds.cpu_temp_max_c,
        },
        disk_usage: CheckVerdict {
            value: snapshot.disk_usage_pct,
            threshold: thresholds.disk_usage_max_pct,
            ok: snapshot.disk_usage_pct <= thresholds.disk_usage_max_pct,
        },
        memory_usage: CheckVerdict {
            value: snapshot.memory_usage_pct,
            threshold: thresholds.memory_usage_max_pct,
            ok: snapshot.memory_usage_pct <= thresholds.memory_usage_max_pct,
        },
        supply_voltage: snapshot.supply_voltage_v.map(|voltage| CheckVerdict {
            value: voltage,
            threshold: thresholds.supply_voltage_min_v,
            ok: voltage <= 0.0 || voltage >= thresholds.supply_voltage_min_v,
        }),
        internet_connected: snapshot.internet_connected,
        timestamp: snapshot.timestamp,
    }
}

async fn probe_internet(addr: std::net::SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Millidegrees in the thermal zone file, degrees out.
fn read_cpu_temp(path: &Path) -> Option<f64> {
    let raw = std::fs::read_to_string(path).ok()?;
    let millidegrees: f64 = raw.trim().parse().ok()?;
    Some(millidegrees / 1000.0)
}

/// Core voltage from the Raspberry Pi firmware, absent elsewhere.
async fn read_supply_voltage() -> Option<f64> {
    let output = tokio::process::Command::new("vcgencmd")
        .args(["measure_volts", "core"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_vcgencmd_volts(&String::from_utf8_lossy(&output.stdout))
}

fn parse_vcgencmd_volts(output: &str) -> Option<f64> {
    output
        .trim()
        .strip_prefix("volt=")?
        .strip_suffix('V')?
        .parse()
        .ok()
}

/// Signal level for `interface` out of `/proc/net/wireless`.
fn read_wifi_signal(path: &Path, interface: &str) -> Option<i16> {
    let content = std::fs::read_to_string(path).ok()?;
    parse_wireless_signal(&content, interface)
}

fn parse_wireless_signal(content: &str, interface: &str) -> Option<i16> {
    let prefix = format!("{interface}:");
    let line = content
        .lines()
        .map(str::trim_start)
        .find(|line| line.starts_with(&prefix))?;
    // Fields: status, link quality, signal level, noise, ...
    let signal = line.split_whitespace().nth(3)?;
    signal.trim_end_matches('.').parse().ok()
}
