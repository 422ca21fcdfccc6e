//! WiFi connectivity: make sure the device has an IP path before the
//! coordinator link is attempted, and give on-site technicians a fallback
//! access point to provision credentials through.
//!
//! Network state is driven through `nmcli`; the access point through
//! hostapd/dnsmasq, as on the deployed image.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::WifiConfig;

/// Scan results are capped: past the strongest handful the list is noise.
const SCAN_LIMIT: usize = 20;

#[derive(Debug, Error)]
pub enum WifiError {
    #[error("failed to run {tool}: {source}")]
    ToolSpawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: &'static str, stderr: String },
    #[error("connected to {ssid} but connectivity verification failed")]
    VerificationFailed { ssid: String },
    #[error("access point setup failed: {0}")]
    AccessPoint(String),
}

/// A network visible in a scan.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScannedNetwork {
    pub ssid: String,
    /// Signal strength as reported by nmcli, 0..=100.
    pub signal: u8,
    pub security: String,
    pub frequency_mhz: Option<u32>,
}

/// The currently active connection.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub ssid: String,
    pub signal: u8,
    pub security: String,
    pub frequency_mhz: Option<u32>,
}

#[derive(Clone)]
pub struct WifiManager {
    config: WifiConfig,
    ap_running: Arc<AtomicBool>,
}

impl WifiManager {
    pub fn new(config: WifiConfig) -> Self {
        Self {
            config,
            ap_running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn access_point_running(&self) -> bool {
        self.ap_running.load(Ordering::Relaxed)
    }

    pub async fn is_connected(&self) -> bool {
        match run_nmcli(&["-t", "-f", "DEVICE,STATE", "device"]).await {
            Ok(output) => parse_device_state(&output, &self.config.interface),
            Err(e) => {
                warn!(error = %e, "Could not query device state");
                false
            }
        }
    }

    pub async fn connection_info(&self) -> Option<ConnectionInfo> {
        let output = run_nmcli(&["-t", "-f", "ACTIVE,SSID,SIGNAL,SECURITY,FREQ", "dev", "wifi"])
            .await
            .ok()?;
        parse_active_connection(&output)
    }

    /// Visible networks, strongest first, deduplicated by SSID, capped.
    pub async fn scan_networks(&self) -> Result<Vec<ScannedNetwork>, WifiError> {
        info!("Scanning for WiFi networks");
        let output = run_nmcli(&[
            "-t",
            "-f",
            "SSID,SIGNAL,SECURITY,FREQ",
            "dev",
            "wifi",
            "list",
            "--rescan",
            "yes",
        ])
        .await?;
        let networks = parse_scan_output(&output);
        info!(count = networks.len(), "WiFi scan complete");
        Ok(networks)
    }

    /// Attempt a connection, let it settle, then verify it actually came
    /// up. No optimistic success: a failed verification is a distinct
    /// error the technician UI can show.
    pub async fn connect(&self, ssid: &str, password: &str) -> Result<(), WifiError> {
        info!(ssid, "Connecting to WiFi network");
        run_nmcli(&[
            "dev",
            "wifi",
            "connect",
            ssid,
            "password",
            password,
            "ifname",
            &self.config.interface,
        ])
        .await?;

        tokio::time::sleep(Duration::from_secs(self.config.settle_delay_secs)).await;

        if !self.is_connected().await {
            return Err(WifiError::VerificationFailed {
                ssid: ssid.to_string(),
            });
        }
        info!(ssid, "WiFi connection verified");

        if self.access_point_running() {
            self.stop_access_point().await;
        }
        Ok(())
    }

    /// Bring up the provisioning access point: write the hostapd/dnsmasq
    /// configurations, give the interface its static address and start the
    /// services.
    pub async fn start_access_point(&self) -> Result<(), WifiError> {
        let ap = &self.config.access_point;
        info!(ssid = %ap.ssid, "Starting access point");

        write_config_file(&ap.hostapd_conf_path, &hostapd_conf(&self.config)).await?;
        write_config_file(&ap.dnsmasq_conf_path, &dnsmasq_conf(&self.config)).await?;

        // A previous run may have left the services up.
        let _ = run_systemctl("stop", "hostapd").await;
        let _ = run_systemctl("stop", "dnsmasq").await;

        run_checked(
            "ip",
            &[
                "addr",
                "replace",
                &format!("{}/24", ap.address),
                "dev",
                &self.config.interface,
            ],
        )
        .await?;

        run_systemctl("start", "dnsmasq").await?;
        run_systemctl("start", "hostapd").await?;

        self.ap_running.store(true, Ordering::Relaxed);
        info!(ssid = %ap.ssid, "Access point started");
        Ok(())
    }

    /// Idempotent; service stop failures are logged, not surfaced.
    pub async fn stop_access_point(&self) {
        info!("Stopping access point");
        if let Err(e) = run_systemctl("stop", "hostapd").await {
            warn!(error = %e, "Could not stop hostapd");
        }
        if let Err(e) = run_systemctl("stop", "dnsmasq").await {
            warn!(error = %e, "Could not stop dnsmasq");
        }
        self.ap_running.store(false, Ordering::Relaxed);
    }
}

async fn write_config_file(path: &PathBuf, content: &str) -> Result<(), WifiError> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| WifiError::AccessPoint(format!("writing {}: {e}", path.display())))
}

fn hostapd_conf(config: &WifiConfig) -> String {
    let ap = &config.access_point;
    format!(
        "interface={iface}\n\
         driver=nl80211\n\
         ssid={ssid}\n\
         hw_mode=g\n\
         channel=7\n\
         wmm_enabled=0\n\
         macaddr_acl=0\n\
         auth_algs=1\n\
         ignore_broadcast_ssid=0\n\
         wpa=2\n\
         wpa_passphrase={passphrase}\n\
         wpa_key_mgmt=WPA-PSK\n\
         wpa_pairwise=TKIP\n\
         rsn_pairwise=CCMP\n",
        iface = config.interface,
        ssid = ap.ssid,
        passphrase = ap.passphrase,
    )
}

fn dnsmasq_conf(config: &WifiConfig) -> String {
    format!(
        "interface={iface}\n\
         dhcp-range=192.168.4.2,192.168.4.20,255.255.255.0,24h\n",
        iface = config.interface,
    )
}

async fn run_nmcli(args: &[&str]) -> Result<String, WifiError> {
    run_checked("nmcli", args).await
}

async fn run_systemctl(action: &str, unit: &str) -> Result<(), WifiError> {
    run_checked("systemctl", &[action, unit]).await.map(|_| ())
}

async fn run_checked(tool: &'static str, args: &[&str]) -> Result<String, WifiError> {
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|source| WifiError::ToolSpawn { tool, source })?;
    if !output.status.success() {
        return Err(WifiError::ToolFailed {
            tool,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Split one line of `nmcli -t` output, unescaping `\:` inside values.
fn split_terse_fields(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            other => current.push(other),
        }
    }
    fields.push(current);
    fields
}

fn parse_device_state(output: &str, interface: &str) -> bool {
    output.lines().any(|line| {
        let fields = split_terse_fields(line);
        fields.len() >= 2 && fields[0] == interface && fields[1] == "connected"
    })
}

fn parse_frequency(field: &str) -> Option<u32> {
    // nmcli renders FREQ as e.g. "2437 MHz".
    field.split_whitespace().next()?.parse().ok()
}

fn parse_active_connection(output: &str) -> Option<ConnectionInfo> {
    output.lines().find_map(|line| {
        let fields = split_terse_fields(line);
        if fields.len() < 5 || fields[0] != "yes" || fields[1].is_empty() {
            return None;
        }
        Some(ConnectionInfo {
            ssid: fields[1].clone(),
            signal: fields[2].parse().unwrap_or(0),
            security: fields[3].clone(),
            frequency_mhz: parse_frequency(&fields[4]),
        })
    })
}

fn parse_scan_output(output: &str) -> Vec<ScannedNetwork> {
    let mut networks: Vec<ScannedNetwork> = Vec::new();
    for line in output.lines() {
        let fields = split_terse_fields(line);
        if fields.len() < 4 || fields[0].is_empty() {
            continue;
        }
        let network = ScannedNetwork {
            ssid: fields[0].clone(),
            signal: fields[1].parse().unwrap_or(0),
            security: fields[2].clone(),
            frequency_mhz: parse_frequency(&fields[3]),
        };
        match networks.iter_mut().find(|n| n.ssid == network.ssid) {
            // Keep the strongest sighting of each SSID.
            Some(existing) => {
                if network.signal > existing.signal {
                    *existing = network;
                }
            }
            None => networks.push(network),
        }
    }
    networks.sort_by(|a, b| b.signal.cmp(&a.signal));
    networks.truncate(SCAN_LIMIT);
    networks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terse_fields_unescape_colons() {
        assert_eq!(
            split_terse_fields(r"Cafe\:Net:78:WPA2:2437 MHz"),
            vec!["Cafe:Net", "78", "WPA2", "2437 MHz"]
        );
    }

    #[test]
    fn device_state_matches_only_the_managed_interface() {
        let output = "lo:unmanaged\neth0:unavailable\nwlan0:connected\n";
        assert!(parse_device_state(output, "wlan0"));
        assert!(!parse_device_state(output, "wlan1"));
    }

    #[test]
    fn scan_dedups_sorts_and_caps() {
        let mut lines: Vec<String> = vec![
            "HomeNet:62:WPA2:2437 MHz".to_string(),
            // Hidden networks have an empty SSID and are dropped.
            ":90:WPA2:5180 MHz".to_string(),
            // A second sighting of HomeNet, stronger.
            "HomeNet:71:WPA2:5180 MHz".to_string(),
            "CoffeeShop:45::2412 MHz".to_string(),
        ];
        for i in 0..25 {
            lines.push(format!("Filler{i}:{}:WPA2:2437 MHz", 30 - i));
        }
        let output = lines.join("\n");

        let networks = parse_scan_output(&output);
        assert_eq!(networks.len(), SCAN_LIMIT);
        assert_eq!(networks[0].ssid, "HomeNet");
        assert_eq!(networks[0].signal, 71);
        assert_eq!(networks[0].frequency_mhz, Some(5180));
        assert!(networks.iter().all(|n| !n.ssid.is_empty()));
        // Sorted strongest first.
        assert!(networks.windows(2).all(|w| w[0].signal >= w[1].signal));
    }

    #[test]
    fn active_connection_requires_the_active_row() {
        let output = "no:HomeNet:62:WPA2:2437 MHz\nyes:CoffeeShop:45:WPA2:2412 MHz\n";
        let info = parse_active_connection(output).unwrap();
        assert_eq!(info.ssid, "CoffeeShop");
        assert_eq!(info.signal, 45);

        assert!(parse_active_connection("no:HomeNet:62:WPA2:2437 MHz\n").is_none());
    }
}
