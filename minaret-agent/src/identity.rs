//! Device identity: derived from stable hardware fields at first boot,
//! persisted, and never changed afterwards.

use std::fmt::Write as _;
use std::path::Path;

use minaret_core::{DeviceId, DeviceIdentity};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{info, warn};

const CPUINFO_PATH: &str = "/proc/cpuinfo";
const DT_SERIAL_PATH: &str = "/sys/firmware/devicetree/base/serial-number";
const DT_MODEL_PATH: &str = "/proc/device-tree/model";
const NET_DIR: &str = "/sys/class/net";

const ID_PREFIX: &str = "MNRT";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no stable hardware identifiers found (serial and MAC both unknown)")]
    NoStableHardware,
    #[error("identity record at {path} is unreadable: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("identity record at {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Load the persisted identity, creating and persisting it on first boot.
///
/// A failure to persist falls back to a MAC-derived id and a warning; only
/// the total absence of stable hardware identifiers is an error, and that
/// one is fatal to startup.
pub fn load_or_create(path: &Path) -> Result<DeviceIdentity, IdentityError> {
    if path.exists() {
        let content = std::fs::read_to_string(path).map_err(|source| IdentityError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let identity: DeviceIdentity =
            serde_json::from_str(&content).map_err(|source| IdentityError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;
        info!(device_id = %identity.device_id, "Loaded existing device identity");
        return Ok(identity);
    }

    let serial = read_serial(Path::new(CPUINFO_PATH), Path::new(DT_SERIAL_PATH));
    let mac = read_mac_address(Path::new(NET_DIR));
    let model = read_model(Path::new(DT_MODEL_PATH));

    let (serial, mac) = match (serial, mac) {
        (None, None) => return Err(IdentityError::NoStableHardware),
        (serial, mac) => (
            serial.unwrap_or_else(|| "unknown".to_string()),
            mac.unwrap_or_else(|| "unknown".to_string()),
        ),
    };

    let identity = DeviceIdentity {
        device_id: derive_device_id(&serial, &mac),
        serial_number: serial.into(),
        mac_address: mac.into(),
        model: model.unwrap_or_else(|| "unknown".to_string()).into(),
        created_at: jiff::Timestamp::now(),
    };

    if let Err(e) = persist(path, &identity) {
        warn!(error = %e, path = %path.display(),
            "Could not persist identity record, continuing with derived id");
    } else {
        info!(device_id = %identity.device_id, "Generated new device identity");
    }

    Ok(identity)
}

/// Stable id from the hardware fingerprint: the project prefix plus the
/// first eight hex digits of SHA-256(serial "-" mac).
fn derive_device_id(serial: &str, mac: &str) -> DeviceId {
    let digest = Sha256::digest(format!("{serial}-{mac}"));
    let mut id = String::with_capacity(ID_PREFIX.len() + 9);
    id.push_str(ID_PREFIX);
    id.push('-');
    for byte in &digest[..4] {
        let _ = write!(id, "{byte:02X}");
    }
    DeviceId(id.into())
}

fn persist(path: &Path, identity: &DeviceIdentity) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let record = serde_json::to_string_pretty(identity)?;
    std::fs::write(path, record)
}

/// CPU serial from `/proc/cpuinfo`, falling back to the device-tree
/// serial-number node.
fn read_serial(cpuinfo: &Path, dt_serial: &Path) -> Option<String> {
    if let Ok(content) = std::fs::read_to_string(cpuinfo) {
        let serial = content
            .lines()
            .find(|line| line.starts_with("Serial"))
            .and_then(|line| line.split(':').nth(1))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if serial.is_some() {
            return serial;
        }
    }

    std::fs::read(dt_serial)
        .ok()
        .map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .trim_matches(char::from(0))
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty())
}

/// First non-loopback interface MAC address.
fn read_mac_address(net_dir: &Path) -> Option<String> {
    let mut names: Vec<_> = std::fs::read_dir(net_dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "lo")
        .collect();
    names.sort();

    for name in names {
        if let Ok(address) = std::fs::read_to_string(net_dir.join(&name).join("address")) {
            let address = address.trim().to_string();
            if !address.is_empty() && address != "00:00:00:00:00:00" {
                return Some(address);
            }
        }
    }
    None
}

fn read_model(model_path: &Path) -> Option<String> {
    std::fs::read(model_path)
        .ok()
        .map(|bytes| {
            String::from_utf8_lossy(&bytes)
                .trim_matches(char::from(0))
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_id_is_stable_and_prefixed() {
        let a = derive_device_id("10000000abcdef01", "b8:27:eb:12:34:56");
        let b = derive_device_id("10000000abcdef01", "b8:27:eb:12:34:56");
        assert_eq!(a, b);
        assert!(a.0.starts_with("MNRT-"));
        assert_eq!(a.0.len(), "MNRT-".len() + 8);

        let other = derive_device_id("10000000abcdef01", "b8:27:eb:12:34:57");
        assert_ne!(a, other);
    }

    #[test]
    fn serial_read_prefers_cpuinfo_then_device_tree() {
        let dir = tempfile::tempdir().unwrap();
        let cpuinfo = dir.path().join("cpuinfo");
        let dt = dir.path().join("serial-number");

        std::fs::write(&cpuinfo, "processor\t: 0\nSerial\t\t: 10000000cafe0001\n").unwrap();
        assert_eq!(
            read_serial(&cpuinfo, &dt),
            Some("10000000cafe0001".to_string())
        );

        std::fs::write(&cpuinfo, "processor\t: 0\n").unwrap();
        std::fs::write(&dt, b"10000000cafe0002\0").unwrap();
        assert_eq!(
            read_serial(&cpuinfo, &dt),
            Some("10000000cafe0002".to_string())
        );

        std::fs::write(&dt, b"").unwrap();
        assert_eq!(read_serial(&cpuinfo, &dt), None);
    }

    #[test]
    fn mac_read_skips_loopback_and_all_zero() {
        let dir = tempfile::tempdir().unwrap();
        let net = dir.path();

        std::fs::create_dir(net.join("lo")).unwrap();
        std::fs::write(net.join("lo").join("address"), "00:00:00:00:00:00\n").unwrap();
        std::fs::create_dir(net.join("dummy0")).unwrap();
        std::fs::write(net.join("dummy0").join("address"), "00:00:00:00:00:00\n").unwrap();
        std::fs::create_dir(net.join("wlan0")).unwrap();
        std::fs::write(net.join("wlan0").join("address"), "b8:27:eb:aa:bb:cc\n").unwrap();

        assert_eq!(
            read_mac_address(net),
            Some("b8:27:eb:aa:bb:cc".to_string())
        );
    }

    #[test]
    fn identity_record_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.json");

        let identity = DeviceIdentity {
            device_id: derive_device_id("serial", "mac"),
            serial_number: "serial".into(),
            mac_address: "mac".into(),
            model: "Raspberry Pi 4 Model B".into(),
            created_at: jiff::Timestamp::UNIX_EPOCH,
        };
        persist(&path, &identity).unwrap();

        let loaded = load_or_create(&path).unwrap();
        assert_eq!(loaded.device_id, identity.device_id);
        assert_eq!(loaded.serial_number, identity.serial_number);

        // A second load must yield the same id: it never changes for the
        // lifetime of the device.
        let again = load_or_create(&path).unwrap();
        assert_eq!(again.device_id, identity.device_id);
    }
}
