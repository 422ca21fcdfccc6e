use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The five daily prayer events, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrayerName {
    Fajr,
    Dhuhr,
    Asr,
    Maghrib,
    Isha,
}

impl PrayerName {
    pub const ALL: [PrayerName; 5] = [
        PrayerName::Fajr,
        PrayerName::Dhuhr,
        PrayerName::Asr,
        PrayerName::Maghrib,
        PrayerName::Isha,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PrayerName::Fajr => "Fajr",
            PrayerName::Dhuhr => "Dhuhr",
            PrayerName::Asr => "Asr",
            PrayerName::Maghrib => "Maghrib",
            PrayerName::Isha => "Isha",
        }
    }

    /// File name of the audio asset for this prayer.
    pub fn asset_file_name(&self) -> &'static str {
        match self {
            PrayerName::Fajr => "fajr.wav",
            PrayerName::Dhuhr => "dhuhr.wav",
            PrayerName::Asr => "asr.wav",
            PrayerName::Maghrib => "maghrib.wav",
            PrayerName::Isha => "isha.wav",
        }
    }
}

impl std::fmt::Display for PrayerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown prayer name: {0}")]
pub struct ParsePrayerError(pub String);

impl FromStr for PrayerName {
    type Err = ParsePrayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fajr" => Ok(PrayerName::Fajr),
            "dhuhr" => Ok(PrayerName::Dhuhr),
            "asr" => Ok(PrayerName::Asr),
            "maghrib" => Ok(PrayerName::Maghrib),
            "isha" => Ok(PrayerName::Isha),
            other => Err(ParsePrayerError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockTimeError {
    #[error("invalid time of day: {0:?} (expected HH:MM)")]
    Format(String),
    #[error("time of day out of range: {0} minutes")]
    OutOfRange(u16),
}

/// A wall-clock time of day at minute resolution, stored as minutes since
/// midnight. Parses and serializes as `"HH:MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime(u16);

pub const MINUTES_PER_DAY: u16 = 24 * 60;

impl ClockTime {
    pub fn from_minutes(minutes: u16) -> Result<Self, ClockTimeError> {
        if minutes < MINUTES_PER_DAY {
            Ok(ClockTime(minutes))
        } else {
            Err(ClockTimeError::OutOfRange(minutes))
        }
    }

    pub fn minutes_since_midnight(&self) -> u16 {
        self.0
    }

    pub fn hour(&self) -> u8 {
        (self.0 / 60) as u8
    }

    pub fn minute(&self) -> u8 {
        (self.0 % 60) as u8
    }
}

impl std::fmt::Display for ClockTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for ClockTime {
    type Err = ClockTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ClockTimeError::Format(s.to_string());
        let (h, m) = s.split_once(':').ok_or_else(bad)?;
        let hour: u16 = h.parse().map_err(|_| bad())?;
        let minute: u16 = m.parse().map_err(|_| bad())?;
        if hour >= 24 || minute >= 60 {
            return Err(bad());
        }
        Ok(ClockTime(hour * 60 + minute))
    }
}

impl TryFrom<String> for ClockTime {
    type Error = ClockTimeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClockTime> for String {
    fn from(value: ClockTime) -> Self {
        value.to_string()
    }
}

/// The complete set of today's prayer times.
///
/// Always replaced wholesale: there is no partial-mutation API, so readers
/// can never observe a half-updated table. Deserialization fails unless all
/// five prayers are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleTable {
    pub fajr: ClockTime,
    pub dhuhr: ClockTime,
    pub asr: ClockTime,
    pub maghrib: ClockTime,
    pub isha: ClockTime,
}

impl ScheduleTable {
    pub fn get(&self, name: PrayerName) -> ClockTime {
        match name {
            PrayerName::Fajr => self.fajr,
            PrayerName::Dhuhr => self.dhuhr,
            PrayerName::Asr => self.asr,
            PrayerName::Maghrib => self.maghrib,
            PrayerName::Isha => self.isha,
        }
    }

    /// All entries sorted by time of day (canonical prayer order breaks
    /// ties between equal times).
    pub fn entries_by_time(&self) -> [(PrayerName, ClockTime); 5] {
        let mut entries = PrayerName::ALL.map(|name| (name, self.get(name)));
        entries.sort_by_key(|&(name, time)| (time, name));
        entries
    }

    /// The first prayer strictly after `now`, wrapping to the day's first
    /// prayer once the last has passed.
    pub fn next_after(&self, now: ClockTime) -> (PrayerName, ClockTime) {
        let entries = self.entries_by_time();
        entries
            .iter()
            .copied()
            .find(|&(_, time)| time > now)
            .unwrap_or(entries[0])
    }

    /// The latest prayer whose time has passed (or is passing) at `now`,
    /// wrapping to the previous day's last prayer before the day's first.
    pub fn current_at(&self, now: ClockTime) -> (PrayerName, ClockTime) {
        let entries = self.entries_by_time();
        entries
            .iter()
            .copied()
            .rev()
            .find(|&(_, time)| time <= now)
            .unwrap_or(entries[4])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ScheduleTable {
        ScheduleTable {
            fajr: "05:15".parse().unwrap(),
            dhuhr: "12:30".parse().unwrap(),
            asr: "15:45".parse().unwrap(),
            maghrib: "18:42".parse().unwrap(),
            isha: "20:15".parse().unwrap(),
        }
    }

    #[test]
    fn clock_time_parses_and_displays() {
        let t: ClockTime = "05:07".parse().unwrap();
        assert_eq!(t.minutes_since_midnight(), 5 * 60 + 7);
        assert_eq!(t.to_string(), "05:07");

        assert!("24:00".parse::<ClockTime>().is_err());
        assert!("12:60".parse::<ClockTime>().is_err());
        assert!("1230".parse::<ClockTime>().is_err());
        assert!("".parse::<ClockTime>().is_err());
    }

    #[test]
    fn next_before_first_prayer_is_fajr() {
        let now: ClockTime = "04:00".parse().unwrap();
        assert_eq!(table().next_after(now), (PrayerName::Fajr, table().fajr));
    }

    #[test]
    fn next_after_last_prayer_wraps_to_fajr() {
        let now: ClockTime = "21:00".parse().unwrap();
        assert_eq!(table().next_after(now), (PrayerName::Fajr, table().fajr));
    }

    #[test]
    fn next_is_strictly_after_now() {
        // At exactly Fajr time, Fajr is current and Dhuhr is next.
        let now = table().fajr;
        assert_eq!(table().next_after(now), (PrayerName::Dhuhr, table().dhuhr));
        assert_eq!(table().current_at(now), (PrayerName::Fajr, table().fajr));
    }

    #[test]
    fn current_before_fajr_wraps_to_previous_isha() {
        let now: ClockTime = "03:00".parse().unwrap();
        assert_eq!(table().current_at(now), (PrayerName::Isha, table().isha));
    }

    #[test]
    fn table_deserialization_requires_all_five() {
        let missing = r#"{"fajr":"05:15","dhuhr":"12:30","asr":"15:45","maghrib":"18:42"}"#;
        assert!(serde_json::from_str::<ScheduleTable>(missing).is_err());

        let full = r#"{"fajr":"05:15","dhuhr":"12:30","asr":"15:45","maghrib":"18:42","isha":"20:15"}"#;
        assert_eq!(serde_json::from_str::<ScheduleTable>(full).unwrap(), table());
    }

    #[test]
    fn prayer_name_round_trips_case_insensitively() {
        assert_eq!("FAJR".parse::<PrayerName>().unwrap(), PrayerName::Fajr);
        assert_eq!("maghrib".parse::<PrayerName>().unwrap(), PrayerName::Maghrib);
        assert!("test".parse::<PrayerName>().is_err());
    }
}
