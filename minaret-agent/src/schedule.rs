//! The prayer schedule engine.
//!
//! One planner task computes the next fire instant explicitly from the
//! active table: no cron expressions, no timer per event. Replacing the
//! table wakes the planner, which abandons its current sleep before
//! arming anything from the new table, so a stale table can never fire.
//! A time that has already passed today is skipped for today and honoured
//! from tomorrow onward; it never fires late.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jiff::Zoned;
use minaret_core::schedule::MINUTES_PER_DAY;
use minaret_core::{ClockTime, PrayerName, ScheduleTable};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A firing delivered to the agent's dispatch loop.
#[derive(Debug, Clone, PartialEq)]
pub struct PrayerFiring {
    pub name: PrayerName,
    /// The scheduled time of day, or the trigger time for manual firings.
    pub time: ClockTime,
    pub manual: bool,
    pub fired_at: jiff::Timestamp,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule engine already started")]
    AlreadyStarted,
}

#[derive(Debug, Error)]
#[error("schedule fetch failed: {0}")]
pub struct ScheduleSourceError(#[from] reqwest::Error);

/// Where today's table comes from at midnight rollover.
#[async_trait]
pub trait ScheduleSource: Send + Sync + 'static {
    async fn fetch_today(&self) -> Result<ScheduleTable, ScheduleSourceError>;
}

/// Fetches the day's table from the coordinator's schedule endpoint.
pub struct HttpScheduleSource {
    url: String,
    client: reqwest::Client,
}

impl HttpScheduleSource {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ScheduleSource for HttpScheduleSource {
    async fn fetch_today(&self) -> Result<ScheduleTable, ScheduleSourceError> {
        let table = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(table)
    }
}

struct EngineShared {
    table_tx: watch::Sender<ScheduleTable>,
}

pub struct ScheduleEngine {
    shared: Arc<EngineShared>,
    fire_tx: mpsc::Sender<PrayerFiring>,
    fire_rx: Mutex<Option<mpsc::Receiver<PrayerFiring>>>,
    source: Option<Arc<dyn ScheduleSource>>,
    stop: CancellationToken,
}

impl ScheduleEngine {
    pub fn new(initial: ScheduleTable, source: Option<Arc<dyn ScheduleSource>>) -> Self {
        let (table_tx, _) = watch::channel(initial);
        let (fire_tx, fire_rx) = mpsc::channel(16);
        Self {
            shared: Arc::new(EngineShared { table_tx }),
            fire_tx,
            fire_rx: Mutex::new(Some(fire_rx)),
            source,
            stop: CancellationToken::new(),
        }
    }

    /// Arm the engine and return the firing stream.
    ///
    /// First call only; a second call is a caller error and fails with
    /// [`ScheduleError::AlreadyStarted`].
    pub fn start(
        &self,
        cancel: &CancellationToken,
    ) -> Result<mpsc::Receiver<PrayerFiring>, ScheduleError> {
        let rx = self
            .fire_rx
            .lock()
            .expect("fire receiver lock")
            .take()
            .ok_or(ScheduleError::AlreadyStarted)?;

        tokio::spawn(run_planner(
            Arc::clone(&self.shared),
            self.fire_tx.clone(),
            self.source.clone(),
            cancel.child_token(),
            self.stop.clone(),
        ));
        Ok(rx)
    }

    /// Cancel all armed timers. Idempotent, safe from any shutdown path.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Atomically swap the active table. The planner re-arms from the new
    /// table only; times already past today are skipped until tomorrow.
    pub fn update_schedule(&self, table: ScheduleTable) {
        info!("Prayer times replaced");
        self.shared.table_tx.send_replace(table);
    }

    pub fn table(&self) -> ScheduleTable {
        *self.shared.table_tx.borrow()
    }

    pub fn scheduled_prayers(&self) -> [(PrayerName, ClockTime); 5] {
        self.table().entries_by_time()
    }

    pub fn next_prayer(&self) -> (PrayerName, ClockTime) {
        self.table().next_after(clock_now(&Zoned::now()))
    }

    pub fn current_prayer(&self) -> (PrayerName, ClockTime) {
        self.table().current_at(clock_now(&Zoned::now()))
    }

    /// Inject a firing through the normal playback path, tagged manual.
    /// Bypasses the planner entirely: the real timer for this prayer is
    /// neither consumed nor rescheduled.
    pub fn trigger_manually(&self, name: PrayerName) {
        let firing = PrayerFiring {
            name,
            time: clock_now(&Zoned::now()),
            manual: true,
            fired_at: jiff::Timestamp::now(),
        };
        info!(prayer = %name, "Manual prayer trigger");
        if self.fire_tx.try_send(firing).is_err() {
            warn!(prayer = %name, "Manual trigger dropped, engine not consuming");
        }
    }
}

/// The earliest event at or after `now` that has not fired today.
fn plan_next(
    table: &ScheduleTable,
    fired: &HashSet<PrayerName>,
    now: ClockTime,
) -> Option<(PrayerName, ClockTime)> {
    table
        .entries_by_time()
        .into_iter()
        .find(|(name, time)| *time >= now && !fired.contains(name))
}

fn clock_now(now: &Zoned) -> ClockTime {
    let time = now.time();
    ClockTime::from_minutes(time.hour() as u16 * 60 + time.minute() as u16)
        .expect("wall clock is within a day")
}

/// Real duration from `now` until `target` today, zero if the instant has
/// already passed within the current minute.
fn duration_until(now: &Zoned, target: ClockTime) -> Duration {
    let civil = now
        .date()
        .at(target.hour() as i8, target.minute() as i8, 0, 0);
    match civil.to_zoned(now.time_zone().clone()) {
        Ok(target_zoned) => {
            let delta = target_zoned.timestamp().duration_since(now.timestamp());
            if delta.is_negative() {
                Duration::ZERO
            } else {
                delta.unsigned_abs()
            }
        }
        // DST gap: minute arithmetic is close enough at this resolution.
        Err(_) => {
            let remaining = target
                .minutes_since_midnight()
                .saturating_sub(clock_now(now).minutes_since_midnight());
            Duration::from_secs(u64::from(remaining) * 60)
        }
    }
}

fn duration_until_midnight(now: &Zoned) -> Duration {
    let fallback = || {
        let remaining = MINUTES_PER_DAY - clock_now(now).minutes_since_midnight();
        Duration::from_secs(u64::from(remaining) * 60)
    };
    let Ok(tomorrow) = now.date().tomorrow() else {
        return fallback();
    };
    match tomorrow.at(0, 0, 0, 0).to_zoned(now.time_zone().clone()) {
        Ok(midnight) => midnight
            .timestamp()
            .duration_since(now.timestamp())
            .unsigned_abs(),
        Err(_) => fallback(),
    }
}

async fn run_planner(
    shared: Arc<EngineShared>,
    fire_tx: mpsc::Sender<PrayerFiring>,
    source: Option<Arc<dyn ScheduleSource>>,
    cancel: CancellationToken,
    stop: CancellationToken,
) {
    info!("Prayer scheduler started");

    let mut table_rx = shared.table_tx.subscribe();
    let mut fired: HashSet<PrayerName> = HashSet::new();
    let mut current_day = Zoned::now().date();

    loop {
        let now = Zoned::now();
        if now.date() != current_day {
            current_day = now.date();
            fired.clear();
        }

        let table = *table_rx.borrow_and_update();
        match plan_next(&table, &fired, clock_now(&now)) {
            Some((name, time)) => {
                let wait = duration_until(&now, time);
                debug!(prayer = %name, time = %time, wait_secs = wait.as_secs(), "Next prayer armed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stop.cancelled() => break,
                    changed = table_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!("Schedule replaced, re-planning");
                    }
                    _ = tokio::time::sleep(wait) => {
                        fired.insert(name);
                        info!(prayer = %name, time = %time, "Prayer time reached");
                        let firing = PrayerFiring {
                            name,
                            time,
                            manual: false,
                            fired_at: jiff::Timestamp::now(),
                        };
                        if fire_tx.send(firing).await.is_err() {
                            break;
                        }
                    }
                }
            }
            None => {
                let wait = duration_until_midnight(&now);
                debug!(wait_secs = wait.as_secs(), "No prayers left today, waiting for rollover");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stop.cancelled() => break,
                    changed = table_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        info!("Schedule replaced, re-planning");
                    }
                    _ = tokio::time::sleep(wait) => {
                        fired.clear();
                        if let Some(source) = &source {
                            match source.fetch_today().await {
                                Ok(table) => {
                                    info!("Loaded today's prayer times");
                                    shared.table_tx.send_replace(table);
                                }
                                Err(e) => {
                                    warn!(error = %e, "Could not fetch today's times, keeping previous table");
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    info!("Prayer scheduler stopped");
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

    fn at(s: &str) -> ClockTime {
        s.parse().unwrap()
    }

    #[test]
    fn plan_skips_past_events() {
        let fired = HashSet::new();
        assert_eq!(
            plan_next(&table(), &fired, at("13:00")),
            Some((PrayerName::Asr, at("15:45")))
        );
    }

    #[test]
    fn plan_fires_event_at_the_current_minute() {
        let fired = HashSet::new();
        assert_eq!(
            plan_next(&table(), &fired, at("12:30")),
            Some((PrayerName::Dhuhr, at("12:30")))
        );
    }

    #[test]
    fn plan_skips_already_fired_events() {
        let mut fired = HashSet::new();
        fired.insert(PrayerName::Dhuhr);
        assert_eq!(
            plan_next(&table(), &fired, at("12:30")),
            Some((PrayerName::Asr, at("15:45")))
        );
    }

    #[test]
    fn plan_is_empty_after_the_last_prayer() {
        let fired = HashSet::new();
        assert_eq!(plan_next(&table(), &fired, at("21:00")), None);
    }

    #[test]
    fn plan_handles_two_prayers_in_the_same_minute() {
        let mut same = table();
        same.asr = same.dhuhr;
        let mut fired = HashSet::new();

        let first = plan_next(&same, &fired, at("12:30")).unwrap();
        assert_eq!(first, (PrayerName::Dhuhr, at("12:30")));
        fired.insert(first.0);

        let second = plan_next(&same, &fired, at("12:30")).unwrap();
        assert_eq!(second, (PrayerName::Asr, at("12:30")));
    }

    #[test]
    fn duration_until_is_zero_for_the_current_minute() {
        let now = Zoned::now();
        assert_eq!(duration_until(&now, clock_now(&now)), Duration::ZERO);
    }

    #[test]
    fn midnight_wait_covers_the_rest_of_the_day() {
        let now = Zoned::now();
        let wait = duration_until_midnight(&now);
        assert!(wait <= Duration::from_secs(24 * 3600));
        let remaining_minutes =
            u64::from(MINUTES_PER_DAY - clock_now(&now).minutes_since_midnight());
        // Within a minute of the arithmetic fallback.
        assert!(wait.as_secs() <= remaining_minutes * 60);
        assert!(wait.as_secs() + 60 >= remaining_minutes.saturating_sub(1) * 60);
    }
}
