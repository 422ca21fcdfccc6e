//! The device agent orchestrator: wires the schedule engine, audio guard,
//! health monitor and coordinator link together and runs the central
//! dispatch loop.

use std::sync::Arc;

use async_trait::async_trait;
use minaret_core::{AckOutcome, Command, DeviceIdentity, DeviceStatus, HealthStatus, Report};
use minaret_link::{LinkEvent, LinkHandle, SessionReporter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::audio::{AudioGuard, PlayOutcome};
use crate::health::HealthMonitor;
use crate::schedule::{PrayerFiring, ScheduleEngine};
use crate::state::AgentState;

/// Command types the coordinator may legitimately send; a malformed frame
/// claiming one of these is nacked, anything else is only logged.
const KNOWN_COMMANDS: [&str; 6] = [
    "volume_update",
    "mute_update",
    "prayer_times_update",
    "remote_maintenance",
    "audio_test",
    "customer_assignment",
];

pub struct Agent {
    pub identity: DeviceIdentity,
    pub state: AgentState,
    pub audio: AudioGuard,
    pub engine: Arc<ScheduleEngine>,
    pub health: HealthMonitor,
    pub link: LinkHandle,
}

/// Builds the session-scoped reports the link sends on connect and on
/// every heartbeat tick.
pub struct AgentReporter {
    pub identity: DeviceIdentity,
    pub state: AgentState,
    pub health: HealthMonitor,
}

#[async_trait]
impl SessionReporter for AgentReporter {
    async fn registration(&self) -> Report {
        Report::DeviceRegister {
            device_id: self.identity.device_id.clone(),
            device_info: self.identity.clone(),
            status: self.state.status().await,
            timestamp: jiff::Timestamp::now(),
        }
    }

    async fn heartbeat(&self) -> Report {
        Report::StatusUpdate {
            device_id: self.identity.device_id.clone(),
            status: self.state.status().await,
            system_info: self.health.last_snapshot().await,
            timestamp: jiff::Timestamp::now(),
        }
    }
}

impl Agent {
    /// Run the central dispatch loop until cancellation.
    ///
    /// Every inbound stream is handled in one place so commands, firings
    /// and health transitions serialize naturally; playback itself happens
    /// inline, which is fine because nothing here is latency-sensitive
    /// beyond the minute resolution of the schedule.
    pub async fn run(
        &self,
        mut firings: mpsc::Receiver<PrayerFiring>,
        mut health_events: mpsc::Receiver<HealthStatus>,
        mut link_events: mpsc::Receiver<LinkEvent>,
        cancel: CancellationToken,
    ) {
        info!("Agent dispatch loop started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(firing) = firings.recv() => {
                    self.handle_firing(firing).await;
                }
                Some(status) = health_events.recv() => {
                    self.handle_health_transition(status).await;
                }
                Some(event) = link_events.recv() => {
                    self.handle_link_event(event).await;
                }
                else => break,
            }
        }
        info!("Agent dispatch loop stopped");
    }

    pub async fn handle_firing(&self, firing: PrayerFiring) {
        info!(prayer = %firing.name, time = %firing.time, manual = firing.manual, "Prayer firing");
        let outcome = self.audio.play_prayer(firing.name).await;
        if outcome != PlayOutcome::Played {
            info!(prayer = %firing.name, ?outcome, "Playback did not run");
        }
        // Reported after every attempt, audible or not, so the coordinator
        // sees the schedule being honoured.
        self.link.send(Report::PrayerPlayed {
            device_id: self.identity.device_id.clone(),
            prayer: firing.name,
            time: firing.time,
            manual: firing.manual,
            timestamp: jiff::Timestamp::now(),
        });
    }

    pub async fn handle_health_transition(&self, status: HealthStatus) {
        let current = self.state.status().await;
        if current == DeviceStatus::Maintenance {
            // Maintenance is sticky: health flaps must not pull the device
            // back into rotation behind the technician's back.
            info!(health = ?status, "Health transition ignored while in maintenance");
            return;
        }
        let next = match status {
            HealthStatus::Ready => DeviceStatus::Ready,
            HealthStatus::Error => DeviceStatus::Error,
        };
        if self.state.set_status(next).await {
            info!(status = next.as_str(), "Device status changed");
            self.send_status_update().await;
        }
    }

    pub async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                info!("Coordinator session established");
            }
            LinkEvent::Disconnected => {
                info!("Coordinator session lost");
            }
            LinkEvent::Command(command) => {
                self.handle_command(command).await;
            }
            LinkEvent::Malformed { command, detail } => {
                match command {
                    Some(kind) if KNOWN_COMMANDS.contains(&kind.as_ref()) => {
                        self.ack(&kind, Err(detail.to_string())).await;
                    }
                    other => {
                        warn!(command = ?other, %detail, "Ignoring unknown inbound message");
                    }
                }
            }
        }
    }

    /// Dispatch one coordinator command and acknowledge it. A failing
    /// command is acked `failed` with detail; it never takes the dispatch
    /// loop down.
    pub async fn handle_command(&self, command: Command) {
        let kind = command.kind();
        let result: Result<(), String> = match command {
            Command::VolumeUpdate { volume } => {
                self.audio.set_volume(volume).await;
                Ok(())
            }
            Command::MuteUpdate { muted } => {
                self.audio.set_muted(muted);
                Ok(())
            }
            Command::PrayerTimesUpdate { prayer_times } => {
                self.engine.update_schedule(prayer_times);
                Ok(())
            }
            Command::RemoteMaintenance => {
                info!("Entering maintenance mode");
                self.state.set_status(DeviceStatus::Maintenance).await;
                self.send_status_update().await;
                Ok(())
            }
            Command::AudioTest => match self.audio.play_test().await {
                PlayOutcome::Played => Ok(()),
                PlayOutcome::SkippedBusy => Err("audio output busy".to_string()),
                PlayOutcome::SkippedMuted | PlayOutcome::Failed => {
                    Err("test playback failed".to_string())
                }
            },
            Command::CustomerAssignment { customer } => {
                info!(customer = %customer.full_name, "Customer assignment received");
                self.state.assign_customer(customer).await;
                Ok(())
            }
        };
        self.ack(kind, result).await;
    }

    async fn ack(&self, command: &str, result: Result<(), String>) {
        let (status, error) = match result {
            Ok(()) => (AckOutcome::Completed, None),
            Err(detail) => {
                warn!(command, error = %detail, "Command failed");
                (AckOutcome::Failed, Some(detail.into_boxed_str()))
            }
        };
        self.link.send(Report::CommandAck {
            device_id: self.identity.device_id.clone(),
            command: command.into(),
            status,
            error,
            timestamp: jiff::Timestamp::now(),
        });
    }

    pub async fn send_status_update(&self) {
        self.link.send(Report::StatusUpdate {
            device_id: self.identity.device_id.clone(),
            status: self.state.status().await,
            system_info: self.health.last_snapshot().await,
            timestamp: jiff::Timestamp::now(),
        });
    }
}
