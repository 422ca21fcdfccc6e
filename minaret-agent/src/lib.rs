pub mod agent;
pub mod api;
pub mod audio;
pub mod config;
pub mod health;
pub mod identity;
pub mod schedule;
pub mod state;
pub mod wifi;

pub use agent::{Agent, AgentReporter};
pub use audio::{AudioGuard, PlayOutcome};
pub use config::Config;
pub use health::HealthMonitor;
pub use schedule::{PrayerFiring, ScheduleEngine};
pub use state::AgentState;
pub use wifi::WifiManager;
