use std::sync::Arc;
use std::time::Instant;

use minaret_core::{CustomerInfo, DeviceStatus};
use tokio::sync::Mutex;

/// Shared mutable agent state: the advertised status and the assigned
/// customer metadata.
pub struct AgentState {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    status: DeviceStatus,
    customer: Option<CustomerInfo>,
    started_at: Instant,
}

impl AgentState {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                status: DeviceStatus::Initializing,
                customer: None,
                started_at: Instant::now(),
            })),
        }
    }

    pub async fn status(&self) -> DeviceStatus {
        self.inner.lock().await.status
    }

    /// Set the advertised status. Returns true when it actually changed.
    pub async fn set_status(&self, status: DeviceStatus) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.status == status {
            return false;
        }
        inner.status = status;
        true
    }

    pub async fn customer(&self) -> Option<CustomerInfo> {
        self.inner.lock().await.customer.clone()
    }

    pub async fn assign_customer(&self, customer: CustomerInfo) {
        self.inner.lock().await.customer = Some(customer);
    }

    pub async fn uptime_secs(&self) -> u64 {
        self.inner.lock().await.started_at.elapsed().as_secs()
    }
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for AgentState {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
