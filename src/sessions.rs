// Client session monitor
//
// Tracks which clients could legitimately be commanding movement. The stop on
// last disconnect is edge-triggered: it happens in `on_disconnect` itself,
// without waiting for the watchdog period.

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::coordinator::MotorSafetyCoordinator;

pub struct SessionMonitor {
    coordinator: Arc<MotorSafetyCoordinator>,
}

impl SessionMonitor {
    pub fn new(coordinator: Arc<MotorSafetyCoordinator>) -> Self {
        Self { coordinator }
    }

    pub fn on_connect(&self, session: &str) {
        let total = self.coordinator.attach_session(session);
        info!("Client {} connected, {} attached", session, total);
    }

    pub async fn on_disconnect(&self, session: &str) {
        match self.coordinator.detach_session(session) {
            None => {
                warn!("Disconnect from unknown client {}", session);
            }
            Some(0) => {
                warn!("Last client {} disconnected, stopping motors", session);
                if let Err(e) = self.coordinator.force_stop().await {
                    error!("Stop after last disconnect failed: {}", e);
                }
            }
            Some(remaining) => {
                info!("Client {} disconnected, {} still attached", session, remaining);
            }
        }
    }
}
