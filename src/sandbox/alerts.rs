//! Security alert bus.
//!
//! Violations and emergency terminations are published here so that
//! consumers (CLI, report writers, tests) can react without the publishers
//! knowing about them. Every alert is also logged at `error`.

use super::error::{ErrorSeverity, ViolationKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Capacity of the broadcast channel.
const ALERT_CAPACITY: usize = 256;

/// Number of alerts kept for later inspection.
const HISTORY_LIMIT: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "violation", rename_all = "kebab-case")]
pub enum AlertKind {
    Violation(ViolationKind),
    EmergencyTermination,
    SuspiciousNetworkActivity,
    ThresholdExceeded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityAlert {
    pub environment: String,
    pub kind: AlertKind,
    pub severity: ErrorSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
pub struct AlertBus {
    tx: broadcast::Sender<SecurityAlert>,
    history: Mutex<VecDeque<SecurityAlert>>,
}

impl Default for AlertBus {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(ALERT_CAPACITY);
        Self {
            tx,
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SecurityAlert> {
        self.tx.subscribe()
    }

    pub fn raise(
        &self,
        environment: &str,
        kind: AlertKind,
        severity: ErrorSeverity,
        message: impl Into<String>,
    ) {
        let alert = SecurityAlert {
            environment: environment.to_string(),
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
        };
        tracing::error!(
            env_id = %alert.environment,
            kind = ?alert.kind,
            severity = ?alert.severity,
            "SECURITY ALERT: {}",
            alert.message
        );

        {
            let mut history = self.history.lock().unwrap_or_else(|p| p.into_inner());
            if history.len() == HISTORY_LIMIT {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        // No subscribers is fine
        let _ = self.tx.send(alert);
    }

    pub fn violation(&self, environment: &str, kind: ViolationKind, message: impl Into<String>) {
        self.raise(
            environment,
            AlertKind::Violation(kind),
            ErrorSeverity::Critical,
            message,
        );
    }

    /// Alerts raised for `environment`, oldest first
    pub fn history_for(&self, environment: &str) -> Vec<SecurityAlert> {
        self.history
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|a| a.environment == environment)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_alerts() {
        let bus = AlertBus::new();
        let mut rx = bus.subscribe();

        bus.violation("assess-1", ViolationKind::Network, "host network attached");

        let alert = rx.recv().await.unwrap();
        assert_eq!(alert.environment, "assess-1");
        assert_eq!(alert.kind, AlertKind::Violation(ViolationKind::Network));
        assert_eq!(alert.severity, ErrorSeverity::Critical);
    }

    #[test]
    fn test_history_is_filtered_by_environment() {
        let bus = AlertBus::new();
        bus.violation("a", ViolationKind::Filesystem, "one");
        bus.raise("b", AlertKind::EmergencyTermination, ErrorSeverity::Critical, "two");

        assert_eq!(bus.history_for("a").len(), 1);
        assert_eq!(bus.history_for("b")[0].kind, AlertKind::EmergencyTermination);
        assert!(bus.history_for("c").is_empty());
    }
}
