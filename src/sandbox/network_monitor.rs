// Network activity monitor
//
// Samples a sandbox's connections on a fixed interval, tags records that
// match suspicious patterns and raises threshold alerts over a sliding
// one-minute window. Events go out on a broadcast channel.

use super::alerts::{AlertBus, AlertKind};
use super::error::{AssessmentError, ErrorSeverity, Result, ViolationKind};
use super::runtime::{shell, NetworkSpec, SharedRuntime};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;
const LOG_LIMIT: usize = 10_000;
const WINDOW_SECS: i64 = 60;
const SAMPLE_TIMEOUT: Duration = Duration::from_secs(10);

const SAMPLE_SCRIPT: &str =
    "for f in tcp udp tcp6 udp6; do echo \"## $f\"; cat /proc/net/$f 2>/dev/null; done";

// ---------------------------------------------------------------------------
// Records and rules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkAction {
    Allowed,
    Blocked,
    Suspicious,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkActivity {
    pub timestamp: DateTime<Utc>,
    pub container_id: String,
    pub source_ip: IpAddr,
    pub source_port: u16,
    pub destination_ip: IpAddr,
    pub destination_port: u16,
    pub protocol: Protocol,
    pub action: NetworkAction,
    pub bytes: u64,
    pub reason: Option<String>,
}

/// Static rule over destination ports, protocols and address ranges.
///
/// Every non-empty criterion must match; an empty criterion matches
/// anything. A pattern with no criteria never matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuspiciousPattern {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<u16>,
    #[serde(default)]
    pub protocols: Vec<Protocol>,
    #[serde(default)]
    pub ip_ranges: Vec<IpNetwork>,
    pub severity: ErrorSeverity,
}

impl SuspiciousPattern {
    pub fn matches(&self, activity: &NetworkActivity) -> bool {
        if self.ports.is_empty() && self.protocols.is_empty() && self.ip_ranges.is_empty() {
            return false;
        }
        let port_ok = self.ports.is_empty() || self.ports.contains(&activity.destination_port);
        let proto_ok = self.protocols.is_empty() || self.protocols.contains(&activity.protocol);
        let range_ok = self.ip_ranges.is_empty()
            || self
                .ip_ranges
                .iter()
                .any(|net| net.contains(activity.destination_ip));
        port_ok && proto_ok && range_ok
    }
}

fn cidr(s: &str) -> Vec<IpNetwork> {
    s.split(',').filter_map(|c| c.trim().parse().ok()).collect()
}

/// Built-in rule set
pub fn default_patterns() -> Vec<SuspiciousPattern> {
    vec![
        SuspiciousPattern {
            name: "cloud-metadata".into(),
            ports: vec![],
            protocols: vec![],
            ip_ranges: cidr("169.254.169.254/32"),
            severity: ErrorSeverity::Critical,
        },
        SuspiciousPattern {
            name: "backdoor-port".into(),
            ports: vec![1337, 4444, 5554, 6666, 12345, 31337],
            protocols: vec![Protocol::Tcp],
            ip_ranges: vec![],
            severity: ErrorSeverity::Critical,
        },
        SuspiciousPattern {
            name: "crypto-mining".into(),
            ports: vec![3333, 5555, 7777, 14433, 14444, 45560, 45700],
            protocols: vec![Protocol::Tcp],
            ip_ranges: vec![],
            severity: ErrorSeverity::Critical,
        },
        SuspiciousPattern {
            name: "tor".into(),
            ports: vec![9001, 9030, 9050, 9051, 9150],
            protocols: vec![],
            ip_ranges: vec![],
            severity: ErrorSeverity::Error,
        },
        SuspiciousPattern {
            name: "irc".into(),
            ports: vec![6660, 6661, 6662, 6663, 6664, 6665, 6667, 6668, 6669, 6697],
            protocols: vec![Protocol::Tcp],
            ip_ranges: vec![],
            severity: ErrorSeverity::Error,
        },
        SuspiciousPattern {
            name: "outbound-mail".into(),
            ports: vec![25, 465, 587],
            protocols: vec![Protocol::Tcp],
            ip_ranges: vec![],
            severity: ErrorSeverity::Warning,
        },
        SuspiciousPattern {
            name: "private-network".into(),
            ports: vec![],
            protocols: vec![],
            ip_ranges: cidr("10.0.0.0/8,172.16.0.0/12,192.168.0.0/16"),
            severity: ErrorSeverity::Warning,
        },
    ]
}

// ---------------------------------------------------------------------------
// Settings and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorThresholds {
    pub connections_per_minute: u64,
    pub bytes_per_minute: u64,
    pub unique_destinations_per_minute: u64,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            connections_per_minute: 100,
            bytes_per_minute: 10 * 1024 * 1024,
            unique_destinations_per_minute: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitorSettings {
    pub sample_interval_ms: u64,
    pub thresholds: MonitorThresholds,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            thresholds: MonitorThresholds::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ThresholdKind {
    ConnectionsPerMinute,
    BytesPerMinute,
    UniqueDestinationsPerMinute,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum MonitorEvent {
    SuspiciousActivity {
        activity: NetworkActivity,
        pattern: String,
        severity: ErrorSeverity,
    },
    AlertThresholdExceeded {
        container_id: String,
        threshold: ThresholdKind,
        observed: u64,
        limit: u64,
    },
}

// ---------------------------------------------------------------------------
// /proc/net parsing
// ---------------------------------------------------------------------------

fn parse_hex_ipv4(hex: &str) -> Option<IpAddr> {
    let raw = u32::from_str_radix(hex, 16).ok()?;
    Some(IpAddr::V4(Ipv4Addr::from(raw.swap_bytes())))
}

fn parse_hex_ipv6(hex: &str) -> Option<IpAddr> {
    if hex.len() != 32 {
        return None;
    }
    let mut bytes = [0u8; 16];
    for word in 0..4 {
        let raw = u32::from_str_radix(&hex[word * 8..word * 8 + 8], 16).ok()?;
        bytes[word * 4..word * 4 + 4].copy_from_slice(&raw.to_le_bytes());
    }
    let addr = Ipv6Addr::from(bytes);
    Some(match addr.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(addr),
    })
}

fn parse_endpoint(field: &str) -> Option<(IpAddr, u16)> {
    let (addr, port) = field.split_once(':')?;
    let ip = if addr.len() == 8 {
        parse_hex_ipv4(addr)?
    } else {
        parse_hex_ipv6(addr)?
    };
    let port = u16::from_str_radix(port, 16).ok()?;
    Some((ip, port))
}

/// Turn `/proc/net/{tcp,udp}[6]` dumps into activity records.
///
/// Listening sockets, unconnected sockets and loopback traffic are skipped.
pub fn parse_proc_net(output: &str, container_id: &str) -> Vec<NetworkActivity> {
    let now = Utc::now();
    let mut protocol = Protocol::Tcp;
    let mut activities = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if let Some(section) = line.strip_prefix("## ") {
            protocol = if section.starts_with("udp") {
                Protocol::Udp
            } else {
                Protocol::Tcp
            };
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || fields[0] == "sl" {
            continue;
        }
        let (Some((src_ip, src_port)), Some((dst_ip, dst_port))) =
            (parse_endpoint(fields[1]), parse_endpoint(fields[2]))
        else {
            continue;
        };
        // 0A is TCP_LISTEN
        if protocol == Protocol::Tcp && fields[3] == "0A" {
            continue;
        }
        if dst_port == 0 || dst_ip.is_unspecified() {
            continue;
        }
        if src_ip.is_loopback() || dst_ip.is_loopback() {
            continue;
        }
        let bytes = fields[4]
            .split_once(':')
            .map(|(tx, rx)| {
                u64::from_str_radix(tx, 16).unwrap_or(0) + u64::from_str_radix(rx, 16).unwrap_or(0)
            })
            .unwrap_or(0);

        activities.push(NetworkActivity {
            timestamp: now,
            container_id: container_id.to_string(),
            source_ip: src_ip,
            source_port: src_port,
            destination_ip: dst_ip,
            destination_port: dst_port,
            protocol,
            action: NetworkAction::Allowed,
            bytes,
            reason: None,
        });
    }
    activities
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

struct MonitorCore {
    runtime: SharedRuntime,
    patterns: Vec<SuspiciousPattern>,
    thresholds: MonitorThresholds,
    logs: DashMap<String, VecDeque<NetworkActivity>>,
    events: broadcast::Sender<MonitorEvent>,
    alerts: Option<Arc<AlertBus>>,
}

impl MonitorCore {
    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.send(event);
    }

    async fn sample(&self, id: &str) -> Result<Vec<NetworkActivity>> {
        let output = self.runtime.exec(id, &shell(SAMPLE_SCRIPT), SAMPLE_TIMEOUT).await?;
        Ok(parse_proc_net(&output.stdout_lossy(), id))
    }

    fn record(&self, mut activity: NetworkActivity) {
        let id = activity.container_id.clone();

        if let Some(pattern) = self.patterns.iter().find(|p| p.matches(&activity)) {
            activity.action = NetworkAction::Suspicious;
            activity.reason = Some(pattern.name.clone());
            warn!(
                env_id = %id,
                pattern = %pattern.name,
                destination = %format!("{}:{}", activity.destination_ip, activity.destination_port),
                "Suspicious network activity"
            );
            if pattern.severity == ErrorSeverity::Critical {
                if let Some(alerts) = &self.alerts {
                    alerts.raise(
                        &id,
                        AlertKind::SuspiciousNetworkActivity,
                        pattern.severity,
                        format!(
                            "{} connection to {}:{}",
                            pattern.name, activity.destination_ip, activity.destination_port
                        ),
                    );
                }
            }
            self.emit(MonitorEvent::SuspiciousActivity {
                activity: activity.clone(),
                pattern: pattern.name.clone(),
                severity: pattern.severity,
            });
        }

        let breaches = {
            let mut log = self.logs.entry(id.clone()).or_default();
            if log.len() == LOG_LIMIT {
                log.pop_front();
            }
            log.push_back(activity);
            self.window_breaches(&log)
        };

        for (threshold, observed, limit) in breaches {
            debug!(env_id = %id, ?threshold, observed, limit, "Threshold exceeded");
            if let Some(alerts) = &self.alerts {
                alerts.raise(
                    &id,
                    AlertKind::ThresholdExceeded,
                    ErrorSeverity::Warning,
                    format!("{:?}: {} > {}", threshold, observed, limit),
                );
            }
            self.emit(MonitorEvent::AlertThresholdExceeded {
                container_id: id.clone(),
                threshold,
                observed,
                limit,
            });
        }
    }

    fn window_breaches(&self, log: &VecDeque<NetworkActivity>) -> Vec<(ThresholdKind, u64, u64)> {
        let cutoff = Utc::now() - chrono::Duration::seconds(WINDOW_SECS);
        let window: Vec<&NetworkActivity> = log.iter().filter(|a| a.timestamp >= cutoff).collect();

        let connections = window.len() as u64;
        let bytes: u64 = window.iter().map(|a| a.bytes).sum();
        let destinations = window
            .iter()
            .map(|a| a.destination_ip)
            .collect::<HashSet<_>>()
            .len() as u64;

        let t = &self.thresholds;
        [
            (ThresholdKind::ConnectionsPerMinute, connections, t.connections_per_minute),
            (ThresholdKind::BytesPerMinute, bytes, t.bytes_per_minute),
            (
                ThresholdKind::UniqueDestinationsPerMinute,
                destinations,
                t.unique_destinations_per_minute,
            ),
        ]
        .into_iter()
        .filter(|(_, observed, limit)| observed > limit)
        .collect()
    }
}

pub struct NetworkMonitor {
    core: Arc<MonitorCore>,
    interval: Duration,
    samplers: DashMap<String, CancellationToken>,
    networks: DashMap<String, String>,
}

impl NetworkMonitor {
    pub fn new(runtime: SharedRuntime, settings: &MonitorSettings, alerts: Option<Arc<AlertBus>>) -> Self {
        Self::with_patterns(runtime, settings, default_patterns(), alerts)
    }

    pub fn with_patterns(
        runtime: SharedRuntime,
        settings: &MonitorSettings,
        patterns: Vec<SuspiciousPattern>,
        alerts: Option<Arc<AlertBus>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            core: Arc::new(MonitorCore {
                runtime,
                patterns,
                thresholds: settings.thresholds.clone(),
                logs: DashMap::new(),
                events,
                alerts,
            }),
            interval: Duration::from_millis(settings.sample_interval_ms.max(100)),
            samplers: DashMap::new(),
            networks: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.core.events.subscribe()
    }

    pub fn is_monitoring(&self, id: &str) -> bool {
        self.samplers.contains_key(id)
    }

    /// Recorded activity for `id`, oldest first
    pub fn activities(&self, id: &str) -> Vec<NetworkActivity> {
        self.core
            .logs
            .get(id)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Feed one observation through pattern matching and threshold checks.
    pub fn record_activity(&self, activity: NetworkActivity) {
        self.core.record(activity);
    }

    /// Take one sample now and record it.
    pub async fn sample_once(&self, id: &str) -> Result<usize> {
        let activities = self.core.sample(id).await?;
        let count = activities.len();
        for activity in activities {
            self.core.record(activity);
        }
        Ok(count)
    }

    /// Start the periodic sampler for `id`. Idempotent.
    pub fn start_monitoring(&self, id: &str) {
        if self.samplers.contains_key(id) {
            return;
        }
        let token = CancellationToken::new();
        self.samplers.insert(id.to_string(), token.clone());

        info!(env_id = %id, interval_ms = self.interval.as_millis() as u64, "Network monitoring started");

        let core = self.core.clone();
        let interval = self.interval;
        let id = id.to_string();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        match core.sample(&id).await {
                            Ok(activities) => {
                                for activity in activities {
                                    core.record(activity);
                                }
                            }
                            Err(e) => debug!(env_id = %id, "Network sample failed: {}", e),
                        }
                    }
                }
            }
            debug!(env_id = %id, "Network sampler stopped");
        });
    }

    /// Move `id` onto a fresh internal bridge network with ICC and IP
    /// masquerading disabled, detaching it from everything else first.
    pub async fn create_isolated_namespace(&self, id: &str) -> Result<String> {
        let runtime = &self.core.runtime;
        let details = runtime.inspect_container(id).await?;
        if let Some(shared) = details
            .networks
            .iter()
            .find(|n| n.as_str() == "host" || n.starts_with("container:"))
        {
            return Err(AssessmentError::violation(
                ViolationKind::Network,
                format!("cannot isolate {}: attached to '{}'", id, shared),
            ));
        }

        for network in &details.networks {
            runtime.disconnect_network(network, id, true).await?;
        }

        let name = format!("isolab-{}-ns", id);
        let mut spec = NetworkSpec::internal_bridge(name.clone());
        spec.labels.insert("isolab.environment".to_string(), id.to_string());
        runtime.create_network(&spec).await?;
        self.networks.insert(id.to_string(), name.clone());
        runtime.connect_network(&name, id).await?;

        info!(env_id = %id, network = %name, "Sandbox moved to isolated namespace");
        Ok(name)
    }

    /// Cancel the sampler, drop the log and remove any per-sandbox network.
    pub async fn stop_monitoring(&self, id: &str) {
        if let Some((_, token)) = self.samplers.remove(id) {
            token.cancel();
        }
        self.core.logs.remove(id);
        if let Some((_, network)) = self.networks.remove(id) {
            let runtime = &self.core.runtime;
            if let Err(e) = runtime.disconnect_network(&network, id, true).await {
                debug!(env_id = %id, network = %network, "Disconnect on stop: {}", e);
            }
            if let Err(e) = runtime.remove_network(&network).await {
                warn!(env_id = %id, network = %network, "Failed to remove monitor network: {}", e);
            }
        }
        debug!(env_id = %id, "Network monitoring stopped");
    }
}
