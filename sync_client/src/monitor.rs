//! Performance monitor.
//!
//! Periodically pulls counters from the bound `MetricSource`s into a
//! bounded history, checks each sample against the configured thresholds
//! and publishes one `Alert` per breach. Sources are read-only; a source
//! that cannot answer is simply missing from the sample.

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sync_shared::config::{MonitorConfig, Thresholds};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    chunks::ChunkStats,
    client::GameClient,
    connection::ConnectionStats,
    tester::{ConnectionTester, TesterStats},
};

const ALERT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryMetrics {
    pub resident_bytes: u64,
}

/// One tick worth of counters. Sections are `None` when their source is
/// absent or did not answer.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub memory: Option<MemoryMetrics>,
    pub connection: Option<ConnectionStats>,
    pub chunks: Option<ChunkStats>,
    pub tester: Option<TesterStats>,
}

impl MetricSample {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            memory: None,
            connection: None,
            chunks: None,
            tester: None,
        }
    }
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    /// Fills this source's section of `sample`.
    async fn collect(&self, sample: &mut MetricSample);
}

#[async_trait]
impl MetricSource for GameClient {
    async fn collect(&self, sample: &mut MetricSample) {
        match self.stats().await {
            Ok(stats) => {
                sample.connection = Some(stats.connection);
                sample.chunks = Some(stats.chunks);
            }
            Err(e) => debug!(error = %e, "Client stats unavailable"),
        }
    }
}

#[async_trait]
impl MetricSource for ConnectionTester {
    async fn collect(&self, sample: &mut MetricSample) {
        sample.tester = Some(self.stats());
    }
}

/// Resident set size of this process, from `/proc/self/statm`.
pub struct ProcessMemory;

const PAGE_SIZE: u64 = 4096;

#[async_trait]
impl MetricSource for ProcessMemory {
    async fn collect(&self, sample: &mut MetricSample) {
        let Ok(statm) = std::fs::read_to_string("/proc/self/statm") else {
            return;
        };
        if let Some(pages) = statm
            .split_whitespace()
            .nth(1)
            .and_then(|v| v.parse::<u64>().ok())
        {
            sample.memory = Some(MemoryMetrics {
                resident_bytes: pages * PAGE_SIZE,
            });
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MemoryUsage,
    ChunkEntities,
    ReconnectTime,
    HeartbeatLatency,
    QueueBacklog,
}

impl AlertKind {
    fn recommendation(self) -> &'static str {
        match self {
            AlertKind::MemoryUsage => {
                "Memory usage is high: lower the chunk size or evict render objects sooner."
            }
            AlertKind::ChunkEntities => {
                "Partitions carry too many entities: reduce server-side density or the chunk size."
            }
            AlertKind::ReconnectTime => {
                "Reconnects are slow: check server availability and lower the reconnect base delay."
            }
            AlertKind::HeartbeatLatency => {
                "Heartbeat round trips are slow: check network latency to the server."
            }
            AlertKind::QueueBacklog => {
                "Outbound messages are piling up while disconnected: reduce send rate during outages."
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub observed: f64,
    pub threshold: f64,
    pub timestamp: DateTime<Utc>,
}

/// Average and peak of one metric over a report window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Aggregate {
    pub avg: f64,
    pub peak: f64,
    pub samples: usize,
}

impl Aggregate {
    fn of(values: impl Iterator<Item = f64>) -> Option<Self> {
        let (mut sum, mut peak, mut n) = (0.0, f64::MIN, 0usize);
        for v in values {
            sum += v;
            peak = peak.max(v);
            n += 1;
        }
        (n > 0).then(|| Aggregate {
            avg: sum / n as f64,
            peak,
            samples: n,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub window_ms: u64,
    pub samples: usize,
    pub memory_bytes: Option<Aggregate>,
    pub chunk_entities: Option<Aggregate>,
    pub heartbeat_rtt_ms: Option<Aggregate>,
    pub reconnect_ms: Option<Aggregate>,
    pub pending_messages: Option<Aggregate>,
    pub alerts_by_kind: BTreeMap<AlertKind, usize>,
    pub recommendations: Vec<String>,
}

/// Threshold rules applied to a sample.
pub fn evaluate(sample: &MetricSample, t: &Thresholds) -> Vec<Alert> {
    let mut checks: Vec<(AlertKind, f64, f64, &str)> = Vec::new();
    if let Some(mem) = &sample.memory {
        checks.push((
            AlertKind::MemoryUsage,
            mem.resident_bytes as f64,
            t.memory_usage_bytes as f64,
            "memory usage",
        ));
    }
    if let Some(chunks) = &sample.chunks {
        checks.push((
            AlertKind::ChunkEntities,
            chunks.entities as f64,
            t.max_chunk_entities as f64,
            "materialised entities",
        ));
    }
    if let Some(conn) = &sample.connection {
        if conn.successful_reconnects > 0 {
            checks.push((
                AlertKind::ReconnectTime,
                conn.average_reconnect_ms,
                t.max_reconnect_ms,
                "average reconnect time (ms)",
            ));
        }
        if let Some(rtt) = conn.last_rtt_ms {
            checks.push((
                AlertKind::HeartbeatLatency,
                rtt as f64,
                t.max_heartbeat_rtt_ms,
                "heartbeat round trip (ms)",
            ));
        }
        checks.push((
            AlertKind::QueueBacklog,
            conn.pending_messages as f64,
            t.max_pending_messages as f64,
            "pending messages",
        ));
    }

    checks
        .into_iter()
        .filter(|(_, observed, threshold, _)| observed > threshold)
        .map(|(kind, observed, threshold, what)| Alert {
            kind,
            severity: if observed >= threshold * 2.0 {
                Severity::Critical
            } else {
                Severity::Warning
            },
            message: format!("{what} {observed:.0} exceeds threshold {threshold:.0}"),
            observed,
            threshold,
            timestamp: sample.timestamp,
        })
        .collect()
}

struct State {
    sources: Vec<Arc<dyn MetricSource>>,
    history: VecDeque<MetricSample>,
    alerts: VecDeque<Alert>,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    config: MonitorConfig,
    state: Mutex<State>,
    alert_tx: broadcast::Sender<Alert>,
}

/// Cloneable handle; clones share history, alerts and the sampling task.
#[derive(Clone)]
pub struct PerformanceMonitor {
    inner: Arc<Inner>,
}

impl PerformanceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (alert_tx, _) = broadcast::channel(ALERT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    sources: Vec::new(),
                    history: VecDeque::new(),
                    alerts: VecDeque::new(),
                    task: None,
                }),
                alert_tx,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Binds the sources sampled on each tick, replacing previous ones.
    pub fn setup(&self, sources: Vec<Arc<dyn MetricSource>>) {
        self.state().sources = sources;
    }

    pub fn add_source(&self, source: Arc<dyn MetricSource>) {
        self.state().sources.push(source);
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.inner.alert_tx.subscribe()
    }

    pub fn start_monitoring(&self) {
        let mut state = self.state();
        if state.task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Monitoring already running");
            return;
        }
        let monitor = self.clone();
        let period = self.inner.config.interval();
        state.task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.collect_sample().await;
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "Performance monitoring started");
    }

    pub fn stop_monitoring(&self) {
        if let Some(task) = self.state().task.take() {
            task.abort();
            info!("Performance monitoring stopped");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.state().task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops sampling and drops all history, alerts and sources.
    pub fn destroy(&self) {
        self.stop_monitoring();
        let mut state = self.state();
        state.sources.clear();
        state.history.clear();
        state.alerts.clear();
    }

    /// Pulls one sample from every source and records it.
    pub async fn collect_sample(&self) -> MetricSample {
        let sources = self.state().sources.clone();
        let mut sample = MetricSample::empty(Utc::now());
        for source in &sources {
            source.collect(&mut sample).await;
        }
        self.record_sample(sample.clone());
        sample
    }

    /// Appends `sample` to the history and raises an alert per breached
    /// threshold. Returns the new alerts.
    pub fn record_sample(&self, sample: MetricSample) -> Vec<Alert> {
        let config = &self.inner.config;
        let alerts = evaluate(&sample, &config.thresholds);
        {
            let mut state = self.state();
            state.history.push_back(sample);
            while state.history.len() > config.max_history_size {
                state.history.pop_front();
            }
            for alert in &alerts {
                state.alerts.push_back(alert.clone());
                while state.alerts.len() > config.max_alerts {
                    state.alerts.pop_front();
                }
            }
        }
        for alert in &alerts {
            warn!(kind = ?alert.kind, severity = ?alert.severity, "{}", alert.message);
            let _ = self.inner.alert_tx.send(alert.clone());
        }
        alerts
    }

    pub fn current_metrics(&self) -> Option<MetricSample> {
        self.state().history.back().cloned()
    }

    /// Up to `limit` most recent samples, oldest first.
    pub fn history(&self, limit: usize) -> Vec<MetricSample> {
        let state = self.state();
        let skip = state.history.len().saturating_sub(limit);
        state.history.iter().skip(skip).cloned().collect()
    }

    /// Up to `limit` most recent alerts, oldest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let state = self.state();
        let skip = state.alerts.len().saturating_sub(limit);
        state.alerts.iter().skip(skip).cloned().collect()
    }

    /// Summarises the samples and alerts of the last `window`.
    pub fn generate_report(&self, window: Duration) -> PerformanceReport {
        let now = Utc::now();
        let since = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let state = self.state();
        let samples: Vec<&MetricSample> = state
            .history
            .iter()
            .filter(|s| s.timestamp >= since)
            .collect();

        let mut alerts_by_kind = BTreeMap::new();
        for alert in state.alerts.iter().filter(|a| a.timestamp >= since) {
            *alerts_by_kind.entry(alert.kind).or_insert(0usize) += 1;
        }
        let mut ranked: Vec<(AlertKind, usize)> = alerts_by_kind.iter().map(|(k, n)| (*k, *n)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let mut recommendations: Vec<String> = ranked
            .iter()
            .map(|(kind, _)| kind.recommendation().to_string())
            .collect();
        if recommendations.is_empty() {
            recommendations.push("No threshold breaches in this window.".to_string());
        }

        let conn = || samples.iter().filter_map(|s| s.connection.as_ref());
        PerformanceReport {
            generated_at: now,
            window_ms: window.as_millis() as u64,
            samples: samples.len(),
            memory_bytes: Aggregate::of(
                samples
                    .iter()
                    .filter_map(|s| s.memory.map(|m| m.resident_bytes as f64)),
            ),
            chunk_entities: Aggregate::of(
                samples
                    .iter()
                    .filter_map(|s| s.chunks.as_ref().map(|c| c.entities as f64)),
            ),
            heartbeat_rtt_ms: Aggregate::of(conn().filter_map(|c| c.last_rtt_ms.map(|v| v as f64))),
            reconnect_ms: Aggregate::of(
                conn()
                    .filter(|c| c.successful_reconnects > 0)
                    .map(|c| c.average_reconnect_ms),
            ),
            pending_messages: Aggregate::of(conn().map(|c| c.pending_messages as f64)),
            alerts_by_kind,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    const MB: u64 = 1024 * 1024;

    fn memory_sample(bytes: u64) -> MetricSample {
        MetricSample {
            memory: Some(MemoryMetrics {
                resident_bytes: bytes,
            }),
            ..MetricSample::empty(Utc::now())
        }
    }

    fn monitor(history: usize, alerts: usize) -> PerformanceMonitor {
        PerformanceMonitor::new(MonitorConfig {
            max_history_size: history,
            max_alerts: alerts,
            ..Default::default()
        })
    }

    #[test]
    fn memory_breach_raises_exactly_one_alert() {
        let m = monitor(10, 10);
        let alerts = m.record_sample(memory_sample(150 * MB));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::MemoryUsage);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(m.recent_alerts(10), alerts);
        assert_eq!(
            serde_json::to_value(alerts[0].kind).unwrap(),
            serde_json::json!("memory_usage")
        );
    }

    #[test]
    fn repeated_breaches_each_alert_and_double_is_critical() {
        let m = monitor(10, 10);
        m.record_sample(memory_sample(150 * MB));
        let second = m.record_sample(memory_sample(250 * MB));
        assert_eq!(second[0].severity, Severity::Critical);
        assert_eq!(m.recent_alerts(10).len(), 2);
        assert!(m.record_sample(memory_sample(50 * MB)).is_empty());
    }

    #[test]
    fn missing_sections_raise_nothing() {
        let m = monitor(10, 10);
        assert!(m.record_sample(MetricSample::empty(Utc::now())).is_empty());
        assert_eq!(m.history(10).len(), 1);
    }

    #[test]
    fn rings_evict_oldest() {
        let m = monitor(3, 2);
        for i in 1..=5 {
            m.record_sample(memory_sample(100 * MB + i));
        }
        let kept: Vec<u64> = m
            .history(10)
            .iter()
            .map(|s| s.memory.unwrap().resident_bytes - 100 * MB)
            .collect();
        assert_eq!(kept, vec![3, 4, 5]);
        assert_eq!(m.history(1).len(), 1);
        let alerts: Vec<f64> = m.recent_alerts(10).iter().map(|a| a.observed).collect();
        assert_eq!(alerts, vec![(100 * MB + 4) as f64, (100 * MB + 5) as f64]);
        assert_eq!(
            m.current_metrics().unwrap().memory.unwrap().resident_bytes,
            100 * MB + 5
        );
    }

    #[test]
    fn report_aggregates_and_ranks_recommendations() {
        let m = monitor(10, 10);
        m.record_sample(memory_sample(120 * MB));
        m.record_sample(memory_sample(80 * MB));
        m.record_sample(MetricSample {
            chunks: Some(ChunkStats {
                entities: 900,
                ..Default::default()
            }),
            ..memory_sample(130 * MB)
        });

        let report = m.generate_report(Duration::from_secs(60));
        assert_eq!(report.samples, 3);
        let mem = report.memory_bytes.unwrap();
        assert_eq!(mem.peak, (130 * MB) as f64);
        assert_eq!(mem.avg, (110 * MB) as f64);
        assert_eq!(report.alerts_by_kind[&AlertKind::MemoryUsage], 2);
        assert_eq!(report.alerts_by_kind[&AlertKind::ChunkEntities], 1);
        assert_eq!(report.recommendations[0], AlertKind::MemoryUsage.recommendation());
        assert!(report.heartbeat_rtt_ms.is_none());
    }

    #[test]
    fn report_excludes_samples_outside_window() {
        let m = monitor(10, 10);
        m.record_sample(MetricSample::empty(Utc::now() - chrono::Duration::minutes(10)));
        m.record_sample(MetricSample::empty(Utc::now()));
        let report = m.generate_report(Duration::from_secs(60));
        assert_eq!(report.samples, 1);
        assert_eq!(report.recommendations.len(), 1);
    }

    struct Counting(AtomicU64);

    #[async_trait]
    impl MetricSource for Counting {
        async fn collect(&self, sample: &mut MetricSample) {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            sample.memory = Some(MemoryMetrics {
                resident_bytes: n * 200 * MB,
            });
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sampling_runs_on_interval_until_stopped() {
        let m = PerformanceMonitor::new(MonitorConfig {
            interval_ms: 1_000,
            ..Default::default()
        });
        let source = Arc::new(Counting(AtomicU64::new(0)));
        m.setup(vec![source.clone() as Arc<dyn MetricSource>]);
        let mut alerts = m.subscribe_alerts();

        m.start_monitoring();
        assert!(m.is_monitoring());
        let first = alerts.recv().await.unwrap();
        assert_eq!(first.kind, AlertKind::MemoryUsage);
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        m.stop_monitoring();
        let taken = source.0.load(Ordering::SeqCst);
        assert!(taken >= 3);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(source.0.load(Ordering::SeqCst), taken);
        assert!(!m.is_monitoring());
        assert_eq!(m.history(100).len() as u64, taken);
    }
}
