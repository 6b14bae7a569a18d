//! Load test harness.
//!
//! Drives many virtual sessions against one server in three phases:
//! - Ramp-up: sessions are spawned at a linear rate until the target count
//! - Sustain: the full load is held for the test duration
//! - Ramp-down: sessions are torn down at a linear rate
//!
//! Each virtual session owns a `ConnectionManager` (so it reconnects the same
//! way a real client does), authenticates with a synthetic credential, then
//! random-walks across chunk boundaries. Every step is followed by a ping
//! whose round-trip feeds the shared latency statistics.

use std::{
    f32::consts::TAU,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sync_client::{
    client::now,
    connection::{static_credential, ConnectionEvent, ConnectionManager},
};
use sync_shared::{
    chunk::PartitionKey,
    config::{ConnectionConfig, LoadTestConfig},
    math::Vec2,
    net::{timestamp_ms, ChunkEnter, ClientMsg, Ping, PlayerMove},
    transport::Transport,
};
use tokio::{
    sync::{oneshot, watch, Mutex as AsyncMutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

/// Creates one transport per virtual session.
pub trait TransportFactory: Send + Sync + 'static {
    type Transport: Transport + 'static;

    fn create(&self, index: u32) -> Self::Transport;
}

impl<T, F> TransportFactory for F
where
    T: Transport + 'static,
    F: Fn(u32) -> T + Send + Sync + 'static,
{
    type Transport = T;

    fn create(&self, index: u32) -> T {
        self(index)
    }
}

/// Running min/max/mean of round-trip samples.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub samples: u64,
    pub min_ms: Option<i64>,
    pub max_ms: Option<i64>,
    pub average_ms: f64,
}

impl LatencyStats {
    pub fn record(&mut self, rtt_ms: i64) {
        self.samples += 1;
        self.min_ms = Some(self.min_ms.map_or(rtt_ms, |m| m.min(rtt_ms)));
        self.max_ms = Some(self.max_ms.map_or(rtt_ms, |m| m.max(rtt_ms)));
        self.average_ms += (rtt_ms as f64 - self.average_ms) / self.samples as f64;
    }
}

/// Counters shared by all sessions of one run.
#[derive(Debug, Clone, Default)]
pub struct LoadStats {
    pub total_players_created: u32,
    pub active_sessions: u32,
    pub peak_concurrent: u32,
    pub authenticated_sessions: u32,
    pub failed_sessions: u32,
    pub reconnects: u64,
    pub errors: u64,
    pub movements: u64,
    pub partition_crossings: u64,
    pub messages_received: u64,
    pub latency: LatencyStats,
}

/// End-of-run report. Serialised to the results file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadTestSummary {
    pub server_url: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub stopped_early: bool,
    pub max_concurrent_players: u32,
    pub total_players_created: u32,
    pub peak_concurrent_players: u32,
    pub successful_connections: u32,
    pub failed_connections: u32,
    pub success_rate: f64,
    pub total_movements: u64,
    pub movements_per_second: f64,
    pub partition_crossings: u64,
    pub messages_received: u64,
    pub reconnects: u64,
    pub errors: u64,
    /// Errors per created session.
    pub error_rate: f64,
    pub average_latency: f64,
    pub min_latency: Option<i64>,
    pub max_latency: Option<i64>,
    pub latency_samples: u64,
    /// Sessions still connected when the run returned. Zero on a clean run.
    pub sessions_left_running: u32,
}

/// Writes `load-test-results-<UTC timestamp>.json` into `dir`.
pub fn write_summary(summary: &LoadTestSummary, dir: &Path) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let name = format!(
        "load-test-results-{}.json",
        summary.finished_at.format("%Y%m%dT%H%M%S%.3fZ")
    );
    let path = dir.join(name);
    let json = serde_json::to_string_pretty(summary).context("serialise summary")?;
    std::fs::write(&path, json).with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}

type SharedStats = Arc<Mutex<LoadStats>>;

fn lock(stats: &SharedStats) -> MutexGuard<'_, LoadStats> {
    stats.lock().unwrap_or_else(|e| e.into_inner())
}

struct SessionHandle {
    index: u32,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

type CompletionCallback = Box<dyn Fn(&LoadTestSummary) + Send + Sync>;

pub struct LoadTestHarness<F: TransportFactory> {
    config: LoadTestConfig,
    connection: ConnectionConfig,
    chunk_size: f32,
    factory: Arc<F>,
    stats: SharedStats,
    /// Held across teardown so concurrent stops wait for each other.
    sessions: AsyncMutex<Vec<SessionHandle>>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    on_complete: Option<CompletionCallback>,
}

impl<F: TransportFactory> LoadTestHarness<F> {
    pub fn new(config: LoadTestConfig, factory: F) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            config,
            connection: ConnectionConfig::default(),
            chunk_size: 1_000.0,
            factory: Arc::new(factory),
            stats: Arc::default(),
            sessions: AsyncMutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stop_tx,
            on_complete: None,
        }
    }

    /// Connection policy used by every virtual session.
    pub fn with_connection_config(mut self, connection: ConnectionConfig) -> Self {
        self.connection = connection;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: f32) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Called with the summary at the end of every run.
    pub fn on_complete(mut self, callback: impl Fn(&LoadTestSummary) + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> LoadStats {
        lock(&self.stats).clone()
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Runs ramp-up, sustain and ramp-down, then tears every session down.
    pub async fn start_load_test(&self) -> anyhow::Result<LoadTestSummary> {
        if self.running.swap(true, Ordering::SeqCst) {
            anyhow::bail!("load test already running");
        }
        self.stop_tx.send_replace(false);
        *lock(&self.stats) = LoadStats::default();

        let started_at = Utc::now();
        let started = tokio::time::Instant::now();
        let players = self.config.max_concurrent_players;
        info!(
            server = %self.config.server_url,
            players,
            ramp_up_s = self.config.ramp_up_secs,
            duration_s = self.config.test_duration_secs,
            ramp_down_s = self.config.ramp_down_secs,
            "Starting load test"
        );

        let mut stopped = self.ramp_up(players).await;
        if !stopped {
            let active = self.active_sessions().await;
            info!(active, "Ramp-up complete, holding load");
            stopped = self.sustain().await;
        }
        if !stopped {
            stopped = self.ramp_down().await;
        }
        self.stop_all().await;

        let summary = self.summarize(started_at, started.elapsed(), stopped);
        info!(
            created = summary.total_players_created,
            success_rate = summary.success_rate,
            movements_per_s = summary.movements_per_second,
            avg_latency_ms = summary.average_latency,
            "Load test finished"
        );
        if let Some(callback) = &self.on_complete {
            callback(&summary);
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(summary)
    }

    /// Cancels the current run. Returns once every session is disconnected.
    pub async fn stop_load_test(&self) {
        if self.is_running() {
            info!("Stopping load test");
        }
        self.stop_tx.send_replace(true);
        self.stop_all().await;
    }

    async fn ramp_up(&self, players: u32) -> bool {
        let step = linear_step(self.config.ramp_up(), players);
        for index in 0..players {
            if self.stop_requested() {
                return true;
            }
            self.spawn_session(index).await;
            if index + 1 < players && self.wait_or_stop(step).await {
                return true;
            }
        }
        false
    }

    async fn sustain(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.test_duration();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self.wait_or_stop(remaining.min(PROGRESS_INTERVAL)).await {
                return true;
            }
            let stats = self.stats();
            info!(
                active = stats.active_sessions,
                movements = stats.movements,
                errors = stats.errors,
                avg_latency_ms = stats.latency.average_ms,
                "Load test progress"
            );
        }
    }

    async fn ramp_down(&self) -> bool {
        let count = self.active_sessions().await as u32;
        let step = linear_step(self.config.ramp_down(), count);
        loop {
            let remaining = {
                let mut sessions = self.sessions.lock().await;
                let Some(session) = sessions.pop() else {
                    return false;
                };
                stop_session(session).await;
                sessions.len()
            };
            if remaining > 0 && self.wait_or_stop(step).await {
                return true;
            }
        }
    }

    async fn stop_all(&self) {
        let mut sessions = self.sessions.lock().await;
        if !sessions.is_empty() {
            debug!(count = sessions.len(), "Tearing down sessions");
        }
        for session in sessions.drain(..) {
            stop_session(session).await;
        }
    }

    fn stop_requested(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Sleeps for `d`. Returns true if a stop was requested meanwhile.
    async fn wait_or_stop(&self, d: Duration) -> bool {
        let mut stop = self.stop_tx.subscribe();
        if self.stop_requested() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(d) => {}
            _ = stop.changed() => {}
        }
        self.stop_requested()
    }

    async fn spawn_session(&self, index: u32) {
        let transport = self.factory.create(index);
        let conn = ConnectionManager::new(
            self.connection.clone(),
            transport,
            static_credential(format!("loadtest-{index}")),
        )
        .with_display_name(format!("LoadBot{index}"));
        let walker = Walker {
            rng: StdRng::seed_from_u64(0x10ad_0000 + u64::from(index)),
            position: Vec2::ZERO,
            partition: None,
            chunk_size: self.chunk_size,
            step_size: self.config.step_size,
        };
        {
            let mut stats = lock(&self.stats);
            stats.total_players_created += 1;
            stats.active_sessions += 1;
            stats.peak_concurrent = stats.peak_concurrent.max(stats.active_sessions);
        }
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_session(
            index,
            conn,
            walker,
            self.config.movement_interval(),
            self.stats.clone(),
            stop_rx,
        ));
        let session = SessionHandle { index, stop, task };
        let mut sessions = self.sessions.lock().await;
        if self.stop_requested() {
            debug!(index, "Stop requested while spawning, tearing session down");
            stop_session(session).await;
            return;
        }
        debug!(index, "Virtual session spawned");
        sessions.push(session);
    }

    fn summarize(&self, started_at: DateTime<Utc>, elapsed: Duration, stopped_early: bool) -> LoadTestSummary {
        let stats = self.stats();
        let created = stats.total_players_created;
        let secs = elapsed.as_secs_f64();
        let ratio = |n: f64| if created == 0 { 0.0 } else { n / created as f64 };
        LoadTestSummary {
            server_url: self.config.server_url.clone(),
            started_at,
            finished_at: Utc::now(),
            elapsed_secs: secs,
            stopped_early,
            max_concurrent_players: self.config.max_concurrent_players,
            total_players_created: created,
            peak_concurrent_players: stats.peak_concurrent,
            successful_connections: stats.authenticated_sessions,
            failed_connections: stats.failed_sessions,
            success_rate: ratio(stats.authenticated_sessions as f64),
            total_movements: stats.movements,
            movements_per_second: if secs > 0.0 {
                stats.movements as f64 / secs
            } else {
                0.0
            },
            partition_crossings: stats.partition_crossings,
            messages_received: stats.messages_received,
            reconnects: stats.reconnects,
            errors: stats.errors,
            error_rate: ratio(stats.errors as f64),
            average_latency: stats.latency.average_ms,
            min_latency: stats.latency.min_ms,
            max_latency: stats.latency.max_ms,
            latency_samples: stats.latency.samples,
            sessions_left_running: stats.active_sessions,
        }
    }
}

fn linear_step(window: Duration, count: u32) -> Duration {
    if count <= 1 {
        Duration::ZERO
    } else {
        window / (count - 1)
    }
}

async fn stop_session(session: SessionHandle) {
    let SessionHandle { index, stop, task } = session;
    let _ = stop.send(());
    if let Err(e) = task.await {
        warn!(index, error = %e, "Virtual session task failed");
    }
}

struct Walker {
    rng: StdRng,
    position: Vec2,
    partition: Option<PartitionKey>,
    chunk_size: f32,
    step_size: f32,
}

impl Walker {
    /// One random-walk step. Returns the new position and, when a chunk
    /// boundary was crossed, the chunk entered.
    fn step(&mut self) -> (Vec2, Option<PartitionKey>) {
        let angle = self.rng.gen_range(0.0..TAU);
        let dist = self.rng.gen_range(0.0..=self.step_size);
        self.position = Vec2::new(
            self.position.x + dist * angle.cos(),
            self.position.y + dist * angle.sin(),
        );
        let key = PartitionKey::from_position(self.position, self.chunk_size);
        if self.partition == Some(key) {
            return (self.position, None);
        }
        self.partition = Some(key);
        (self.position, Some(key))
    }
}

async fn run_session<T: Transport>(
    index: u32,
    mut conn: ConnectionManager<T>,
    mut walker: Walker,
    movement_interval: Duration,
    stats: SharedStats,
    mut stop: oneshot::Receiver<()>,
) {
    let mut walk = tokio::time::interval(movement_interval);
    walk.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut moving = false;
    let mut ever_authenticated = false;
    let mut failed = false;

    if let Err(e) = conn.connect(now()) {
        warn!(index, error = %e, "Virtual session could not connect");
        failed = true;
    }

    while !failed {
        let deadline = conn.next_timeout();
        tokio::select! {
            _ = &mut stop => break,
            ev = conn.transport_mut().recv() => {
                if let Some(ev) = ev {
                    conn.handle_transport_event(ev, now());
                }
            }
            _ = sleep_until(deadline) => conn.handle_timeout(now()),
            _ = walk.tick(), if moving => {
                let t = now();
                let (pos, entered) = walker.step();
                if let Some(key) = entered {
                    conn.send_msg(&ClientMsg::ChunkEnter(ChunkEnter { x: key.x, y: key.y }), t);
                    conn.track_partition(key);
                    lock(&stats).partition_crossings += 1;
                }
                let key = PartitionKey::from_position(pos, walker.chunk_size);
                conn.send_msg(
                    &ClientMsg::PlayerMove(PlayerMove { x: pos.x, y: pos.y, chunk_x: key.x, chunk_y: key.y }),
                    t,
                );
                conn.send_msg(&ClientMsg::Ping(Ping { timestamp: timestamp_ms() }), t);
                lock(&stats).movements += 1;
            }
        }

        for ev in conn.drain_events() {
            let mut stats = lock(&stats);
            match ev {
                ConnectionEvent::Authenticated { reconnected, .. } => {
                    moving = true;
                    // Re-announce the chunk after every (re)authentication.
                    walker.partition = None;
                    if !ever_authenticated {
                        ever_authenticated = true;
                        stats.authenticated_sessions += 1;
                    }
                    if reconnected {
                        stats.reconnects += 1;
                    }
                }
                ConnectionEvent::ConnectionLost { reason } => {
                    moving = false;
                    stats.errors += 1;
                    debug!(index, %reason, "Virtual session lost connection");
                }
                ConnectionEvent::AuthRejected { message } => {
                    stats.errors += 1;
                    debug!(index, %message, "Virtual session auth rejected");
                }
                ConnectionEvent::HeartbeatTimeout => stats.errors += 1,
                ConnectionEvent::ReconnectExhausted { attempts } => {
                    warn!(index, attempts, "Virtual session gave up reconnecting");
                    stats.errors += 1;
                    failed = true;
                }
                ConnectionEvent::Pong { rtt_ms } => stats.latency.record(rtt_ms),
                ConnectionEvent::Message(_) => stats.messages_received += 1,
                _ => {}
            }
        }
    }

    conn.disconnect();
    let mut stats = lock(&stats);
    if !ever_authenticated {
        stats.failed_sessions += 1;
    }
    stats.active_sessions = stats.active_sessions.saturating_sub(1);
    debug!(index, "Virtual session ended");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
    }
}
