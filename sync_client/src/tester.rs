//! Connection tester.
//!
//! Fault injection against a live `GameClient`: drop the transport, wait for
//! the session to come back, and check that identity and partition survived.
//! Only one test runs at a time per tester; a second caller gets
//! `TesterError::TestInProgress`.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sync_shared::config::TesterConfig;
use thiserror::Error;
use tokio::{sync::broadcast, task::JoinHandle, time::Instant};
use tracing::{debug, info, warn};

use crate::{
    client::{ClientEvent, GameClient, SessionProbe},
    connection::{ConnectionError, ConnectionEvent},
};

const MAX_RESULTS: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TesterError {
    #[error("a connection test is already running")]
    TestInProgress,
    #[error(transparent)]
    Client(#[from] ConnectionError),
}

#[derive(Debug, Clone)]
pub struct ReconnectionTestOptions {
    /// Drop the transport before waiting. Without it the test waits for an
    /// external drop and recovery.
    pub force_disconnect: bool,
    pub max_reconnect_time: Duration,
}

impl ReconnectionTestOptions {
    pub fn from_config(config: &TesterConfig) -> Self {
        Self {
            force_disconnect: true,
            max_reconnect_time: config.max_reconnect_time(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconnectionTestResult {
    pub started_at: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: f64,
    pub reconnect_time_ms: Option<f64>,
    pub state_preserved: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressTestResult {
    pub iterations: usize,
    pub passed: usize,
    pub pass_rate: f64,
    pub average_reconnect_ms: Option<f64>,
    pub results: Vec<ReconnectionTestResult>,
}

/// Cumulative tester counters, as sampled by the performance monitor.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TesterStats {
    pub tests_run: u64,
    pub tests_passed: u64,
    pub in_progress: bool,
    pub automated: bool,
    pub last_success: Option<bool>,
    pub average_reconnect_ms: Option<f64>,
}

#[derive(Default)]
struct Ledger {
    tests_run: u64,
    tests_passed: u64,
    reconnect_total_ms: f64,
    reconnects: u64,
    results: VecDeque<ReconnectionTestResult>,
}

/// Clears the in-progress flag when a run ends or is cancelled.
struct RunGuard(Arc<AtomicBool>);

impl RunGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag.clone()))
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct ConnectionTester {
    client: GameClient,
    config: TesterConfig,
    running: Arc<AtomicBool>,
    ledger: Arc<Mutex<Ledger>>,
    automated: Arc<Mutex<Option<JoinHandle<()>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ConnectionTester {
    pub fn new(client: GameClient, config: TesterConfig) -> Self {
        Self {
            client,
            config,
            running: Arc::new(AtomicBool::new(false)),
            ledger: Arc::new(Mutex::new(Ledger::default())),
            automated: Arc::new(Mutex::new(None)),
        }
    }

    /// Options derived from this tester's config.
    pub fn default_options(&self) -> ReconnectionTestOptions {
        ReconnectionTestOptions::from_config(&self.config)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn run_reconnection_test(
        &self,
        opts: ReconnectionTestOptions,
    ) -> Result<ReconnectionTestResult, TesterError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(TesterError::TestInProgress)?;
        let started_at = Utc::now();
        let started = Instant::now();
        let mut errors = Vec::new();

        let baseline = self.client.probe().await?;
        if !baseline.authenticated {
            errors.push(format!("session not authenticated at start ({:?})", baseline.state));
        }

        let mut events = self.client.subscribe();
        let drop_at = Instant::now();
        if opts.force_disconnect {
            self.client.force_drop("connection test").await?;
        }

        let reconnect_time =
            match tokio::time::timeout(opts.max_reconnect_time, wait_for_reconnect(&mut events)).await {
                Ok(Ok(())) => Some(drop_at.elapsed()),
                Ok(Err(reason)) => {
                    errors.push(reason);
                    None
                }
                Err(_) => {
                    errors.push(format!(
                        "no reconnect within {} ms",
                        opts.max_reconnect_time.as_millis()
                    ));
                    None
                }
            };

        let after = self.client.probe().await?;
        let state_preserved = preserved(&baseline, &after);
        if reconnect_time.is_some() && !state_preserved {
            errors.push(format!(
                "state changed across reconnect: player {:?} -> {:?}, partition {:?} -> {:?}",
                baseline.player_id, after.player_id, baseline.partition, after.partition
            ));
        }

        let success = baseline.authenticated && reconnect_time.is_some() && state_preserved;
        let result = ReconnectionTestResult {
            started_at,
            success,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            reconnect_time_ms: reconnect_time.map(|d| d.as_secs_f64() * 1000.0),
            state_preserved,
            errors,
        };
        if success {
            info!(reconnect_ms = ?result.reconnect_time_ms, "Reconnection test passed");
        } else {
            warn!(errors = ?result.errors, "Reconnection test failed");
        }
        self.record(&result);
        Ok(result)
    }

    /// Runs `iterations` tests back to back with a cooldown in between.
    pub async fn run_stress_test(&self, iterations: usize) -> Result<StressTestResult, TesterError> {
        let opts = self.default_options();
        let mut results = Vec::with_capacity(iterations);
        for i in 0..iterations {
            debug!(iteration = i + 1, iterations, "Stress iteration");
            results.push(self.run_reconnection_test(opts.clone()).await?);
            if i + 1 < iterations {
                tokio::time::sleep(self.config.stress_cooldown()).await;
            }
        }

        let passed = results.iter().filter(|r| r.success).count();
        let times: Vec<f64> = results.iter().filter_map(|r| r.reconnect_time_ms).collect();
        let summary = StressTestResult {
            iterations,
            passed,
            pass_rate: if iterations == 0 {
                0.0
            } else {
                passed as f64 / iterations as f64
            },
            average_reconnect_ms: (!times.is_empty())
                .then(|| times.iter().sum::<f64>() / times.len() as f64),
            results,
        };
        info!(
            iterations,
            passed,
            average_reconnect_ms = ?summary.average_reconnect_ms,
            "Stress test finished"
        );
        Ok(summary)
    }

    /// Re-runs the single test every `automated_interval`. Replaces a
    /// previous schedule.
    pub fn start_automated(&self) {
        self.stop_automated();
        let tester = self.clone();
        let interval = self.config.automated_interval();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match tester.run_reconnection_test(tester.default_options()).await {
                    Ok(_) => {}
                    Err(TesterError::TestInProgress) => debug!("Automated test skipped, one is running"),
                    Err(e) => {
                        warn!(error = %e, "Automated testing stopped");
                        break;
                    }
                }
            }
        });
        *lock(&self.automated) = Some(handle);
        info!(interval_ms = interval.as_millis() as u64, "Automated connection testing enabled");
    }

    pub fn stop_automated(&self) {
        if let Some(handle) = lock(&self.automated).take() {
            handle.abort();
            info!("Automated connection testing disabled");
        }
    }

    pub fn is_automated(&self) -> bool {
        lock(&self.automated).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Most recent results, oldest first.
    pub fn results(&self) -> Vec<ReconnectionTestResult> {
        lock(&self.ledger).results.iter().cloned().collect()
    }

    pub fn stats(&self) -> TesterStats {
        let ledger = lock(&self.ledger);
        TesterStats {
            tests_run: ledger.tests_run,
            tests_passed: ledger.tests_passed,
            in_progress: self.is_running(),
            automated: self.is_automated(),
            last_success: ledger.results.back().map(|r| r.success),
            average_reconnect_ms: (ledger.reconnects > 0)
                .then(|| ledger.reconnect_total_ms / ledger.reconnects as f64),
        }
    }

    fn record(&self, result: &ReconnectionTestResult) {
        let mut ledger = lock(&self.ledger);
        ledger.tests_run += 1;
        if result.success {
            ledger.tests_passed += 1;
        }
        if let Some(ms) = result.reconnect_time_ms {
            ledger.reconnect_total_ms += ms;
            ledger.reconnects += 1;
        }
        if ledger.results.len() == MAX_RESULTS {
            ledger.results.pop_front();
        }
        ledger.results.push_back(result.clone());
    }
}

fn preserved(before: &SessionProbe, after: &SessionProbe) -> bool {
    after.authenticated && after.player_id == before.player_id && after.partition == before.partition
}

async fn wait_for_reconnect(events: &mut broadcast::Receiver<ClientEvent>) -> Result<(), String> {
    loop {
        match events.recv().await {
            Ok(ClientEvent::Connection(ConnectionEvent::Authenticated { .. })) => return Ok(()),
            Ok(ClientEvent::Connection(ConnectionEvent::ReconnectExhausted { attempts })) => {
                return Err(format!("reconnection gave up after {attempts} attempts"))
            }
            Ok(ClientEvent::Connection(ConnectionEvent::Closed)) => {
                return Err("session closed during test".into())
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "Tester lagged behind events"),
            Err(broadcast::error::RecvError::Closed) => return Err("client stopped".into()),
        }
    }
}
