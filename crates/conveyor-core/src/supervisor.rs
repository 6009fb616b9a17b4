//! OTP-style supervision tree for worker stages.
//!
//! A supervisor owns an ordered set of supervised entries (worker stages
//! and child supervisors), runs a monitor loop that detects dead workers,
//! and applies its restart strategy within a sliding-window restart budget.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::stage::ProcessingStage;

/// Cadence of the monitor loop.
const MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Restart strategies applied when a supervised worker dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart only the dead worker.
    OneForOne,
    /// Restart every supervised worker.
    OneForAll,
    /// Restart the dead worker and every worker after it in stage order.
    RestForOne,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::OneForOne => "one_for_one",
            RestartPolicy::OneForAll => "one_for_all",
            RestartPolicy::RestForOne => "rest_for_one",
        }
    }
}

/// Behavioral parameters of one supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSpec {
    pub restart_policy: RestartPolicy,
    /// Restarts allowed per stage within `restart_period`.
    pub max_restarts: u32,
    pub restart_period: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorSpec {
    fn default() -> Self {
        SupervisorSpec {
            restart_policy: RestartPolicy::OneForOne,
            max_restarts: 5,
            restart_period: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// One supervised entry: a leaf worker stage or a nested supervisor.
#[derive(Clone)]
pub enum Supervised {
    Worker(Arc<dyn ProcessingStage>),
    Child(Arc<Supervisor>),
}

impl Supervised {
    pub fn name(&self) -> &str {
        match self {
            Supervised::Worker(stage) => stage.name(),
            Supervised::Child(supervisor) => supervisor.name(),
        }
    }

    /// Child supervisors police their own workers; for the parent they are
    /// healthy as long as their monitor is alive.
    pub fn is_healthy(&self) -> bool {
        match self {
            Supervised::Worker(stage) => stage.is_healthy(),
            Supervised::Child(supervisor) => supervisor.is_active(),
        }
    }

    pub fn terminate(&self) {
        match self {
            Supervised::Worker(stage) => stage.terminate(),
            Supervised::Child(supervisor) => supervisor.shutdown(),
        }
    }

    pub fn restart(&self) -> crate::error::Result<()> {
        match self {
            Supervised::Worker(stage) => stage.restart(),
            Supervised::Child(supervisor) => {
                supervisor.restart_all_components();
                Ok(())
            }
        }
    }
}

struct SupervisorState {
    supervised: Vec<Supervised>,
    /// Per-stage timestamps of performed restarts, pruned to the budget
    /// window.
    restart_history: HashMap<String, VecDeque<Instant>>,
    /// Stages whose budget is exhausted; they stay stopped until the
    /// process restarts.
    failed: HashSet<String>,
    total_restarts: u64,
}

/// Snapshot of supervisor health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStats {
    pub total_components: usize,
    pub healthy_components: usize,
    pub total_restarts: u64,
}

/// Monitors a set of worker stages and restarts them per its policy.
pub struct Supervisor {
    name: String,
    spec: SupervisorSpec,
    state: Mutex<SupervisorState>,
    shutdown: (Mutex<bool>, Condvar),
    monitor_active: AtomicBool,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, spec: SupervisorSpec) -> Self {
        Supervisor {
            name: name.into(),
            spec,
            state: Mutex::new(SupervisorState {
                supervised: Vec::new(),
                restart_history: HashMap::new(),
                failed: HashSet::new(),
                total_restarts: 0,
            }),
            shutdown: (Mutex::new(false), Condvar::new()),
            monitor_active: AtomicBool::new(false),
            monitor: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &SupervisorSpec {
        &self.spec
    }

    /// Whether the monitor loop is running.
    pub fn is_active(&self) -> bool {
        self.monitor_active.load(Ordering::Relaxed)
    }

    pub fn add_worker(&self, stage: Arc<dyn ProcessingStage>) {
        let mut state = self.state.lock().unwrap();
        tracing::info!(supervisor = %self.name, stage = stage.name(), "component added");
        state.supervised.push(Supervised::Worker(stage));
    }

    pub fn add_child(&self, child: Arc<Supervisor>) {
        let mut state = self.state.lock().unwrap();
        tracing::info!(supervisor = %self.name, child = child.name(), "child supervisor added");
        state.supervised.push(Supervised::Child(child));
    }

    pub fn component_count(&self) -> usize {
        self.state.lock().unwrap().supervised.len()
    }

    /// Replace a worker slot in place, keeping stage order. Returns the
    /// previous occupant.
    pub fn replace_worker(
        &self,
        name: &str,
        stage: Arc<dyn ProcessingStage>,
    ) -> Option<Arc<dyn ProcessingStage>> {
        let mut state = self.state.lock().unwrap();
        for entry in state.supervised.iter_mut() {
            if let Supervised::Worker(current) = entry {
                if current.name() == name {
                    let old = Arc::clone(current);
                    *entry = Supervised::Worker(stage);
                    return Some(old);
                }
            }
        }
        None
    }

    /// Start every supervised worker. Returns how many came up; spawn
    /// failures are logged and left for the monitor to retry under the
    /// restart budget.
    pub fn start_all_components(&self) -> usize {
        let entries: Vec<Supervised> = self.state.lock().unwrap().supervised.clone();
        let mut started = 0;
        for entry in entries {
            match &entry {
                Supervised::Worker(stage) => match stage.start() {
                    Ok(()) => started += 1,
                    Err(error) => {
                        tracing::error!(
                            supervisor = %self.name,
                            stage = stage.name(),
                            %error,
                            "failed to start component"
                        );
                    }
                },
                Supervised::Child(child) => {
                    started += child.start_all_components();
                }
            }
        }
        started
    }

    pub fn stop_all_components(&self) {
        let entries: Vec<Supervised> = self.state.lock().unwrap().supervised.clone();
        for entry in entries {
            entry.terminate();
        }
    }

    /// Restart every supervised worker, without touching budgets. Used when
    /// a parent supervisor restarts this subtree.
    pub fn restart_all_components(&self) {
        let entries: Vec<Supervised> = self.state.lock().unwrap().supervised.clone();
        for entry in entries {
            if let Err(error) = entry.restart() {
                tracing::error!(
                    supervisor = %self.name,
                    component = entry.name(),
                    %error,
                    "restart failed"
                );
            }
        }
    }

    /// Launch the monitor loop.
    pub fn start_monitoring(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock().unwrap();
        if monitor.is_some() {
            return;
        }
        *self.shutdown.0.lock().unwrap() = false;
        self.monitor_active.store(true, Ordering::Relaxed);

        let supervisor = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name(format!("{}-monitor", self.name))
            .spawn(move || {
                tracing::info!(supervisor = %supervisor.name, "monitor started");
                loop {
                    let stop = {
                        let (lock, cvar) = &supervisor.shutdown;
                        let guard = lock.lock().unwrap();
                        let (guard, _) = cvar
                            .wait_timeout_while(guard, MONITOR_INTERVAL, |stop| !*stop)
                            .unwrap();
                        *guard
                    };
                    if stop {
                        break;
                    }
                    supervisor.monitor_tick();
                }
                supervisor.monitor_active.store(false, Ordering::Relaxed);
                tracing::info!(supervisor = %supervisor.name, "monitor stopped");
            });

        match handle {
            Ok(handle) => *monitor = Some(handle),
            Err(error) => {
                self.monitor_active.store(false, Ordering::Relaxed);
                tracing::error!(supervisor = %self.name, %error, "failed to spawn monitor");
            }
        }
    }

    /// Stop the monitor and terminate everything supervised.
    pub fn shutdown(&self) {
        {
            let (lock, cvar) = &self.shutdown;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
        let started = Instant::now();
        self.stop_all_components();
        if started.elapsed() > self.spec.shutdown_timeout {
            tracing::warn!(
                supervisor = %self.name,
                timeout_s = self.spec.shutdown_timeout.as_secs(),
                "shutdown exceeded its timeout"
            );
        }
    }

    fn monitor_tick(&self) {
        let (entries, failed): (Vec<Supervised>, HashSet<String>) = {
            let state = self.state.lock().unwrap();
            (state.supervised.clone(), state.failed.clone())
        };

        for entry in &entries {
            if let Supervised::Worker(stage) = entry {
                let _ = stage.send_heartbeat();
            }
        }

        for entry in &entries {
            let Supervised::Worker(stage) = entry else {
                continue;
            };
            if failed.contains(stage.name()) {
                continue;
            }
            if !stage.is_healthy() {
                self.handle_death(stage.name());
            }
        }
    }

    /// Apply the restart strategy after a worker death. Serialized on the
    /// supervisor mutex for the whole cascade.
    pub fn handle_death(&self, name: &str) {
        let mut state = self.state.lock().unwrap();

        if state.failed.contains(name) {
            return;
        }
        let Some(index) = state
            .supervised
            .iter()
            .position(|entry| matches!(entry, Supervised::Worker(s) if s.name() == name))
        else {
            return;
        };

        let now = Instant::now();
        if !budget_allows(&mut state, &self.spec, name, now) {
            tracing::error!(
                supervisor = %self.name,
                stage = name,
                max_restarts = self.spec.max_restarts,
                period_s = self.spec.restart_period.as_secs(),
                "restart budget exhausted, component left stopped"
            );
            state.failed.insert(name.to_string());
            return;
        }

        tracing::warn!(
            supervisor = %self.name,
            stage = name,
            policy = self.spec.restart_policy.as_str(),
            "handling component death"
        );

        let range = match self.spec.restart_policy {
            RestartPolicy::OneForOne => index..index + 1,
            RestartPolicy::OneForAll => 0..state.supervised.len(),
            RestartPolicy::RestForOne => index..state.supervised.len(),
        };
        for i in range {
            let entry = state.supervised[i].clone();
            let entry_name = entry.name().to_string();
            // Each restart in the cascade is gated by that stage's own
            // budget.
            if !budget_allows(&mut state, &self.spec, &entry_name, now) {
                tracing::error!(
                    supervisor = %self.name,
                    stage = %entry_name,
                    "restart budget exhausted during cascade, component left stopped"
                );
                state.failed.insert(entry_name);
                continue;
            }
            match entry.restart() {
                Ok(()) => {
                    state
                        .restart_history
                        .entry(entry_name.clone())
                        .or_default()
                        .push_back(now);
                    state.total_restarts += 1;
                    tracing::info!(supervisor = %self.name, stage = %entry_name, "component restarted");
                }
                Err(error) => {
                    tracing::error!(
                        supervisor = %self.name,
                        stage = %entry_name,
                        %error,
                        "component restart failed"
                    );
                }
            }
        }
    }

    /// Stages whose restart budget ran out; they stay stopped until an
    /// operator intervenes.
    pub fn failed_components(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        let mut failed: Vec<String> = state.failed.iter().cloned().collect();
        failed.sort();
        failed
    }

    /// Consistent snapshot of component health.
    pub fn statistics(&self) -> SupervisorStats {
        let state = self.state.lock().unwrap();
        let healthy = state
            .supervised
            .iter()
            .filter(|entry| entry.is_healthy())
            .count();
        SupervisorStats {
            total_components: state.supervised.len(),
            healthy_components: healthy,
            total_restarts: state.total_restarts,
        }
    }

    /// Render the supervision tree for diagnostics.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        out.push_str(&format!(
            "{indent}Supervisor: {} (policy: {})\n",
            self.name,
            self.spec.restart_policy.as_str()
        ));
        let state = self.state.lock().unwrap();
        for entry in &state.supervised {
            match entry {
                Supervised::Worker(stage) => {
                    out.push_str(&format!(
                        "{indent}  Component: {} (healthy: {})\n",
                        stage.name(),
                        if stage.is_healthy() { "yes" } else { "no" }
                    ));
                }
                Supervised::Child(child) => {
                    child.render_into(out, depth + 1);
                }
            }
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        {
            let (lock, cvar) = &self.shutdown;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.monitor.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// Prune `name`'s restart history to the sliding window and check the
/// budget. Does not record a restart.
fn budget_allows(
    state: &mut SupervisorState,
    spec: &SupervisorSpec,
    name: &str,
    now: Instant,
) -> bool {
    let history = state.restart_history.entry(name.to_string()).or_default();
    while history
        .front()
        .is_some_and(|t| now.duration_since(*t) >= spec.restart_period)
    {
        history.pop_front();
    }
    (history.len() as u32) < spec.max_restarts
}
