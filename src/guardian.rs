//! Guardian supervisor: an independent process that watches liveness
//! records, classifies each component, and recovers crashed or wedged
//! components within bounded limits.
//!
//! The guardian shares no memory with the runtime. It sees liveness files
//! and process exit codes, nothing else; a deadlocked runtime is observed
//! only through heartbeat staleness. Restart bookkeeping is explicit data
//! per component, driven through a pure decision function.

use std::collections::HashMap;
use std::process::{Child, Command as ProcessCommand};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::alert::{send_alert, AlertLimiter, Notifier, Severity};
use crate::config::GuardianConfig;
use crate::liveness::{record_age_secs, LivenessError, LivenessRegistry};
use crate::logging::{json_log, obj, ts_epoch, v_num, v_str};
use crate::reliability::journal::Journal;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Ok { age_secs: u64 },
    Stale { age_secs: u64 },
    Critical { age_secs: u64 },
    /// Record missing or unreadable: the component is presumed gone.
    Dead { reason: String },
    /// hb_ts ahead of the guardian's clock. Alert, never a kill trigger.
    ClockSkew { ahead_secs: i64 },
}

/// Classify one component from its registry read at `now`.
pub fn classify(
    read: Result<u64, LivenessError>,
    stale_threshold_sec: u64,
    critical_multiplier: u64,
) -> Classification {
    match read {
        Ok(age) if age <= stale_threshold_sec => Classification::Ok { age_secs: age },
        Ok(age) if age <= stale_threshold_sec * critical_multiplier => {
            Classification::Stale { age_secs: age }
        }
        Ok(age) => Classification::Critical { age_secs: age },
        Err(LivenessError::ClockSkew { ahead_secs }) => Classification::ClockSkew { ahead_secs },
        Err(LivenessError::Missing) => Classification::Dead { reason: "FILE_NOT_FOUND".to_string() },
        Err(LivenessError::Unreadable(e)) => Classification::Dead { reason: e },
    }
}

/// Per-component restart bookkeeping, owned by the guardian, passed through
/// `decide` as data.
#[derive(Debug, Clone, Default)]
pub struct RestartState {
    pub restart_count: u32,
    pub last_restart_at: Option<u64>,
    pub healthy_since: Option<u64>,
    pub circuit_open: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Component healthy, nothing to do.
    Leave,
    /// Healthy long enough: forgive past restarts.
    ResetCounter,
    /// Alert but do not intervene (stale, skewed, or circuit already open).
    AlertOnly { severity: Severity, alert_key: String, message: String },
    /// Kill if needed, wait backoff, start again.
    Restart { attempt: u32 },
    /// Restart budget exhausted: open the circuit and stop recovering.
    OpenCircuit,
}

/// Pure supervision policy: classification + bookkeeping in, decision out.
pub fn decide(
    component_id: &str,
    class: &Classification,
    restart: &RestartState,
    cfg: &GuardianConfig,
    now: u64,
) -> Decision {
    match class {
        Classification::Ok { .. } => {
            if restart.restart_count > 0 {
                if let Some(since) = restart.healthy_since {
                    if now.saturating_sub(since) >= cfg.healthy_reset_sec {
                        return Decision::ResetCounter;
                    }
                }
            }
            Decision::Leave
        }
        Classification::Stale { age_secs } => Decision::AlertOnly {
            severity: Severity::Warning,
            alert_key: format!("stale:{}", component_id),
            message: format!("{} heartbeat {}s old", component_id, age_secs),
        },
        Classification::ClockSkew { ahead_secs } => Decision::AlertOnly {
            severity: Severity::Warning,
            alert_key: format!("clock_skew:{}", component_id),
            message: format!("{} heartbeat {}s in the future", component_id, ahead_secs),
        },
        Classification::Critical { .. } | Classification::Dead { .. } => {
            if restart.circuit_open {
                return Decision::AlertOnly {
                    severity: Severity::Critical,
                    alert_key: format!("circuit_open:{}", component_id),
                    message: format!(
                        "{} down, circuit open after {} restarts, manual reset required",
                        component_id, restart.restart_count
                    ),
                };
            }
            if restart.restart_count >= cfg.max_restart_count {
                return Decision::OpenCircuit;
            }
            Decision::Restart { attempt: restart.restart_count }
        }
    }
}

/// Apply a decision's bookkeeping to the restart state. Kept separate from
/// process control so the arithmetic is testable without spawning anything.
pub fn apply_bookkeeping(decision: &Decision, restart: &mut RestartState, now: u64) {
    match decision {
        Decision::Leave => {
            if restart.healthy_since.is_none() {
                restart.healthy_since = Some(now);
            }
        }
        Decision::ResetCounter => {
            restart.restart_count = 0;
            restart.healthy_since = Some(now);
        }
        Decision::AlertOnly { .. } => {}
        Decision::Restart { .. } => {
            restart.restart_count += 1;
            restart.last_restart_at = Some(now);
            restart.healthy_since = None;
        }
        Decision::OpenCircuit => {
            restart.circuit_open = true;
            restart.healthy_since = None;
        }
    }
}

/// Spawn/kill wrapper around the supervised runtime process.
pub struct ProcessControl {
    cmd: String,
    child: Option<Child>,
}

impl ProcessControl {
    pub fn new(cmd: &str) -> Self {
        Self { cmd: cmd.to_string(), child: None }
    }

    pub fn spawn(&mut self) -> std::io::Result<u32> {
        let mut parts = self.cmd.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty runtime command")
        })?;
        let child = ProcessCommand::new(program).args(parts).spawn()?;
        let pid = child.id();
        self.child = Some(child);
        Ok(pid)
    }

    /// Force-terminate the child if still running.
    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.child = None;
    }

    /// Non-blocking exit observation.
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => false,
        }
    }
}

pub struct Guardian<R: LivenessRegistry> {
    cfg: GuardianConfig,
    registry: R,
    notifier: Box<dyn Notifier>,
    limiter: AlertLimiter,
    restarts: HashMap<String, RestartState>,
    control: ProcessControl,
    component_id: String,
}

impl<R: LivenessRegistry> Guardian<R> {
    pub fn new(
        cfg: GuardianConfig,
        registry: R,
        notifier: Box<dyn Notifier>,
        component_id: &str,
    ) -> Self {
        let limiter = AlertLimiter::new(cfg.alert_rate_limit_minutes);
        let control = ProcessControl::new(&cfg.runtime_cmd);
        Self {
            cfg,
            registry,
            notifier,
            limiter,
            restarts: HashMap::new(),
            control,
            component_id: component_id.to_string(),
        }
    }

    /// Read-only journal inspection at startup: corruption is alerted, not
    /// repaired. Intervention decisions still come from liveness alone.
    pub fn check_journal(&mut self, now: u64) {
        match Journal::verify_chain(&self.cfg.journal_path) {
            Ok((true, None)) => {
                json_log("guardian", obj(&[("journal", v_str("chain_ok"))]));
            }
            Ok((_, broken)) => {
                let seq = broken.map(|s| s as f64).unwrap_or(-1.0);
                send_alert(
                    self.notifier.as_ref(),
                    &mut self.limiter,
                    Severity::Critical,
                    "journal_corrupt",
                    &format!("journal chain broken at seq {}", seq),
                    now,
                );
            }
            Err(e) => {
                send_alert(
                    self.notifier.as_ref(),
                    &mut self.limiter,
                    Severity::Critical,
                    "journal_unreadable",
                    &format!("journal unreadable: {}", e),
                    now,
                );
            }
        }
    }

    fn backoff_with_jitter(&self) -> Duration {
        let base = self.cfg.backoff_seconds;
        let jitter_ms = rand::thread_rng().gen_range(0..=base.saturating_mul(250));
        Duration::from_secs(base) + Duration::from_millis(jitter_ms)
    }

    /// One supervision pass over the watched component.
    pub async fn tick(&mut self, now_wall: DateTime<Utc>) {
        let now = now_wall.timestamp() as u64;
        let component = self.component_id.clone();

        let mut read = self
            .registry
            .read(&component)
            .and_then(|rec| record_age_secs(&rec, now_wall));
        // A clean child exit with a fresh-looking record is still a death.
        if self.control.has_exited() {
            read = Err(LivenessError::Missing);
        }

        let class = classify(read, self.cfg.stale_threshold_sec, self.cfg.critical_multiplier);
        let restart = self.restarts.entry(component.clone()).or_default();
        let decision = decide(&component, &class, restart, &self.cfg, now);

        json_log(
            "guardian",
            obj(&[
                ("component", v_str(&component)),
                ("classification", v_str(&format!("{:?}", class))),
                ("decision", v_str(&format!("{:?}", decision))),
                ("restart_count", v_num(restart.restart_count as f64)),
            ]),
        );

        apply_bookkeeping(&decision, restart, now);
        let restart_count = restart.restart_count;

        match decision {
            Decision::Leave => {}
            Decision::ResetCounter => {
                json_log(
                    "guardian",
                    obj(&[("component", v_str(&component)), ("event", v_str("counter_reset"))]),
                );
            }
            Decision::AlertOnly { severity, alert_key, message } => {
                send_alert(
                    self.notifier.as_ref(),
                    &mut self.limiter,
                    severity,
                    &alert_key,
                    &message,
                    now,
                );
            }
            Decision::Restart { attempt } => {
                send_alert(
                    self.notifier.as_ref(),
                    &mut self.limiter,
                    Severity::Warning,
                    &format!("restart:{}", component),
                    &format!("restarting {} (attempt {})", component, attempt + 1),
                    now,
                );
                self.control.kill();
                tokio::time::sleep(self.backoff_with_jitter()).await;
                match self.control.spawn() {
                    Ok(pid) => {
                        json_log(
                            "guardian",
                            obj(&[
                                ("component", v_str(&component)),
                                ("event", v_str("restarted")),
                                ("pid", v_num(pid as f64)),
                                ("restart_count", v_num(restart_count as f64)),
                            ]),
                        );
                    }
                    Err(e) => {
                        send_alert(
                            self.notifier.as_ref(),
                            &mut self.limiter,
                            Severity::Critical,
                            &format!("spawn_failed:{}", component),
                            &format!("could not start {}: {}", component, e),
                            now,
                        );
                    }
                }
            }
            Decision::OpenCircuit => {
                send_alert(
                    self.notifier.as_ref(),
                    &mut self.limiter,
                    Severity::Critical,
                    &format!("circuit_open:{}", component),
                    &format!(
                        "{} exceeded {} restarts, auto-recovery disabled",
                        component, self.cfg.max_restart_count
                    ),
                    now,
                );
            }
        }
    }

    /// Poll loop, independent and non-blocking with respect to the runtime.
    pub async fn run(&mut self) {
        self.check_journal(ts_epoch());
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.cfg.watchdog_poll_interval_sec.max(1)));
        loop {
            interval.tick().await;
            self.tick(Utc::now()).await;
        }
    }

    pub fn restart_state(&self, component_id: &str) -> Option<&RestartState> {
        self.restarts.get(component_id)
    }
}
