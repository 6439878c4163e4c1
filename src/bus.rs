//! Command bus: validate -> authorize -> route -> execute, one command at
//! a time. Producers submit concurrently through a cloneable handle; a
//! single sequencer task drains the channel, so state machine transitions
//! are linearizable and the journal sees a total order.

use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::command::{Command, ReasonCode};
use crate::config::Config;
use crate::handlers::HandlerMap;
use crate::lifecycle::{StateMachine, TradeState, TransitionOutcome};
use crate::logging::{json_log, obj, ts_epoch, v_str};
use crate::reliability::circuit::CircuitBreaker;
use crate::reliability::journal::{event_type, Journal};
use crate::reliability::rate::RateLimiter;
use crate::storage::StateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accepted,
    Rejected(ReasonCode),
}

/// Fatal bus conditions. Any of these halts command intake for good;
/// recovery is crash-restart plus journal replay.
#[derive(Debug)]
pub enum BusError {
    /// A previous fatal condition already stopped the bus.
    Halted,
    /// The journal could not persist an entry. Fail-closed: no event may be
    /// reported committed unless durably stored.
    JournalPersistence(std::io::Error),
    /// No handler registered for a command type: a configuration error,
    /// not a rejection.
    UnregisteredHandler(&'static str),
    /// A compensating rollback was itself rejected by the graph.
    RollbackDiverged { stuck_in: TradeState },
    /// The sequencer task is gone.
    ChannelClosed,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Halted => write!(f, "bus halted"),
            BusError::JournalPersistence(e) => write!(f, "journal persistence failure: {}", e),
            BusError::UnregisteredHandler(t) => write!(f, "no handler registered for '{}'", t),
            BusError::RollbackDiverged { stuck_in } => {
                write!(f, "compensating rollback rejected, stuck in {}", stuck_in.as_str())
            }
            BusError::ChannelClosed => write!(f, "bus channel closed"),
        }
    }
}

impl std::error::Error for BusError {}

#[derive(Debug, Clone, Copy, Default)]
pub struct BusCounters {
    pub accepted: u64,
    pub rejected_contract: u64,
    pub rejected_auth: u64,
    pub rejected_transition: u64,
    pub rejected_handler: u64,
    pub transitions_applied: u64,
}

pub struct CommandBus {
    machine: StateMachine,
    journal: Journal,
    handlers: HandlerMap,
    rate: RateLimiter,
    circuit: CircuitBreaker,
    handler_timeout: Duration,
    halted: bool,
    counters: BusCounters,
    store: Option<StateStore>,
    persist_every_secs: u64,
    last_persist: u64,
}

impl CommandBus {
    pub fn new(cfg: &Config, journal: Journal, machine: StateMachine, handlers: HandlerMap) -> Self {
        Self {
            machine,
            journal,
            handlers,
            rate: RateLimiter::new(cfg.rate_limit_per_min, 60),
            circuit: CircuitBreaker::new(cfg.failure_threshold),
            handler_timeout: Duration::from_millis(cfg.handler_timeout_ms),
            halted: false,
            counters: BusCounters::default(),
            store: None,
            persist_every_secs: cfg.persist_every_secs,
            last_persist: ts_epoch(),
        }
    }

    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn current_state(&self) -> TradeState {
        self.machine.current()
    }

    pub fn counters(&self) -> BusCounters {
        self.counters
    }

    pub fn journal_path(&self) -> String {
        self.journal.path().to_string()
    }

    fn journal_command_event(
        &mut self,
        event: &str,
        cmd: &Command,
        reason: Option<ReasonCode>,
    ) -> Result<(), BusError> {
        let payload = json!({
            "command_id": cmd.id,
            "command_type": cmd.kind.type_name(),
            "reason": reason.map(|r| r.as_str()),
        });
        match self.journal.append(event, payload, &cmd.correlation_id) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.halted = true;
                Err(BusError::JournalPersistence(e))
            }
        }
    }

    fn reject(&mut self, cmd: &Command, reason: ReasonCode) -> Result<Verdict, BusError> {
        self.journal_command_event(event_type::COMMAND_REJECTED, cmd, Some(reason))?;
        json_log(
            "bus",
            obj(&[
                ("command_id", v_str(&cmd.id)),
                ("command_type", v_str(cmd.kind.type_name())),
                ("verdict", v_str("rejected")),
                ("reason", v_str(reason.as_str())),
            ]),
        );
        match reason {
            ReasonCode::ContractViolation => self.counters.rejected_contract += 1,
            ReasonCode::AuthorizationDenied => self.counters.rejected_auth += 1,
            ReasonCode::InvalidTransition => self.counters.rejected_transition += 1,
            ReasonCode::HandlerFailure | ReasonCode::HandlerTimeout => {
                self.counters.rejected_handler += 1
            }
        }
        Ok(Verdict::Rejected(reason))
    }

    fn maybe_persist(&mut self) {
        let now = ts_epoch();
        if now.saturating_sub(self.last_persist) < self.persist_every_secs {
            return;
        }
        self.last_persist = now;
        let counters = self.counters;
        let state = self.machine.current();
        if let Some(store) = self.store.as_mut() {
            if let Err(e) = store.persist_counters(now, state.as_str(), &counters) {
                json_log(
                    "bus",
                    obj(&[("event", v_str("persist_failed")), ("error", v_str(&e.to_string()))]),
                );
            }
        }
    }

    /// Run one command through the full pipeline. Called only from the
    /// sequencer, so transitions never interleave.
    pub async fn process(&mut self, cmd: Command) -> Result<Verdict, BusError> {
        if self.halted {
            return Err(BusError::Halted);
        }

        // 1. Validate: structural contract, nothing journaled but the audit.
        if let Err(violation) = cmd.kind.validate() {
            json_log(
                "bus",
                obj(&[
                    ("command_id", v_str(&cmd.id)),
                    ("contract_violation", v_str(&violation.msg)),
                ]),
            );
            return self.reject(&cmd, ReasonCode::ContractViolation);
        }

        // 2. Authorize: circuit breaker, then per-type rate limit.
        if !self.circuit.allow() || !self.rate.allow(cmd.kind.type_name(), ts_epoch()) {
            return self.reject(&cmd, ReasonCode::AuthorizationDenied);
        }

        // 3. Route: exactly one handler per type; a hole here is fatal.
        let type_name = cmd.kind.type_name();
        if !self.handlers.contains_key(type_name) {
            self.halted = true;
            return Err(BusError::UnregisteredHandler(type_name));
        }

        // 4. Execute.
        self.journal_command_event(event_type::COMMAND_RECEIVED, &cmd, None)?;
        let last_good = self.machine.current();

        let entry = self
            .handlers
            .get(type_name)
            .map(|h| h.entry_state(&cmd, last_good))
            .unwrap_or(None);
        if let Some(entry_state) = entry {
            let rec = self
                .machine
                .attempt(entry_state, &cmd.id, &cmd.correlation_id, &mut self.journal)
                .map_err(|e| {
                    self.halted = true;
                    BusError::JournalPersistence(e)
                })?;
            if rec.outcome != TransitionOutcome::Applied {
                return self.reject(&cmd, ReasonCode::InvalidTransition);
            }
            self.counters.transitions_applied += 1;
        }

        let handler = self
            .handlers
            .get(type_name)
            .ok_or(BusError::UnregisteredHandler(type_name))?;
        let outcome = match timeout(self.handler_timeout, handler.handle(&cmd)).await {
            Ok(outcome) if outcome.success => outcome,
            Ok(outcome) => {
                return self.fail_and_rollback(&cmd, last_good, ReasonCode::HandlerFailure, outcome.error_code);
            }
            Err(_) => {
                return self.fail_and_rollback(&cmd, last_good, ReasonCode::HandlerTimeout, None);
            }
        };

        if let Some(to) = outcome.new_state_request {
            let rec = self
                .machine
                .attempt(to, &cmd.id, &cmd.correlation_id, &mut self.journal)
                .map_err(|e| {
                    self.halted = true;
                    BusError::JournalPersistence(e)
                })?;
            if rec.outcome != TransitionOutcome::Applied {
                // Side effect ran but its requested destination is illegal:
                // treat like a failed handler and compensate.
                return self.fail_and_rollback(&cmd, last_good, ReasonCode::InvalidTransition, None);
            }
            self.counters.transitions_applied += 1;
        }

        self.circuit.record_success();
        self.journal_command_event(event_type::COMMAND_EXECUTED, &cmd, None)?;
        self.counters.accepted += 1;
        self.maybe_persist();
        Ok(Verdict::Accepted)
    }

    fn fail_and_rollback(
        &mut self,
        cmd: &Command,
        last_good: TradeState,
        reason: ReasonCode,
        error_code: Option<String>,
    ) -> Result<Verdict, BusError> {
        if let Some(code) = &error_code {
            json_log(
                "bus",
                obj(&[
                    ("command_id", v_str(&cmd.id)),
                    ("handler_error", v_str(code)),
                ]),
            );
        }
        if reason == ReasonCode::HandlerFailure || reason == ReasonCode::HandlerTimeout {
            self.circuit.record_failure();
        }
        let rec = self
            .machine
            .rollback_to(last_good, &cmd.id, &cmd.correlation_id, &mut self.journal)
            .map_err(|e| {
                self.halted = true;
                BusError::JournalPersistence(e)
            })?;
        if rec.outcome == TransitionOutcome::RejectedInvalid {
            // The graph does not allow the way back. Escalate instead of
            // silently diverging; the process exit is the guardian's signal.
            let _ = self.journal.append(
                event_type::ALERT,
                json!({
                    "severity": "CRITICAL",
                    "alert_key": "rollback_diverged",
                    "command_id": cmd.id,
                    "stuck_in": self.machine.current().as_str(),
                }),
                &cmd.correlation_id,
            );
            self.halted = true;
            return Err(BusError::RollbackDiverged { stuck_in: self.machine.current() });
        }
        self.reject(cmd, reason)
    }

    /// Start the sequencer. Producers clone the handle and submit
    /// concurrently; the bus drains in submission order.
    pub fn spawn(mut self, channel_capacity: usize) -> (BusHandle, JoinHandle<CommandBus>) {
        let (tx, mut rx) = mpsc::channel::<SubmitRequest>(channel_capacity);
        let join = tokio::spawn(async move {
            while let Some((cmd, reply)) = rx.recv().await {
                let result = self.process(cmd).await;
                let stop = result.is_err();
                let _ = reply.send(result);
                if stop {
                    // Fatal condition: stop draining, fail fast for everyone.
                    break;
                }
            }
            self
        });
        (BusHandle { tx }, join)
    }
}

type SubmitRequest = (Command, oneshot::Sender<Result<Verdict, BusError>>);

#[derive(Clone)]
pub struct BusHandle {
    tx: mpsc::Sender<SubmitRequest>,
}

impl BusHandle {
    pub async fn submit(&self, cmd: Command) -> Result<Verdict, BusError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send((cmd, reply_tx))
            .await
            .map_err(|_| BusError::ChannelClosed)?;
        reply_rx.await.map_err(|_| BusError::ChannelClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;
    use crate::handlers::{default_handlers, ExecutorError, NullExecutor, OrderExecutor};
    use crate::reliability::journal::Journal;
    use std::sync::Arc;

    struct FailingExecutor;

    #[async_trait::async_trait]
    impl OrderExecutor for FailingExecutor {
        async fn place(
            &self,
            _symbol: &str,
            _side: &str,
            _qty: f64,
            _price: Option<f64>,
        ) -> Result<String, ExecutorError> {
            Err(ExecutorError { code: "venue_down".to_string() })
        }

        async fn cancel(&self, _order_ref: &str) -> Result<(), ExecutorError> {
            Ok(())
        }

        async fn close(&self, _reason: &str) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    fn test_cfg() -> Config {
        let mut cfg = Config::from_env();
        cfg.rate_limit_per_min = 100;
        cfg.failure_threshold = 3;
        cfg.handler_timeout_ms = 500;
        cfg
    }

    fn make_bus(executor: Arc<dyn OrderExecutor>) -> (tempfile::TempDir, CommandBus) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bus.journal").to_string_lossy().to_string();
        let journal = Journal::open(&path).unwrap();
        let bus = CommandBus::new(
            &test_cfg(),
            journal,
            StateMachine::new(),
            default_handlers(executor),
        );
        (dir, bus)
    }

    fn signal() -> Command {
        Command::new(
            "C-sig",
            CommandKind::Signal {
                symbol: "BTCUSDT".to_string(),
                direction: "LONG".to_string(),
                score: 0.8,
            },
            "ep-1",
        )
    }

    fn order() -> Command {
        Command::new(
            "C-ord",
            CommandKind::Order {
                symbol: "BTCUSDT".to_string(),
                side: "BUY".to_string(),
                qty: 0.1,
                price: None,
            },
            "ep-1",
        )
    }

    #[tokio::test]
    async fn test_contract_violation_rejected_before_state() {
        let (_dir, mut bus) = make_bus(Arc::new(NullExecutor));
        let cmd = Command::new(
            "C-bad",
            CommandKind::Order {
                symbol: "BTCUSDT".to_string(),
                side: "BUY".to_string(),
                qty: -1.0,
                price: None,
            },
            "ep-1",
        );
        let verdict = bus.process(cmd).await.unwrap();
        assert_eq!(verdict, Verdict::Rejected(ReasonCode::ContractViolation));
        assert_eq!(bus.current_state(), TradeState::Idle);

        // Only the rejection audit entry, nothing else.
        let entries = Journal::read_all(&bus.journal_path()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, "command_rejected");
    }

    #[tokio::test]
    async fn test_full_episode_accepted() {
        let (_dir, mut bus) = make_bus(Arc::new(NullExecutor));
        let steps: Vec<Command> = vec![
            Command::new("C-1", CommandKind::Sync {}, "ep-1"), // IDLE -> SCANNING
            signal(),                                           // -> SIGNAL_RECEIVED
            Command::new("C-3", CommandKind::Decide { approved: true, confidence: 0.9 }, "ep-1"),
            order(),                                            // DECIDING -> ORDERING -> PENDING_FILL
            Command::new("C-5", CommandKind::Sync {}, "ep-1"), // -> POSITION_OPEN
            Command::new("C-6", CommandKind::Sync {}, "ep-1"), // -> MONITORING
            Command::new("C-7", CommandKind::Close { reason: "take_profit".to_string() }, "ep-1"),
            Command::new("C-8", CommandKind::Sync {}, "ep-1"), // CLOSED -> IDLE
        ];
        for cmd in steps {
            let verdict = bus.process(cmd).await.unwrap();
            assert_eq!(verdict, Verdict::Accepted);
        }
        assert_eq!(bus.current_state(), TradeState::Idle);
        assert_eq!(Journal::verify_chain(&bus.journal_path()).unwrap(), (true, None));
    }

    #[tokio::test]
    async fn test_order_from_idle_rejected_invalid_transition() {
        let (_dir, mut bus) = make_bus(Arc::new(NullExecutor));
        let verdict = bus.process(order()).await.unwrap();
        assert_eq!(verdict, Verdict::Rejected(ReasonCode::InvalidTransition));
        assert_eq!(bus.current_state(), TradeState::Idle);
    }

    #[tokio::test]
    async fn test_handler_failure_rolls_back() {
        let (_dir, mut bus) = make_bus(Arc::new(FailingExecutor));
        // Walk to DECIDING.
        bus.process(Command::new("C-1", CommandKind::Sync {}, "ep-1")).await.unwrap();
        bus.process(signal()).await.unwrap();
        bus.process(Command::new(
            "C-3",
            CommandKind::Decide { approved: true, confidence: 0.9 },
            "ep-1",
        ))
        .await
        .unwrap();
        assert_eq!(bus.current_state(), TradeState::Deciding);

        // Order enters ORDERING, venue fails, bus compensates back.
        let verdict = bus.process(order()).await.unwrap();
        assert_eq!(verdict, Verdict::Rejected(ReasonCode::HandlerFailure));
        assert_eq!(bus.current_state(), TradeState::Deciding);

        let entries = Journal::read_all(&bus.journal_path()).unwrap();
        let rolled: Vec<_> = entries
            .iter()
            .filter(|e| e.payload.get("outcome") == Some(&serde_json::json!("ROLLED_BACK")))
            .collect();
        assert_eq!(rolled.len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_handler_halts_and_later_submits_fail_fast() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nohandler.journal").to_string_lossy().to_string();
        let journal = Journal::open(&path).unwrap();
        let mut bus = CommandBus::new(
            &test_cfg(),
            journal,
            StateMachine::new(),
            HandlerMap::new(),
        );

        // A hole in the routing table is a configuration error, not a
        // rejection: the bus halts on the spot.
        match bus.process(Command::new("C-h1", CommandKind::Health {}, "ep-1")).await {
            Err(BusError::UnregisteredHandler(t)) => assert_eq!(t, "health"),
            other => panic!("expected UnregisteredHandler, got {:?}", other),
        }

        // Every later submit fails fast without touching journal or state.
        match bus.process(Command::new("C-h2", CommandKind::Health {}, "ep-1")).await {
            Err(BusError::Halted) => {}
            other => panic!("expected Halted, got {:?}", other),
        }
        assert_eq!(bus.current_state(), TradeState::Idle);
        assert!(Journal::read_all(&path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_circuit_opens_after_repeated_failures() {
        let (_dir, mut bus) = make_bus(Arc::new(FailingExecutor));
        bus.process(Command::new("C-1", CommandKind::Sync {}, "ep-1")).await.unwrap();
        bus.process(signal()).await.unwrap();
        bus.process(Command::new(
            "C-3",
            CommandKind::Decide { approved: true, confidence: 0.9 },
            "ep-1",
        ))
        .await
        .unwrap();

        for i in 0..3 {
            let mut cmd = order();
            cmd.id = format!("C-ord-{}", i);
            let verdict = bus.process(cmd).await.unwrap();
            assert_eq!(verdict, Verdict::Rejected(ReasonCode::HandlerFailure));
        }
        // Breaker tripped: even a health probe is now denied.
        let verdict = bus
            .process(Command::new("C-h", CommandKind::Health {}, "ep-1"))
            .await
            .unwrap();
        assert_eq!(verdict, Verdict::Rejected(ReasonCode::AuthorizationDenied));
    }

    #[tokio::test]
    async fn test_rate_limit_denies_burst() {
        let (_dir, journal_bus) = {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("rate.journal").to_string_lossy().to_string();
            let journal = Journal::open(&path).unwrap();
            let mut cfg = test_cfg();
            cfg.rate_limit_per_min = 2;
            let bus = CommandBus::new(
                &cfg,
                journal,
                StateMachine::new(),
                default_handlers(Arc::new(NullExecutor)),
            );
            (dir, bus)
        };
        let mut bus = journal_bus;
        for i in 0..2 {
            let cmd = Command::new(&format!("C-h{}", i), CommandKind::Health {}, "ep-1");
            assert_eq!(bus.process(cmd).await.unwrap(), Verdict::Accepted);
        }
        let cmd = Command::new("C-h3", CommandKind::Health {}, "ep-1");
        assert_eq!(
            bus.process(cmd).await.unwrap(),
            Verdict::Rejected(ReasonCode::AuthorizationDenied)
        );
    }

    #[tokio::test]
    async fn test_sequencer_serializes_concurrent_producers() {
        let (_dir, bus) = make_bus(Arc::new(NullExecutor));
        let (handle, join) = bus.spawn(64);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move {
                let cmd = Command::new(&format!("C-h{}", i), CommandKind::Health {}, "ep-x");
                h.submit(cmd).await.unwrap()
            }));
        }
        for t in tasks {
            assert_eq!(t.await.unwrap(), Verdict::Accepted);
        }
        drop(handle);
        let bus = join.await.unwrap();
        assert_eq!(bus.counters().accepted, 8);
        assert_eq!(Journal::verify_chain(&bus.journal_path()).unwrap(), (true, None));
    }
}
