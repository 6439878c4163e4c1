//! Command handlers: the seam between the control plane and external
//! collaborators. The bus owns validation and journaling; a handler owns
//! the side effect only and reports which transition it wants.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::command::{Command, CommandKind};
use crate::lifecycle::TradeState;

/// What a handler reports back to the bus.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub success: bool,
    pub new_state_request: Option<TradeState>,
    pub error_code: Option<String>,
}

impl HandlerOutcome {
    pub fn ok() -> Self {
        Self { success: true, new_state_request: None, error_code: None }
    }

    pub fn ok_with(state: TradeState) -> Self {
        Self { success: true, new_state_request: Some(state), error_code: None }
    }

    pub fn failed(code: &str) -> Self {
        Self { success: false, new_state_request: None, error_code: Some(code.to_string()) }
    }
}

#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Transition to apply before the side effect runs (e.g. enter ORDERING
    /// before talking to the exchange). The bus rolls back to the
    /// pre-command state if the side effect then fails.
    fn entry_state(&self, _cmd: &Command, _current: TradeState) -> Option<TradeState> {
        None
    }

    /// The side effect. No journaling, no state mutation in here.
    async fn handle(&self, cmd: &Command) -> HandlerOutcome;
}

#[derive(Debug)]
pub struct ExecutorError {
    pub code: String,
}

impl std::fmt::Display for ExecutorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "executor error: {}", self.code)
    }
}

/// Exchange-facing collaborator. Connectivity lives outside this crate.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn place(
        &self,
        symbol: &str,
        side: &str,
        qty: f64,
        price: Option<f64>,
    ) -> Result<String, ExecutorError>;
    async fn cancel(&self, order_ref: &str) -> Result<(), ExecutorError>;
    async fn close(&self, reason: &str) -> Result<(), ExecutorError>;
}

/// Stub executor for dry runs and tests.
pub struct NullExecutor;

#[async_trait]
impl OrderExecutor for NullExecutor {
    async fn place(
        &self,
        _symbol: &str,
        _side: &str,
        _qty: f64,
        _price: Option<f64>,
    ) -> Result<String, ExecutorError> {
        Ok("null-order".to_string())
    }

    async fn cancel(&self, _order_ref: &str) -> Result<(), ExecutorError> {
        Ok(())
    }

    async fn close(&self, _reason: &str) -> Result<(), ExecutorError> {
        Ok(())
    }
}

struct SignalHandler;

#[async_trait]
impl CommandHandler for SignalHandler {
    async fn handle(&self, _cmd: &Command) -> HandlerOutcome {
        HandlerOutcome::ok_with(TradeState::SignalReceived)
    }
}

struct DecideHandler;

#[async_trait]
impl CommandHandler for DecideHandler {
    fn entry_state(&self, _cmd: &Command, _current: TradeState) -> Option<TradeState> {
        Some(TradeState::Deciding)
    }

    async fn handle(&self, cmd: &Command) -> HandlerOutcome {
        match &cmd.kind {
            // Approved decisions hold in DECIDING until the order command
            // drives DECIDING -> ORDERING; vetoes return to IDLE.
            CommandKind::Decide { approved: true, .. } => HandlerOutcome::ok(),
            CommandKind::Decide { approved: false, .. } => {
                HandlerOutcome::ok_with(TradeState::Idle)
            }
            _ => HandlerOutcome::failed("wrong_command_for_handler"),
        }
    }
}

struct OrderHandler {
    executor: Arc<dyn OrderExecutor>,
}

#[async_trait]
impl CommandHandler for OrderHandler {
    fn entry_state(&self, _cmd: &Command, _current: TradeState) -> Option<TradeState> {
        Some(TradeState::Ordering)
    }

    async fn handle(&self, cmd: &Command) -> HandlerOutcome {
        let CommandKind::Order { symbol, side, qty, price } = &cmd.kind else {
            return HandlerOutcome::failed("wrong_command_for_handler");
        };
        match self.executor.place(symbol, side, *qty, *price).await {
            Ok(_ref) => HandlerOutcome::ok_with(TradeState::PendingFill),
            Err(e) => HandlerOutcome::failed(&e.code),
        }
    }
}

struct CancelHandler {
    executor: Arc<dyn OrderExecutor>,
}

#[async_trait]
impl CommandHandler for CancelHandler {
    async fn handle(&self, cmd: &Command) -> HandlerOutcome {
        let CommandKind::Cancel { order_ref } = &cmd.kind else {
            return HandlerOutcome::failed("wrong_command_for_handler");
        };
        match self.executor.cancel(order_ref).await {
            Ok(()) => HandlerOutcome::ok_with(TradeState::Idle),
            Err(e) => HandlerOutcome::failed(&e.code),
        }
    }
}

struct CloseHandler {
    executor: Arc<dyn OrderExecutor>,
}

#[async_trait]
impl CommandHandler for CloseHandler {
    fn entry_state(&self, _cmd: &Command, _current: TradeState) -> Option<TradeState> {
        Some(TradeState::Closing)
    }

    async fn handle(&self, cmd: &Command) -> HandlerOutcome {
        let CommandKind::Close { reason } = &cmd.kind else {
            return HandlerOutcome::failed("wrong_command_for_handler");
        };
        match self.executor.close(reason).await {
            Ok(()) => HandlerOutcome::ok_with(TradeState::Closed),
            Err(e) => HandlerOutcome::failed(&e.code),
        }
    }
}

struct SyncHandler;

#[async_trait]
impl CommandHandler for SyncHandler {
    fn entry_state(&self, _cmd: &Command, current: TradeState) -> Option<TradeState> {
        // Housekeeping progression; elsewhere sync is a no-op.
        match current {
            TradeState::Idle => Some(TradeState::Scanning),
            TradeState::PendingFill => Some(TradeState::PositionOpen),
            TradeState::PositionOpen => Some(TradeState::Monitoring),
            TradeState::Closed => Some(TradeState::Idle),
            _ => None,
        }
    }

    async fn handle(&self, _cmd: &Command) -> HandlerOutcome {
        HandlerOutcome::ok()
    }
}

struct HealthHandler;

#[async_trait]
impl CommandHandler for HealthHandler {
    async fn handle(&self, _cmd: &Command) -> HandlerOutcome {
        HandlerOutcome::ok()
    }
}

pub type HandlerMap = HashMap<&'static str, Box<dyn CommandHandler>>;

/// The built-in handler set covering every command type.
pub fn default_handlers(executor: Arc<dyn OrderExecutor>) -> HandlerMap {
    let mut map: HandlerMap = HashMap::new();
    map.insert("signal", Box::new(SignalHandler));
    map.insert("decide", Box::new(DecideHandler));
    map.insert("order", Box::new(OrderHandler { executor: executor.clone() }));
    map.insert("cancel", Box::new(CancelHandler { executor: executor.clone() }));
    map.insert("close", Box::new(CloseHandler { executor }));
    map.insert("sync", Box::new(SyncHandler));
    map.insert("health", Box::new(HealthHandler));
    map
}
