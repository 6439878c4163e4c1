//! Typed trading commands and their structural contracts.
//!
//! Commands are a closed set of variants; each variant validates its own
//! payload before any state effect. There is no runtime schema lookup:
//! the serde tag selects the variant, the variant carries the contract.

use serde::{Deserialize, Serialize};

use crate::logging::ts_epoch;

/// Why a submitted command was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    ContractViolation,
    AuthorizationDenied,
    InvalidTransition,
    HandlerFailure,
    HandlerTimeout,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::ContractViolation => "contract_violation",
            ReasonCode::AuthorizationDenied => "authorization_denied",
            ReasonCode::InvalidTransition => "invalid_transition",
            ReasonCode::HandlerFailure => "handler_failure",
            ReasonCode::HandlerTimeout => "handler_timeout",
        }
    }
}

/// Contract violation detail, naming the offending field.
#[derive(Debug, Clone)]
pub struct ContractError {
    pub msg: String,
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg)
    }
}

fn bad(field: &str, why: &str) -> ContractError {
    ContractError { msg: format!("{}: {}", field, why) }
}

fn check_symbol(symbol: &str) -> Result<(), ContractError> {
    if symbol.is_empty() {
        return Err(bad("symbol", "empty"));
    }
    if !symbol.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()) {
        return Err(bad("symbol", "must be uppercase alphanumeric"));
    }
    Ok(())
}

fn check_unit(field: &str, v: f64) -> Result<(), ContractError> {
    if !v.is_finite() || !(0.0..=1.0).contains(&v) {
        return Err(bad(field, "must be within [0, 1]"));
    }
    Ok(())
}

/// Closed set of command payloads. The serde tag is the wire `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandKind {
    Signal {
        symbol: String,
        direction: String,
        score: f64,
    },
    Decide {
        approved: bool,
        confidence: f64,
    },
    Order {
        symbol: String,
        side: String,
        qty: f64,
        #[serde(default)]
        price: Option<f64>,
    },
    Cancel {
        order_ref: String,
    },
    Close {
        reason: String,
    },
    Sync {},
    Health {},
}

impl CommandKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            CommandKind::Signal { .. } => "signal",
            CommandKind::Decide { .. } => "decide",
            CommandKind::Order { .. } => "order",
            CommandKind::Cancel { .. } => "cancel",
            CommandKind::Close { .. } => "close",
            CommandKind::Sync {} => "sync",
            CommandKind::Health {} => "health",
        }
    }

    /// Structural contract for this variant. Rejects before any state effect.
    pub fn validate(&self) -> Result<(), ContractError> {
        match self {
            CommandKind::Signal { symbol, direction, score } => {
                check_symbol(symbol)?;
                if direction != "LONG" && direction != "SHORT" {
                    return Err(bad("direction", "must be LONG or SHORT"));
                }
                check_unit("score", *score)
            }
            CommandKind::Decide { confidence, .. } => check_unit("confidence", *confidence),
            CommandKind::Order { symbol, side, qty, price } => {
                check_symbol(symbol)?;
                if side != "BUY" && side != "SELL" {
                    return Err(bad("side", "must be BUY or SELL"));
                }
                if !qty.is_finite() || *qty <= 0.0 {
                    return Err(bad("qty", "must be positive"));
                }
                if let Some(p) = price {
                    if !p.is_finite() || *p <= 0.0 {
                        return Err(bad("price", "must be positive when present"));
                    }
                }
                Ok(())
            }
            CommandKind::Cancel { order_ref } => {
                if order_ref.is_empty() {
                    return Err(bad("order_ref", "empty"));
                }
                Ok(())
            }
            CommandKind::Close { reason } => {
                if reason.is_empty() {
                    return Err(bad("reason", "empty"));
                }
                Ok(())
            }
            CommandKind::Sync {} | CommandKind::Health {} => Ok(()),
        }
    }
}

/// A typed request to act on the trading lifecycle. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(flatten)]
    pub kind: CommandKind,
    pub submitted_at: u64,
    pub correlation_id: String,
}

impl Command {
    pub fn new(id: &str, kind: CommandKind, correlation_id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            submitted_at: ts_epoch(),
            correlation_id: correlation_id.to_string(),
        }
    }
}
