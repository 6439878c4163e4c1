//! Reliability core for a trading runtime: a journaled command bus, a
//! strict lifecycle state machine, and an external guardian supervisor.

pub mod alert;
pub mod bus;
pub mod command;
pub mod config;
pub mod guardian;
pub mod handlers;
pub mod lifecycle;
pub mod liveness;
pub mod logging;
pub mod reliability;
pub mod storage;
