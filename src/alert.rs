//! Alerting: a fire-and-forget notification sink, rate-limited per alert
//! key before the call so sustained outages do not turn into notification
//! storms. The limiter is an injected value, one per guardian instance.

use std::collections::HashMap;

use crate::logging::{log, obj, v_str, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Critical => "CRITICAL",
        }
    }

    fn level(&self) -> Level {
        match self {
            Severity::Info => Level::Info,
            Severity::Warning => Level::Warn,
            Severity::Critical => Level::Error,
        }
    }
}

/// External notification transport. The body (Telegram, pager, ...) lives
/// outside this crate.
pub trait Notifier: Send + Sync {
    fn notify(&self, severity: Severity, alert_key: &str, message: &str);
}

/// Notifier that writes to the structured log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, severity: Severity, alert_key: &str, message: &str) {
        log(
            severity.level(),
            "alert",
            "notify",
            obj(&[
                ("severity", v_str(severity.as_str())),
                ("alert_key", v_str(alert_key)),
                ("msg", v_str(message)),
            ]),
        );
    }
}

/// Suppresses repeats of the same alert key within a cool-down window.
#[derive(Debug)]
pub struct AlertLimiter {
    window_secs: u64,
    last_sent: HashMap<String, u64>,
}

impl AlertLimiter {
    pub fn new(window_minutes: u64) -> Self {
        Self { window_secs: window_minutes * 60, last_sent: HashMap::new() }
    }

    /// True if this key may be sent at `now`; records the send.
    pub fn allow(&mut self, alert_key: &str, now: u64) -> bool {
        match self.last_sent.get(alert_key) {
            Some(last) if now.saturating_sub(*last) < self.window_secs => false,
            _ => {
                self.last_sent.insert(alert_key.to_string(), now);
                true
            }
        }
    }
}

/// Rate-limited send: the limiter decides, the notifier delivers.
pub fn send_alert(
    notifier: &dyn Notifier,
    limiter: &mut AlertLimiter,
    severity: Severity,
    alert_key: &str,
    message: &str,
    now: u64,
) -> bool {
    if !limiter.allow(alert_key, now) {
        return false;
    }
    notifier.notify(severity, alert_key, message);
    true
}
