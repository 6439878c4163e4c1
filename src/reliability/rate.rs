//! Fixed-window rate limiting per command type.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct Window {
    start: u64,
    count: u32,
}

/// Admits up to `limit` commands per type within each `window_secs` window.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window_secs: u64,
    windows: HashMap<&'static str, Window>,
}

impl RateLimiter {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs, windows: HashMap::new() }
    }

    /// True if the command type is admitted at `now`; counts the admission.
    pub fn allow(&mut self, type_name: &'static str, now: u64) -> bool {
        let bucket = now / self.window_secs.max(1);
        let w = self.windows.entry(type_name).or_insert(Window { start: bucket, count: 0 });
        if w.start != bucket {
            w.start = bucket;
            w.count = 0;
        }
        if w.count >= self.limit {
            return false;
        }
        w.count += 1;
        true
    }
}
