use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

/// Lets one log record through per window.
///
/// ```ignore
/// if self.not_connected.should_log() {
///     log::warn!("Connection to collectd not established");
/// }
/// ```
#[derive(Debug)]
pub struct RateLimitedLog {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateLimitedLog {
    pub const fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    pub fn should_log(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last.lock().unwrap_or_else(|err| err.into_inner());
        match *last {
            Some(previous) if now.duration_since(previous) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
