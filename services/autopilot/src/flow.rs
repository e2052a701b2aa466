//! Flow control - backpressure and restock decisions
//!
//! `should_pause` and `should_restock` are pure. `RestockGate` adds the
//! cooldown-window token that keeps repeated restock checks from issuing
//! duplicate work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::FlowConfig;

/// Producers pause once the queue reaches its high-water mark
pub fn should_pause(queue_size: usize, max_size: usize) -> bool {
    queue_size >= max_size
}

/// Restock when under the low-water mark and the cooldown has elapsed
pub fn should_restock(queue_size: usize, min_size: usize, cooldown_elapsed: bool) -> bool {
    queue_size < min_size && cooldown_elapsed
}

/// Token identifying one cooldown window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RestockToken(pub i64);

impl RestockToken {
    /// Window index for `now` given a cooldown length
    pub fn for_window(now: DateTime<Utc>, cooldown: Duration) -> Self {
        let window_secs = cooldown.as_secs().max(1) as i64;
        RestockToken(now.timestamp().div_euclid(window_secs))
    }

    pub fn key(&self) -> String {
        format!("restock-{}", self.0)
    }
}

/// Issues at most one restock token per cooldown window
#[derive(Debug, Clone)]
pub struct RestockGate {
    min_size: usize,
    cooldown: Duration,
    last_issued: Option<(RestockToken, DateTime<Utc>)>,
}

impl RestockGate {
    pub fn new(min_size: usize, cooldown: Duration) -> Self {
        Self {
            min_size,
            cooldown,
            last_issued: None,
        }
    }

    pub fn from_config(config: &FlowConfig) -> Self {
        Self::new(config.min_queue, config.restock_cooldown())
    }

    /// Resume from a token persisted before a restart
    pub fn with_last_issued(mut self, token: RestockToken, issued_at: DateTime<Utc>) -> Self {
        self.last_issued = Some((token, issued_at));
        self
    }

    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self.last_issued {
            None => true,
            Some((_, issued_at)) => {
                let elapsed = now.signed_duration_since(issued_at);
                elapsed
                    .to_std()
                    .map(|e| e >= self.cooldown)
                    .unwrap_or(false)
            }
        }
    }

    /// Request a restock; returns a token only for the first request of a window
    pub fn request(&mut self, queue_size: usize, now: DateTime<Utc>) -> Option<RestockToken> {
        if !should_restock(queue_size, self.min_size, self.cooldown_elapsed(now)) {
            return None;
        }

        let token = RestockToken::for_window(now, self.cooldown);
        if matches!(self.last_issued, Some((last, _)) if last == token) {
            return None;
        }

        self.last_issued = Some((token, now));
        Some(token)
    }

    pub fn last_issued(&self) -> Option<RestockToken> {
        self.last_issued.map(|(token, _)| token)
    }
}
