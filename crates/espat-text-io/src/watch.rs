//! Raw-window token watching.
//!
//! Some AT exchanges are not line-correlated: joining an access point emits
//! an `OK` for the command itself and then, seconds later, `WIFI CONNECTED`
//! or `FAIL`; a data upload ends in `SEND OK` or `ERROR`. [`TokenWatch`]
//! accumulates raw text (terminators included) and looks for any of a few
//! tokens anywhere in that window.
//!
//! Success and failure tokens are checked before reset tokens. A reset token
//! clears the window so that it cannot be confused with later output. When
//! no token is present the window is cut back to a short suffix once it
//! passes its bound.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use espat_core::error::Result;
use espat_core::transport::Transport;

/// Default window bound before truncation.
pub const DEFAULT_WINDOW_LIMIT: usize = 30;

/// Default suffix kept after truncation.
pub const DEFAULT_WINDOW_KEEP: usize = 15;

/// How a token watch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchOutcome {
    /// A success token was seen.
    Succeeded(String),
    /// A failure token was seen.
    Failed(String),
    /// Neither appeared before the deadline.
    TimedOut,
}

impl WatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WatchOutcome::Succeeded(_))
    }
}

/// A set of tokens to look for in the raw receive window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenWatch {
    pub success: Vec<String>,
    pub failure: Vec<String>,
    pub reset: Vec<String>,
    pub window_limit: usize,
    pub window_keep: usize,
}

impl TokenWatch {
    /// Watch for a single success token.
    pub fn new(success: impl Into<String>) -> Self {
        TokenWatch {
            success: vec![success.into()],
            failure: Vec::new(),
            reset: Vec::new(),
            window_limit: DEFAULT_WINDOW_LIMIT,
            window_keep: DEFAULT_WINDOW_KEEP,
        }
    }

    /// Add a token that ends the watch unsuccessfully.
    pub fn fail_on(mut self, token: impl Into<String>) -> Self {
        self.failure.push(token.into());
        self
    }

    /// Add a token that clears the window without ending the watch.
    pub fn reset_on(mut self, token: impl Into<String>) -> Self {
        self.reset.push(token.into());
        self
    }

    /// Override the truncation policy.
    pub fn window(mut self, limit: usize, keep: usize) -> Self {
        self.window_limit = limit;
        self.window_keep = keep.min(limit);
        self
    }

    /// Examine the window once, clearing or truncating it as needed.
    ///
    /// Returns `Some` when the watch is decided.
    pub fn scan(&self, window: &mut String) -> Option<WatchOutcome> {
        if let Some(token) = self.success.iter().find(|t| window.contains(t.as_str())) {
            window.clear();
            return Some(WatchOutcome::Succeeded(token.clone()));
        }
        if let Some(token) = self.failure.iter().find(|t| window.contains(t.as_str())) {
            window.clear();
            return Some(WatchOutcome::Failed(token.clone()));
        }
        if self.reset.iter().any(|t| window.contains(t.as_str())) {
            trace!(window = %window.trim_end(), "reset token seen, clearing window");
            window.clear();
        } else if window.len() > self.window_limit {
            let mut cut = window.len() - self.window_keep;
            while !window.is_char_boundary(cut) {
                cut += 1;
            }
            window.drain(..cut);
        }
        None
    }

    /// Read from `transport` until a success or failure token appears or
    /// `timeout` elapses, pausing `poll_interval` between empty reads.
    pub async fn run(
        &self,
        transport: &mut dyn Transport,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<WatchOutcome> {
        let start = Instant::now();
        let mut window = String::new();
        let mut chunk = [0u8; 256];

        loop {
            if start.elapsed() > timeout {
                debug!(
                    success = ?self.success,
                    timeout_ms = timeout.as_millis() as u64,
                    "token watch timed out"
                );
                return Ok(WatchOutcome::TimedOut);
            }

            let n = transport.read_available(&mut chunk).await?;
            if n == 0 {
                tokio::time::sleep(poll_interval).await;
                continue;
            }

            window.push_str(&String::from_utf8_lossy(&chunk[..n]));
            if let Some(outcome) = self.scan(&mut window) {
                debug!(?outcome, "token watch decided");
                return Ok(outcome);
            }
        }
    }
}
