//! Stylesheet completion by polling
//!
//! Stylesheets have no reliable completion signal, so their parsed rules are
//! probed at a fixed interval. Both a successful read and a security refusal
//! count as loaded.

use crate::error::FetchError;
use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;

/// What a single probe observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetState {
    /// Not available yet
    Pending,
    /// Rules are readable
    Parsed {
        /// Number of top-level rules
        rules: usize,
    },
    /// Rules exist but may not be read (cross-origin or permission refusal)
    SecurityRestricted,
}

impl SheetState {
    /// Whether the sheet is considered loaded
    pub fn is_loaded(&self) -> bool {
        !matches!(self, SheetState::Pending)
    }
}

/// Reads the current state of one stylesheet
#[async_trait]
pub trait SheetProbe: Send {
    /// Inspect the sheet once
    async fn probe(&mut self) -> Result<SheetState, FetchError>;
}

/// Probe every `interval` until the sheet is loaded or the probe fails
pub async fn poll_until_loaded<P: SheetProbe + ?Sized>(
    probe: &mut P,
    interval: Duration,
) -> Result<SheetState, FetchError> {
    let mut ticker = tokio::time::interval(interval);
    let mut attempts = 0usize;
    loop {
        ticker.tick().await;
        attempts += 1;
        let state = probe.probe().await?;
        if state.is_loaded() {
            trace!("Stylesheet loaded after {} probe(s): {:?}", attempts, state);
            return Ok(state);
        }
    }
}

/// Count top-level rule blocks, skipping comments
pub fn count_rules(css: &str) -> usize {
    let mut depth = 0usize;
    let mut rules = 0usize;
    let mut chars = css.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = ' ';
                for c in chars.by_ref() {
                    if previous == '*' && c == '/' {
                        break;
                    }
                    previous = c;
                }
            }
            '{' => depth += 1,
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    rules += 1;
                }
            }
            _ => {}
        }
    }
    rules
}
