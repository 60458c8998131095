//! Interrupt handling
//!
//! The first SIGINT/SIGTERM trips the cancel token: the pipeline stops at
//! its next checkpoint or backoff sleep and reports CANCELLED. A second
//! signal exits immediately.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::error::ErrorKind;
use crate::retry::CancelToken;

/// What to do for a received signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Trip the cancel token and let the pipeline wind down
    InitiateCancellation,
    /// Exit now
    ImmediateExit,
}

/// Maps received signals onto a cancel token
#[derive(Debug, Clone)]
pub struct SignalHandler {
    token: CancelToken,
    signal_count: Arc<AtomicU8>,
}

impl SignalHandler {
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            signal_count: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Number of signals received
    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Handle a signal (SIGINT/SIGTERM)
    pub fn handle_signal(&self) -> SignalAction {
        let previous = self.signal_count.fetch_add(1, Ordering::SeqCst);
        if previous == 0 {
            self.token.cancel();
            SignalAction::InitiateCancellation
        } else {
            SignalAction::ImmediateExit
        }
    }

    /// Install the process handler
    ///
    /// Must be called at most once per process.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let handler = self.clone();
        ctrlc::set_handler(move || match handler.handle_signal() {
            SignalAction::InitiateCancellation => {
                eprintln!("\nReceived interrupt signal, cancelling...");
            }
            SignalAction::ImmediateExit => {
                eprintln!("\nReceived second interrupt, exiting immediately...");
                std::process::exit(ErrorKind::Cancelled.exit_code());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_signal_cancels() {
        let token = CancelToken::new();
        let handler = SignalHandler::new(token.clone());

        assert!(!token.is_cancelled());
        assert_eq!(handler.handle_signal(), SignalAction::InitiateCancellation);
        assert!(token.is_cancelled());
        assert_eq!(handler.signal_count(), 1);
    }

    #[test]
    fn test_second_signal_exits() {
        let handler = SignalHandler::new(CancelToken::new());
        handler.handle_signal();
        assert_eq!(handler.handle_signal(), SignalAction::ImmediateExit);
        assert_eq!(handler.clone().handle_signal(), SignalAction::ImmediateExit);
        assert_eq!(handler.signal_count(), 3);
    }
}
