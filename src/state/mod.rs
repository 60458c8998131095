//! Pipeline state machine
//!
//! START → FINGERPRINTED → {CACHE_HIT | CACHE_MISS → BUILT → PUBLISHED}
//! → LINKING → LINKED, with FAILED reachable from every non-terminal state.

mod pipeline_state;

pub use pipeline_state::{Component, PipelineState, PipelineStateError, StateTracker, Transition};

/// Check if a state is terminal (no further transitions possible)
pub trait TerminalState {
    fn is_terminal(&self) -> bool;
}
