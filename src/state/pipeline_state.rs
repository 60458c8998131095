use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::TerminalState;

/// Pipeline state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineState {
    Start,
    /// Tree fingerprint computed
    Fingerprinted,
    /// A published version carries the fingerprint
    CacheHit,
    /// No published version carries the fingerprint
    CacheMiss,
    /// Artifact built
    Built,
    /// Artifact uploaded and registered
    Published,
    /// Attaching the version to consumers
    Linking,
    /// All consumers linked
    Linked,
    Failed,
}

impl TerminalState for PipelineState {
    fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Linked | PipelineState::Failed)
    }
}

impl PipelineState {
    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: PipelineState) -> bool {
        use PipelineState::*;
        match (self, target) {
            (Start, Fingerprinted) => true,
            (Fingerprinted, CacheHit) | (Fingerprinted, CacheMiss) => true,
            (CacheMiss, Built) => true,
            (Built, Published) => true,
            (CacheHit, Linking) | (Published, Linking) => true,
            (Linking, Linked) => true,

            (from, Failed) => !from.is_terminal(),

            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Start => "START",
            PipelineState::Fingerprinted => "FINGERPRINTED",
            PipelineState::CacheHit => "CACHE_HIT",
            PipelineState::CacheMiss => "CACHE_MISS",
            PipelineState::Built => "BUILT",
            PipelineState::Published => "PUBLISHED",
            PipelineState::Linking => "LINKING",
            PipelineState::Linked => "LINKED",
            PipelineState::Failed => "FAILED",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline component a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Fingerprinter,
    ArtifactBuilder,
    VersionRegistry,
    Publisher,
    Linker,
    Pipeline,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Fingerprinter => "fingerprinter",
            Component::ArtifactBuilder => "artifact_builder",
            Component::VersionRegistry => "version_registry",
            Component::Publisher => "publisher",
            Component::Linker => "linker",
            Component::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors for pipeline state operations
#[derive(Debug, thiserror::Error)]
pub enum PipelineStateError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
}

/// A recorded state change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
}

/// Current state of one pipeline invocation plus its history
#[derive(Debug, Clone)]
pub struct StateTracker {
    state: PipelineState,
    history: Vec<Transition>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    /// Create a tracker in START
    pub fn new() -> Self {
        Self {
            state: PipelineState::Start,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// States visited so far, START included
    pub fn visited(&self) -> Vec<PipelineState> {
        std::iter::once(PipelineState::Start)
            .chain(self.history.iter().map(|t| t.to))
            .collect()
    }

    /// Transition to a new state
    pub fn transition(&mut self, to: PipelineState) -> Result<(), PipelineStateError> {
        if !self.state.can_transition_to(to) {
            return Err(PipelineStateError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        info!(from = %self.state, to = %to, "pipeline state");
        self.history.push(Transition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
        Ok(())
    }

    /// Move to FAILED, returning the last state reached before it
    pub fn fail(&mut self) -> PipelineState {
        let last = self.state;
        // A terminal tracker keeps its recorded outcome
        let _ = self.transition(PipelineState::Failed);
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_miss_path() {
        let mut tracker = StateTracker::new();
        for state in [
            PipelineState::Fingerprinted,
            PipelineState::CacheMiss,
            PipelineState::Built,
            PipelineState::Published,
            PipelineState::Linking,
            PipelineState::Linked,
        ] {
            tracker.transition(state).unwrap();
        }
        assert_eq!(tracker.state(), PipelineState::Linked);
        assert!(tracker.state().is_terminal());
        assert_eq!(tracker.history().len(), 6);
        assert_eq!(tracker.visited()[0], PipelineState::Start);
    }

    #[test]
    fn test_cache_hit_path() {
        let mut tracker = StateTracker::new();
        tracker.transition(PipelineState::Fingerprinted).unwrap();
        tracker.transition(PipelineState::CacheHit).unwrap();
        tracker.transition(PipelineState::Linking).unwrap();
        tracker.transition(PipelineState::Linked).unwrap();
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!PipelineState::Start.can_transition_to(PipelineState::Built));
        assert!(!PipelineState::CacheHit.can_transition_to(PipelineState::Built));
        assert!(!PipelineState::Fingerprinted.can_transition_to(PipelineState::Published));
        assert!(!PipelineState::Linked.can_transition_to(PipelineState::Failed));
        assert!(!PipelineState::Failed.can_transition_to(PipelineState::Start));

        let mut tracker = StateTracker::new();
        match tracker.transition(PipelineState::Linked).unwrap_err() {
            PipelineStateError::InvalidTransition { from, to } => {
                assert_eq!(from, PipelineState::Start);
                assert_eq!(to, PipelineState::Linked);
            }
        }
    }

    #[test]
    fn test_fail_from_any_non_terminal() {
        for state in [
            PipelineState::Start,
            PipelineState::Fingerprinted,
            PipelineState::CacheHit,
            PipelineState::CacheMiss,
            PipelineState::Built,
            PipelineState::Published,
            PipelineState::Linking,
        ] {
            assert!(state.can_transition_to(PipelineState::Failed), "{}", state);
        }

        let mut tracker = StateTracker::new();
        tracker.transition(PipelineState::Fingerprinted).unwrap();
        assert_eq!(tracker.fail(), PipelineState::Fingerprinted);
        assert_eq!(tracker.state(), PipelineState::Failed);
    }

    #[test]
    fn test_serialization() {
        assert_eq!(
            serde_json::to_string(&PipelineState::CacheHit).unwrap(),
            "\"CACHE_HIT\""
        );
        assert_eq!(
            serde_json::to_string(&Component::ArtifactBuilder).unwrap(),
            "\"artifact_builder\""
        );
    }
}
