use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Where an analysis is in its life, from waiting on dependencies to archived results
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    /// Blocked on other analyses
    Wait,
    /// Ready to be submitted
    Ready,
    Running,
    /// Pipeline has confirmed completion, post-processing not yet started
    Finished,
    Processing,
    /// Results archived
    Uploaded,
    /// Held, failed or vanished without completing; needs remediation
    Stuck,
    Stopped,
    Cancelled,
    /// Skipped by the monitor until a human clears it
    Manual,
}

impl LifecycleState {
    pub const ALL: [LifecycleState; 10] = [
        LifecycleState::Wait,
        LifecycleState::Ready,
        LifecycleState::Running,
        LifecycleState::Finished,
        LifecycleState::Processing,
        LifecycleState::Uploaded,
        LifecycleState::Stuck,
        LifecycleState::Stopped,
        LifecycleState::Cancelled,
        LifecycleState::Manual,
    ];

    /// No transition leaves this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Uploaded | LifecycleState::Cancelled)
    }

    /// Dependents waiting on an analysis in this state may proceed
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, LifecycleState::Finished | LifecycleState::Processing | LifecycleState::Uploaded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Wait => "wait",
            LifecycleState::Ready => "ready",
            LifecycleState::Running => "running",
            LifecycleState::Finished => "finished",
            LifecycleState::Processing => "processing",
            LifecycleState::Uploaded => "uploaded",
            LifecycleState::Stuck => "stuck",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Cancelled => "cancelled",
            LifecycleState::Manual => "manual",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        LifecycleState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("Unknown lifecycle state: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for state in LifecycleState::ALL {
            assert_eq!(state.to_string().parse::<LifecycleState>().unwrap(), state);
        }
        assert_eq!(" Running ".parse::<LifecycleState>().unwrap(), LifecycleState::Running);
        assert!("lost".parse::<LifecycleState>().is_err());
    }

    #[test]
    fn only_uploaded_and_cancelled_are_terminal() {
        let terminal: Vec<_> = LifecycleState::ALL.into_iter().filter(LifecycleState::is_terminal).collect();
        assert_eq!(terminal, vec![LifecycleState::Uploaded, LifecycleState::Cancelled]);
        assert!(!LifecycleState::Manual.is_terminal());
    }

    #[test]
    fn serialised_lowercase() {
        assert_eq!(serde_json::to_string(&LifecycleState::Stuck).unwrap(), "\"stuck\"");
    }
}
