//! Policy lifecycle state machine

use std::fmt;

use crate::models::Phase;

/// What started a reconciliation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    /// Task start after (re)gaining leadership
    Resync,
    Created,
    SpecChanged,
    Timer,
    Deleted,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Resync => "resync",
            Trigger::Created => "created",
            Trigger::SpecChanged => "spec_changed",
            Trigger::Timer => "timer",
            Trigger::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the controller may move a policy from `from` to `to`
pub fn can_transition(from: Phase, to: Phase) -> bool {
    use Phase::*;
    match (from, to) {
        (Pending, Analyzing) => true,
        // No candidate or no data: back to waiting. A still-effective apply stays Applied.
        (Analyzing, Ready | Pending | Applied) => true,
        (Ready, Analyzing | Applying) => true,
        (Applying, Applied | Failed) => true,
        (Applied, Analyzing | Failed) => true,
        (Failed, Analyzing) => true,
        (RolledBack, Analyzing) => true,
        // Deletion and failure rollbacks; an in-flight apply always settles first
        (Pending | Analyzing | Ready | Applied | Failed, RolledBack) => true,
        // A restarted controller resumes an interrupted cycle
        (Analyzing, Analyzing) => true,
        _ => false,
    }
}

/// Phase a policy is moved to when an analysis starts
pub fn analysis_entry(from: Phase) -> Option<Phase> {
    can_transition(from, Phase::Analyzing).then_some(Phase::Analyzing)
}
