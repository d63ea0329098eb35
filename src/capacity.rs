use serde::Serialize;
use uuid::Uuid;

use crate::models::Student;

pub const DEFAULT_ACTIVE_STUDENT_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DenialKind {
    CapacityExceeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Denial {
    pub kind: DenialKind,
    pub limit: usize,
}

impl Denial {
    pub fn capacity_exceeded(limit: usize) -> Self {
        Self {
            kind: DenialKind::CapacityExceeded,
            limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    Denied(Denial),
}

impl Decision {
    pub fn allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    pub fn into_result(self) -> Result<(), Denial> {
        match self {
            Decision::Allowed => Ok(()),
            Decision::Denied(denial) => Err(denial),
        }
    }
}

/// Decides whether a tutor may hold one more active student.
///
/// The decision is pure; stores call it while holding the lock (or row lock)
/// that guards the tutor's roster, so the count cannot move between the check
/// and the write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityPolicy {
    pub limit: usize,
}

impl Default for CapacityPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_ACTIVE_STUDENT_LIMIT,
        }
    }
}

impl CapacityPolicy {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// `candidate` is excluded from the count so re-activating an already
    /// active student never counts it twice.
    pub fn can_activate<'a, I>(&self, roster: I, candidate: Option<Uuid>) -> Decision
    where
        I: IntoIterator<Item = &'a Student>,
    {
        let active = roster
            .into_iter()
            .filter(|s| s.active && Some(s.id) != candidate)
            .count();
        self.decide(active)
    }

    /// Same rule for callers that already hold a count which excludes the candidate.
    pub fn decide(&self, active_excluding_candidate: usize) -> Decision {
        if active_excluding_candidate < self.limit {
            Decision::Allowed
        } else {
            Decision::Denied(Denial::capacity_exceeded(self.limit))
        }
    }

    /// Only transitions into the active state are limited.
    pub fn check_transition<'a, I>(&self, roster: I, candidate: Option<Uuid>, target_active: bool) -> Decision
    where
        I: IntoIterator<Item = &'a Student>,
    {
        if !target_active {
            return Decision::Allowed;
        }
        self.can_activate(roster, candidate)
    }
}
