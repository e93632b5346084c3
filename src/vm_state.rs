//! Shared vocabulary for instance lifecycle state.
//!
//! `InstanceState` is reconstructed from libvirt on every invocation; the
//! hypervisor is the only store of record.

use std::fmt;

use crate::backend::DomainStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// No domain of that name exists.
    Undefined,
    /// Defined from a template, never started.
    Defined,
    Running,
    /// Shut off after having run.
    Stopped,
    /// Torn down: domain undefined and root volume gone. Terminal.
    Destroyed,
}

impl InstanceState {
    pub fn from_status(status: Option<DomainStatus>) -> Self {
        match status {
            None => InstanceState::Undefined,
            Some(DomainStatus::Defined) => InstanceState::Defined,
            Some(DomainStatus::Running) => InstanceState::Running,
            Some(DomainStatus::Stopped) => InstanceState::Stopped,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, InstanceState::Destroyed)
    }

    /// Transitions the lifecycle controller will perform.
    ///
    /// `Running → Running` is the tolerated repeat start. Destroying a
    /// running instance goes through `Stopped` first.
    pub fn can_transition(self, to: InstanceState) -> bool {
        use InstanceState::*;
        matches!(
            (self, to),
            (Undefined, Defined)
                | (Defined, Running)
                | (Stopped, Running)
                | (Running, Running)
                | (Running, Stopped)
                | (Defined, Destroyed)
                | (Stopped, Destroyed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Undefined => "not defined",
            InstanceState::Defined => "defined",
            InstanceState::Running => "running",
            InstanceState::Stopped => "stopped",
            InstanceState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
