//! Crawl phase definitions
//!
//! A multi-phase crawl moves through these phases in a fixed order; the
//! current phase is persisted with the crawl checkpoint so a restarted
//! process continues in the phase it was interrupted in.

use crate::VodsweepError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the current phase of a crawl job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CrawlPhase {
    /// Site-wide streams configured under `[[stream]]`
    Discovery,

    /// One unit per entity, each expanding the `[entities]` stream templates
    Entities,

    /// Numeric ID-space scan configured under `[scan]`
    Scan,

    /// Nothing left to do
    Done,
}

impl CrawlPhase {
    /// Returns the phase that follows this one, if any
    ///
    /// | From | To |
    /// |------|----|
    /// | Discovery | Entities |
    /// | Entities | Done |
    /// | Scan | Done |
    /// | Done | - |
    pub fn successor(&self) -> Option<Self> {
        match self {
            Self::Discovery => Some(Self::Entities),
            Self::Entities => Some(Self::Done),
            Self::Scan => Some(Self::Done),
            Self::Done => None,
        }
    }

    /// Returns true if moving from this phase to `to` is allowed
    pub fn can_transition_to(&self, to: Self) -> bool {
        self.successor() == Some(to)
    }

    /// Checks and performs a transition
    pub fn transition(self, to: Self) -> Result<Self, VodsweepError> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(VodsweepError::InvalidTransition { from: self, to })
        }
    }

    /// Returns true once the job has finished every phase
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Entities => "entities",
            Self::Scan => "scan",
            Self::Done => "done",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "discovery" => Some(Self::Discovery),
            "entities" => Some(Self::Entities),
            "scan" => Some(Self::Scan),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    /// Returns all phases
    pub fn all_phases() -> Vec<Self> {
        vec![Self::Discovery, Self::Entities, Self::Scan, Self::Done]
    }
}

impl fmt::Display for CrawlPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
