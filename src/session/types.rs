//! Session record types (spec §3, §4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::Id;

/// How a process was launched, classified by the Session Registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Terminal,
    GuiWorkflow,
    EditorAgent,
    ManualScript,
    Unknown,
}

impl SessionType {
    /// Fixed priority table from spec §4.4: higher wins arbitration.
    pub fn priority(&self) -> u8 {
        match self {
            SessionType::GuiWorkflow => 10,
            SessionType::Terminal => 8,
            SessionType::EditorAgent => 6,
            SessionType::ManualScript => 4,
            SessionType::Unknown => 2,
        }
    }

    /// The conflicting set for this type (spec §4.4).
    pub fn conflicts_with(&self) -> &'static [SessionType] {
        use SessionType::*;
        match self {
            Terminal => &[GuiWorkflow, EditorAgent],
            GuiWorkflow => &[Terminal, EditorAgent],
            EditorAgent => &[Terminal, GuiWorkflow],
            ManualScript => &[],
            Unknown => &[],
        }
    }

    pub fn conflicts(&self, other: SessionType) -> bool {
        self.conflicts_with().contains(&other)
    }
}

/// A tracked session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Id,
    pub session_type: SessionType,
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hints: Vec<String>,
}

impl SessionRecord {
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// What a lower-priority session does when outranked during arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArbitrationOutcome {
    /// This session continues; it outranked (or tied) every conflicting peer.
    Continue,
    /// This session must pause, per the configured policy.
    Pause,
    /// This session must stop entirely, per the configured policy.
    Stop,
    /// The operator must be asked (headless test runs treat this as `Pause`).
    Ask,
}
