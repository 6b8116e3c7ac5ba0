// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Discussions
//!
//! A [`Discussion`] records the exchange between the agent assigned to a
//! collaborative task and its reviewer. It is open until the reviewer
//! approves a proposal or the round limit is reached, at which point it is
//! escalated to a human.

use crate::domain::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchyard_core::domain::agent::ProjectId;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscussionId(pub Uuid);

impl DiscussionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DiscussionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DiscussionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionStatus {
    Open,
    Approved,
    Escalated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Proposal,
    Argument,
    Vote,
}

impl EntryKind {
    fn label(&self) -> &'static str {
        match self {
            EntryKind::Proposal => "proposal",
            EntryKind::Argument => "review",
            EntryKind::Vote => "vote",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionEntry {
    pub author: String,
    pub kind: EntryKind,
    pub content: String,
    pub round: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum DiscussionError {
    #[error("Discussion {0} is already resolved")]
    Resolved(DiscussionId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discussion {
    pub id: DiscussionId,
    pub project_id: ProjectId,
    pub task_id: TaskId,
    pub topic: String,
    pub participants: Vec<String>,
    pub status: DiscussionStatus,
    pub entries: Vec<DiscussionEntry>,
    /// Approved proposal, or the escalation reason.
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Discussion {
    pub fn open(
        project_id: ProjectId,
        task_id: TaskId,
        topic: impl Into<String>,
        participants: Vec<String>,
    ) -> Self {
        Self {
            id: DiscussionId::new(),
            project_id,
            task_id,
            topic: topic.into(),
            participants,
            status: DiscussionStatus::Open,
            entries: Vec::new(),
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn add_entry(
        &mut self,
        author: impl Into<String>,
        kind: EntryKind,
        content: impl Into<String>,
        round: u32,
    ) -> Result<(), DiscussionError> {
        self.ensure_open()?;
        self.entries.push(DiscussionEntry {
            author: author.into(),
            kind,
            content: content.into(),
            round,
            created_at: Utc::now(),
        });
        Ok(())
    }

    pub fn is_approved(&self) -> bool {
        self.status == DiscussionStatus::Approved
    }

    pub fn latest_proposal(&self) -> Option<&DiscussionEntry> {
        self.entries.iter().rev().find(|e| e.kind == EntryKind::Proposal)
    }

    pub fn approve(&mut self, proposal: impl Into<String>) -> Result<(), DiscussionError> {
        self.resolve(DiscussionStatus::Approved, proposal.into())
    }

    pub fn escalate(&mut self, reason: impl Into<String>) -> Result<(), DiscussionError> {
        self.resolve(DiscussionStatus::Escalated, reason.into())
    }

    /// Plain-text rendering used as context for the next participant.
    pub fn transcript(&self) -> String {
        let mut out = format!("Discussion: {}\n", self.topic);
        for entry in &self.entries {
            out.push_str(&format!(
                "\n[round {}] {} ({}):\n{}\n",
                entry.round,
                entry.author,
                entry.kind.label(),
                entry.content
            ));
        }
        out
    }

    fn resolve(&mut self, status: DiscussionStatus, resolution: String) -> Result<(), DiscussionError> {
        self.ensure_open()?;
        self.status = status;
        self.resolution = Some(resolution);
        self.resolved_at = Some(Utc::now());
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DiscussionError> {
        if self.status == DiscussionStatus::Open {
            Ok(())
        } else {
            Err(DiscussionError::Resolved(self.id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discussion() -> Discussion {
        Discussion::open(
            ProjectId::new(),
            TaskId::new(),
            "schema migration",
            vec!["coder".into(), "reviewer".into()],
        )
    }

    #[test]
    fn test_resolved_discussion_is_frozen() {
        let mut d = discussion();
        d.add_entry("coder", EntryKind::Proposal, "plan A", 0).unwrap();
        d.approve("plan A").unwrap();
        assert_eq!(d.status, DiscussionStatus::Approved);
        assert!(d.resolved_at.is_some());

        assert_eq!(
            d.add_entry("reviewer", EntryKind::Argument, "late", 1),
            Err(DiscussionError::Resolved(d.id))
        );
        assert!(d.escalate("too late").is_err());
    }

    #[test]
    fn test_latest_proposal_and_transcript() {
        let mut d = discussion();
        d.add_entry("coder", EntryKind::Proposal, "plan A", 0).unwrap();
        d.add_entry("reviewer", EntryKind::Argument, "needs tests", 1).unwrap();
        d.add_entry("coder", EntryKind::Proposal, "plan B", 1).unwrap();

        assert_eq!(d.latest_proposal().map(|e| e.content.as_str()), Some("plan B"));
        let transcript = d.transcript();
        assert!(transcript.contains("reviewer (review):\nneeds tests"));
        assert!(transcript.find("plan A") < transcript.find("plan B"));
    }
}
