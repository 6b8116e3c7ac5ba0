// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Discussion Coordinator
//
// Runs the proposal/review exchange for collaborative tasks. The primary
// agent proposes, the reviewer answers; an answer carrying an approval marker
// ends the discussion, anything else goes back to the primary for revision.
// When the round limit is reached without approval the discussion is
// escalated instead of proceeding.

use crate::domain::discussion::{Discussion, DiscussionError, EntryKind};
use crate::domain::repository::{DiscussionRepository, RepositoryError};
use crate::domain::task::SpecTask;
use chrono::Utc;
use std::sync::Arc;
use switchyard_core::application::executor::{AgentExecutor, ExecutionRequest, ExecutorError};
use switchyard_core::domain::agent::AgentDefinition;
use switchyard_core::domain::config::CoordinatorConfig;
use switchyard_core::domain::events::TaskEvent;
use switchyard_core::domain::run::RunStatus;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct ConsensusSettings {
    pub max_rounds: u32,
    pub approval_markers: Vec<String>,
    pub default_reviewer: Option<String>,
}

impl ConsensusSettings {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            max_rounds: config.consensus.max_rounds,
            approval_markers: config.consensus.approval_markers.clone(),
            default_reviewer: config.consensus.default_reviewer.clone(),
        }
    }
}

impl Default for ConsensusSettings {
    fn default() -> Self {
        Self::from_config(&CoordinatorConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    #[error("Participant '{agent}' ended {status}: {detail}")]
    Participant {
        agent: String,
        status: RunStatus,
        detail: String,
    },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Discussion(#[from] DiscussionError),
}

impl ConsensusError {
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            ConsensusError::Participant {
                status: RunStatus::Cancelled,
                ..
            }
        )
    }
}

pub struct DiscussionCoordinator {
    executor: Arc<AgentExecutor>,
    discussions: Arc<dyn DiscussionRepository>,
    settings: ConsensusSettings,
}

impl DiscussionCoordinator {
    pub fn new(
        executor: Arc<AgentExecutor>,
        discussions: Arc<dyn DiscussionRepository>,
        settings: ConsensusSettings,
    ) -> Self {
        Self {
            executor,
            discussions,
            settings,
        }
    }

    pub fn settings(&self) -> &ConsensusSettings {
        &self.settings
    }

    /// Run the exchange to a resolution. The returned discussion is either
    /// approved, with the accepted proposal as its resolution, or escalated.
    pub async fn deliberate(
        &self,
        task: &SpecTask,
        primary: &AgentDefinition,
        reviewer: &AgentDefinition,
        cancel: &CancellationToken,
    ) -> Result<Discussion, ConsensusError> {
        let mut discussion = Discussion::open(
            task.project_id,
            task.id,
            &task.title,
            vec![primary.name.clone(), reviewer.name.clone()],
        );
        info!(
            discussion_id = %discussion.id,
            task = %task.title,
            primary = %primary.name,
            reviewer = %reviewer.name,
            "Opening discussion"
        );

        let opening = format!(
            "{}\n\nPropose a plan for this task. A reviewer will check it before any work starts.",
            task.prompt()
        );
        let mut proposal = self.contribute(primary, opening, cancel).await?;
        discussion.add_entry(&primary.name, EntryKind::Proposal, &proposal, 0)?;
        self.discussions.save(&discussion).await?;

        let marker = self
            .settings
            .approval_markers
            .first()
            .map(String::as_str)
            .unwrap_or("APPROVED");

        for round in 1..=self.settings.max_rounds {
            let review_request = format!(
                "{}\n\nReview the latest proposal. Reply with {marker} if it is acceptable; \
                 otherwise explain what must change.",
                discussion.transcript()
            );
            let review = self.contribute(reviewer, review_request, cancel).await?;

            if approves(&review, &self.settings.approval_markers) {
                discussion.add_entry(&reviewer.name, EntryKind::Vote, &review, round)?;
                discussion.approve(proposal)?;
                self.discussions.save(&discussion).await?;
                info!(discussion_id = %discussion.id, round, "Discussion approved");
                return Ok(discussion);
            }

            discussion.add_entry(&reviewer.name, EntryKind::Argument, &review, round)?;
            self.discussions.save(&discussion).await?;

            if round < self.settings.max_rounds {
                let revision_request = format!(
                    "{}\n\nRevise your proposal to address the review.",
                    discussion.transcript()
                );
                proposal = self.contribute(primary, revision_request, cancel).await?;
                discussion.add_entry(&primary.name, EntryKind::Proposal, &proposal, round)?;
                self.discussions.save(&discussion).await?;
            }
        }

        let reason = format!("No approval after {} rounds", self.settings.max_rounds);
        discussion.escalate(&reason)?;
        self.discussions.save(&discussion).await?;
        warn!(discussion_id = %discussion.id, task = %task.title, "Discussion escalated");
        self.executor
            .event_bus()
            .publish_task_event(TaskEvent::DiscussionEscalated {
                discussion_id: discussion.id.0,
                task_id: task.id.0,
                reason,
                escalated_at: Utc::now(),
            });
        Ok(discussion)
    }

    /// One participant turn as a top-level run; its summary is the entry.
    async fn contribute(
        &self,
        agent: &AgentDefinition,
        input: String,
        cancel: &CancellationToken,
    ) -> Result<String, ConsensusError> {
        let run = self
            .executor
            .execute(ExecutionRequest::new(agent.clone(), input).with_cancellation(cancel.child_token()))
            .await?;
        match run.status {
            RunStatus::Completed | RunStatus::Paused => Ok(run.summary.unwrap_or_default()),
            status => Err(ConsensusError::Participant {
                agent: agent.name.clone(),
                status,
                detail: run.error.unwrap_or_default(),
            }),
        }
    }
}

/// Whether `reply` carries an approval marker that is not negated.
fn approves(reply: &str, markers: &[String]) -> bool {
    let reply = reply.to_lowercase();
    markers
        .iter()
        .map(|m| m.to_lowercase())
        .filter(|m| !m.is_empty())
        .any(|marker| {
            reply
                .match_indices(marker.as_str())
                .any(|(pos, _)| !reply[..pos].trim_end().ends_with("not"))
        })
}
