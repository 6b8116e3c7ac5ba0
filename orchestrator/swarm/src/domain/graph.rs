// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Graphs
//!
//! A [`TaskGraphSpec`] is the planner's view of a piece of work: tasks keyed
//! by title, with dependencies expressed as predecessor titles. Building the
//! graph resolves titles to [`TaskId`]s and rejects graphs that could never
//! finish (unknown predecessors, duplicate titles, cycles).

use crate::domain::task::{SpecTask, TaskId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use switchyard_core::domain::agent::ProjectId;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agent_hint: Option<String>,
    /// Titles of tasks that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub requires_collaboration: bool,
    #[serde(default)]
    pub reviewer: Option<String>,
}

impl TaskSpec {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            agent_hint: None,
            depends_on: Vec::new(),
            max_retries: None,
            requires_collaboration: false,
            reviewer: None,
        }
    }

    pub fn depends_on<I, S>(mut self, titles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(titles.into_iter().map(Into::into));
        self
    }

    pub fn with_hint(mut self, agent: impl Into<String>) -> Self {
        self.agent_hint = Some(agent.into());
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraphSpec {
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Error, PartialEq)]
pub enum TaskGraphError {
    #[error("Task graph is empty")]
    Empty,

    #[error("Duplicate task title: {0}")]
    DuplicateTitle(String),

    #[error("Task '{task}' depends on unknown task '{predecessor}'")]
    UnknownPredecessor { task: String, predecessor: String },

    #[error("Task graph contains a cycle through: {}", .0.join(", "))]
    Cycle(Vec<String>),
}

impl TaskGraphSpec {
    pub fn new(tasks: Vec<TaskSpec>) -> Self {
        Self { tasks }
    }

    /// Resolve titles and materialize pending tasks in declaration order.
    pub fn build(&self, project: ProjectId, default_max_retries: u32) -> Result<Vec<SpecTask>, TaskGraphError> {
        if self.tasks.is_empty() {
            return Err(TaskGraphError::Empty);
        }

        let mut ids: HashMap<&str, TaskId> = HashMap::new();
        for spec in &self.tasks {
            if ids.insert(spec.title.as_str(), TaskId::new()).is_some() {
                return Err(TaskGraphError::DuplicateTitle(spec.title.clone()));
            }
        }

        let mut tasks = Vec::with_capacity(self.tasks.len());
        for spec in &self.tasks {
            let mut predecessors = Vec::with_capacity(spec.depends_on.len());
            for title in &spec.depends_on {
                let id = ids.get(title.as_str()).ok_or_else(|| TaskGraphError::UnknownPredecessor {
                    task: spec.title.clone(),
                    predecessor: title.clone(),
                })?;
                predecessors.push(*id);
            }

            let mut task = SpecTask::new(
                project,
                &spec.title,
                &spec.description,
                spec.max_retries.unwrap_or(default_max_retries),
            )
            .blocked_by(predecessors);
            task.id = ids[spec.title.as_str()];
            task.agent_hint = spec.agent_hint.clone();
            if spec.requires_collaboration {
                task = task.collaborative(spec.reviewer.clone());
            }
            tasks.push(task);
        }

        check_acyclic(&tasks).map_err(|stuck| {
            TaskGraphError::Cycle(
                tasks
                    .iter()
                    .filter(|t| stuck.contains(&t.id))
                    .map(|t| t.title.clone())
                    .collect(),
            )
        })?;
        Ok(tasks)
    }
}

/// Kahn's algorithm. On failure returns the tasks that never reached
/// in-degree zero, i.e. those on or behind a cycle. Edges to tasks outside
/// the slice are ignored.
pub fn check_acyclic(tasks: &[SpecTask]) -> Result<(), HashSet<TaskId>> {
    let known: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
    let mut in_degree: HashMap<TaskId, usize> = HashMap::new();
    let mut successors: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for task in tasks {
        let degree = in_degree.entry(task.id).or_default();
        for predecessor in task.blocked_by.iter().filter(|p| known.contains(p)) {
            *degree += 1;
            successors.entry(*predecessor).or_default().push(task.id);
        }
    }

    let mut queue: VecDeque<TaskId> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut visited = 0;
    while let Some(id) = queue.pop_front() {
        visited += 1;
        for next in successors.get(&id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if visited == tasks.len() {
        Ok(())
    } else {
        Err(in_degree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(id, _)| id)
            .collect())
    }
}

/// Every task that depends on `root`, directly or transitively.
pub fn dependents_of(root: TaskId, tasks: &[SpecTask]) -> Vec<TaskId> {
    let mut found = Vec::new();
    let mut seen = HashSet::from([root]);
    let mut frontier = vec![root];
    while let Some(current) = frontier.pop() {
        for task in tasks.iter().filter(|t| t.blocked_by.contains(&current)) {
            if seen.insert(task.id) {
                found.push(task.id);
                frontier.push(task.id);
            }
        }
    }
    found
}
