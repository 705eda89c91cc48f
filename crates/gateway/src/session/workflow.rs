// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Workflow status machine and awaiting-input bookkeeping.
//!
//! Workflow status is orthogonal to lifecycle status: it tracks what the
//! agent is doing (working, waiting on a human, blocked, under review),
//! not whether the process is alive.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Workflow status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Started,
    Working,
    AwaitingInput,
    Blocked,
    AwaitingReview,
    Completed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Working => "working",
            Self::AwaitingInput => "awaiting_input",
            Self::Blocked => "blocked",
            Self::AwaitingReview => "awaiting_review",
            Self::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether `self → next` is an allowed workflow transition.
    pub fn can_transition(&self, next: WorkflowStatus) -> bool {
        matches!(
            (self, next),
            (Self::Started, Self::Working)
                | (Self::Working, Self::AwaitingInput)
                | (Self::Working, Self::Blocked)
                | (Self::Working, Self::AwaitingReview)
                | (Self::Working, Self::Completed)
                | (Self::AwaitingInput, Self::Working)
                | (Self::Blocked, Self::Working)
                | (Self::AwaitingReview, Self::Working)
                | (Self::AwaitingReview, Self::Completed)
        )
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pending question recorded while a session sits in `awaiting_input`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwaitingInput {
    pub question: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    pub default_action: String,
    pub expires_at: DateTime<Utc>,
}

/// How an `awaiting_input` state was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputResolution {
    /// A human answered before the expiry.
    Human { value: String },
    /// The expiry fired and the default action was taken.
    Timeout { value: String },
}

impl InputResolution {
    pub fn value(&self) -> &str {
        match self {
            Self::Human { value } | Self::Timeout { value } => value,
        }
    }
}

#[cfg(test)]
#[path = "workflow_tests.rs"]
mod tests;
