//! Activity and exec-script types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::{ActivityId, AgreementId, BatchId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivityState {
    Created,
    Destroyed,
}

/// Execution context created against an approved agreement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub id: ActivityId,
    pub agreement_id: AgreementId,
    pub state: ActivityState,
    pub created_at: DateTime<Utc>,
    pub destroyed_at: Option<DateTime<Utc>>,
}

/// One command of an exec script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExeCommand {
    Deploy {},
    Start {},
    Run { entry_point: String, args: Vec<String> },
    Transfer { from: String, to: String },
}

impl ExeCommand {
    pub fn run(entry_point: impl Into<String>, args: &[&str]) -> Self {
        Self::Run {
            entry_point: entry_point.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// Ordered list of commands sent in one exec call
pub type ExeScript = Vec<ExeCommand>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    Ok,
    Error,
}

/// Outcome of a single command inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExeResult {
    pub batch_id: BatchId,
    pub index: usize,
    pub result: CommandResult,
    pub stdout: Option<String>,
    pub is_batch_finished: bool,
    pub event_date: DateTime<Utc>,
}
