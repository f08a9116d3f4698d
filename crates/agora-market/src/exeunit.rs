//! Exe-unit simulator
//!
//! Runs exec scripts on spawned tasks, one command every `command_delay`,
//! and lets requestors wait for a batch's results. Destroying an activity
//! stops its batches: commands not yet run are dropped and the batch does not
//! count towards the invoice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::sync::Notify;
use tracing::{debug, info};

use agora_types::{
    ActivityId, AgreementId, BatchId, CommandResult, ExeCommand, ExeResult, ExeScript,
    MarketError, Result,
};

struct Batch {
    activity_id: ActivityId,
    results: Vec<ExeResult>,
    notify: Arc<Notify>,
}

pub struct ExeUnitSimulator {
    command_delay: Duration,
    batches: Arc<DashMap<BatchId, Batch>>,
    completed: Arc<DashMap<AgreementId, u64>>,
    stopped: Arc<DashSet<ActivityId>>,
}

impl ExeUnitSimulator {
    pub fn new(command_delay: Duration) -> Self {
        Self {
            command_delay,
            batches: Arc::new(DashMap::new()),
            completed: Arc::new(DashMap::new()),
            stopped: Arc::new(DashSet::new()),
        }
    }

    /// Start executing `script`; results arrive asynchronously
    pub fn exec(
        &self,
        activity_id: ActivityId,
        agreement_id: AgreementId,
        script: ExeScript,
    ) -> BatchId {
        let batch_id = BatchId::new();
        let notify = Arc::new(Notify::new());
        self.batches.insert(
            batch_id,
            Batch {
                activity_id,
                results: Vec::with_capacity(script.len()),
                notify: notify.clone(),
            },
        );

        let batches = self.batches.clone();
        let completed = self.completed.clone();
        let stopped = self.stopped.clone();
        let delay = self.command_delay;
        let total = script.len();

        info!(
            batch_id = %batch_id,
            activity_id = %activity_id,
            commands = total,
            "Exec batch started"
        );

        tokio::spawn(async move {
            for (index, command) in script.into_iter().enumerate() {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if stopped.contains(&activity_id) {
                    debug!(batch_id = %batch_id, executed = index, "Exec batch stopped");
                    notify.notify_waiters();
                    return;
                }
                let is_batch_finished = index + 1 == total;
                if is_batch_finished {
                    *completed.entry(agreement_id).or_insert(0) += 1;
                }
                let result = ExeResult {
                    batch_id,
                    index,
                    result: CommandResult::Ok,
                    stdout: stdout_for(&command),
                    is_batch_finished,
                    event_date: Utc::now(),
                };
                if let Some(mut batch) = batches.get_mut(&batch_id) {
                    batch.results.push(result);
                }
                notify.notify_waiters();
            }
            if total == 0 && !stopped.contains(&activity_id) {
                *completed.entry(agreement_id).or_insert(0) += 1;
            }
            debug!(batch_id = %batch_id, "Exec batch finished");
        });

        batch_id
    }

    /// Wait until `expected` results of the batch are available
    pub async fn collect_results(
        &self,
        activity_id: &ActivityId,
        batch_id: &BatchId,
        expected: usize,
        timeout: Duration,
    ) -> Result<Vec<ExeResult>> {
        let notify = {
            let batch = self.batches.get(batch_id).ok_or_else(|| MarketError::BatchNotFound {
                batch_id: batch_id.to_string(),
            })?;
            if batch.activity_id != *activity_id {
                return Err(MarketError::protocol(batch_id, "batch belongs to another activity"));
            }
            batch.notify.clone()
        };

        tokio::time::timeout(timeout, async {
            loop {
                let progressed = notify.notified();
                tokio::pin!(progressed);
                progressed.as_mut().enable();

                if let Some(batch) = self.batches.get(batch_id) {
                    if batch.results.len() >= expected {
                        return Ok(batch.results.clone());
                    }
                }
                if self.stopped.contains(activity_id) {
                    return Err(MarketError::protocol(
                        activity_id,
                        "activity destroyed before batch finished",
                    ));
                }
                progressed.await;
            }
        })
        .await
        .map_err(|_| MarketError::timeout(format!("collect_results {}", batch_id), timeout))?
    }

    /// Stop every batch of a destroyed activity
    pub fn stop(&self, activity_id: &ActivityId) {
        if self.stopped.insert(*activity_id) {
            let waiting: Vec<Arc<Notify>> = self
                .batches
                .iter()
                .filter(|b| b.activity_id == *activity_id)
                .map(|b| b.notify.clone())
                .collect();
            for notify in waiting {
                notify.notify_waiters();
            }
        }
    }

    /// Batches that ran to completion under the agreement
    pub fn completed_batches(&self, agreement_id: &AgreementId) -> u64 {
        self.completed.get(agreement_id).map(|c| *c).unwrap_or(0)
    }
}

fn stdout_for(command: &ExeCommand) -> Option<String> {
    match command {
        ExeCommand::Run { entry_point, args } if args.is_empty() => Some(entry_point.clone()),
        ExeCommand::Run { entry_point, args } => {
            Some(format!("{} {}", entry_point, args.join(" ")))
        }
        _ => None,
    }
}
