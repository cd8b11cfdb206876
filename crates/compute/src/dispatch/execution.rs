use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use kiln_queue::{CommitRecord, Delivery};

use crate::executor::ExecuteError;

use super::Dispatcher;

impl Dispatcher {
    /// Run one queue entry to a terminal state and enqueue its commit.
    /// Interrupted tasks are not committed.
    pub(super) async fn handle(
        &mut self,
        delivery: Delivery,
        cancel: &CancellationToken,
    ) -> Result<(), ExecuteError> {
        let record = delivery.commit_record();

        match delivery {
            Delivery::Poison {
                topic,
                partition,
                offset,
                reason,
            } => {
                warn!(topic = %topic, partition, offset, reason = %reason, "skipping undecodable message");
                if let Ok(mut m) = self.metrics.write() {
                    m.record_poison(&topic);
                }
            }
            Delivery::Task(task) => {
                debug!(task_id = %task.task_id, topic = %task.topic, offset = task.broker_offset, "executing task");
                let started = Instant::now();
                let outcome = match self.executor.execute(&task, cancel).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        if let Ok(mut m) = self.metrics.write() {
                            m.interrupted += 1;
                        }
                        return Err(e);
                    }
                };
                if let Ok(mut m) = self.metrics.write() {
                    m.record_outcome(&task.topic, &outcome, started.elapsed());
                }
            }
        }

        self.commit(record);
        Ok(())
    }

    fn commit(&self, record: CommitRecord) {
        if let Err(e) = self.commits.send(record.clone()) {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset_to_commit,
                error = %e,
                "commit not enqueued, broker will redeliver"
            );
        }
    }

    /// Run passes until `cancel` fires. The in-flight task is finished (or
    /// abandoned if it was waiting on a retry), the resident base is unloaded
    /// and the commit sender is dropped so the poller can flush and exit.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!("dispatcher started");

        while !cancel.is_cancelled() {
            match self.run_pass(&cancel).await {
                Ok(0) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.settings.idle_sleep) => {}
                    }
                }
                Ok(_) => {}
                Err(ExecuteError::Interrupted(task_id)) => {
                    info!(task_id = %task_id, "in-flight task left for redelivery");
                    break;
                }
            }
        }

        self.executor.shutdown().await;
        let executed = self.metrics().total_executed();
        info!(executed, "dispatcher stopped");
    }
}
