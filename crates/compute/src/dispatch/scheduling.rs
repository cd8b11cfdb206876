use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::ExecuteError;

use super::Dispatcher;

impl Dispatcher {
    /// One dispatch iteration: drain priority topics, then serve one batch
    /// from the next non-empty normal topic. Returns the number of queue
    /// entries handled; zero means every queue was empty.
    pub async fn run_pass(&mut self, cancel: &CancellationToken) -> Result<usize, ExecuteError> {
        let mut handled = self.drain_priority(cancel).await?;

        let topics = self.settings.normal_topics.len();
        for _ in 0..topics {
            if cancel.is_cancelled() {
                break;
            }
            let topic = self.settings.normal_topics[self.rr_index].clone();
            let (taken, preempted) = self.run_batch(&topic, cancel).await?;
            self.rr_index = (self.rr_index + 1) % topics;
            handled += taken + preempted;
            if taken > 0 {
                break;
            }
        }

        Ok(handled)
    }

    /// Handle priority entries until every priority queue is empty. After
    /// each one the scan restarts from the first priority topic.
    pub(super) async fn drain_priority(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<usize, ExecuteError> {
        let mut handled = 0;
        while !cancel.is_cancelled() {
            let Some(delivery) = self.pop_priority() else {
                break;
            };
            self.handle(delivery, cancel).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Oldest entry of the first non-empty priority topic.
    fn pop_priority(&mut self) -> Option<kiln_queue::Delivery> {
        let Self {
            queues, settings, ..
        } = self;
        settings
            .priority_topics
            .iter()
            .find_map(|topic| queues.try_pop(topic))
    }

    /// Up to `batch_cap` entries from one normal topic, draining priority
    /// topics before every pop. Returns `(normal, priority)` counts.
    async fn run_batch(
        &mut self,
        topic: &str,
        cancel: &CancellationToken,
    ) -> Result<(usize, usize), ExecuteError> {
        let mut taken = 0;
        let mut preempted = 0;

        while taken < self.settings.batch_cap && !cancel.is_cancelled() {
            let jumped = self.drain_priority(cancel).await?;
            if taken > 0 && jumped > 0 {
                debug!(topic, jumped, "priority work preempted batch");
                if let Ok(mut m) = self.metrics.write() {
                    m.preemptions += jumped as u64;
                }
            }
            preempted += jumped;

            if cancel.is_cancelled() {
                break;
            }
            let Some(delivery) = self.queues.try_pop(topic) else {
                break;
            };
            self.handle(delivery, cancel).await?;
            taken += 1;
        }

        Ok((taken, preempted))
    }
}
