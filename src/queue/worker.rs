use std::sync::Arc;

use async_channel::{Receiver, Sender};
use chrono::{Duration, Utc};

use super::{TaskEnvelope, TaskQueue};
use crate::api::TaskAPI;
use crate::config::QueueConfig;
use crate::error::Error;

pub type DynRunner = Arc<dyn TaskAPI + Send + Sync>;

/// What happened to one claimed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Completed,
    Retrying { attempt: u32 },
    Exhausted,
}

/// Polls the queue and fans due tasks out to a fixed pool of consumers.
pub struct Worker {
    queue: Arc<dyn TaskQueue>,
    runner: DynRunner,
    config: QueueConfig,
}

impl Worker {
    pub fn new(queue: Arc<dyn TaskQueue>, runner: DynRunner, config: QueueConfig) -> Self {
        Self { queue, runner, config }
    }

    #[tracing::instrument(name = "Worker::run", skip(self))]
    pub async fn run(self) {
        let (tx, rx): (Sender<TaskEnvelope>, Receiver<TaskEnvelope>) =
            async_channel::bounded(self.config.batch_size.max(1));

        let worker = Arc::new(self);
        let mut handles = vec![];

        for _ in 0..worker.config.concurrency {
            let rx = rx.clone();
            let worker = worker.clone();

            let handle = tokio::spawn(async move {
                while let Ok(envelope) = rx.recv().await {
                    if let Err(err) = worker.deliver(envelope).await {
                        tracing::error!(%err, "failed to settle task delivery");
                    }
                }
            });

            handles.push(handle);
        }

        let poller = worker.clone();
        handles.push(tokio::spawn(async move {
            loop {
                match poller.poll().await {
                    Ok(envelopes) => {
                        for envelope in envelopes {
                            if tx.send(envelope).await.is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => tracing::warn!(%err, "failed to claim due tasks"),
                }

                tokio::time::sleep(poller.config.poll_interval).await;
            }
        }));

        futures::future::join_all(handles).await;
    }

    pub async fn poll(&self) -> Result<Vec<TaskEnvelope>, Error> {
        self.queue
            .claim_due(Utc::now(), self.config.batch_size, self.config.lease)
            .await
    }

    /// Runs due tasks inline until none are left. Used by tests and one-shot maintenance.
    pub async fn drain(&self) -> Result<Vec<Delivery>, Error> {
        let mut deliveries = vec![];

        loop {
            let envelopes = self.poll().await?;
            if envelopes.is_empty() {
                return Ok(deliveries);
            }

            for envelope in envelopes {
                deliveries.push(self.deliver(envelope).await?);
            }
        }
    }

    /// Executes one claimed delivery and settles it with the queue.
    #[tracing::instrument(skip(self, envelope), fields(task = envelope.task.name(), attempt = envelope.attempt))]
    pub async fn deliver(&self, envelope: TaskEnvelope) -> Result<Delivery, Error> {
        let task = envelope.task.clone();

        match self.runner.run_task(task.clone()).await {
            Ok(()) => {
                self.queue.complete(envelope.id).await?;
                self.follow_up(&task).await;
                Ok(Delivery::Completed)
            }
            Err(err) if self.config.retry.is_exhausted(envelope.attempt) => {
                tracing::error!(%err, "task retries exhausted");

                // the task stays queued until its exhaustion has been handled
                if let Err(handler_err) = self.runner.handle_exhausted(task.clone()).await {
                    let delay = self.backoff(envelope.attempt);
                    tracing::error!(%handler_err, ?delay, "exhaustion handler failed, keeping task");

                    self.queue
                        .reschedule(envelope.id, delay, &handler_err.to_string())
                        .await?;

                    return Ok(Delivery::Retrying {
                        attempt: envelope.attempt,
                    });
                }

                self.queue.abandon(envelope.id, &err.to_string()).await?;
                self.follow_up(&task).await;
                Ok(Delivery::Exhausted)
            }
            Err(err) => {
                let delay = self.backoff(envelope.attempt);
                tracing::warn!(%err, ?delay, "task failed, retrying");

                self.queue
                    .reschedule(envelope.id, delay, &err.to_string())
                    .await?;

                Ok(Delivery::Retrying {
                    attempt: envelope.attempt,
                })
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.config.retry.backoff_with_jitter(attempt);
        Duration::from_std(delay).unwrap_or_else(|_| Duration::seconds(1))
    }

    async fn follow_up(&self, task: &super::Task) {
        if !task.is_periodic() {
            return;
        }

        if let Err(err) = self.runner.schedule_next(task).await {
            tracing::error!(%err, task = task.name(), "failed to schedule next run");
        }
    }
}
