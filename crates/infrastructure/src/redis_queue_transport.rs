//! Redis-backed queue transport for multi-process deployments.

use std::sync::Arc;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde_json::Value;
use taskgate_application::{
    PublishOptions, QueueJob, QueueSubscription, QueueTransport, SubscribeOptions,
};
use taskgate_core::{AppError, AppResult};
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

/// Redis implementation of the queue transport.
///
/// Each channel is one Redis list; publishing is an LPUSH and the subscriber
/// drains with a blocking BRPOP loop. Duplicate-id suppression is left to the
/// broker deployment; this adapter does not deduplicate.
#[derive(Clone)]
pub struct RedisQueueTransport {
    client: redis::Client,
}

impl RedisQueueTransport {
    /// Creates a transport over the given Redis client.
    #[must_use]
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl QueueTransport for RedisQueueTransport {
    async fn publish(
        &self,
        channel: &str,
        name: &str,
        payload: Value,
        options: PublishOptions,
    ) -> AppResult<QueueJob> {
        let job = QueueJob {
            id: options
                .job_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: name.to_owned(),
            payload,
        };

        let serialized = serde_json::to_string(&job).map_err(|error| {
            AppError::Internal(format!("failed to serialize queue item: {error}"))
        })?;

        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))?;

        connection
            .lpush::<_, _, ()>(channel, serialized)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to publish onto '{channel}': {error}"))
            })?;

        Ok(job)
    }

    async fn subscribe(
        &self,
        channel: &str,
        options: SubscribeOptions,
    ) -> AppResult<Box<dyn QueueSubscription>> {
        if options.concurrency == 0 {
            return Err(AppError::Validation(
                "subscription concurrency must be greater than zero".to_owned(),
            ));
        }

        let mut connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Internal(format!("failed to connect to redis: {error}")))?;

        let (shutdown_sender, mut shutdown_receiver) = watch::channel(false);
        let channel_name = channel.to_owned();
        let concurrency = options.concurrency;
        let permits = Arc::new(Semaphore::new(concurrency));

        let supervisor = tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    permit = permits.clone().acquire_owned() => permit,
                    _ = shutdown_receiver.changed() => break,
                };
                let Ok(permit) = permit else {
                    break;
                };

                // Blocks for at most one second so shutdown stays responsive.
                let popped: Result<Option<(String, String)>, redis::RedisError> = tokio::select! {
                    popped = connection.brpop(channel_name.as_str(), 1.0) => popped,
                    _ = shutdown_receiver.changed() => break,
                };

                let serialized = match popped {
                    Ok(Some((_, serialized))) => serialized,
                    Ok(None) => continue,
                    Err(error) => {
                        warn!(
                            channel = %channel_name,
                            error = %error,
                            "queue pop failed; retrying"
                        );
                        continue;
                    }
                };

                let job: QueueJob = match serde_json::from_str(serialized.as_str()) {
                    Ok(job) => job,
                    Err(error) => {
                        warn!(
                            channel = %channel_name,
                            error = %error,
                            "dropping undecodable queue item"
                        );
                        continue;
                    }
                };

                let subscriber = options.clone();
                tokio::spawn(async move {
                    let result = (subscriber.handler)(job.clone()).await;
                    match &result {
                        Ok(()) => {
                            if let Some(on_completed) = &subscriber.on_completed {
                                on_completed(&job);
                            }
                        }
                        Err(error) => {
                            if let Some(on_failed) = &subscriber.on_failed {
                                on_failed(&job, error);
                            }
                        }
                    }
                    drop(permit);
                });
            }

            // Drain: every permit back means every handler finished.
            let drained = permits.acquire_many(concurrency as u32).await;
            drop(drained);
        });

        Ok(Box::new(RedisSubscription {
            shutdown: shutdown_sender,
            supervisor: Mutex::new(Some(supervisor)),
        }))
    }
}

struct RedisSubscription {
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl QueueSubscription for RedisSubscription {
    async fn close(&self) -> AppResult<()> {
        let _ = self.shutdown.send(true);

        let supervisor = self.supervisor.lock().await.take();
        if let Some(supervisor) = supervisor
            && let Err(error) = supervisor.await
        {
            return Err(AppError::Internal(format!(
                "queue subscription supervisor failed: {error}"
            )));
        }

        Ok(())
    }
}
