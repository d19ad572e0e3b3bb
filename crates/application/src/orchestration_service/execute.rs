use chrono::Utc;
use taskgate_domain::DeferredOperation;
use tracing::warn;

use crate::ports::{BOOTSTRAP_CHANNEL, JOBS_CHANNEL, PublishOptions, WORKER_EVENTS_CHANNEL};

use super::{DeferredExecution, OrchestrationService};

impl OrchestrationService {
    /// Executes one approved deferred operation.
    ///
    /// For jobs the registry persist happens strictly before the transport
    /// publish: a persist failure publishes nothing, and a publish failure
    /// leaves the record behind but still reports executed=false.
    pub(super) async fn execute_deferred(
        &self,
        operation: &DeferredOperation,
    ) -> DeferredExecution {
        match operation {
            DeferredOperation::EnqueueJob { job } => {
                if let Err(error) = self.jobs.save_queued(job.clone(), None, Utc::now()).await {
                    return DeferredExecution {
                        executed: false,
                        error: Some(format!(
                            "failed to persist job '{}': {error}",
                            job.job_id
                        )),
                    };
                }

                let payload = match serde_json::to_value(job) {
                    Ok(payload) => payload,
                    Err(error) => {
                        return DeferredExecution {
                            executed: false,
                            error: Some(format!(
                                "failed to serialize job '{}': {error}",
                                job.job_id
                            )),
                        };
                    }
                };

                match self
                    .transport
                    .publish(
                        JOBS_CHANNEL,
                        job.job_type.as_str(),
                        payload,
                        PublishOptions {
                            job_id: Some(job.job_id.clone()),
                        },
                    )
                    .await
                {
                    Ok(_) => DeferredExecution {
                        executed: true,
                        error: None,
                    },
                    Err(error) => {
                        warn!(
                            job_id = %job.job_id,
                            error = %error,
                            "job record persisted but publish failed; job is never queued"
                        );
                        DeferredExecution {
                            executed: false,
                            error: Some(format!(
                                "failed to publish job '{}': {error}",
                                job.job_id
                            )),
                        }
                    }
                }
            }
            DeferredOperation::EnqueueBootstrap { request } => {
                self.publish_plain(BOOTSTRAP_CHANNEL, "bootstrap", request.clone())
                    .await
            }
            DeferredOperation::EnqueueWorkerEvent { event } => {
                self.publish_plain(WORKER_EVENTS_CHANNEL, "worker_event", event.clone())
                    .await
            }
        }
    }

    async fn publish_plain(
        &self,
        channel: &str,
        name: &str,
        payload: serde_json::Value,
    ) -> DeferredExecution {
        match self
            .transport
            .publish(channel, name, payload, PublishOptions::default())
            .await
        {
            Ok(_) => DeferredExecution {
                executed: true,
                error: None,
            },
            Err(error) => DeferredExecution {
                executed: false,
                error: Some(format!("failed to publish onto '{channel}': {error}")),
            },
        }
    }
}
