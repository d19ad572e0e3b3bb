use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use taskgate_application::{
    PublishOptions, QueueJob, QueueSubscription, QueueTransport, SubscribeOptions,
};
use taskgate_core::{AppError, AppResult};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

/// In-process queue transport for single-process deployments and tests.
///
/// Each channel holds at most one subscriber. An item id stays reserved from
/// publish until its handler finishes, so re-publishing a pending or
/// in-flight id is rejected rather than duplicated.
#[derive(Clone, Default)]
pub struct InProcessQueueTransport {
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
}

struct ChannelState {
    pending: VecDeque<QueueJob>,
    pending_ids: HashSet<String>,
    in_flight: usize,
    subscriber: Option<SubscribeOptions>,
    closed: bool,
    drained: Arc<Notify>,
}

impl ChannelState {
    fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            pending_ids: HashSet::new(),
            in_flight: 0,
            subscriber: None,
            closed: false,
            drained: Arc::new(Notify::new()),
        }
    }
}

impl InProcessQueueTransport {
    /// Creates a transport with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Starts as many queued items as the subscriber's concurrency allows.
///
/// Returns a boxed future: the spawned completion block re-enters dispatch,
/// and the boxed signature keeps that re-entry out of the future's own type.
fn dispatch(
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    channel: String,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        let mut started = Vec::new();
        {
            let mut guard = channels.lock().await;
            let Some(state) = guard.get_mut(channel.as_str()) else {
                return;
            };
            let Some(subscriber) = state.subscriber.clone() else {
                return;
            };

            while state.in_flight < subscriber.concurrency
                && let Some(job) = state.pending.pop_front()
            {
                state.in_flight += 1;
                started.push((subscriber.clone(), job));
            }
        }

        for (subscriber, job) in started {
            let channels = channels.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                let result = (subscriber.handler)(job.clone()).await;

                // Release the id and the concurrency slot before the
                // best-effort callbacks, so an on_completed observer can
                // immediately republish the same id.
                {
                    let mut guard = channels.lock().await;
                    if let Some(state) = guard.get_mut(channel.as_str()) {
                        state.in_flight -= 1;
                        state.pending_ids.remove(job.id.as_str());
                        state.drained.notify_waiters();
                    }
                }

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

                dispatch(channels, channel).await;
            });
        }
    })
}

#[async_trait]
impl QueueTransport for InProcessQueueTransport {
    async fn publish(
        &self,
        channel: &str,
        name: &str,
        payload: Value,
        options: PublishOptions,
    ) -> AppResult<QueueJob> {
        let job = {
            let mut guard = self.channels.lock().await;
            let state = guard
                .entry(channel.to_owned())
                .or_insert_with(ChannelState::new);

            if state.closed {
                return Err(AppError::Conflict(format!(
                    "queue channel '{channel}' is closed"
                )));
            }

            let id = options
                .job_id
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            if !state.pending_ids.insert(id.clone()) {
                return Err(AppError::Conflict(format!(
                    "item '{id}' is already pending or in flight on channel '{channel}'"
                )));
            }

            let job = QueueJob {
                id,
                name: name.to_owned(),
                payload,
            };
            state.pending.push_back(job.clone());
            job
        };

        dispatch(self.channels.clone(), channel.to_owned()).await;
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

        {
            let mut guard = self.channels.lock().await;
            let state = guard
                .entry(channel.to_owned())
                .or_insert_with(ChannelState::new);

            if state.closed {
                return Err(AppError::Conflict(format!(
                    "queue channel '{channel}' is closed"
                )));
            }

            if state.subscriber.is_some() {
                return Err(AppError::Conflict(format!(
                    "queue channel '{channel}' already has a subscriber"
                )));
            }

            state.subscriber = Some(options);
        }

        dispatch(self.channels.clone(), channel.to_owned()).await;

        Ok(Box::new(InProcessSubscription {
            channels: self.channels.clone(),
            channel: channel.to_owned(),
        }))
    }
}

struct InProcessSubscription {
    channels: Arc<Mutex<HashMap<String, ChannelState>>>,
    channel: String,
}

#[async_trait]
impl QueueSubscription for InProcessSubscription {
    async fn close(&self) -> AppResult<()> {
        let drained = {
            let mut guard = self.channels.lock().await;
            let Some(state) = guard.get_mut(self.channel.as_str()) else {
                return Ok(());
            };

            state.closed = true;
            state.subscriber = None;
            for job in state.pending.drain(..) {
                state.pending_ids.remove(job.id.as_str());
            }
            state.drained.clone()
        };

        loop {
            let notified = drained.notified();
            tokio::pin!(notified);
            // Register before checking so a decrement between the check and
            // the await still wakes this waiter.
            notified.as_mut().enable();
            {
                let guard = self.channels.lock().await;
                let in_flight = guard
                    .get(self.channel.as_str())
                    .map_or(0, |state| state.in_flight);
                if in_flight == 0 {
                    return Ok(());
                }
            }
            notified.await;
        }
    }
}
