//! Partition fan-in consumer
//!
//! One receiver task per partition feeds a shared message channel and a shared error
//! channel. The orchestrating loop dispatches each message to its own callback task and
//! returns on the first partition error or on cancellation. Every receiver task has
//! exited and closed its link before the call returns.

use super::management::get_partition_ids;
use crate::error::{HubError, HubResult};
use crate::lifecycle::run_cancellable;
use crate::link_span;
use crate::protocol::{AddressBuilder, LinkFilter, Message};
use crate::transport::amqp::{LinkOptions, Receiver, Session};
use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

/// Consume every partition of event hub `name` in consumer group `group`.
///
/// Only messages enqueued at or after the moment of this call are delivered. Each message
/// is accepted before `callback` runs, and every accepted message reaches `callback` even
/// when a partition error ends the call; callbacks run concurrently and in no particular
/// order across partitions. Runs until `cancel` fires (`Cancelled`) or a partition fails
/// (that partition's error).
pub async fn subscribe_partitions<F, Fut>(
    session: &dyn Session,
    cancel: &CancellationToken,
    name: &str,
    group: &str,
    callback: F,
) -> HubResult<()>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    let started_at = Utc::now();
    let partition_ids = get_partition_ids(session, cancel, name).await?;
    if partition_ids.is_empty() {
        return Err(HubError::decode(format!("event hub {name} reported no partitions")));
    }

    let scope = cancel.child_token();
    let (message_tx, mut message_rx) = mpsc::channel(partition_ids.len());
    let (error_tx, mut error_rx) = mpsc::channel(partition_ids.len());
    let mut receivers = JoinSet::new();

    for partition_id in &partition_ids {
        let options = partition_link(name, group, partition_id, started_at);
        let address = options.address().to_string();
        let receiver = match run_cancellable(&scope, session.open_receiver(options)).await {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!(address = %address, error = %e, "opening partition receiver failed");
                shutdown(&scope, &mut receivers).await;
                return Err(e);
            }
        };

        let worker = PartitionWorker {
            receiver,
            scope: scope.clone(),
            messages: message_tx.clone(),
            errors: error_tx.clone(),
        };
        receivers.spawn(worker.run().instrument(link_span!(address = %address, partition_id = %partition_id)));
    }
    drop(message_tx);
    drop(error_tx);
    info!(name, group, partitions = partition_ids.len(), "consuming partitions");

    let result = loop {
        tokio::select! {
            biased;

            Some(e) = error_rx.recv() => {
                // accepted messages queued before the failure are still delivered
                while let Ok(message) = message_rx.try_recv() {
                    tokio::spawn(callback(message));
                }
                break Err(e);
            }
            _ = scope.cancelled() => break Err(HubError::Cancelled),
            Some(message) = message_rx.recv() => {
                tokio::spawn(callback(message));
            }
            else => break Err(HubError::transport("every partition receiver stopped")),
        }
    };

    shutdown(&scope, &mut receivers).await;
    debug!(name, "partition consumer stopped");
    result
}

/// Receiver options for one partition, filtered to messages enqueued at or after `since`
pub fn partition_link(
    name: &str,
    group: &str,
    partition_id: &str,
    since: DateTime<Utc>,
) -> LinkOptions {
    LinkOptions::source(AddressBuilder::partition(name, group, partition_id))
        .with_filter(LinkFilter::EnqueuedAtOrAfter(since))
}

async fn shutdown(scope: &CancellationToken, receivers: &mut JoinSet<()>) {
    scope.cancel();
    while let Some(joined) = receivers.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "partition receiver task failed");
        }
    }
}

struct PartitionWorker {
    receiver: Box<dyn Receiver>,
    scope: CancellationToken,
    messages: mpsc::Sender<Message>,
    errors: mpsc::Sender<HubError>,
}

impl PartitionWorker {
    async fn run(mut self) {
        if let Err(e) = self.pump().await {
            // Nobody reads the error channel once the scope is cancelled.
            if !self.scope.is_cancelled() {
                let _ = self.errors.try_send(e);
            }
        }
        if let Err(e) = self.receiver.close().await {
            debug!(error = %e, "closing partition receiver failed");
        }
    }

    /// Forward messages until the scope is cancelled (`Ok`) or the link fails
    async fn pump(&mut self) -> HubResult<()> {
        loop {
            let message = tokio::select! {
                _ = self.scope.cancelled() => return Ok(()),
                received = self.receiver.receive() => received?,
            };
            self.receiver.accept(&message).await?;

            tokio::select! {
                _ = self.scope.cancelled() => return Ok(()),
                sent = self.messages.send(message) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
