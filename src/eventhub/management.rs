//! Request/response exchanges over a session
//!
//! Both the management node and the claims-based security node answer a request on a
//! dedicated receiver link. The response must echo the request's message id as its
//! correlation id and carry status 200. Both links are released on every exit path.

use crate::error::{HubError, HubResult};
use crate::lifecycle::run_cancellable;
use crate::link_span;
use crate::protocol::addresses::{EVENTHUB_ENTITY_TYPE, MANAGEMENT_NODE};
use crate::protocol::{check_correlation, check_response, AddressBuilder, Message, Value};
use crate::transport::amqp::{LinkOptions, Receiver, Sender, Session};
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

/// Link pair used by one exchange
#[derive(Debug, Clone)]
pub struct Exchange {
    pub receiver: LinkOptions,
    pub sender: LinkOptions,
}

/// Send `request` and wait for its correlated, successful response
pub async fn exchange(
    session: &dyn Session,
    cancel: &CancellationToken,
    links: Exchange,
    request: Message,
) -> HubResult<Message> {
    let message_id = request
        .properties
        .message_id
        .clone()
        .ok_or_else(|| HubError::invalid_input("request has no message id"))?;
    let span = link_span!(address = links.sender.address(), message_id = %message_id);

    async move {
        let mut receiver = run_cancellable(cancel, session.open_receiver(links.receiver)).await?;
        let sender = match run_cancellable(cancel, session.open_sender(links.sender)).await {
            Ok(sender) => sender,
            Err(e) => {
                release(None, receiver.as_ref()).await;
                return Err(e);
            }
        };

        let result = run_cancellable(cancel, async {
            sender.send(request).await?;
            let response = receiver.receive().await?;
            check_correlation(&message_id, &response)?;
            check_response(&response)?;
            receiver.accept(&response).await?;
            Ok(response)
        })
        .await;

        release(Some(sender.as_ref()), receiver.as_ref()).await;
        result
    }
    .instrument(span)
    .await
}

async fn release(sender: Option<&dyn Sender>, receiver: &dyn Receiver) {
    if let Some(sender) = sender {
        if let Err(e) = sender.close().await {
            debug!(error = %e, "closing sender link failed");
        }
    }
    if let Err(e) = receiver.close().await {
        debug!(error = %e, "closing receiver link failed");
    }
}

/// Build the management READ request for event hub `name`
pub fn partition_ids_request(name: &str, reply_to: &str) -> Message {
    Message::new(Value::Null)
        .with_message_id(uuid::Uuid::new_v4().to_string())
        .with_reply_to(reply_to)
        .with_property("operation", "READ")
        .with_property("name", name)
        .with_property("type", EVENTHUB_ENTITY_TYPE)
}

/// Discover the partition ids of event hub `name`
pub async fn get_partition_ids(
    session: &dyn Session,
    cancel: &CancellationToken,
    name: &str,
) -> HubResult<Vec<String>> {
    let reply_to = AddressBuilder::reply_address();
    let links = Exchange {
        receiver: LinkOptions::source(MANAGEMENT_NODE).with_target(&reply_to),
        sender: LinkOptions::target(MANAGEMENT_NODE).with_source(&reply_to),
    };

    let response = exchange(session, cancel, links, partition_ids_request(name, &reply_to)).await?;
    let ids = response.value.get("partition_ids")?.to_string_list()?;
    debug!(name, partitions = ids.len(), "discovered partitions");
    Ok(ids)
}
