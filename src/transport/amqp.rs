//! AMQP session surface consumed by the event hub client
//!
//! Framing, link credit and TLS belong to the implementation behind these traits.
//! Every link is closed explicitly by whoever opened it.

use crate::error::HubResult;
use crate::protocol::{LinkFilter, Message};
use async_trait::async_trait;
use std::sync::Arc;

/// Source, target and optional selector of a link
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkOptions {
    pub source: Option<String>,
    pub target: Option<String>,
    pub filter: Option<LinkFilter>,
}

impl LinkOptions {
    pub fn source(address: impl Into<String>) -> Self {
        Self {
            source: Some(address.into()),
            ..Default::default()
        }
    }

    pub fn target(address: impl Into<String>) -> Self {
        Self {
            target: Some(address.into()),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, address: impl Into<String>) -> Self {
        self.source = Some(address.into());
        self
    }

    pub fn with_target(mut self, address: impl Into<String>) -> Self {
        self.target = Some(address.into());
        self
    }

    pub fn with_filter(mut self, filter: LinkFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Address used to name the link in logs and errors
    pub fn address(&self) -> &str {
        self.source
            .as_deref()
            .or(self.target.as_deref())
            .unwrap_or_default()
    }
}

/// Dials broker connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn dial(&self, hostname: &str) -> HubResult<Box<dyn Connection>>;
}

#[async_trait]
pub trait Connection: Send + Sync {
    async fn new_session(&self) -> HubResult<Arc<dyn Session>>;

    async fn close(&self) -> HubResult<()>;
}

/// Multiplexed session; safe for concurrent use
#[async_trait]
pub trait Session: Send + Sync {
    async fn open_sender(&self, options: LinkOptions) -> HubResult<Box<dyn Sender>>;

    async fn open_receiver(&self, options: LinkOptions) -> HubResult<Box<dyn Receiver>>;

    async fn close(&self) -> HubResult<()>;
}

#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, message: Message) -> HubResult<()>;

    async fn close(&self) -> HubResult<()>;
}

#[async_trait]
pub trait Receiver: Send + Sync {
    /// Next message in link order
    async fn receive(&mut self) -> HubResult<Message>;

    /// Settle `message` as accepted
    async fn accept(&self, message: &Message) -> HubResult<()>;

    async fn close(&self) -> HubResult<()>;
}
