//! Event hub client: one connection, one session

use super::cbs::TokenManager;
use super::consumer;
use super::management;
use crate::config::TokenSection;
use crate::error::{HubError, HubResult};
use crate::protocol::{AddressBuilder, Message};
use crate::session_span;
use crate::transport::amqp::{Connection, Connector, Session};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

struct Live {
    connection: Box<dyn Connection>,
    session: Arc<dyn Session>,
}

pub struct EventHubClient {
    hostname: String,
    tokens: TokenSection,
    live: Mutex<Option<Live>>,
}

impl EventHubClient {
    /// Open a connection and a session to `hostname`. If the session cannot be created the
    /// connection is closed before the error is returned.
    pub async fn dial(
        connector: &dyn Connector,
        hostname: &str,
        tokens: TokenSection,
    ) -> HubResult<Self> {
        let span = session_span!(hostname, url = %AddressBuilder::amqps_url(hostname));
        async {
            let connection = connector.dial(hostname).await?;
            let session = match connection.new_session().await {
                Ok(session) => session,
                Err(e) => {
                    if let Err(close_err) = connection.close().await {
                        debug!(error = %close_err, "closing connection after session failure");
                    }
                    return Err(e);
                }
            };
            info!("event hub session open");

            Ok(Self {
                hostname: hostname.to_string(),
                tokens,
                live: Mutex::new(Some(Live {
                    connection,
                    session,
                })),
            })
        }
        .instrument(span)
        .await
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn is_closed(&self) -> bool {
        self.live.lock().is_none()
    }

    /// Current session; `Closed` after [`close`](Self::close)
    pub fn session(&self) -> HubResult<Arc<dyn Session>> {
        self.live
            .lock()
            .as_ref()
            .map(|live| live.session.clone())
            .ok_or(HubError::Closed)
    }

    pub async fn get_partition_ids(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> HubResult<Vec<String>> {
        let session = self.session()?;
        management::get_partition_ids(session.as_ref(), cancel, name).await
    }

    /// See [`consumer::subscribe_partitions`]
    pub async fn subscribe_partitions<F, Fut>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        group: &str,
        callback: F,
    ) -> HubResult<()>
    where
        F: Fn(Message) -> Fut + Send + Sync,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let session = self.session()?;
        consumer::subscribe_partitions(session.as_ref(), cancel, name, group, callback).await
    }

    pub fn token_manager(&self) -> HubResult<TokenManager> {
        Ok(TokenManager::new(self.session()?, &self.tokens))
    }

    pub async fn put_token(
        &self,
        cancel: &CancellationToken,
        audience: &str,
        token: &str,
    ) -> HubResult<()> {
        self.token_manager()?.put_token(cancel, audience, token).await
    }

    pub async fn put_token_continuously(
        &self,
        cancel: &CancellationToken,
        audience: &str,
        token: &str,
        stop: CancellationToken,
    ) -> HubResult<JoinHandle<()>> {
        self.token_manager()?
            .put_token_continuously(cancel, audience, token, stop)
            .await
    }

    /// Close the session, then the connection. Later calls are no-ops.
    pub async fn close(&self) -> HubResult<()> {
        let live = self.live.lock().take();
        let Some(live) = live else {
            return Ok(());
        };

        if let Err(e) = live.session.close().await {
            warn!(hostname = %self.hostname, error = %e, "closing session failed");
        }
        live.connection.close().await?;
        info!(hostname = %self.hostname, "event hub client closed");
        Ok(())
    }
}
