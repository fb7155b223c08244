//! Claims-based security token grants

use super::management::{exchange, Exchange};
use crate::config::TokenSection;
use crate::credentials::Credentials;
use crate::error::{HubError, HubResult};
use crate::link_span;
use crate::protocol::addresses::{CBS_NODE, CBS_REPLY_TO};
use crate::protocol::Message;
use crate::transport::amqp::{LinkOptions, Session};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

/// Grants tokens to the `$cbs` node of one session
#[derive(Clone)]
pub struct TokenManager {
    session: Arc<dyn Session>,
    renewal_interval: Duration,
    token_type: String,
}

impl TokenManager {
    pub fn new(session: Arc<dyn Session>, tokens: &TokenSection) -> Self {
        Self {
            session,
            renewal_interval: tokens.renewal_interval(),
            token_type: tokens.token_type.clone(),
        }
    }

    pub fn with_renewal_interval(mut self, interval: Duration) -> Self {
        self.renewal_interval = interval;
        self
    }

    pub fn renewal_interval(&self) -> Duration {
        self.renewal_interval
    }

    /// The `put-token` request for `audience`
    pub fn put_token_request(&self, audience: &str, token: &str) -> Message {
        Message::new(token)
            .with_message_id(uuid::Uuid::new_v4().to_string())
            .with_to(CBS_NODE)
            .with_reply_to(CBS_REPLY_TO)
            .with_property("operation", "put-token")
            .with_property("type", self.token_type.as_str())
            .with_property("name", audience)
    }

    /// Grant `token` for `audience` once
    pub async fn put_token(
        &self,
        cancel: &CancellationToken,
        audience: &str,
        token: &str,
    ) -> HubResult<()> {
        let links = Exchange {
            receiver: LinkOptions::source(CBS_NODE),
            sender: LinkOptions::target(CBS_NODE),
        };
        exchange(
            self.session.as_ref(),
            cancel,
            links,
            self.put_token_request(audience, token),
        )
        .await?;
        debug!(audience, "token granted");
        Ok(())
    }

    /// Grant `token` now, then re-grant it every renewal interval until `stop` fires.
    ///
    /// The first grant blocks and its failure is returned. Renewals run in the returned
    /// task under `stop`; a failed renewal is logged and ends the task.
    pub async fn put_token_continuously(
        &self,
        cancel: &CancellationToken,
        audience: &str,
        token: &str,
        stop: CancellationToken,
    ) -> HubResult<JoinHandle<()>> {
        let token = token.to_string();
        self.grant_continuously(cancel, audience, stop, move || Ok(token.clone()))
            .await
    }

    /// Like [`put_token_continuously`](Self::put_token_continuously), but mints a fresh
    /// signature of `lifetime` from `credentials` for every grant
    pub async fn put_credentials_continuously(
        &self,
        cancel: &CancellationToken,
        credentials: Arc<dyn Credentials>,
        audience: &str,
        lifetime: Duration,
        stop: CancellationToken,
    ) -> HubResult<JoinHandle<()>> {
        let audience_owned = audience.to_string();
        let mint = move || match credentials.token(&audience_owned, lifetime)? {
            Some(signature) => Ok(signature.to_string()),
            None => Err(HubError::credentials(
                "credentials do not issue shared access signatures",
            )),
        };
        self.grant_continuously(cancel, audience, stop, mint).await
    }

    async fn grant_continuously<M>(
        &self,
        cancel: &CancellationToken,
        audience: &str,
        stop: CancellationToken,
        mint: M,
    ) -> HubResult<JoinHandle<()>>
    where
        M: Fn() -> HubResult<String> + Send + 'static,
    {
        self.put_token(cancel, audience, &mint()?).await?;

        let manager = self.clone();
        let audience = audience.to_string();
        let span = link_span!(address = CBS_NODE, audience = %audience);
        let renewals = async move {
            let period = manager.renewal_interval;
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let renewed = match mint() {
                    Ok(token) => manager.put_token(&stop, &audience, &token).await,
                    Err(e) => Err(e),
                };
                match renewed {
                    Ok(()) => {}
                    Err(HubError::Cancelled) => break,
                    Err(e) => {
                        error!(error = %e.redacted(), "token renewal failed");
                        return;
                    }
                }
            }
            info!("token renewal stopped");
        };

        Ok(tokio::spawn(renewals.instrument(span)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;
    use crate::testing::MockConnector;
    use crate::transport::amqp::{Connection, Connector};

    #[tokio::test]
    async fn test_put_token_request_shape() {
        let connection = MockConnector::new().dial("hub.example.net").await.unwrap();
        let session = connection.new_session().await.unwrap();
        let manager = TokenManager::new(session, &TokenSection::default());

        let request = manager.put_token_request("sb://hub/telemetry", "SharedAccessSignature sr=x");

        assert_eq!(request.properties.to.as_deref(), Some(CBS_NODE));
        assert_eq!(request.properties.reply_to.as_deref(), Some(CBS_REPLY_TO));
        assert_eq!(request.value, Value::from("SharedAccessSignature sr=x"));
        assert_eq!(
            request.application_properties.get("operation"),
            Some(&Value::from("put-token"))
        );
        assert_eq!(
            request.application_properties.get("type"),
            Some(&Value::from(crate::config::DEFAULT_TOKEN_TYPE))
        );
        assert_eq!(
            request.application_properties.get("name"),
            Some(&Value::from("sb://hub/telemetry"))
        );
    }
}
