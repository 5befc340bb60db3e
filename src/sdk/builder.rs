use crate::transport::SignalConnector;
use crate::transport::rest::{CoreApiClient, Credentials, PersonaConfig};
use crate::transport::ws::WsConnector;
use crate::{Error, Result};
use serde_json::Value;
use std::sync::Arc;

use super::config::{ClientContext, SessionOptions};
use super::peer::PeerFactory;
use super::session::Session;

pub struct PersonaClient;

impl PersonaClient {
    #[must_use]
    pub fn builder() -> PersonaClientBuilder {
        PersonaClientBuilder::new()
    }
}

pub struct PersonaClientBuilder {
    context: ClientContext,
    session_token: Option<String>,
    api_key: Option<String>,
    persona: Option<PersonaConfig>,
    options: SessionOptions,
    server_options: Option<Value>,
    peer_factory: Option<Arc<dyn PeerFactory>>,
    connector: Option<Arc<dyn SignalConnector>>,
}

impl PersonaClientBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            context: ClientContext::default(),
            session_token: None,
            api_key: None,
            persona: None,
            options: SessionOptions::default(),
            server_options: None,
            peer_factory: None,
            connector: None,
        }
    }

    /// Authenticate with a session token minted by your backend.
    #[must_use]
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.session_token = Some(token.into());
        self
    }

    /// Authenticate with an API key. For local development only; never ship
    /// an API key to end users.
    #[must_use]
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn persona(mut self, persona: PersonaConfig) -> Self {
        self.persona = Some(persona);
        self
    }

    #[must_use]
    pub const fn options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    /// Extra session options forwarded verbatim to the bootstrap call.
    #[must_use]
    pub fn server_options(mut self, options: Value) -> Self {
        self.server_options = Some(options);
        self
    }

    #[must_use]
    pub fn context(mut self, context: ClientContext) -> Self {
        self.context = context;
        self
    }

    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.context = self.context.with_base_url(url);
        self
    }

    /// The media stack used to create peer connections.
    #[must_use]
    pub fn peer_factory(mut self, factory: Arc<dyn PeerFactory>) -> Self {
        self.peer_factory = Some(factory);
        self
    }

    /// Replace the WebSocket signalling transport.
    #[must_use]
    pub fn signal_connector(mut self, connector: Arc<dyn SignalConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    #[allow(clippy::result_large_err)]
    fn build(self) -> Result<ClientSetup> {
        let credentials = match (self.session_token, self.api_key) {
            (Some(token), None) => Credentials::SessionToken(token),
            (None, Some(key)) => Credentials::ApiKey(key),
            (Some(_), Some(_)) => {
                return Err(Error::InvalidConfig(
                    "only one of session_token or api_key may be set".to_string(),
                ));
            }
            (None, None) => {
                return Err(Error::InvalidConfig("session_token or api_key required".to_string()));
            }
        };
        if matches!(credentials, Credentials::ApiKey(_)) && self.persona.is_none() {
            return Err(Error::InvalidConfig("persona required when using an api_key".to_string()));
        }
        let peer_factory = self
            .peer_factory
            .ok_or_else(|| Error::InvalidConfig("peer_factory required".to_string()))?;
        self.options.validate()?;

        Ok(ClientSetup {
            api: CoreApiClient::new(self.context, credentials)?,
            persona: self.persona,
            options: self.options,
            server_options: self.server_options,
            peer_factory,
            connector: self.connector,
        })
    }

    /// Bootstrap a session over REST and return it ready to `connect()`.
    ///
    /// # Errors
    /// Returns `InvalidConfig` if the configuration is incomplete, or `Api`
    /// if the bootstrap call is rejected.
    pub async fn start_session(self) -> Result<Session> {
        self.build()?.start_session().await
    }
}

impl Default for PersonaClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientSetup {
    api: CoreApiClient,
    persona: Option<PersonaConfig>,
    options: SessionOptions,
    server_options: Option<Value>,
    peer_factory: Arc<dyn PeerFactory>,
    connector: Option<Arc<dyn SignalConnector>>,
}

impl ClientSetup {
    async fn start_session(self) -> Result<Session> {
        let response = self
            .api
            .start_session(self.persona.as_ref(), self.server_options.as_ref())
            .await?;
        let descriptor = response.into_descriptor()?;
        tracing::debug!(
            session_id = %descriptor.session_id,
            url = %descriptor.signalling_url,
            "Session bootstrapped"
        );
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(WsConnector::new(descriptor.signalling_url.clone())));
        Session::from_parts(descriptor, self.options, connector, self.peer_factory)
    }
}
