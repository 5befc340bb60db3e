use crate::error::{ApiError, ApiErrorCode, Error, Result};
use crate::sdk::config::{ClientContext, ReconnectPolicyParams};
use crate::sdk::peer::IceServer;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const API_KEY_CLIENT_LABEL: &str = "rust-sdk-api-key";

/// Persona to start a session with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaConfig {
    pub persona_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_id: Option<String>,
    /// Deprecated in favour of `llm_id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brain_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_session_length_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language_code: Option<String>,
}

impl PersonaConfig {
    #[must_use]
    pub fn new(persona_id: impl Into<String>) -> Self {
        Self {
            persona_id: persona_id.into(),
            ..Self::default()
        }
    }

    const fn is_custom(&self) -> bool {
        self.brain_type.is_some() || self.llm_id.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(flatten)]
    pub policy: ReconnectPolicyParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: String,
    pub engine_host: String,
    #[serde(default)]
    pub engine_protocol: String,
    pub signalling_endpoint: String,
    #[serde(default)]
    pub client_config: ClientConfig,
}

/// Everything a session needs from bootstrap to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub session_id: String,
    /// Base of the engine's HTTP API, `http[s]://{host}`.
    pub engine_url: Url,
    pub signalling_url: Url,
    pub ice_servers: Vec<IceServer>,
    pub policy: ReconnectPolicyParams,
}

impl StartSessionResponse {
    /// Resolve the engine URLs. Signalling lives at
    /// `ws[s]://{host}{endpoint}?session_id={id}`.
    ///
    /// # Errors
    /// Returns an error if the host and endpoint do not form a valid URL.
    #[allow(clippy::result_large_err)]
    pub fn into_descriptor(self) -> Result<SessionDescriptor> {
        let plain = self.engine_protocol.eq_ignore_ascii_case("http");
        let (http, ws) = if plain { ("http", "ws") } else { ("https", "wss") };
        let engine_url = Url::parse(&format!("{http}://{}", self.engine_host))?;
        let mut signalling_url = Url::parse(&format!("{ws}://{}{}", self.engine_host, self.signalling_endpoint))?;
        signalling_url.query_pairs_mut().append_pair("session_id", &self.session_id);
        Ok(SessionDescriptor {
            session_id: self.session_id,
            engine_url,
            signalling_url,
            ice_servers: self.client_config.ice_servers,
            policy: self.client_config.policy,
        })
    }
}

#[derive(Clone, Debug)]
pub enum Credentials {
    SessionToken(String),
    /// Exchanged for a session token before each bootstrap. Development only.
    ApiKey(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartSessionRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    persona_config: Option<&'a PersonaConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_options: Option<&'a Value>,
    client_metadata: &'a crate::sdk::config::ClientMetadata,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionTokenRequest<'a> {
    client_label: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    persona_config: Option<&'a PersonaConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionTokenResponse {
    session_token: String,
}

/// Client for the session bootstrap API.
#[derive(Clone, Debug)]
pub struct CoreApiClient {
    client: Client,
    context: ClientContext,
    credentials: Credentials,
}

impl CoreApiClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new(context: ClientContext, credentials: Credentials) -> Result<Self> {
        Self::new_with_timeouts(context, credentials, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(
        context: ClientContext,
        credentials: Credentials,
        timeout: Duration,
        pool_idle_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()?;
        Ok(Self { client, context, credentials })
    }

    #[must_use]
    pub const fn context(&self) -> &ClientContext {
        &self.context
    }

    /// Start a session. The call is not retried.
    ///
    /// # Errors
    /// Returns `Api` with a classified code for non-success statuses, or the
    /// underlying HTTP/JSON error.
    pub async fn start_session(
        &self,
        persona: Option<&PersonaConfig>,
        session_options: Option<&Value>,
    ) -> Result<StartSessionResponse> {
        if persona.is_some_and(|p| p.brain_type.is_some()) {
            tracing::warn!("brainType is deprecated; use llmId instead");
        }
        let token = match &self.credentials {
            Credentials::SessionToken(token) => token.clone(),
            Credentials::ApiKey(key) => {
                let persona = persona.ok_or_else(|| {
                    Error::Api(ApiError {
                        code: ApiErrorCode::ValidationError,
                        status: 400,
                        message: "Persona configuration must be provided when using an API key".to_string(),
                        cause: None,
                    })
                })?;
                self.exchange_api_key(key, persona).await?
            }
        };

        let body = StartSessionRequest {
            persona_config: persona,
            session_options,
            client_metadata: &self.context.metadata,
        };
        let res = self
            .client
            .post(self.context.endpoint("/engine/session"))
            .header(AUTHORIZATION, bearer(&token)?)
            .json(&body)
            .send()
            .await?;

        let status = res.status().as_u16();
        let text = res.text().await?;
        if (200..300).contains(&status) {
            let response: StartSessionResponse = serde_json::from_str(&text)?;
            tracing::info!(session_id = %response.session_id, "Session started");
            return Ok(response);
        }

        let data: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let err = classify_failure(status, &data);
        tracing::error!(status, code = ?err.code, "Session bootstrap failed: {}", err.message);
        Err(Error::Api(err))
    }

    /// Exchange an API key for a short-lived session token.
    async fn exchange_api_key(&self, api_key: &str, persona: &PersonaConfig) -> Result<String> {
        tracing::warn!("Exchanging an API key for a session token; do not ship API keys to clients");
        let body = SessionTokenRequest {
            client_label: API_KEY_CLIENT_LABEL,
            persona_config: persona.is_custom().then_some(persona),
        };
        let res = self
            .client
            .post(self.context.endpoint("/auth/session-token"))
            .header(AUTHORIZATION, bearer(api_key)?)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let token: SessionTokenResponse = res.json().await?;
        Ok(token.session_token)
    }
}

#[derive(Debug, Serialize)]
struct TalkRequest<'a> {
    content: &'a str,
}

/// Client for the engine's per-session HTTP API.
#[derive(Clone, Debug)]
pub struct EngineApiClient {
    client: Client,
    base_url: Url,
    session_id: String,
}

impl EngineApiClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new(base_url: Url, session_id: impl Into<String>) -> Result<Self> {
        Self::new_with_timeouts(base_url, session_id, DEFAULT_TIMEOUT, DEFAULT_POOL_IDLE_TIMEOUT)
    }

    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    #[allow(clippy::result_large_err)]
    pub fn new_with_timeouts(
        base_url: Url,
        session_id: impl Into<String>,
        timeout: Duration,
        pool_idle_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(pool_idle_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url,
            session_id: session_id.into(),
        })
    }

    /// `POST {base}/talk?session_id={id}`: have the persona say `content` verbatim.
    ///
    /// # Errors
    /// Returns the HTTP error for a failed request or a non-success status.
    pub async fn send_talk_command(&self, content: &str) -> Result<()> {
        let mut url = Url::parse(&format!("{}/talk", self.base_url.as_str().trim_end_matches('/')))?;
        url.query_pairs_mut().append_pair("session_id", &self.session_id);
        let res = self.client.post(url).json(&TalkRequest { content }).send().await?;
        if let Err(err) = res.error_for_status_ref() {
            tracing::error!(session_id = %self.session_id, "Talk command failed: {err}");
            return Err(err.into());
        }
        tracing::debug!(session_id = %self.session_id, "Talk command sent");
        Ok(())
    }
}

#[allow(clippy::result_large_err)]
fn bearer(token: &str) -> Result<HeaderValue> {
    Ok(HeaderValue::from_str(&format!("Bearer {token}"))?)
}

/// Map a failed bootstrap response to an [`ApiError`].
fn classify_failure(status: u16, data: &Value) -> ApiError {
    let cause = data.get("message").and_then(Value::as_str).map(str::to_owned);
    let error = data.get("error").and_then(Value::as_str).unwrap_or_default();
    let (code, message, status) = match status {
        400 => (ApiErrorCode::ValidationError, "Invalid request to start session", 400),
        401 | 403 => (ApiErrorCode::AuthenticationError, "Authentication failed when starting session", status),
        402 => (ApiErrorCode::NoPlanFound, "Please sign up for a plan to start a session", 402),
        429 if error == "Concurrent session limit reached" => (
            ApiErrorCode::MaxConcurrentSessionsReached,
            "Concurrency limit reached, please upgrade your plan",
            429,
        ),
        429 if error == "Spend cap reached" => {
            (ApiErrorCode::SpendCapReached, "Spend cap reached, please upgrade your plan", 429)
        }
        429 => (ApiErrorCode::UsageLimitReached, "Usage limit reached, please upgrade your plan", 429),
        503 => (ApiErrorCode::ServiceBusy, "There are no available personas, please try again later", 503),
        _ => (ApiErrorCode::ServerError, "Unknown error when starting session", 500),
    };
    ApiError {
        code,
        status,
        message: message.to_string(),
        cause,
    }
}
