use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chatrelay_config::Config;
use chatrelay_contracts::{DirectSendMessage, ErrorBody, ErrorResponse, IntentResult};
use chatrelay_kernel as kernel;
use chatrelay_kernel::RouteDecision;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use regex::Regex;
use reqwest::Client;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use serde::Deserialize;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub async fn serve(cfg: Config) -> Result<(), String> {
    let addr: SocketAddr = cfg
        .server
        .listen_addr
        .parse()
        .map_err(|e| format!("invalid listen_addr: {e}"))?;

    let app = build_app(cfg)?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("bind failed: {e}"))?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|e| format!("serve failed: {e}"))
}

pub fn build_app(cfg: Config) -> Result<Router, String> {
    let state = AppState::new(cfg)?;
    Ok(Router::new()
        .route("/healthz", get(healthz))
        .route("/receive", post(receive))
        .route("/send/{user}", post(send))
        .route("/send-travis/{user}", post(send_travis))
        .with_state(state))
}

#[derive(Clone)]
struct AppState {
    cfg: Arc<Config>,
    inbound_tokens: Arc<HashSet<String>>,
    client: Client,
}

impl AppState {
    fn new(cfg: Config) -> Result<Self, String> {
        let inbound_tokens: HashSet<String> = cfg
            .chat
            .tokens
            .split(';')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.http.timeout_ms))
            .build()
            .map_err(|e| format!("http client build failed: {e}"))?;
        Ok(Self {
            cfg: Arc::new(cfg),
            inbound_tokens: Arc::new(inbound_tokens),
            client,
        })
    }

    async fn route_message(
        &self,
        username: &str,
        channel_id: Option<&str>,
        text: &str,
    ) -> Result<String, AppError> {
        match kernel::classify_message(text) {
            RouteDecision::Echo => Ok(kernel::ECHO_REPLY.to_string()),
            RouteDecision::PassThroughLookup(key) => self.lookup(key).await,
            RouteDecision::IntentDriven => self.intent_reply(username, channel_id, text).await,
        }
    }

    // upstream failures become reply text, never an HTTP-level failure
    async fn lookup(&self, key: &str) -> Result<String, AppError> {
        let lookup = self
            .cfg
            .lookup
            .as_ref()
            .ok_or_else(|| AppError::Config("lookup service is not configured".to_string()))?;

        let url = format!(
            "{}{}",
            lookup.url,
            utf8_percent_encode(key, NON_ALPHANUMERIC)
        );
        let mut request = self.client.get(&url).header(header::ACCEPT, "text/plain");
        if let Some(secure_key) = &lookup.secure_key {
            request = request.header("secure-key", secure_key);
        }

        Ok(match request.send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => response
                .text()
                .await
                .unwrap_or_else(|_| kernel::LOOKUP_ERROR_REPLY.to_string()),
            Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => {
                format!("'{key}' not found")
            }
            Ok(response) => {
                tracing::warn!(status = %response.status(), "lookup service error");
                kernel::LOOKUP_ERROR_REPLY.to_string()
            }
            Err(e) => {
                tracing::warn!(error = %e, "lookup call failed");
                kernel::LOOKUP_ERROR_REPLY.to_string()
            }
        })
    }

    async fn intent_reply(
        &self,
        username: &str,
        channel_id: Option<&str>,
        text: &str,
    ) -> Result<String, AppError> {
        let token = channel_id
            .and_then(|id| self.cfg.nlu.client_tokens.get(id))
            .or_else(|| self.cfg.nlu.client_tokens.get("others"));
        let Some(token) = token else {
            // ruled out at startup validation
            tracing::error!("no nlu client token available");
            return Ok(kernel::NLU_ERROR_REPLY.to_string());
        };

        let query = json!({
            "query": [text],
            "timezone": "Europe/Paris",
            "lang": "fr",
            "sessionId": username,
        });
        let response = match self
            .client
            .post(&self.cfg.nlu.url)
            .bearer_auth(token)
            .json(&query)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "nlu call failed");
                return Ok(kernel::NLU_ERROR_REPLY.to_string());
            }
        };

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status != reqwest::StatusCode::OK {
            tracing::warn!(%status, body = %body, "nlu service error");
            return Ok(kernel::NLU_ERROR_REPLY.to_string());
        }

        let intent = match kernel::parse_intent_response(&body) {
            Ok(intent) => intent,
            Err(e) => {
                tracing::warn!(error = %e, body = %body, "unusable nlu response");
                return Ok(kernel::NLU_ERROR_REPLY.to_string());
            }
        };
        tracing::debug!(action = %intent.action, incomplete = intent.action_incomplete, "intent recognized");

        if intent.action.contains(&self.cfg.nlu.force_output_marker) || intent.action_incomplete {
            return Ok(intent.fulfillment_speech);
        }
        self.perform_action(&intent).await
    }

    async fn perform_action(&self, intent: &IntentResult) -> Result<String, AppError> {
        let target = self.cfg.actions.get(&intent.action).ok_or_else(|| {
            AppError::Config(format!("no action target configured for `{}`", intent.action))
        })?;

        let url = kernel::substitute_url_params(&target.url, &intent.parameters);
        // `-get` actions are reads; everything else posts the merged
        // parameters as a JSON body.
        let mut request = if intent.action.ends_with("-get") {
            self.client.get(&url)
        } else {
            self.client.post(&url).body(intent.parameters_json.clone())
        };
        request = request.header(header::ACCEPT, "text/plain");
        if let Some(secure_key) = &target.secure_key {
            request = request.header("secure-key", secure_key);
        }

        let service_body = match request.send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                match response.text().await {
                    Ok(body) => body,
                    Err(e) => {
                        tracing::warn!(action = %intent.action, error = %e, "action body read failed");
                        return Ok(format!("Service {} error", intent.action));
                    }
                }
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(action = %intent.action, %status, body = %body, "action service error");
                return Ok(format!("Service {} error", intent.action));
            }
            Err(e) => {
                tracing::warn!(action = %intent.action, error = %e, "action call failed");
                return Ok(format!("Service {} error", intent.action));
            }
        };

        let output_type = intent.output_type.as_deref();
        match kernel::render_action_reply(output_type, &intent.fulfillment_speech, &service_body) {
            Ok(reply) => Ok(reply),
            Err(kernel::UnknownOutputType(output_type)) => {
                tracing::error!(action = %intent.action, %output_type, "unmanaged output type");
                Ok(kernel::OUTPUT_ERROR_REPLY.to_string())
            }
        }
    }

    async fn deliver_chat(
        &self,
        user: &str,
        url_override: Option<&str>,
        message: &str,
    ) -> Result<bool, AppError> {
        let token = self.cfg.chat.user_tokens.get(user).ok_or_else(|| {
            AppError::Config(format!("no chat token configured for user `{user}`"))
        })?;
        let url = match url_override {
            Some(url) => url.to_string(),
            None => self.cfg.chat.url.replacen("%s", token, 1),
        };

        let body = kernel::encode_chat_send(message);
        Ok(match self.client.post(&url).body(body).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                let response_body = response.text().await.unwrap_or_default();
                // the platform reports rejections inside a 200 body
                if response_body.contains("error") {
                    tracing::warn!(user, body = %response_body, "chat platform rejected message");
                    false
                } else {
                    true
                }
            }
            Ok(response) => {
                tracing::warn!(user, status = %response.status(), "chat delivery failed");
                false
            }
            Err(e) => {
                tracing::warn!(user, error = %e, "chat delivery failed");
                false
            }
        })
    }

    // per request, no caching: the provider rotates keys
    async fn fetch_public_key(&self) -> Result<String, AppError> {
        let response = self
            .client
            .get(&self.cfg.travis.public_key_url)
            .send()
            .await
            .map_err(|e| AppError::NoAccess(format!("public key fetch failed: {e}")))?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(AppError::NoAccess(format!(
                "public key fetch returned {}",
                response.status()
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| AppError::NoAccess(format!("public key fetch failed: {e}")))?;

        let pattern = Regex::new(&self.cfg.travis.public_key_regexp)
            .map_err(|e| AppError::Config(format!("invalid travis.public_key_regexp: {e}")))?;
        let captured = pattern
            .captures(&body)
            .and_then(|c| c.get(1))
            .ok_or_else(|| {
                AppError::NoAccess("public key not found in discovery response".to_string())
            })?;
        Ok(captured.as_str().replace("\\n", "\n"))
    }
}

#[derive(Debug, Error)]
enum AppError {
    #[error("wrong request: {0}")]
    BadRequest(String),
    #[error("no access: {0}")]
    NoAccess(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // no_access and configuration details go to the log only
        let (status, code, message) = match self {
            AppError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "wrong_request", detail),
            AppError::NoAccess(detail) => {
                tracing::warn!(%detail, "access denied");
                (StatusCode::FORBIDDEN, "no_access", "access denied".to_string())
            }
            AppError::Config(detail) => {
                tracing::error!(%detail, "configuration error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "configuration",
                    "configuration error".to_string(),
                )
            }
        };
        (
            status,
            Json(ErrorResponse {
                error: ErrorBody {
                    code: code.to_string(),
                    message,
                },
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("malformed public key: {0}")]
    MalformedKey(String),
    #[error("signature mismatch")]
    Invalid,
}

/// RSA PKCS#1 v1.5 / SHA-1 over the raw payload bytes, signature in
/// standard base64.
pub fn verify_signature(
    public_key_pem: &str,
    payload: &[u8],
    signature_b64: &str,
) -> Result<(), SignatureError> {
    let signature = BASE64_STANDARD
        .decode(signature_b64)
        .map_err(|e| SignatureError::MalformedSignature(e.to_string()))?;
    let key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| SignatureError::MalformedKey(e.to_string()))?;
    let digest = Sha1::digest(payload);
    key.verify(Pkcs1v15Sign::new::<Sha1>(), &digest, &signature)
        .map_err(|_| SignatureError::Invalid)
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

#[derive(Debug, Deserialize)]
struct ReceiveParams {
    token: Option<String>,
    username: Option<String>,
    channel_id: Option<String>,
    text: Option<String>,
}

async fn receive(
    State(state): State<AppState>,
    Query(params): Query<ReceiveParams>,
) -> Result<Response, AppError> {
    let token = params
        .token
        .ok_or_else(|| AppError::BadRequest("token query parameter is required".to_string()))?;
    if !state.inbound_tokens.contains(&token) {
        return Err(AppError::NoAccess("unknown inbound webhook token".to_string()));
    }
    let username = params
        .username
        .ok_or_else(|| AppError::BadRequest("username query parameter is required".to_string()))?;
    let text = params
        .text
        .ok_or_else(|| AppError::BadRequest("text query parameter is required".to_string()))?;

    tracing::debug!(%username, channel_id = ?params.channel_id, "message received");
    let reply = state
        .route_message(&username, params.channel_id.as_deref(), &text)
        .await?;
    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        kernel::encode_chat_reply(&reply),
    )
        .into_response())
}

async fn send(
    State(state): State<AppState>,
    Path(user): Path<String>,
    body: String,
) -> Result<Json<Value>, AppError> {
    // JSON {message, url} or a bare-text body (older clients)
    let (message, url_override) = match serde_json::from_str::<DirectSendMessage>(&body) {
        Ok(parsed) => (parsed.message.unwrap_or_default(), parsed.url),
        Err(_) => (body, None),
    };
    if message.trim().is_empty() {
        return Err(AppError::BadRequest("message is empty".to_string()));
    }

    let delivered = state
        .deliver_chat(&user, url_override.as_deref(), &message)
        .await?;
    Ok(Json(
        json!({"status": if delivered { "sent" } else { "error" }}),
    ))
}

#[derive(Debug, Deserialize)]
struct BuildWebhookParams {
    payload: Option<String>,
}

async fn send_travis(
    State(state): State<AppState>,
    Path(user): Path<String>,
    Query(params): Query<BuildWebhookParams>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let payload = params
        .payload
        .ok_or_else(|| AppError::BadRequest("payload query parameter is required".to_string()))?;
    let signature = headers
        .get("Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::BadRequest("Signature header is required".to_string()))?;

    let pem = state.fetch_public_key().await?;
    verify_signature(&pem, payload.as_bytes(), signature)
        .map_err(|e| AppError::NoAccess(e.to_string()))?;

    let event =
        kernel::parse_build_event(&payload).map_err(|e| AppError::BadRequest(e.to_string()))?;
    let message =
        kernel::render_build_event(&event).map_err(|e| AppError::BadRequest(e.to_string()))?;

    let delivered = state.deliver_chat(&user, None, &message).await?;
    Ok(Json(
        json!({"status": if delivered { "sent" } else { "error" }}),
    ))
}
