use chatrelay_contracts::{BuildEvent, IntentResult, NluResponse};
use once_cell::sync::Lazy;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use regex::Regex;
use std::collections::BTreeMap;
use thiserror::Error;

pub const ECHO_REPLY: &str = "echo from bot service";
pub const NLU_ERROR_REPLY: &str = "ChatBot-API error";
pub const OUTPUT_ERROR_REPLY: &str = "ChatBot-API error (output management)";
pub const LOOKUP_ERROR_REPLY: &str = "Lookup-service error";

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("invalid payload: {0}")]
    Invalid(&'static str),
}

/// How an inbound chat message is handled, decided from its prefix only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteDecision<'a> {
    Echo,
    PassThroughLookup(&'a str),
    IntentDriven,
}

pub fn classify_message(text: &str) -> RouteDecision<'_> {
    if text.starts_with("echo") {
        RouteDecision::Echo
    } else if let Some(key) = text.strip_prefix("pass ") {
        RouteDecision::PassThroughLookup(key)
    } else {
        RouteDecision::IntentDriven
    }
}

pub fn parse_build_event(json_body: &str) -> Result<BuildEvent, PayloadError> {
    serde_json::from_str(json_body).map_err(|e| PayloadError::Malformed(e.to_string()))
}

/// Renders a build event as a chat status line. The `<url|text>` markup
/// is the chat platform's hyperlink convention.
pub fn render_build_event(event: &BuildEvent) -> Result<String, PayloadError> {
    let repository = event
        .repository
        .as_ref()
        .ok_or(PayloadError::Invalid("payload has no repository"))?;
    let name = repository
        .name
        .as_deref()
        .ok_or(PayloadError::Invalid("repository has no name"))?;
    let url = repository
        .url
        .as_deref()
        .ok_or(PayloadError::Invalid("repository has no url"))?;

    if event.status == 0 {
        return Ok(format!("Build success of {name}"));
    }
    let status_message = event.status_message.as_deref().unwrap_or_default();
    let author = event.author_name.as_deref().unwrap_or_default();
    let message = event.message.as_deref().unwrap_or_default();
    Ok(format!(
        "Build <{url}|{status_message}> of {name}: [{author}] {message}"
    ))
}

/// Parses an NLU response into a normalized intent. Fails closed when
/// `result`, `action` or `fulfillment.speech` is missing.
pub fn parse_intent_response(json_body: &str) -> Result<IntentResult, PayloadError> {
    let response: NluResponse =
        serde_json::from_str(json_body).map_err(|e| PayloadError::Malformed(e.to_string()))?;
    let result = response
        .result
        .ok_or(PayloadError::Invalid("response has no result"))?;
    let action = result
        .action
        .ok_or(PayloadError::Invalid("result has no action"))?;
    let fulfillment_speech = result
        .fulfillment
        .and_then(|f| f.speech)
        .ok_or(PayloadError::Invalid("result has no fulfillment speech"))?;

    // Top-level parameters first, context entries override in array order.
    // The reply mode is pinned before the merge: only the top-level map
    // may set it.
    let mut parameters: BTreeMap<String, String> = result.parameters.unwrap_or_default();
    let output_type = parameters.get("outputType").cloned();
    for context in result.contexts.unwrap_or_default() {
        if let Some(context_parameters) = context.parameters {
            parameters.extend(context_parameters);
        }
    }
    let parameters_json = serde_json::to_string(&parameters)
        .map_err(|e| PayloadError::Malformed(e.to_string()))?;

    Ok(IntentResult {
        action,
        action_incomplete: result.action_incomplete,
        fulfillment_speech,
        output_type,
        parameters,
        parameters_json,
    })
}

/// Replaces `:name` placeholders with percent-encoded parameter values.
pub fn substitute_url_params(url: &str, parameters: &BTreeMap<String, String>) -> String {
    let mut url = url.to_string();
    for (key, value) in parameters {
        let placeholder = format!(":{key}");
        if url.contains(&placeholder) {
            let encoded = utf8_percent_encode(value, NON_ALPHANUMERIC).to_string();
            url = url.replace(&placeholder, &encoded);
        }
    }
    url
}

/// Positional template: the first `%s` is replaced with the value.
pub fn fill_text_template(template: &str, value: &str) -> String {
    template.replacen("%s", value, 1)
}

static TOKEN_TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{(\w+)\}").expect("token template regex"));

/// `${token}` template resolved by a flat first-match `"token": "value"`
/// scan of the body. Not a JSON parser; unresolved tokens stay in place.
pub fn fill_json_template(template: &str, json_value: &str) -> String {
    let mut filled = template.to_string();
    for capture in TOKEN_TEMPLATE.captures_iter(template) {
        let token = &capture[1];
        let value_pattern = format!("\"{}\"\\s*:\\s*\"(.*)\"", regex::escape(token));
        let Ok(value_regex) = Regex::new(&value_pattern) else {
            continue;
        };
        if let Some(value_capture) = value_regex.captures(json_value) {
            filled = filled.replace(&format!("${{{token}}}"), &value_capture[1]);
        }
    }
    filled
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownOutputType(pub String);

/// Picks the reply for a completed action from its `outputType` (absent
/// means `service-message`).
pub fn render_action_reply(
    output_type: Option<&str>,
    speech: &str,
    service_body: &str,
) -> Result<String, UnknownOutputType> {
    match output_type.unwrap_or("service-message") {
        "none" => Ok(String::new()),
        "service-message" => Ok(if service_body.is_empty() {
            speech.to_string()
        } else {
            service_body.to_string()
        }),
        "bot-message" => Ok(speech.to_string()),
        "bot-text-template" => Ok(fill_text_template(speech, service_body)),
        "bot-json-template" => Ok(fill_json_template(speech, service_body)),
        other => Err(UnknownOutputType(other.to_string())),
    }
}

/// Inbound reply encoding: only newlines are escaped.
pub fn encode_chat_reply(text: &str) -> String {
    format!("{{\"text\": \"{}\"}}", text.replace('\n', "\\n"))
}

/// Outbound send encoding: `payload=` plus the reply encoding. Every
/// double quote is escaped only when the text contains a quote directly
/// followed by a closing parenthesis.
pub fn encode_chat_send(text: &str) -> String {
    let text = if text.contains("\")") {
        text.replace('"', "\\\"")
    } else {
        text.to_string()
    };
    format!("payload={}", encode_chat_reply(&text))
}
