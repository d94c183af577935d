use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// CI build-status webhook payload, as posted by the provider.
///
/// Every field is optional on the wire; rendering decides which absences
/// are fatal. Unknown fields (the real payloads carry dozens) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildEvent {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub repository: Option<BuildRepository>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildRepository {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Raw NLU-service response (api.ai v1 shape). Only the fields the
/// router consumes are modeled.
#[derive(Debug, Clone, Deserialize)]
pub struct NluResponse {
    #[serde(default)]
    pub result: Option<NluResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NluResult {
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default, rename = "actionIncomplete")]
    pub action_incomplete: bool,
    #[serde(default)]
    pub fulfillment: Option<NluFulfillment>,
    #[serde(default)]
    pub parameters: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub contexts: Option<Vec<NluContext>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NluFulfillment {
    #[serde(default)]
    pub speech: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NluContext {
    #[serde(default)]
    pub parameters: Option<BTreeMap<String, String>>,
}

/// Normalized intent, derived from [`NluResponse`] once per request.
///
/// `parameters` is the effective map (top-level first, context entries
/// override in array order) and `parameters_json` its compact JSON
/// serialization, computed once at parse time and reused for action
/// bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntentResult {
    pub action: String,
    pub action_incomplete: bool,
    pub fulfillment_speech: String,
    /// Reply mode, taken from the top-level parameter map only; context
    /// entries never change it.
    pub output_type: Option<String>,
    pub parameters: BTreeMap<String, String>,
    pub parameters_json: String,
}

/// JSON body accepted by the direct-send route.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectSendMessage {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
