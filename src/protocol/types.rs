//! Job socket wire types

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Correlation id allocated by the session channel at transmit time
pub type RequestId = u64;

/// Reserved `id` values the server uses for session-level frames
pub const INITIALIZE_ID: &str = "initialize";
pub const ERROR_ID: &str = "ERROR";
pub const NOTIFICATION_ID: &str = "notification";
pub const WARNING_ID: &str = "warning";

/// A task to run on the backend, before it is stamped with an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub module: String,
    pub task: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl TaskRequest {
    /// Create a request with an empty parameter map
    pub fn new(module: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            task: task.into(),
            parameters: Map::new(),
        }
    }

    /// Replace the parameter map
    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Add a single parameter
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Reject requests that would reach the server without a target
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.module.trim().is_empty() {
            return Err(ProtocolError::InvalidRequest(format!(
                "module must not be empty (task: {:?})",
                self.task
            )));
        }
        if self.task.trim().is_empty() {
            return Err(ProtocolError::InvalidRequest(format!(
                "task must not be empty (module: {:?})",
                self.module
            )));
        }
        Ok(())
    }

    /// `module.task` label used in logs
    pub fn label(&self) -> String {
        format!("{}.{}", self.module, self.task)
    }
}

/// Identity stamped onto every transmitted request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskId {
    pub user_id: String,
    pub session_id: String,
    pub request_id: RequestId,
}

/// Request as it goes over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub module: String,
    pub task: String,
    pub parameters: Map<String, Value>,
    pub id: TaskId,
}

impl OutboundFrame {
    /// Stamp a request with its transmit-time identity
    pub fn stamp(request: TaskRequest, id: TaskId) -> Self {
        Self {
            module: request.module,
            task: request.task,
            parameters: request.parameters,
            id,
        }
    }

    /// Serialize to a single text message
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Inbound frame with its correlation fields lifted out
///
/// `kind` is the frame's `id` string. `body` holds every other key except
/// `request_id`, so task-specific payload stays reachable.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub kind: String,
    pub request_id: Option<RequestId>,
    pub body: Map<String, Value>,
}

impl Response {
    /// Look up a payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// True when `progress_update` is present and truthy
    pub fn is_progress_update(&self) -> bool {
        self.body.get("progress_update").is_some_and(is_truthy)
    }

    /// Explicit `finished` flag, if the server sent one
    pub fn finished(&self) -> Option<bool> {
        match self.body.get("finished") {
            Some(Value::Null) | None => None,
            Some(value) => Some(is_truthy(value)),
        }
    }

    /// Whether this frame ends its request under the given policy
    pub fn is_terminal(&self, policy: TerminalPolicy) -> bool {
        if let Some(finished) = self.finished() {
            return finished;
        }
        match policy {
            TerminalPolicy::ProgressFlag => !self.is_progress_update(),
            TerminalPolicy::ExplicitFinish => false,
        }
    }

    /// Human-readable text of an ERROR/notification/warning frame
    pub fn message(&self) -> Option<&str> {
        ["error", "msg", "warning"]
            .iter()
            .find_map(|key| self.body.get(*key).and_then(Value::as_str))
    }

    /// Rebuild the JSON object as received
    pub fn to_value(&self) -> Value {
        let mut object = self.body.clone();
        object.insert("id".to_string(), Value::String(self.kind.clone()));
        if let Some(request_id) = self.request_id {
            object.insert("request_id".to_string(), Value::from(request_id));
        }
        Value::Object(object)
    }
}

/// Session identity carried by the `initialize` frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInit {
    pub user_id: String,
    pub session_id: String,
}

/// Reserved control frames
#[derive(Debug, Clone, PartialEq)]
pub enum ControlFrame {
    Initialize(SessionInit),
    Error(Response),
    Notification(Response),
    Warning(Response),
}

impl ControlFrame {
    /// Control frame kind, for logging and handler lookup
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlFrame::Initialize(_) => ControlKind::Initialize,
            ControlFrame::Error(_) => ControlKind::Error,
            ControlFrame::Notification(_) => ControlKind::Notification,
            ControlFrame::Warning(_) => ControlKind::Warning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Initialize,
    Error,
    Notification,
    Warning,
}

impl ControlKind {
    /// Map a frame `id` onto a reserved kind
    pub fn classify(id: &str) -> Option<Self> {
        match id {
            INITIALIZE_ID => Some(ControlKind::Initialize),
            ERROR_ID => Some(ControlKind::Error),
            NOTIFICATION_ID => Some(ControlKind::Notification),
            WARNING_ID => Some(ControlKind::Warning),
            _ => None,
        }
    }
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControlKind::Initialize => INITIALIZE_ID,
            ControlKind::Error => ERROR_ID,
            ControlKind::Notification => NOTIFICATION_ID,
            ControlKind::Warning => WARNING_ID,
        };
        f.write_str(name)
    }
}

/// Every inbound frame is exactly one of these
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Control(ControlFrame),
    Result(Response),
}

impl ServerFrame {
    /// Decode one text message
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// Classify an already-decoded JSON value
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(mut body) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        let kind = match body.remove("id") {
            Some(Value::String(kind)) => kind,
            Some(other) => {
                return Err(ProtocolError::InvalidField {
                    field: "id",
                    reason: format!("expected a string, got {}", other),
                });
            }
            None => return Err(ProtocolError::MissingField("id")),
        };

        let request_id = match body.remove("request_id") {
            None | Some(Value::Null) => None,
            Some(value) => Some(parse_request_id(&value)?),
        };

        let Some(control) = ControlKind::classify(&kind) else {
            return Ok(ServerFrame::Result(Response {
                kind,
                request_id,
                body,
            }));
        };

        let frame = match control {
            ControlKind::Initialize => ControlFrame::Initialize(SessionInit {
                user_id: id_string(&body, "user_id")?,
                session_id: id_string(&body, "session_id")?,
            }),
            ControlKind::Error => ControlFrame::Error(Response {
                kind,
                request_id,
                body,
            }),
            ControlKind::Notification => ControlFrame::Notification(Response {
                kind,
                request_id,
                body,
            }),
            ControlKind::Warning => ControlFrame::Warning(Response {
                kind,
                request_id,
                body,
            }),
        };

        Ok(ServerFrame::Control(frame))
    }
}

/// Accept `request_id` as a JSON number or a numeric string
fn parse_request_id(value: &Value) -> Result<RequestId, ProtocolError> {
    let parsed = match value {
        Value::Number(number) => number.as_u64(),
        Value::String(text) => text.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| ProtocolError::InvalidField {
        field: "request_id",
        reason: format!("expected a non-negative integer, got {}", value),
    })
}

fn id_string(body: &Map<String, Value>, field: &'static str) -> Result<String, ProtocolError> {
    let text = match body.get(field) {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Number(number)) => number.to_string(),
        Some(other) => {
            return Err(ProtocolError::InvalidField {
                field,
                reason: format!("expected a string, got {}", other),
            });
        }
        None => return Err(ProtocolError::MissingField(field)),
    };
    if text.is_empty() {
        return Err(ProtocolError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(text)
}

/// JSON truthiness: null, false, 0 and "" are falsy
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// How the channel decides a response frame is the last for its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalPolicy {
    /// Terminal unless `progress_update` is truthy; explicit `finished` wins
    #[default]
    ProgressFlag,
    /// Only `finished: true` is terminal
    ExplicitFinish,
}

impl FromStr for TerminalPolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "progress_flag" => Ok(TerminalPolicy::ProgressFlag),
            "explicit_finish" => Ok(TerminalPolicy::ExplicitFinish),
            other => Err(ProtocolError::InvalidField {
                field: "terminal_policy",
                reason: format!("unknown policy {:?}", other),
            }),
        }
    }
}

/// Error types for frame encoding and decoding
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Frame is not a JSON object")]
    NotAnObject,
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    #[error("Invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}
