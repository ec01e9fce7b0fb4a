//! Canonical reply.
//!
//! On the wire a reply is `{success: true, data}` or `{code, error}`; the
//! presence of a non-zero `code` is the only discriminant. System
//! acknowledgements (handshake) are plain objects passed through verbatim.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::types::Error;

pub const NO_SUCH_SERVICE: &str = "No such service";
pub const EMPTY_TARGET_PATH: &str = "empty target path";
pub const MISSING_HANDLER: &str = "Missing Handler";
pub const SERVICE_DOWN: &str = "service down...";
pub const WORKER_DOWN: &str = "worker down...";
pub const SERVICE_TIMEOUT: &str = "service timeout...";
pub const NODE_FAILURE: &str = "something wrong inside worker node...";

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Success(Value),
    Failure { code: u16, error: String },
    /// Verbatim acknowledgement object, e.g. `{success, nodeID}`.
    Ack(Value),
}

impl Reply {
    pub fn success(data: impl Into<Value>) -> Self {
        Reply::Success(data.into())
    }

    pub fn failure(code: u16, error: impl Into<String>) -> Self {
        Reply::Failure {
            code,
            error: error.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::failure(404, NO_SUCH_SERVICE)
    }

    pub fn service_down() -> Self {
        Self::failure(500, SERVICE_DOWN)
    }

    /// The execution unit serving the call died.
    pub fn worker_down() -> Self {
        Self::failure(500, WORKER_DOWN)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Failure { .. })
    }

    pub fn code(&self) -> Option<u16> {
        match self {
            Reply::Failure { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Downgrade an internal error to an error-coded reply.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Remote { code, error } => Self::failure(*code, error.clone()),
            other => Self::failure(other.reply_code(), other.to_string()),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Reply::Success(data) => json!({ "success": true, "data": data }),
            Reply::Failure { code, error } => json!({ "code": code, "error": error }),
            Reply::Ack(value) => value.clone(),
        }
    }

    /// Reply object with the caller's `rid` echoed back.
    pub fn to_frame(&self, rid: Option<&str>) -> Value {
        let mut value = self.to_value();
        if let (Some(rid), Value::Object(map)) = (rid, &mut value) {
            map.insert("rid".to_string(), Value::String(rid.to_string()));
        }
        value
    }

    pub fn from_value(value: Value) -> Self {
        let Value::Object(map) = value else {
            return Reply::Success(value);
        };
        if let Some(code) = map.get("code").and_then(Value::as_u64).filter(|c| *c != 0) {
            let error = map
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            return Reply::Failure {
                code: u16::try_from(code).unwrap_or(500),
                error,
            };
        }
        Self::from_map(map)
    }

    fn from_map(mut map: Map<String, Value>) -> Self {
        let is_data_reply = map.get("success").and_then(Value::as_bool) == Some(true)
            && map.contains_key("data");
        if is_data_reply {
            Reply::Success(map.remove("data").unwrap_or(Value::Null))
        } else {
            Reply::Ack(Value::Object(map))
        }
    }
}

impl Serialize for Reply {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Reply {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Reply::from_value)
    }
}
