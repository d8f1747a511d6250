//! Wire protocol for the broker socket.
//!
//! One UTF-8 JSON record per line in both directions. Requests are decoded
//! into [`Operation`] here, so malformed calls are answered with
//! `INVALID_PARAMS` / `UNKNOWN_TOOL` before they reach the coordinator.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UnknownTool,
    InvalidParams,
    UnknownWorker,
    TaskMismatch,
    DuplicateTask,
    Timeout,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UnknownTool => "UNKNOWN_TOOL",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::UnknownWorker => "UNKNOWN_WORKER",
            ErrorCode::TaskMismatch => "TASK_MISMATCH",
            ErrorCode::DuplicateTask => "DUPLICATE_TASK",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

/// A decoded request. `id` is opaque and echoed back untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: Value,
    pub operation: Operation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Register { name: String },
    Poll { name: String, timeout_ms: Option<u64> },
    Ack { name: String, task_id: String },
    Done { task_id: String },
    Failed { task_id: String, reason: String },
    Submit { task_id: String },
    GetStatus,
    ResetWorker { name: String },
    RetryTask { task_id: String },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Register { .. } => "register",
            Operation::Poll { .. } => "poll",
            Operation::Ack { .. } => "ack",
            Operation::Done { .. } => "done",
            Operation::Failed { .. } => "failed",
            Operation::Submit { .. } => "submit",
            Operation::GetStatus => "get_status",
            Operation::ResetWorker { .. } => "reset_worker",
            Operation::RetryTask { .. } => "retry_task",
        }
    }
}

/// Decoding failure, carrying whatever id could be recovered from the record.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeError {
    pub id: Value,
    pub code: ErrorCode,
    pub message: String,
}

impl DecodeError {
    fn invalid(id: &Value, message: impl Into<String>) -> Self {
        Self {
            id: id.clone(),
            code: ErrorCode::InvalidParams,
            message: message.into(),
        }
    }
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct PollParams {
    name: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Deserialize)]
struct AckParams {
    name: String,
    task_id: String,
}

#[derive(Deserialize)]
struct TaskParams {
    task_id: String,
}

#[derive(Deserialize)]
struct FailedParams {
    task_id: String,
    reason: String,
}

pub fn decode_request(record: &[u8]) -> Result<Request, DecodeError> {
    let value: Value = serde_json::from_slice(record)
        .map_err(|err| DecodeError::invalid(&Value::Null, format!("malformed record: {err}")))?;

    let Value::Object(mut fields) = value else {
        return Err(DecodeError::invalid(
            &Value::Null,
            "request must be a JSON object",
        ));
    };

    let id = fields.remove("id").unwrap_or(Value::Null);
    if !(id.is_string() || id.is_number()) {
        return Err(DecodeError::invalid(
            &id,
            "request id must be a string or a number",
        ));
    }

    let operation = match fields.remove("operation").or_else(|| fields.remove("tool")) {
        Some(Value::String(op)) => op,
        Some(_) => return Err(DecodeError::invalid(&id, "operation must be a string")),
        None => return Err(DecodeError::invalid(&id, "missing operation")),
    };

    let params = match fields.remove("params") {
        None | Some(Value::Null) => Value::Object(Default::default()),
        Some(obj @ Value::Object(_)) => obj,
        Some(_) => return Err(DecodeError::invalid(&id, "params must be an object")),
    };

    let operation = decode_operation(&id, &operation, params)?;
    Ok(Request { id, operation })
}

fn decode_operation(id: &Value, op: &str, params: Value) -> Result<Operation, DecodeError> {
    let operation = match op {
        "register" => {
            let p: NameParams = parse_params(id, op, params)?;
            Operation::Register {
                name: required(id, "name", p.name)?,
            }
        }
        "poll" => {
            let p: PollParams = parse_params(id, op, params)?;
            Operation::Poll {
                name: required(id, "name", p.name)?,
                timeout_ms: p.timeout_ms,
            }
        }
        "ack" => {
            let p: AckParams = parse_params(id, op, params)?;
            Operation::Ack {
                name: required(id, "name", p.name)?,
                task_id: required(id, "task_id", p.task_id)?,
            }
        }
        "done" => {
            let p: TaskParams = parse_params(id, op, params)?;
            Operation::Done {
                task_id: required(id, "task_id", p.task_id)?,
            }
        }
        "failed" => {
            let p: FailedParams = parse_params(id, op, params)?;
            Operation::Failed {
                task_id: required(id, "task_id", p.task_id)?,
                reason: required(id, "reason", p.reason)?,
            }
        }
        "submit" => {
            let p: TaskParams = parse_params(id, op, params)?;
            Operation::Submit {
                task_id: required(id, "task_id", p.task_id)?,
            }
        }
        "get_status" => Operation::GetStatus,
        "reset_worker" => {
            let p: NameParams = parse_params(id, op, params)?;
            Operation::ResetWorker {
                name: required(id, "name", p.name)?,
            }
        }
        "retry_task" => {
            let p: TaskParams = parse_params(id, op, params)?;
            Operation::RetryTask {
                task_id: required(id, "task_id", p.task_id)?,
            }
        }
        other => {
            return Err(DecodeError {
                id: id.clone(),
                code: ErrorCode::UnknownTool,
                message: format!("unknown operation '{other}'"),
            })
        }
    };
    Ok(operation)
}

fn parse_params<T: DeserializeOwned>(id: &Value, op: &str, params: Value) -> Result<T, DecodeError> {
    serde_json::from_value(params)
        .map_err(|err| DecodeError::invalid(id, format!("invalid params for {op}: {err}")))
}

/// Blank values are rejected; anything else passes through untouched.
fn required(id: &Value, field: &str, value: String) -> Result<String, DecodeError> {
    if value.trim().is_empty() {
        return Err(DecodeError::invalid(id, format!("{field} must be non-empty")));
    }
    Ok(value)
}

/// Response record. Exactly one of `data` or `error_code`/`message` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub fn ok(id: Value, data: Value) -> Self {
        Self {
            id,
            success: true,
            data: Some(data),
            error_code: None,
            message: None,
        }
    }

    pub fn error(id: Value, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error_code: Some(code),
            message: Some(message.into()),
        }
    }
}

impl From<DecodeError> for Response {
    fn from(err: DecodeError) -> Self {
        Response::error(err.id, err.code, err.message)
    }
}

/// Unsolicited record pushed to every open connection (no `id`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNotice {
    pub event: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_timeout_ms: Option<u64>,
}

impl ServerNotice {
    pub fn shutdown(drain_timeout_ms: u64) -> Self {
        Self {
            event: "shutdown".to_string(),
            message: "broker is shutting down; finish in-flight calls and reconnect later"
                .to_string(),
            drain_timeout_ms: Some(drain_timeout_ms),
        }
    }
}

/// Serialize any record as a single newline-terminated line.
pub fn encode_line<T: Serialize>(record: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> Result<Request, DecodeError> {
        decode_request(value.to_string().as_bytes())
    }

    #[test]
    fn decodes_every_operation() {
        let req = decode(json!({"id": 1, "operation": "poll", "params": {"name": "w1", "timeout_ms": 100}}))
            .unwrap();
        assert_eq!(req.id, json!(1));
        assert_eq!(
            req.operation,
            Operation::Poll {
                name: "w1".into(),
                timeout_ms: Some(100)
            }
        );

        let req = decode(json!({"id": "a", "operation": "get_status"})).unwrap();
        assert_eq!(req.operation, Operation::GetStatus);

        let req = decode(json!({"id": "b", "tool": "failed", "params": {"task_id": "bd-1", "reason": "tests red"}}))
            .unwrap();
        assert_eq!(
            req.operation,
            Operation::Failed {
                task_id: "bd-1".into(),
                reason: "tests red".into()
            }
        );
    }

    #[test]
    fn unknown_operation_is_unknown_tool() {
        let err = decode(json!({"id": 7, "operation": "explode"})).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownTool);
        assert_eq!(err.id, json!(7));
    }

    #[test]
    fn missing_or_blank_params_are_invalid() {
        let err = decode(json!({"id": 1, "operation": "register", "params": {}})).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);

        let err = decode(json!({"id": 2, "operation": "register", "params": {"name": "  "}}))
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
        assert!(err.message.contains("name"));

        let err = decode(json!({"id": 3, "operation": "ack", "params": {"name": "w"}})).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
        assert_eq!(err.id, json!(3));
    }

    #[test]
    fn padded_values_are_not_rewritten() {
        let req = decode(json!({"id": 4, "operation": "register", "params": {"name": " w1 "}}))
            .unwrap();
        assert_eq!(req.operation, Operation::Register { name: " w1 ".into() });

        let req = decode(json!({"id": 5, "operation": "submit", "params": {"task_id": " bd-1"}}))
            .unwrap();
        assert_eq!(req.operation, Operation::Submit { task_id: " bd-1".into() });
    }

    #[test]
    fn garbage_record_has_null_id() {
        let err = decode_request(b"{not json").unwrap_err();
        assert_eq!(err.id, Value::Null);
        assert_eq!(err.code, ErrorCode::InvalidParams);

        let err = decode(json!({"operation": "get_status"})).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidParams);
    }

    #[test]
    fn error_response_shape() {
        let resp = Response::error(json!("x"), ErrorCode::TaskMismatch, "nope");
        let encoded: Value = serde_json::from_str(&encode_line(&resp).unwrap()).unwrap();
        assert_eq!(
            encoded,
            json!({"id": "x", "success": false, "error_code": "TASK_MISMATCH", "message": "nope"})
        );
    }
}
