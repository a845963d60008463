//! Wire protocol for worker communication.
//!
//! Messages are JSON-serialized and framed by the transport layer.

use crate::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

/// Procedure name for graceful shutdown requests.
pub const PROC_EXIT: &str = "_exit";
/// Procedure name for infrastructure-level exception messages.
pub const PROC_EXCEPTION: &str = "_exception";
/// Procedure name for task dispatch.
pub const PROC_RUN: &str = "run";

/// Monotonic message id source, local to each process.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Structured error crossing the process boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorRecord {
    /// Error class or type name.
    pub class: String,
    /// Error message.
    pub message: String,
    /// Textual backtrace, if one was captured.
    pub trace: String,
}

impl ErrorRecord {
    /// Create a new error record.
    pub fn new(
        class: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Capture a boxed error from worker code.
    pub fn from_error(err: &(dyn std::error::Error + 'static)) -> Self {
        Self::new("WorkerError", err.to_string(), String::new())
    }

    /// Capture a panic payload from `catch_unwind`.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker panicked".to_string()
        };
        Self::new("Panic", message, String::new())
    }
}

/// Message body variants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    /// No payload (also the "no result" response).
    None,
    /// Task input or task output data.
    Data { value: Value },
    /// An error raised by worker code while handling a task.
    WorkerError { error: ErrorRecord },
    /// An infrastructure error raised by the pool machinery.
    PoolError { error: ErrorRecord },
    /// Synthesized notice that the peer process terminated.
    Terminated { pid: i32, exit_status: i32 },
}

/// Envelope for every frame exchanged between parent and worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Procedure name; names starting with '_' are reserved for the protocol.
    pub procedure: String,
    /// Message body.
    pub payload: Payload,
    /// Monotonic id used to match responses to requests.
    pub id: u64,
    /// Pid of the originating process.
    pub pid: i32,
    /// Whether the sender will not wait for the response.
    pub asynchronous: bool,
}

impl Message {
    /// Create a request message.
    ///
    /// Fails if the procedure name starts with the reserved '_' prefix.
    pub fn request(procedure: impl Into<String>, payload: Payload, asynchronous: bool) -> Result<Self> {
        let procedure = procedure.into();
        if procedure.starts_with('_') {
            return Err(PoolError::ReservedProcedure(procedure));
        }
        Ok(Self::internal(procedure, payload, asynchronous))
    }

    /// Create a protocol message, bypassing the reserved-prefix check.
    fn internal(procedure: String, payload: Payload, asynchronous: bool) -> Self {
        Self {
            procedure,
            payload,
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            pid: std::process::id() as i32,
            asynchronous,
        }
    }

    /// Create a graceful shutdown request.
    pub fn exit() -> Self {
        Self::internal(PROC_EXIT.to_string(), Payload::None, true)
    }

    /// Create an infrastructure exception message.
    pub fn exception(payload: Payload) -> Self {
        Self::internal(PROC_EXCEPTION.to_string(), payload, true)
    }

    /// Build the response to this message.
    ///
    /// The response keeps the request's id, procedure and async flag; the
    /// pid becomes the responder's.
    pub fn respond(&self, payload: Payload) -> Self {
        Self {
            procedure: self.procedure.clone(),
            payload,
            id: self.id,
            pid: std::process::id() as i32,
            asynchronous: self.asynchronous,
        }
    }

    /// Re-attribute a synthesized message to another process.
    pub fn override_pid(mut self, pid: i32) -> Self {
        self.pid = pid;
        self
    }

    /// Is this a shutdown request?
    pub fn is_exit(&self) -> bool {
        self.procedure == PROC_EXIT
    }

    /// Is this an exception message?
    pub fn is_exception(&self) -> bool {
        self.procedure == PROC_EXCEPTION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_rejects_reserved_prefix() {
        let err = Message::request("_exit", Payload::None, false).unwrap_err();
        assert!(matches!(err, PoolError::ReservedProcedure(_)));
        assert!(err.to_string().contains("_exit"));
    }

    #[test]
    fn test_request_ids_are_monotonic() {
        let a = Message::request("run", Payload::None, false).unwrap();
        let b = Message::request("run", Payload::None, false).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn test_respond_preserves_id_and_async_flag() {
        let req = Message::request(
            "run",
            Payload::Data {
                value: json!({"n": 1}),
            },
            true,
        )
        .unwrap();
        let resp = req.respond(Payload::Data { value: json!(2) });
        assert_eq!(resp.id, req.id);
        assert_eq!(resp.procedure, "run");
        assert!(resp.asynchronous);
    }

    #[test]
    fn test_sentinels() {
        assert!(Message::exit().is_exit());
        let exc = Message::exception(Payload::Terminated {
            pid: 42,
            exit_status: 1,
        });
        assert!(exc.is_exception());
        assert!(!exc.is_exit());
    }

    #[test]
    fn test_override_pid() {
        let msg = Message::exception(Payload::None).override_pid(1234);
        assert_eq!(msg.pid, 1234);
    }

    #[test]
    fn test_message_serialization() {
        let msg = Message::request(
            "run",
            Payload::Data {
                value: json!([1, 2, 3]),
            },
            false,
        )
        .unwrap();
        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"procedure\":\"run\""));

        let decoded: Message = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.payload, msg.payload);
    }

    #[test]
    fn test_payload_tagged_encoding() {
        let payload = Payload::WorkerError {
            error: ErrorRecord::new("Panic", "boom", ""),
        };
        let encoded = serde_json::to_string(&payload).unwrap();
        assert!(encoded.contains("\"kind\":\"worker_error\""));

        let decoded: Payload = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_error_record_from_panic_str() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let record = ErrorRecord::from_panic(payload.as_ref());
        assert_eq!(record.class, "Panic");
        assert_eq!(record.message, "boom");
    }
}
