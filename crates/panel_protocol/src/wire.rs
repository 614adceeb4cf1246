//! Frames exchanged between the supervisor and a worker.
//!
//! Upward (worker → supervisor) traffic is a stream of [`Upward`] requests;
//! downward traffic multiplexes the three logical queues of a worker (user
//! dispatch, replies, flow-control permits) onto one ordered stream of
//! [`ToWorker`] frames.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};

use crate::handle::{CallableRef, HandleId};
use crate::message::WorkerInit;
use crate::value::WireValue;

// -----------------------------------------------------------------------------
// Upward requests
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, IntoStaticStr)]
#[serde(tag = "op", rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UpwardOp {
    GetAttr {
        handle: HandleId,
        name: String,
    },
    SetAttr {
        handle: HandleId,
        name: String,
        value: WireValue,
    },
    CallHandle {
        handle: HandleId,
        #[serde(default)]
        args: Vec<WireValue>,
        #[serde(default)]
        kwargs: BTreeMap<String, WireValue>,
    },
    CallMethod {
        handle: HandleId,
        method: String,
        #[serde(default)]
        args: Vec<WireValue>,
        #[serde(default)]
        kwargs: BTreeMap<String, WireValue>,
    },
    CallMethodNoReturn {
        handle: HandleId,
        method: String,
        #[serde(default)]
        args: Vec<WireValue>,
        #[serde(default)]
        kwargs: BTreeMap<String, WireValue>,
    },
    DeleteHandle {
        handle: HandleId,
    },
}

impl UpwardOp {
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// Whether the worker blocks on a reply for this request.
    pub fn expects_reply(&self) -> bool {
        matches!(
            self,
            UpwardOp::GetAttr { .. } | UpwardOp::CallHandle { .. } | UpwardOp::CallMethod { .. }
        )
    }

    pub fn handle(&self) -> HandleId {
        match self {
            UpwardOp::GetAttr { handle, .. }
            | UpwardOp::SetAttr { handle, .. }
            | UpwardOp::CallHandle { handle, .. }
            | UpwardOp::CallMethod { handle, .. }
            | UpwardOp::CallMethodNoReturn { handle, .. }
            | UpwardOp::DeleteHandle { handle } => *handle,
        }
    }
}

/// One upward request. `seq` is echoed in the matching [`Reply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upward {
    pub seq: u64,
    #[serde(flatten)]
    pub op: UpwardOp,
}

// -----------------------------------------------------------------------------
// Replies and the cross-process error envelope
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RemoteErrorKind {
    Attribute,
    Type,
    Value,
    Index,
    Lookup,
    Marshal,
    Runtime,
}

/// Lightweight envelope for an error raised while servicing a request.
/// Only the kind and the rendered message survive the crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyOutcome {
    Value(WireValue),
    Error(RemoteError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub seq: u64,
    pub outcome: ReplyOutcome,
}

// -----------------------------------------------------------------------------
// Downward dispatch
// -----------------------------------------------------------------------------

/// Invoke a method on a worker-local specialty proxy, on the worker's main thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyCall {
    pub handle: HandleId,
    pub method: String,
    #[serde(default)]
    pub args: Vec<WireValue>,
}

impl ProxyCall {
    pub fn new(handle: HandleId, method: impl Into<String>, args: Vec<WireValue>) -> Self {
        Self {
            handle,
            method: method.into(),
            args,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dispatch {
    /// Call `module.function` with the widget handles bound by name.
    Invoke(CallableRef),
    ProxyCall(ProxyCall),
    /// Sentinel: stop the proxies and leave the receive loop.
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerPhase {
    Created,
    Importing,
    Running,
    Stopping,
    Dead,
}

// -----------------------------------------------------------------------------
// Frames
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum ToWorker {
    Init(WorkerInit),
    Dispatch(Dispatch),
    Reply(Reply),
    /// Return one flow-control permit to the worker.
    Permit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", content = "body", rename_all = "snake_case")]
pub enum ToSupervisor {
    Request(Upward),
    Phase(WorkerPhase),
    /// A module failed to import; the worker keeps running without it.
    ImportFailed { module: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_names_are_snake_case() {
        let op = UpwardOp::CallMethodNoReturn {
            handle: HandleId(1),
            method: "redraw".into(),
            args: vec![],
            kwargs: BTreeMap::new(),
        };
        assert_eq!(op.name(), "call_method_no_return");
        assert!(!op.expects_reply());
        assert!(UpwardOp::GetAttr { handle: HandleId(1), name: "x".into() }.expects_reply());
    }

    #[test]
    fn upward_request_flattens_op() {
        let req = Upward {
            seq: 9,
            op: UpwardOp::DeleteHandle { handle: HandleId(3) },
        };
        let s = serde_json::to_string(&req).unwrap();
        assert_eq!(s, r#"{"seq":9,"op":"delete_handle","handle":3}"#);
        let back: Upward = serde_json::from_str(&s).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn permit_frame_is_compact() {
        let s = serde_json::to_string(&ToWorker::Permit).unwrap();
        assert_eq!(s, r#"{"frame":"permit"}"#);
    }

    #[test]
    fn remote_error_renders_kind_and_message() {
        let e = RemoteError::new(RemoteErrorKind::Attribute, "no attribute `nope`");
        assert_eq!(e.to_string(), "attribute error: no attribute `nope`");
    }
}
