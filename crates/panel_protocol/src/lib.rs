pub mod codec;
pub mod error;
pub mod flow;
pub mod handle;
pub mod message;
pub mod value;
pub mod wire;

pub use error::ProtocolError;
pub use flow::{FlowControl, DEFAULT_PERMITS};
pub use handle::{CallableRef, HandleId, HandleRef, WorkerId};
pub use message::{LogLevel, ProxyKind, WidgetPrototype, WorkerInit};
pub use value::{NdArray, WireValue};
pub use wire::{
    Dispatch, ProxyCall, RemoteError, RemoteErrorKind, Reply, ReplyOutcome, ToSupervisor,
    ToWorker, Upward, UpwardOp, WorkerPhase,
};
