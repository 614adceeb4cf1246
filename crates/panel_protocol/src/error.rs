use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error on transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid callable reference `{0}`, expected `module.function`")]
    BadCallable(String),

    #[error("array shape {shape:?} does not match {len} elements")]
    Shape { shape: Vec<usize>, len: usize },

    #[error("transport closed")]
    Closed,
}
