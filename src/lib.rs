//! labpanel: widget panels for lab instruments.
//!
//! The supervisor owns every widget and services requests on a single UI
//! thread. Each open app gets a worker (a child process or, for tests, a
//! thread) that runs the app's Rhai modules and reaches the widgets only
//! through remote handles.

pub mod config;
pub mod layout;
pub mod logger;
pub mod runtime;
pub mod supervisor;
pub mod widgets;
pub mod worker;
