//! Shell proxy: evaluates lines typed into a shell widget.
//!
//! Lines arrive from the supervisor as `push_line` proxy calls and are handed
//! to a session thread with its own engine and a scope that persists across
//! lines. Widgets are in scope by id. An unfinished statement switches the
//! prompt to the continuation prompt and keeps accumulating.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use panel_protocol::{HandleId, UpwardOp, WireValue};
use rhai::{AST, Dynamic, Engine, Map, ParseError, ParseErrorType, Scope};
use tracing::debug;

use super::ProxyError;
use crate::widgets::control::{CONTINUATION, PROMPT};
use crate::worker::marshal::Bridge;
use crate::worker::modules::{CATCH_ALL, Widgets, build_engine};

struct Running {
    lines: std_mpsc::Sender<String>,
    thread: JoinHandle<()>,
}

pub struct ShellProxy {
    handle: HandleId,
    running: Mutex<Option<Running>>,
}

impl ShellProxy {
    pub fn new(handle: HandleId) -> Self {
        Self {
            handle,
            running: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> HandleId {
        self.handle
    }

    pub fn start(&self, bridge: Arc<Bridge>, app_dir: &Path, widgets: Widgets) -> Result<(), ProxyError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return Err(ProxyError::AlreadyRunning("shell"));
        }
        let (lines, rx) = std_mpsc::channel::<String>();
        let handle = self.handle;
        let app_dir = app_dir.to_path_buf();
        let thread = thread::Builder::new()
            .name(format!("{}-shell-{handle}", bridge.conduit().worker()))
            .spawn(move || {
                let mut session = Session::new(&app_dir, widgets);
                for line in rx {
                    let (text, prompt) = session.feed(&line);
                    if !text.is_empty() && !notify(&bridge, handle, "write", &text) {
                        break;
                    }
                    if !notify(&bridge, handle, "set_prompt", prompt) {
                        break;
                    }
                }
                debug!(%handle, "shell session ended");
            })?;
        *running = Some(Running { lines, thread });
        Ok(())
    }

    pub fn push_line(&self, line: String) -> Result<(), ProxyError> {
        let running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let run = running.as_ref().ok_or(ProxyError::NotRunning("shell"))?;
        run.lines.send(line).map_err(|_| ProxyError::NotRunning("shell"))
    }

    pub fn shutdown(&self) {
        let run = self.running.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(Running { lines, thread }) = run {
            drop(lines);
            let _ = thread.join();
        }
    }
}

fn notify(bridge: &Bridge, handle: HandleId, method: &str, text: &str) -> bool {
    let op = UpwardOp::CallMethodNoReturn {
        handle,
        method: method.to_string(),
        args: vec![WireValue::Str(text.to_string())],
        kwargs: BTreeMap::new(),
    };
    match bridge.request(op) {
        Ok(_) => true,
        Err(e) => {
            debug!(%handle, method, "shell output lost: {e}");
            false
        }
    }
}

/// One interactive session: accumulated input, the scope, and the functions
/// defined so far.
pub(crate) struct Session {
    engine: Engine,
    scope: Scope<'static>,
    functions: AST,
    pending: String,
    printed: Arc<Mutex<String>>,
}

impl Session {
    pub(crate) fn new(app_dir: &Path, widgets: Widgets) -> Self {
        let mut engine = build_engine(app_dir);
        let printed = Arc::new(Mutex::new(String::new()));
        let sink = printed.clone();
        engine.on_print(move |text| {
            let mut out = sink.lock().unwrap_or_else(PoisonError::into_inner);
            out.push_str(text);
            out.push('\n');
        });
        let mut scope = Scope::new();
        let all: Map = widgets
            .iter()
            .map(|(id, h)| (id.as_str().into(), Dynamic::from(h.clone())))
            .collect();
        scope.push(CATCH_ALL, all);
        for (id, handle) in widgets {
            scope.push(id, handle);
        }
        Self {
            engine,
            scope,
            functions: AST::empty(),
            pending: String::new(),
            printed,
        }
    }

    /// Feeds one line. Returns the text to show and the prompt to use next.
    pub(crate) fn feed(&mut self, line: &str) -> (String, &'static str) {
        if self.pending.is_empty() && line.trim().is_empty() {
            return (String::new(), PROMPT);
        }
        self.pending.push_str(line);
        self.pending.push('\n');
        let ast = match self.engine.compile_with_scope(&self.scope, &self.pending) {
            Ok(ast) => ast,
            Err(e) if is_incomplete(&self.pending, &e) => return (String::new(), CONTINUATION),
            Err(e) => {
                self.pending.clear();
                return (format!("{e}\n"), PROMPT);
            }
        };
        self.pending.clear();
        let program = self.functions.merge(&ast);
        self.functions += ast.clone_functions_only();
        let result = self.engine.eval_ast_with_scope::<Dynamic>(&mut self.scope, &program);
        let mut text = std::mem::take(&mut *self.printed.lock().unwrap_or_else(PoisonError::into_inner));
        match result {
            Ok(value) if value.is_unit() => {}
            Ok(value) => {
                text.push_str(&value.to_string());
                text.push('\n');
            }
            Err(e) => {
                text.push_str(&e.to_string());
                text.push('\n');
            }
        }
        (text, PROMPT)
    }
}

fn is_incomplete(source: &str, err: &ParseError) -> bool {
    matches!(err.err_type(), ParseErrorType::UnexpectedEOF) || open_brackets(source) > 0
}

/// Net count of unclosed brackets, ignoring string literals and comments.
fn open_brackets(source: &str) -> i64 {
    let mut depth = 0i64;
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            '"' | '`' | '\'' => {
                while let Some(d) = chars.next() {
                    if d == '\\' {
                        chars.next();
                    } else if d == c {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'/') => {
                for d in chars.by_ref() {
                    if d == '\n' {
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    depth
}
