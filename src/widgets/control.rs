//! Widgets whose behaviour runs inside the worker: timer, run button, shell.
//! The UI side keeps the visible state and forwards user input as proxy calls.

use panel_protocol::{CallableRef, HandleId, ProxyCall, ProxyKind, WireValue};

use super::{bool_attr, f64_attr, str_attr, widget_error};
use crate::layout::{LayoutError, WidgetSpec};
use crate::supervisor::object::{CallCtx, HostError, HostObject, Registration, no_attr, required};
use crate::supervisor::value::{Kwargs, Value};

pub const PROMPT: &str = ">>> ";
pub const CONTINUATION: &str = "... ";

// -----------------------------------------------------------------------------
// Timer
// -----------------------------------------------------------------------------

/// Periodic timer. The worker-side proxy does the ticking and reports its
/// state back through `running`.
pub struct TimerWidget {
    interval: f64,
    action: Option<String>,
    running: bool,
}

impl TimerWidget {
    pub fn from_spec(spec: &WidgetSpec) -> Result<Self, LayoutError> {
        let interval = f64_attr(spec, "interval", 1.0)?;
        if interval <= 0.0 {
            return Err(widget_error(spec, "`interval` must be positive"));
        }
        Ok(Self {
            interval,
            action: spec.actions.get("tick").cloned(),
            running: false,
        })
    }
}

impl HostObject for TimerWidget {
    fn type_name(&self) -> &'static str {
        "timer"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "interval" => Ok(Value::Float(self.interval)),
            "action" => Ok(self.action.clone().map_or(Value::Null, Value::Str)),
            "running" => Ok(Value::Bool(self.running)),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        match name {
            "interval" => {
                let interval = value
                    .as_f64()
                    .filter(|x| *x > 0.0)
                    .ok_or_else(|| HostError::Value("interval must be a positive number".into()))?;
                self.interval = interval;
            }
            "running" => self.running = value.truthy(),
            _ => return Err(no_attr(self.type_name(), name)),
        }
        Ok(())
    }

    fn attributes(&self) -> Vec<String> {
        ["interval", "action", "running"].map(String::from).to_vec()
    }

    fn get_param(&self) -> Option<Value> {
        Some(Value::Float(self.interval))
    }

    fn set_param(&mut self, value: Value) -> Result<(), HostError> {
        self.set_attr("interval", value)
    }

    fn proxy_kind(&self) -> ProxyKind {
        ProxyKind::Timer
    }
}

// -----------------------------------------------------------------------------
// Run button
// -----------------------------------------------------------------------------

/// Toggle that drives a step function in the worker while pressed. The step
/// factory is the widget's `run` action.
pub struct RunButton {
    text: String,
    pressed: bool,
    action: Option<CallableRef>,
    fixed_cadence: bool,
    handle: Option<HandleId>,
}

impl RunButton {
    pub fn from_spec(spec: &WidgetSpec) -> Result<Self, LayoutError> {
        let action = spec
            .actions
            .get("run")
            .map(|a| a.parse::<CallableRef>())
            .transpose()
            .map_err(|e| widget_error(spec, e.to_string()))?;
        Ok(Self {
            text: str_attr(spec, "text")?.unwrap_or_else(|| "Run".into()),
            pressed: false,
            action,
            fixed_cadence: bool_attr(spec, "fixed_cadence", false)?,
            handle: None,
        })
    }

    fn toggle(&mut self, ctx: &mut CallCtx) -> Result<(), HostError> {
        let handle = self
            .handle
            .ok_or_else(|| HostError::Runtime("run button is not attached to a worker".into()))?;
        self.pressed = !self.pressed;
        let method = if self.pressed { "start" } else { "stop" };
        ctx.proxy_call(ProxyCall::new(handle, method, vec![]));
        Ok(())
    }
}

impl HostObject for RunButton {
    fn type_name(&self) -> &'static str {
        "run_button"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "text" => Ok(Value::Str(self.text.clone())),
            "pressed" => Ok(Value::Bool(self.pressed)),
            "fixed_cadence" => Ok(Value::Bool(self.fixed_cadence)),
            "action" => Ok(self.action.as_ref().map_or(Value::Null, |a| Value::Str(a.to_string()))),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        match name {
            "text" => self.text = value.display(),
            "pressed" => self.pressed = value.truthy(),
            _ => return Err(no_attr(self.type_name(), name)),
        }
        Ok(())
    }

    fn attributes(&self) -> Vec<String> {
        ["text", "pressed", "fixed_cadence", "action"].map(String::from).to_vec()
    }

    fn methods(&self) -> &'static [&'static str] {
        &["click"]
    }

    fn call_method(&mut self, ctx: &mut CallCtx, name: &str, _args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            "click" => self.toggle(ctx).map(|_| Value::Null),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn register(&mut self, reg: &mut Registration<'_>) {
        self.handle = Some(reg.handle);
    }

    fn on_signal(&mut self, ctx: &mut CallCtx, signal: &str, _args: &[Value]) -> Result<(), HostError> {
        match signal {
            "clicked" => self.toggle(ctx),
            _ => Ok(()),
        }
    }

    fn proxy_kind(&self) -> ProxyKind {
        ProxyKind::RunButton {
            action: self.action.clone(),
            fixed_cadence: self.fixed_cadence,
        }
    }
}

// -----------------------------------------------------------------------------
// Shell
// -----------------------------------------------------------------------------

/// Console for evaluating lines inside the worker.
pub struct ShellWidget {
    output: String,
    prompt: String,
    history: Vec<String>,
    handle: Option<HandleId>,
}

impl ShellWidget {
    pub fn from_spec(_spec: &WidgetSpec) -> Result<Self, LayoutError> {
        Ok(Self {
            output: String::new(),
            prompt: PROMPT.to_string(),
            history: Vec::new(),
            handle: None,
        })
    }

    fn submit(&mut self, ctx: &mut CallCtx, line: &Value) -> Result<(), HostError> {
        let handle = self
            .handle
            .ok_or_else(|| HostError::Runtime("shell is not attached to a worker".into()))?;
        let line = line
            .as_str()
            .ok_or_else(|| HostError::Type("shell input must be a string".into()))?;
        self.output.push_str(&self.prompt);
        self.output.push_str(line);
        self.output.push('\n');
        self.history.push(line.to_string());
        ctx.proxy_call(ProxyCall::new(handle, "push_line", vec![WireValue::Str(line.to_string())]));
        Ok(())
    }
}

impl HostObject for ShellWidget {
    fn type_name(&self) -> &'static str {
        "shell"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "output" => Ok(Value::Str(self.output.clone())),
            "prompt" => Ok(Value::Str(self.prompt.clone())),
            "history" => Ok(Value::List(self.history.iter().cloned().map(Value::Str).collect())),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn attributes(&self) -> Vec<String> {
        ["output", "prompt", "history"].map(String::from).to_vec()
    }

    fn methods(&self) -> &'static [&'static str] {
        &["write", "set_prompt", "clear", "submit"]
    }

    fn call_method(&mut self, ctx: &mut CallCtx, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            "write" => {
                let text = required(&args, &kwargs, 0, "text")?;
                self.output.push_str(&text.display());
            }
            "set_prompt" => {
                self.prompt = required(&args, &kwargs, 0, "prompt")?.display();
            }
            "clear" => self.output.clear(),
            "submit" => self.submit(ctx, required(&args, &kwargs, 0, "line")?)?,
            _ => return Err(no_attr(self.type_name(), name)),
        }
        Ok(Value::Null)
    }

    fn register(&mut self, reg: &mut Registration<'_>) {
        self.handle = Some(reg.handle);
    }

    fn on_signal(&mut self, ctx: &mut CallCtx, signal: &str, args: &[Value]) -> Result<(), HostError> {
        match (signal, args.first()) {
            ("submit", Some(line)) => self.submit(ctx, line),
            ("submit", None) => Err(HostError::Type("submit needs a line".into())),
            _ => Ok(()),
        }
    }

    fn proxy_kind(&self) -> ProxyKind {
        ProxyKind::Shell
    }
}
