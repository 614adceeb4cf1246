//! Cross-app triggers.
//!
//! A `global_trigger` in one app fires every `global_action` registered under
//! the same name, in whichever app it lives. Each receiving action runs its
//! `triggered` binding on its own worker.

use panel_protocol::HandleId;

use super::str_attr;
use crate::layout::{LayoutError, WidgetSpec};
use crate::supervisor::object::{CallCtx, HostError, HostObject, Registration, no_attr};
use crate::supervisor::value::{Kwargs, Value};

pub struct GlobalTrigger {
    action_id: String,
    text: String,
    fired: i64,
}

impl GlobalTrigger {
    pub fn from_spec(spec: &WidgetSpec) -> Result<Self, LayoutError> {
        let action_id = str_attr(spec, "action_id")?
            .ok_or_else(|| super::widget_error(spec, "a global trigger needs `action_id`"))?;
        Ok(Self {
            text: str_attr(spec, "text")?.unwrap_or_else(|| action_id.clone()),
            action_id,
            fired: 0,
        })
    }

    fn fire(&mut self, ctx: &mut CallCtx) {
        self.fired += 1;
        ctx.trigger(&self.action_id);
    }
}

impl HostObject for GlobalTrigger {
    fn type_name(&self) -> &'static str {
        "global_trigger"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "action_id" => Ok(Value::Str(self.action_id.clone())),
            "text" => Ok(Value::Str(self.text.clone())),
            "fired" => Ok(Value::Int(self.fired)),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        match name {
            "text" => {
                self.text = value.display();
                Ok(())
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn attributes(&self) -> Vec<String> {
        ["action_id", "text", "fired"].map(String::from).to_vec()
    }

    fn methods(&self) -> &'static [&'static str] {
        &["trigger"]
    }

    fn call_method(&mut self, ctx: &mut CallCtx, name: &str, _args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            "trigger" => {
                self.fire(ctx);
                Ok(Value::Null)
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn on_signal(&mut self, ctx: &mut CallCtx, signal: &str, _args: &[Value]) -> Result<(), HostError> {
        if signal == "clicked" {
            self.fire(ctx);
        }
        Ok(())
    }
}

/// Receiver side. Registers under `action_id` (default: its layout id) when
/// its app starts.
pub struct GlobalAction {
    action_id: Option<String>,
    triggered: i64,
    registered: Option<HandleId>,
}

impl GlobalAction {
    pub fn from_spec(spec: &WidgetSpec) -> Result<Self, LayoutError> {
        let action_id = str_attr(spec, "action_id")?.or_else(|| spec.id.clone());
        if action_id.is_none() {
            return Err(super::widget_error(spec, "a global action needs an id or `action_id`"));
        }
        Ok(Self {
            action_id,
            triggered: 0,
            registered: None,
        })
    }
}

impl HostObject for GlobalAction {
    fn type_name(&self) -> &'static str {
        "global_action"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "action_id" => Ok(self.action_id.clone().map_or(Value::Null, Value::Str)),
            "triggered" => Ok(Value::Int(self.triggered)),
            "registered" => Ok(Value::Bool(self.registered.is_some())),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn attributes(&self) -> Vec<String> {
        ["action_id", "triggered", "registered"].map(String::from).to_vec()
    }

    fn register(&mut self, reg: &mut Registration<'_>) {
        if let Some(name) = &self.action_id {
            reg.bus.borrow_mut().register_action(name, reg.worker, reg.handle);
            self.registered = Some(reg.handle);
        }
    }

    fn on_signal(&mut self, _ctx: &mut CallCtx, signal: &str, _args: &[Value]) -> Result<(), HostError> {
        if signal == "triggered" {
            self.triggered += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::bus::GlobalBus;
    use crate::supervisor::object::Effect;
    use panel_protocol::WorkerId;
    use serde_json::json;

    #[test]
    fn trigger_requires_action_id() {
        assert!(GlobalTrigger::from_spec(&WidgetSpec::new("global_trigger", Some("t"))).is_err());
    }

    #[test]
    fn click_fans_out_by_name() {
        let spec = WidgetSpec::new("global_trigger", Some("t")).with_attr("action_id", json!("go"));
        let mut t = GlobalTrigger::from_spec(&spec).unwrap();
        let mut ctx = CallCtx::new(WorkerId(1));
        t.on_signal(&mut ctx, "clicked", &[]).unwrap();
        assert_eq!(ctx.take_effects(), vec![Effect::Trigger { name: "go".into() }]);
        assert_eq!(t.get_attr("fired").unwrap(), Value::Int(1));
    }

    #[test]
    fn action_registers_on_the_bus() {
        let bus = GlobalBus::shared();
        let mut a = GlobalAction::from_spec(&WidgetSpec::new("global_action", Some("go"))).unwrap();
        let (mut modules, mut on_init, mut on_close) = (vec![], vec![], vec![]);
        let mut reg = Registration {
            worker: WorkerId(2),
            id: Some("go"),
            handle: HandleId(11),
            modules: &mut modules,
            on_init: &mut on_init,
            on_close: &mut on_close,
            bus: &bus,
        };
        a.register(&mut reg);
        assert_eq!(
            bus.borrow_mut().targets("go", |_| true),
            vec![(WorkerId(2), HandleId(11))]
        );
        assert_eq!(a.get_attr("registered").unwrap(), Value::Bool(true));
    }
}
