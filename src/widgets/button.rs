use panel_protocol::HandleId;

use super::{bool_attr, str_attr};
use crate::layout::{LayoutError, WidgetSpec};
use crate::supervisor::object::{CallCtx, HostError, HostObject, Registration, borrow, call_object, no_attr};
use crate::supervisor::value::{Kwargs, Value};

/// Push button. Fires `clicked`; an `on_click` callable set from user code is
/// called as well.
pub struct Button {
    text: String,
    enabled: bool,
    clicks: i64,
    on_click: Option<Value>,
    handle: Option<HandleId>,
}

impl Button {
    pub fn from_spec(spec: &WidgetSpec) -> Result<Self, LayoutError> {
        Ok(Self {
            text: str_attr(spec, "text")?.unwrap_or_default(),
            enabled: bool_attr(spec, "enabled", true)?,
            clicks: 0,
            on_click: None,
            handle: None,
        })
    }
}

impl HostObject for Button {
    fn type_name(&self) -> &'static str {
        "button"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "text" => Ok(Value::Str(self.text.clone())),
            "enabled" => Ok(Value::Bool(self.enabled)),
            "clicks" => Ok(Value::Int(self.clicks)),
            "on_click" => Ok(self.on_click.clone().unwrap_or(Value::Null)),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        match name {
            "text" => self.text = value.display(),
            "enabled" => self.enabled = value.truthy(),
            "on_click" => {
                let callable = match &value {
                    Value::Null => false,
                    Value::Object(o) if borrow(o)?.is_callable() => true,
                    other => {
                        return Err(HostError::Type(format!(
                            "on_click must be callable, got {}",
                            other.type_name()
                        )));
                    }
                };
                self.on_click = callable.then_some(value);
            }
            _ => return Err(no_attr(self.type_name(), name)),
        }
        Ok(())
    }

    fn attributes(&self) -> Vec<String> {
        ["text", "enabled", "clicks", "on_click"].map(String::from).to_vec()
    }

    fn methods(&self) -> &'static [&'static str] {
        &["click"]
    }

    fn call_method(&mut self, ctx: &mut CallCtx, name: &str, _args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            "click" => {
                if let Some(handle) = self.handle {
                    ctx.emit(handle, "clicked");
                }
                Ok(Value::Null)
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn repr(&self) -> String {
        format!("<button {:?}>", self.text)
    }

    fn register(&mut self, reg: &mut Registration<'_>) {
        self.handle = Some(reg.handle);
    }

    fn on_signal(&mut self, ctx: &mut CallCtx, signal: &str, _args: &[Value]) -> Result<(), HostError> {
        if signal != "clicked" {
            return Ok(());
        }
        if !self.enabled {
            return Err(HostError::Runtime("button is disabled".into()));
        }
        self.clicks += 1;
        if let Some(Value::Object(callback)) = &self.on_click {
            call_object(callback, ctx, vec![], Kwargs::new())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::object::{CallableShim, Effect, new_object};
    use panel_protocol::{CallableRef, WorkerId};

    #[test]
    fn click_counts_and_calls_back() {
        let mut b = Button::from_spec(&WidgetSpec::new("button", Some("go"))).unwrap();
        let shim = new_object(CallableShim::new(WorkerId(3), CallableRef::new("main", "clicked")));
        b.set_attr("on_click", Value::Object(shim)).unwrap();

        let mut ctx = CallCtx::new(WorkerId(3));
        b.on_signal(&mut ctx, "clicked", &[]).unwrap();
        assert_eq!(b.get_attr("clicks").unwrap(), Value::Int(1));
        assert_eq!(
            ctx.take_effects(),
            vec![Effect::Invoke {
                worker: WorkerId(3),
                callable: CallableRef::new("main", "clicked")
            }]
        );
    }

    #[test]
    fn on_click_must_be_callable() {
        let mut b = Button::from_spec(&WidgetSpec::new("button", None)).unwrap();
        assert!(b.set_attr("on_click", Value::Int(1)).is_err());
        b.set_attr("on_click", Value::Null).unwrap();
    }

    #[test]
    fn disabled_button_ignores_clicks() {
        let mut b = Button::from_spec(&WidgetSpec::new("button", None)).unwrap();
        b.set_attr("enabled", Value::Bool(false)).unwrap();
        let mut ctx = CallCtx::new(WorkerId(1));
        assert!(b.on_signal(&mut ctx, "clicked", &[]).is_err());
        assert_eq!(b.get_attr("clicks").unwrap(), Value::Int(0));
    }
}
