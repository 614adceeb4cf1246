use panel_protocol::HandleId;

use super::{WidgetKind, attr_value, bool_attr, widget_error};
use crate::layout::{LayoutError, WidgetSpec};
use crate::supervisor::object::{CallCtx, HostError, HostObject, Registration, no_attr};
use crate::supervisor::value::{Kwargs, Value};

/// `label`, `text` and `number`: a single editable value.
///
/// A user edit arrives as the `edit` signal; it updates the value and fires
/// `changed`. Writes from user code update the value silently.
pub struct ValueWidget {
    kind: WidgetKind,
    value: Value,
    initial: Value,
    min: Option<f64>,
    max: Option<f64>,
    enabled: bool,
    handle: Option<HandleId>,
}

impl ValueWidget {
    pub fn from_spec(kind: WidgetKind, spec: &WidgetSpec) -> Result<Self, LayoutError> {
        let number_attr = |name: &str| -> Result<Option<f64>, LayoutError> {
            match spec.attrs.get(name) {
                None => Ok(None),
                Some(v) => v
                    .as_f64()
                    .map(Some)
                    .ok_or_else(|| widget_error(spec, format!("`{name}` must be a number"))),
            }
        };
        let mut widget = Self {
            kind,
            value: Value::Null,
            initial: Value::Null,
            min: number_attr("min")?,
            max: number_attr("max")?,
            enabled: bool_attr(spec, "enabled", true)?,
            handle: None,
        };
        if let (Some(min), Some(max)) = (widget.min, widget.max) {
            if min > max {
                return Err(widget_error(spec, format!("min {min} is above max {max}")));
            }
        }
        let initial = match (kind, attr_value(spec, "value")) {
            (_, Some(v)) => v,
            (WidgetKind::Number, None) => Value::Float(widget.min.unwrap_or(0.0)),
            (_, None) => Value::str(""),
        };
        widget.value = widget.check(initial).map_err(|e| widget_error(spec, e.to_string()))?;
        widget.initial = widget.value.clone();
        Ok(widget)
    }

    fn check(&self, value: Value) -> Result<Value, HostError> {
        match self.kind {
            WidgetKind::Number => {
                let x = value
                    .as_f64()
                    .ok_or_else(|| HostError::Type(format!("number value must be numeric, got {}", value.type_name())))?;
                if self.min.is_some_and(|min| x < min) || self.max.is_some_and(|max| x > max) {
                    return Err(HostError::Value(format!(
                        "{x} outside [{}, {}]",
                        self.min.map_or("-inf".into(), |m| m.to_string()),
                        self.max.map_or("inf".into(), |m| m.to_string()),
                    )));
                }
                Ok(value)
            }
            WidgetKind::Text => match value {
                Value::Str(_) => Ok(value),
                other => Err(HostError::Type(format!("text value must be a string, got {}", other.type_name()))),
            },
            _ => Ok(Value::Str(value.display())),
        }
    }
}

impl HostObject for ValueWidget {
    fn type_name(&self) -> &'static str {
        match self.kind {
            WidgetKind::Number => "number",
            WidgetKind::Text => "text",
            _ => "label",
        }
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "value" => Ok(self.value.clone()),
            "enabled" => Ok(Value::Bool(self.enabled)),
            "min" if self.kind == WidgetKind::Number => Ok(self.min.map_or(Value::Null, Value::Float)),
            "max" if self.kind == WidgetKind::Number => Ok(self.max.map_or(Value::Null, Value::Float)),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        match name {
            "value" => {
                self.value = self.check(value)?;
                Ok(())
            }
            "enabled" => {
                self.enabled = value.truthy();
                Ok(())
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn attributes(&self) -> Vec<String> {
        let mut names = vec!["value".to_string(), "enabled".to_string()];
        if self.kind == WidgetKind::Number {
            names.extend(["min".to_string(), "max".to_string()]);
        }
        names
    }

    fn methods(&self) -> &'static [&'static str] {
        &["reset"]
    }

    fn call_method(&mut self, _ctx: &mut CallCtx, name: &str, _args: Vec<Value>, _kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            "reset" => {
                self.value = self.initial.clone();
                Ok(Value::Null)
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn str(&self) -> String {
        self.value.display()
    }

    fn repr(&self) -> String {
        format!("<{} {:?}>", self.type_name(), self.value)
    }

    fn register(&mut self, reg: &mut Registration<'_>) {
        self.handle = Some(reg.handle);
    }

    fn on_signal(&mut self, ctx: &mut CallCtx, signal: &str, args: &[Value]) -> Result<(), HostError> {
        if signal == "edit" {
            let value = args
                .first()
                .cloned()
                .ok_or_else(|| HostError::Type("edit needs the new value".into()))?;
            self.value = self.check(value)?;
            if let Some(handle) = self.handle {
                ctx.emit(handle, "changed");
            }
        }
        Ok(())
    }

    fn get_param(&self) -> Option<Value> {
        Some(self.value.clone())
    }

    fn set_param(&mut self, value: Value) -> Result<(), HostError> {
        self.value = self.check(value)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::object::Effect;
    use panel_protocol::{RemoteErrorKind, WorkerId};
    use serde_json::json;

    fn number(min: f64, max: f64) -> ValueWidget {
        let spec = WidgetSpec::new("number", Some("n"))
            .with_attr("min", json!(min))
            .with_attr("max", json!(max));
        ValueWidget::from_spec(WidgetKind::Number, &spec).unwrap()
    }

    #[test]
    fn number_defaults_to_min_and_checks_range() {
        let mut n = number(1.0, 5.0);
        assert_eq!(n.get_attr("value").unwrap(), Value::Float(1.0));
        n.set_attr("value", Value::Int(3)).unwrap();
        assert_eq!(n.get_attr("value").unwrap(), Value::Int(3));
        let err = n.set_attr("value", Value::Float(9.0)).unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::Value);
        let err = n.set_attr("value", Value::str("x")).unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::Type);
    }

    #[test]
    fn out_of_range_initial_value_fails_construction() {
        let spec = WidgetSpec::new("number", Some("n"))
            .with_attr("max", json!(1.0))
            .with_attr("value", json!(2.0));
        assert!(ValueWidget::from_spec(WidgetKind::Number, &spec).is_err());
    }

    #[test]
    fn text_accepts_strings_only() {
        let spec = WidgetSpec::new("text", Some("t"));
        let mut t = ValueWidget::from_spec(WidgetKind::Text, &spec).unwrap();
        t.set_attr("value", Value::str("hi")).unwrap();
        assert_eq!(t.get_attr("value").unwrap(), Value::str("hi"));
        assert!(t.set_attr("value", Value::Int(1)).is_err());
        assert!(t.get_attr("min").is_err());
    }

    #[test]
    fn label_renders_anything() {
        let spec = WidgetSpec::new("label", None);
        let mut l = ValueWidget::from_spec(WidgetKind::Label, &spec).unwrap();
        l.set_attr("value", Value::Float(2.5)).unwrap();
        assert_eq!(l.get_attr("value").unwrap(), Value::str("2.5"));
    }

    #[test]
    fn edit_updates_and_fires_changed() {
        let mut n = number(0.0, 10.0);
        n.handle = Some(HandleId(77));
        let mut ctx = CallCtx::new(WorkerId(2));
        n.on_signal(&mut ctx, "edit", &[Value::Float(4.0)]).unwrap();
        assert_eq!(n.get_param(), Some(Value::Float(4.0)));
        assert_eq!(
            ctx.take_effects(),
            vec![Effect::Emit {
                worker: WorkerId(2),
                handle: HandleId(77),
                signal: "changed".into()
            }]
        );
    }

    #[test]
    fn reset_restores_initial_value() {
        let mut n = number(0.0, 10.0);
        n.set_attr("value", Value::Float(7.0)).unwrap();
        let mut ctx = CallCtx::new(WorkerId(1));
        n.call_method(&mut ctx, "reset", vec![], Kwargs::new()).unwrap();
        assert_eq!(n.get_attr("value").unwrap(), Value::Float(0.0));
    }
}
