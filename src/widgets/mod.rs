//! Reference widgets.
//!
//! Each one is a [`HostObject`](crate::supervisor::HostObject) owned by the UI
//! thread. They do just enough to be driven from user code and from the
//! outside (signals fired by [`UiState::fire`](crate::supervisor::UiState::fire)).

pub mod button;
pub mod control;
pub mod error_box;
pub mod global;
pub mod image;
pub mod list;
pub mod plot;
pub mod value;

use std::path::Path;
use std::str::FromStr;

use strum_macros::{Display, EnumString};
use tracing::error;

use crate::layout::{LayoutError, WidgetSpec};
use crate::supervisor::bus::SharedBus;
use crate::supervisor::object::{ObjectRef, new_object};
use crate::supervisor::value::Value;

pub use error_box::ErrorBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum WidgetKind {
    Label,
    Text,
    Number,
    Button,
    Plot,
    List,
    Timer,
    RunButton,
    Shell,
    Image,
    GlobalTrigger,
    GlobalAction,
    Namespace,
}

/// What construction may need beyond the widget's own spec.
pub struct BuildCtx<'a> {
    pub bus: &'a SharedBus,
    pub shm_dir: &'a Path,
}

pub fn build_widget(spec: &WidgetSpec, ctx: &BuildCtx<'_>) -> Result<ObjectRef, LayoutError> {
    let kind = WidgetKind::from_str(&spec.kind).map_err(|_| LayoutError::UnknownKind(spec.kind.clone()))?;
    let object = match kind {
        WidgetKind::Label | WidgetKind::Text | WidgetKind::Number => new_object(value::ValueWidget::from_spec(kind, spec)?),
        WidgetKind::Button => new_object(button::Button::from_spec(spec)?),
        WidgetKind::Plot => new_object(plot::Plot::from_spec(spec)?),
        WidgetKind::List => new_object(list::ListWidget::from_spec(spec)?),
        WidgetKind::Timer => new_object(control::TimerWidget::from_spec(spec)?),
        WidgetKind::RunButton => new_object(control::RunButton::from_spec(spec)?),
        WidgetKind::Shell => new_object(control::ShellWidget::from_spec(spec)?),
        WidgetKind::Image => new_object(image::ImageWidget::from_spec(spec, ctx.shm_dir)?),
        WidgetKind::GlobalTrigger => new_object(global::GlobalTrigger::from_spec(spec)?),
        WidgetKind::GlobalAction => new_object(global::GlobalAction::from_spec(spec)?),
        WidgetKind::Namespace => {
            let name = str_attr(spec, "name")?
                .or_else(|| spec.id.clone())
                .ok_or_else(|| widget_error(spec, "a namespace needs an id or a `name` attribute"))?;
            ctx.bus.borrow_mut().namespace(&name)
        }
    };
    Ok(object)
}

/// Builds the widget, or an error box in its place when construction fails.
/// The second value carries the error text.
pub fn build_or_error_box(spec: &WidgetSpec, ctx: &BuildCtx<'_>) -> (ObjectRef, Option<String>) {
    match build_widget(spec, ctx) {
        Ok(object) => (object, None),
        Err(e) => {
            let message = e.to_string();
            error!(widget = %spec.label(), "widget construction failed: {message}");
            (new_object(ErrorBox::new(spec.label(), message.clone())), Some(message))
        }
    }
}

// ── attribute helpers ───────────────────────────────────────────────

pub(crate) fn widget_error(spec: &WidgetSpec, message: impl Into<String>) -> LayoutError {
    LayoutError::Widget {
        widget: spec.label(),
        message: message.into(),
    }
}

pub(crate) fn attr_value(spec: &WidgetSpec, name: &str) -> Option<Value> {
    spec.attrs.get(name).map(Value::from_json)
}

pub(crate) fn f64_attr(spec: &WidgetSpec, name: &str, default: f64) -> Result<f64, LayoutError> {
    match spec.attrs.get(name) {
        None => Ok(default),
        Some(v) => v
            .as_f64()
            .ok_or_else(|| widget_error(spec, format!("`{name}` must be a number"))),
    }
}

pub(crate) fn usize_attr(spec: &WidgetSpec, name: &str, default: usize) -> Result<usize, LayoutError> {
    match spec.attrs.get(name) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| widget_error(spec, format!("`{name}` must be a non-negative integer"))),
    }
}

pub(crate) fn bool_attr(spec: &WidgetSpec, name: &str, default: bool) -> Result<bool, LayoutError> {
    match spec.attrs.get(name) {
        None => Ok(default),
        Some(v) => v
            .as_bool()
            .ok_or_else(|| widget_error(spec, format!("`{name}` must be true or false"))),
    }
}

pub(crate) fn str_attr(spec: &WidgetSpec, name: &str) -> Result<Option<String>, LayoutError> {
    match spec.attrs.get(name) {
        None => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(widget_error(spec, format!("`{name}` must be a string"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::bus::GlobalBus;
    use crate::supervisor::object::read_attr;
    use serde_json::json;
    use std::rc::Rc;

    fn ctx_with<'a>(bus: &'a SharedBus, dir: &'a Path) -> BuildCtx<'a> {
        BuildCtx { bus, shm_dir: dir }
    }

    #[test]
    fn kinds_parse_snake_case() {
        assert_eq!(WidgetKind::from_str("run_button").unwrap(), WidgetKind::RunButton);
        assert_eq!(WidgetKind::GlobalTrigger.to_string(), "global_trigger");
        assert!(WidgetKind::from_str("knob").is_err());
    }

    #[test]
    fn unknown_kind_becomes_error_box() {
        let bus = GlobalBus::shared();
        let dir = tempfile::tempdir().unwrap();
        let spec = WidgetSpec::new("knob", Some("k"));
        let (obj, err) = build_or_error_box(&spec, &ctx_with(&bus, dir.path()));
        assert_eq!(obj.borrow().type_name(), "error_box");
        assert!(err.unwrap().contains("knob"));
        assert_eq!(
            read_attr(&obj, "message").unwrap(),
            Value::str("unknown widget kind `knob`")
        );
    }

    #[test]
    fn bad_attribute_type_is_isolated() {
        let bus = GlobalBus::shared();
        let dir = tempfile::tempdir().unwrap();
        let spec = WidgetSpec::new("number", Some("n")).with_attr("min", json!("low"));
        let (obj, err) = build_or_error_box(&spec, &ctx_with(&bus, dir.path()));
        assert_eq!(obj.borrow().type_name(), "error_box");
        assert!(err.unwrap().contains("`min` must be a number"));
    }

    #[test]
    fn namespace_widget_is_the_shared_record() {
        let bus = GlobalBus::shared();
        let dir = tempfile::tempdir().unwrap();
        let a = build_widget(&WidgetSpec::new("namespace", Some("lab")), &ctx_with(&bus, dir.path())).unwrap();
        let b = build_widget(
            &WidgetSpec::new("namespace", None).with_attr("name", json!("lab")),
            &ctx_with(&bus, dir.path()),
        )
        .unwrap();
        assert!(Rc::ptr_eq(&a, &b));
    }
}
