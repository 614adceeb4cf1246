use crate::supervisor::object::{HostError, HostObject, no_attr};
use crate::supervisor::value::Value;

/// Stands in for a widget whose construction failed.
pub struct ErrorBox {
    widget: String,
    message: String,
}

impl ErrorBox {
    pub fn new(widget: String, message: String) -> Self {
        Self { widget, message }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl HostObject for ErrorBox {
    fn type_name(&self) -> &'static str {
        "error_box"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "message" => Ok(Value::Str(self.message.clone())),
            "widget" => Ok(Value::Str(self.widget.clone())),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn attributes(&self) -> Vec<String> {
        vec!["message".into(), "widget".into()]
    }

    fn repr(&self) -> String {
        format!("<error_box {}: {}>", self.widget, self.message)
    }
}
