use super::attr_value;
use crate::layout::{LayoutError, WidgetSpec};
use crate::supervisor::object::{CallCtx, HostError, HostObject, arg, no_attr, required};
use crate::supervisor::value::{Kwargs, Value};

/// Choice/record list. Supports item access, length and iteration.
pub struct ListWidget {
    items: Vec<Value>,
    selected: Option<usize>,
}

impl ListWidget {
    pub fn from_spec(spec: &WidgetSpec) -> Result<Self, LayoutError> {
        let items = match attr_value(spec, "items") {
            None => Vec::new(),
            Some(Value::List(items)) => items,
            Some(_) => return Err(super::widget_error(spec, "`items` must be a list")),
        };
        Ok(Self { items, selected: None })
    }

    fn index(&self, key: &Value) -> Result<usize, HostError> {
        let index = key
            .as_i64()
            .ok_or_else(|| HostError::Type(format!("list indices must be integers, got {}", key.type_name())))?;
        let len = self.items.len();
        let resolved = if index < 0 { index + len as i64 } else { index };
        usize::try_from(resolved)
            .ok()
            .filter(|i| *i < len)
            .ok_or(HostError::Index { index, len })
    }
}

impl HostObject for ListWidget {
    fn type_name(&self) -> &'static str {
        "list"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "items" => Ok(Value::List(self.items.clone())),
            "selected" => Ok(self.selected.map_or(Value::Null, |i| Value::Int(i as i64))),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        match name {
            "items" => match value {
                Value::List(items) | Value::Tuple(items) => {
                    self.items = items;
                    self.selected = None;
                    Ok(())
                }
                other => Err(HostError::Type(format!("items must be a list, got {}", other.type_name()))),
            },
            "selected" => {
                self.selected = match value {
                    Value::Null => None,
                    other => Some(self.index(&other)?),
                };
                Ok(())
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn attributes(&self) -> Vec<String> {
        vec!["items".into(), "selected".into()]
    }

    fn methods(&self) -> &'static [&'static str] {
        &["append", "clear", "pop"]
    }

    fn call_method(&mut self, _ctx: &mut CallCtx, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            "append" => {
                self.items.push(required(&args, &kwargs, 0, "item")?.clone());
                Ok(Value::Null)
            }
            "clear" => {
                self.items.clear();
                self.selected = None;
                Ok(Value::Null)
            }
            "pop" => {
                let at = match arg(&args, &kwargs, 0, "index") {
                    Some(key) => self.index(key)?,
                    None if self.items.is_empty() => return Err(HostError::Index { index: -1, len: 0 }),
                    None => self.items.len() - 1,
                };
                self.selected = None;
                Ok(self.items.remove(at))
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn get_item(&self, key: &Value) -> Result<Value, HostError> {
        Ok(self.items[self.index(key)?].clone())
    }

    fn set_item(&mut self, key: Value, value: Value) -> Result<(), HostError> {
        let at = self.index(&key)?;
        self.items[at] = value;
        Ok(())
    }

    fn len(&self) -> Result<usize, HostError> {
        Ok(self.items.len())
    }

    fn iter(&self) -> Result<Vec<Value>, HostError> {
        Ok(self.items.clone())
    }

    fn repr(&self) -> String {
        format!("<list {:?}>", self.items)
    }

    fn get_param(&self) -> Option<Value> {
        Some(Value::List(self.items.clone()))
    }

    fn set_param(&mut self, value: Value) -> Result<(), HostError> {
        self.set_attr("items", value)
    }
}
