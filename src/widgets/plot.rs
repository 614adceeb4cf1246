use panel_protocol::NdArray;

use super::str_attr;
use crate::layout::{LayoutError, WidgetSpec};
use crate::supervisor::object::{CallCtx, HostError, HostObject, ObjectRef, borrow_mut, new_object, no_attr, required};
use crate::supervisor::value::{Kwargs, Value};

/// Line plot. The drawing surface is a separate `axes` object so user code can
/// hold on to it.
pub struct Plot {
    title: String,
    axes: ObjectRef,
    redraws: i64,
}

impl Plot {
    pub fn from_spec(spec: &WidgetSpec) -> Result<Self, LayoutError> {
        let axes = Axes {
            xlabel: str_attr(spec, "xlabel")?.unwrap_or_default(),
            ylabel: str_attr(spec, "ylabel")?.unwrap_or_default(),
            lines: Vec::new(),
        };
        Ok(Self {
            title: str_attr(spec, "title")?.unwrap_or_default(),
            axes: new_object(axes),
            redraws: 0,
        })
    }
}

impl HostObject for Plot {
    fn type_name(&self) -> &'static str {
        "plot"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "title" => Ok(Value::Str(self.title.clone())),
            "axes" => Ok(Value::Object(self.axes.clone())),
            "redraws" => Ok(Value::Int(self.redraws)),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        match name {
            "title" => {
                self.title = value.display();
                Ok(())
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn attributes(&self) -> Vec<String> {
        ["title", "axes", "redraws"].map(String::from).to_vec()
    }

    fn methods(&self) -> &'static [&'static str] {
        &["plot", "clear"]
    }

    fn call_method(&mut self, ctx: &mut CallCtx, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            "plot" | "clear" => borrow_mut(&self.axes)?.call_method(ctx, name, args, kwargs),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn redraw(&mut self) {
        self.redraws += 1;
    }
}

struct Line {
    x: Vec<f64>,
    y: Vec<f64>,
}

pub struct Axes {
    xlabel: String,
    ylabel: String,
    lines: Vec<Line>,
}

fn series(value: &Value, what: &str) -> Result<Vec<f64>, HostError> {
    match value {
        Value::Array(a) if a.shape.len() == 1 => Ok(a.data.clone()),
        Value::Array(a) => Err(HostError::Value(format!("{what} must be one-dimensional, got shape {:?}", a.shape))),
        Value::List(items) | Value::Tuple(items) => items
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| HostError::Type(format!("{what} must hold numbers, found {}", v.type_name())))
            })
            .collect(),
        other => Err(HostError::Type(format!("{what} must be a sequence, got {}", other.type_name()))),
    }
}

impl HostObject for Axes {
    fn type_name(&self) -> &'static str {
        "axes"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "xlabel" => Ok(Value::Str(self.xlabel.clone())),
            "ylabel" => Ok(Value::Str(self.ylabel.clone())),
            "line_count" => Ok(Value::Int(self.lines.len() as i64)),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn set_attr(&mut self, name: &str, value: Value) -> Result<(), HostError> {
        match name {
            "xlabel" => self.xlabel = value.display(),
            "ylabel" => self.ylabel = value.display(),
            _ => return Err(no_attr(self.type_name(), name)),
        }
        Ok(())
    }

    fn attributes(&self) -> Vec<String> {
        ["xlabel", "ylabel", "line_count"].map(String::from).to_vec()
    }

    fn methods(&self) -> &'static [&'static str] {
        &["plot", "clear"]
    }

    /// `plot(y)` or `plot(x, y)`.
    fn call_method(&mut self, _ctx: &mut CallCtx, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            "plot" => {
                let (x, y) = match (args.first(), args.get(1)) {
                    (Some(x), Some(y)) => (Some(series(x, "x")?), series(y, "y")?),
                    (Some(y), None) => (None, series(y, "y")?),
                    (None, _) => (
                        kwargs.get("x").map(|x| series(x, "x")).transpose()?,
                        series(required(&[], &kwargs, 0, "y")?, "y")?,
                    ),
                };
                let x = match x {
                    Some(x) if x.len() != y.len() => {
                        return Err(HostError::Value(format!(
                            "x and y differ in length: {} vs {}",
                            x.len(),
                            y.len()
                        )));
                    }
                    Some(x) => x,
                    None => (0..y.len()).map(|i| i as f64).collect(),
                };
                self.lines.push(Line { x, y });
                Ok(Value::Int(self.lines.len() as i64 - 1))
            }
            "clear" => {
                self.lines.clear();
                Ok(Value::Null)
            }
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn len(&self) -> Result<usize, HostError> {
        Ok(self.lines.len())
    }

    /// Line `i` as a 2 × n array of x and y.
    fn get_item(&self, key: &Value) -> Result<Value, HostError> {
        let index = key
            .as_i64()
            .ok_or_else(|| HostError::Type("line index must be an integer".into()))?;
        let line = usize::try_from(index)
            .ok()
            .and_then(|i| self.lines.get(i))
            .ok_or(HostError::Index {
                index,
                len: self.lines.len(),
            })?;
        let mut data = line.x.clone();
        data.extend_from_slice(&line.y);
        NdArray::new(vec![2, line.x.len()], data)
            .map(Value::Array)
            .map_err(|e| HostError::Value(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::object::{invoke_method, read_attr};
    use panel_protocol::WorkerId;
    use std::rc::Rc;

    fn plot() -> ObjectRef {
        new_object(Plot::from_spec(&WidgetSpec::new("plot", Some("p"))).unwrap())
    }

    #[test]
    fn axes_is_a_stable_sub_object() {
        let p = plot();
        let a = read_attr(&p, "axes").unwrap();
        let b = read_attr(&p, "axes").unwrap();
        assert!(Rc::ptr_eq(a.as_object().unwrap(), b.as_object().unwrap()));
    }

    #[test]
    fn plot_through_widget_lands_on_axes() {
        let p = plot();
        let mut ctx = CallCtx::new(WorkerId(1));
        let y = Value::List(vec![Value::Float(1.0), Value::Float(4.0)]);
        invoke_method(&p, &mut ctx, "plot", vec![y], Kwargs::new()).unwrap();

        let axes = read_attr(&p, "axes").unwrap();
        let axes = axes.as_object().unwrap();
        assert_eq!(read_attr(axes, "line_count").unwrap(), Value::Int(1));
        let line = invoke_method(axes, &mut ctx, "__getitem__", vec![Value::Int(0)], Kwargs::new()).unwrap();
        assert_eq!(
            line,
            Value::Array(NdArray::new(vec![2, 2], vec![0.0, 1.0, 1.0, 4.0]).unwrap())
        );
    }

    #[test]
    fn mismatched_series_are_rejected() {
        let p = plot();
        let mut ctx = CallCtx::new(WorkerId(1));
        let x = Value::List(vec![Value::Int(0), Value::Int(1)]);
        let y = Value::List(vec![Value::Int(0)]);
        let err = invoke_method(&p, &mut ctx, "plot", vec![x, y], Kwargs::new()).unwrap_err();
        assert!(err.to_string().contains("differ in length"));
    }

    #[test]
    fn redraw_is_counted() {
        let p = plot();
        p.borrow_mut().redraw();
        assert_eq!(read_attr(&p, "redraws").unwrap(), Value::Int(1));
    }
}
