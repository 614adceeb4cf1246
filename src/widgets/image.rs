//! Image display backed by a shared frame buffer.
//!
//! The buffer is a file under the configured shm dir, sized once at
//! construction and mapped by both sides. The worker writes pixels straight
//! into its mapping, then calls `display_shared(mode, width, height)`; by then
//! the pixels are in place, so the UI copies them out without further locking.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use memmap2::{Mmap, MmapOptions};
use panel_protocol::ProxyKind;
use strum_macros::{Display, EnumString};
use tempfile::NamedTempFile;

use super::{usize_attr, widget_error};
use crate::layout::{LayoutError, WidgetSpec};
use crate::supervisor::object::{CallCtx, HostError, HostObject, arg, no_attr, required};
use crate::supervisor::value::{Kwargs, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum PixelMode {
    #[default]
    Gray,
    Rgb,
    Rgba,
}

impl PixelMode {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelMode::Gray => 1,
            PixelMode::Rgb => 3,
            PixelMode::Rgba => 4,
        }
    }
}

/// Bytes a `width` × `height` frame of `mode` needs, or an error when it
/// does not fit `capacity`.
pub fn frame_len(mode: PixelMode, width: usize, height: usize, capacity: usize) -> Result<usize, String> {
    let len = width
        .checked_mul(height)
        .and_then(|n| n.checked_mul(mode.bytes_per_pixel()))
        .ok_or_else(|| "frame size overflows".to_string())?;
    if len > capacity {
        return Err(format!(
            "{width}x{height} {mode} frame needs {len} bytes, buffer holds {capacity}"
        ));
    }
    Ok(len)
}

pub struct ImageWidget {
    file: NamedTempFile,
    map: Mmap,
    capacity: usize,
    width: usize,
    height: usize,
    mode: PixelMode,
    pixels: Vec<u8>,
    frames: i64,
}

impl ImageWidget {
    pub fn from_spec(spec: &WidgetSpec, shm_dir: &Path) -> Result<Self, LayoutError> {
        let max_width = usize_attr(spec, "max_width", 0)?;
        let max_height = usize_attr(spec, "max_height", 0)?;
        let capacity = max_width
            .checked_mul(max_height)
            .and_then(|n| n.checked_mul(PixelMode::Rgba.bytes_per_pixel()))
            .ok_or_else(|| widget_error(spec, "image buffer size overflows"))?;
        if capacity == 0 {
            return Err(widget_error(
                spec,
                "zero-sized image buffer: set `max_width` and `max_height`",
            ));
        }

        let io_err = |e: std::io::Error| widget_error(spec, format!("cannot create image buffer: {e}"));
        let file = tempfile::Builder::new()
            .prefix("labpanel-image-")
            .suffix(".buf")
            .tempfile_in(shm_dir)
            .map_err(io_err)?;
        file.as_file().set_len(capacity as u64).map_err(io_err)?;
        // SAFETY: the file is private to this widget and its worker, and never truncated while mapped.
        let map = unsafe { MmapOptions::new().len(capacity).map(file.as_file()) }.map_err(io_err)?;

        Ok(Self {
            file,
            map,
            capacity,
            width: 0,
            height: 0,
            mode: PixelMode::default(),
            pixels: Vec::new(),
            frames: 0,
        })
    }

    pub fn path(&self) -> PathBuf {
        self.file.path().to_path_buf()
    }

    fn frame_args(&self, args: &[Value], kwargs: &Kwargs, offset: usize) -> Result<(PixelMode, usize, usize, usize), HostError> {
        let mode = match arg(args, kwargs, offset, "mode") {
            None | Some(Value::Null) => PixelMode::default(),
            Some(m) => {
                let name = m
                    .as_str()
                    .ok_or_else(|| HostError::Type("mode must be a string".into()))?;
                PixelMode::from_str(name).map_err(|_| HostError::Value(format!("unknown pixel mode `{name}`")))?
            }
        };
        let dim = |index: usize, name: &str| -> Result<usize, HostError> {
            let v = required(args, kwargs, index, name)?;
            v.as_i64()
                .and_then(|n| usize::try_from(n).ok())
                .ok_or_else(|| HostError::Type(format!("`{name}` must be a non-negative integer")))
        };
        let width = dim(offset + 1, "width")?;
        let height = dim(offset + 2, "height")?;
        let len = frame_len(mode, width, height, self.capacity).map_err(HostError::Value)?;
        Ok((mode, width, height, len))
    }

    fn show(&mut self, mode: PixelMode, width: usize, height: usize, pixels: Vec<u8>) {
        self.mode = mode;
        self.width = width;
        self.height = height;
        self.pixels = pixels;
        self.frames += 1;
    }
}

fn bytes_of(value: &Value) -> Result<Vec<u8>, HostError> {
    match value {
        Value::Bytes(b) => Ok(b.clone()),
        Value::List(items) => items
            .iter()
            .map(|v| {
                v.as_i64()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| HostError::Value("pixel values must be integers in 0..=255".into()))
            })
            .collect(),
        other => Err(HostError::Type(format!("pixels must be bytes, got {}", other.type_name()))),
    }
}

impl HostObject for ImageWidget {
    fn type_name(&self) -> &'static str {
        "image"
    }

    fn get_attr(&self, name: &str) -> Result<Value, HostError> {
        match name {
            "width" => Ok(Value::Int(self.width as i64)),
            "height" => Ok(Value::Int(self.height as i64)),
            "mode" => Ok(Value::Str(self.mode.to_string())),
            "frames" => Ok(Value::Int(self.frames)),
            "capacity" => Ok(Value::Int(self.capacity as i64)),
            "pixels" => Ok(Value::Bytes(self.pixels.clone())),
            _ => Err(no_attr(self.type_name(), name)),
        }
    }

    fn attributes(&self) -> Vec<String> {
        ["width", "height", "mode", "frames", "capacity", "pixels"]
            .map(String::from)
            .to_vec()
    }

    fn methods(&self) -> &'static [&'static str] {
        &["display", "display_shared", "clear"]
    }

    fn call_method(&mut self, _ctx: &mut CallCtx, name: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value, HostError> {
        match name {
            // display(pixels, width, height, mode): pixels travel in the request
            "display" => {
                let pixels = bytes_of(required(&args, &kwargs, 0, "pixels")?)?;
                let mut reordered = vec![args.get(3).cloned().unwrap_or(Value::Null)];
                reordered.extend(args.iter().skip(1).take(2).cloned());
                let (mode, width, height, len) = self.frame_args(&reordered, &kwargs, 0)?;
                if pixels.len() != len {
                    return Err(HostError::Value(format!(
                        "expected {len} bytes of pixels, got {}",
                        pixels.len()
                    )));
                }
                self.show(mode, width, height, pixels);
            }
            // display_shared(mode, width, height): pixels are already in the buffer
            "display_shared" => {
                let (mode, width, height, len) = self.frame_args(&args, &kwargs, 0)?;
                let pixels = self.map[..len].to_vec();
                self.show(mode, width, height, pixels);
            }
            "clear" => self.show(self.mode, 0, 0, Vec::new()),
            _ => return Err(no_attr(self.type_name(), name)),
        }
        Ok(Value::Null)
    }

    fn proxy_kind(&self) -> ProxyKind {
        ProxyKind::Image {
            path: self.path(),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use panel_protocol::WorkerId;
    use serde_json::json;
    use std::io::{Seek, SeekFrom, Write};

    fn image(dir: &Path) -> ImageWidget {
        let spec = WidgetSpec::new("image", Some("cam"))
            .with_attr("max_width", json!(4))
            .with_attr("max_height", json!(2));
        ImageWidget::from_spec(&spec, dir).unwrap()
    }

    #[test]
    fn zero_sized_buffer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let spec = WidgetSpec::new("image", Some("cam")).with_attr("max_width", json!(16));
        let err = ImageWidget::from_spec(&spec, dir.path()).err().unwrap();
        assert!(err.to_string().contains("zero-sized"));
    }

    #[test]
    fn frame_len_respects_capacity() {
        assert_eq!(frame_len(PixelMode::Rgb, 2, 2, 12), Ok(12));
        assert!(frame_len(PixelMode::Rgba, 2, 2, 12).is_err());
    }

    #[test]
    fn shared_frame_is_read_from_the_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = image(dir.path());
        assert_eq!(img.capacity, 32);

        let mut f = std::fs::OpenOptions::new().write(true).open(img.path()).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(&[1, 2, 3, 4]).unwrap();
        f.flush().unwrap();

        let mut ctx = CallCtx::new(WorkerId(1));
        let args = vec![Value::str("gray"), Value::Int(2), Value::Int(2)];
        img.call_method(&mut ctx, "display_shared", args, Kwargs::new()).unwrap();
        assert_eq!(img.get_attr("pixels").unwrap(), Value::Bytes(vec![1, 2, 3, 4]));
        assert_eq!(img.get_attr("frames").unwrap(), Value::Int(1));
    }

    #[test]
    fn oversized_frame_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = image(dir.path());
        let mut ctx = CallCtx::new(WorkerId(1));
        let args = vec![Value::str("rgba"), Value::Int(5), Value::Int(2)];
        let err = img.call_method(&mut ctx, "display_shared", args, Kwargs::new()).unwrap_err();
        assert!(err.to_string().contains("buffer holds 32"));
    }

    #[test]
    fn display_through_transport_checks_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut img = image(dir.path());
        let mut ctx = CallCtx::new(WorkerId(1));
        let ok = vec![Value::Bytes(vec![9; 3]), Value::Int(1), Value::Int(1), Value::str("rgb")];
        img.call_method(&mut ctx, "display", ok, Kwargs::new()).unwrap();
        assert_eq!(img.get_attr("mode").unwrap(), Value::str("rgb"));
        let short = vec![Value::Bytes(vec![9; 2]), Value::Int(1), Value::Int(1), Value::str("rgb")];
        assert!(img.call_method(&mut ctx, "display", short, Kwargs::new()).is_err());
    }
}
