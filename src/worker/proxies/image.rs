//! Image proxy: writes pixels into the widget's shared buffer and tells the
//! supervisor only the frame geometry.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use memmap2::{MmapMut, MmapOptions};
use panel_protocol::{HandleId, UpwardOp, WireValue};
use rhai::{Array, Blob, Dynamic};

use super::ProxyError;
use crate::widgets::image::{PixelMode, frame_len};
use crate::worker::conduit::Conduit;

pub struct ImageProxy {
    handle: HandleId,
    conduit: Arc<Conduit>,
    capacity: usize,
    map: Mutex<MmapMut>,
}

impl ImageProxy {
    pub fn open(handle: HandleId, conduit: Arc<Conduit>, path: &Path, capacity: usize) -> Result<Self, ProxyError> {
        if capacity == 0 {
            return Err(ProxyError::Buffer("zero-sized buffer".into()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| ProxyError::Buffer(format!("{}: {e}", path.display())))?;
        let len = file.metadata().map_err(|e| ProxyError::Buffer(e.to_string()))?.len();
        if len < capacity as u64 {
            return Err(ProxyError::Buffer(format!(
                "{} holds {len} bytes, expected {capacity}",
                path.display()
            )));
        }
        // SAFETY: the file is created and sized by the supervisor for this
        // widget only and is never truncated while either side has it mapped.
        let map = unsafe { MmapOptions::new().len(capacity).map_mut(&file) }
            .map_err(|e| ProxyError::Buffer(format!("cannot map {}: {e}", path.display())))?;
        Ok(Self {
            handle,
            conduit,
            capacity,
            map: Mutex::new(map),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `display(pixels, width, height, mode)`. Pixels are a blob or an array
    /// of byte values, row-major.
    pub fn display(&self, args: &[Dynamic]) -> Result<(), ProxyError> {
        let [pixels, width, height, rest @ ..] = args else {
            return Err(ProxyError::Argument("display(pixels, width, height, mode)".into()));
        };
        let mode = match rest.first() {
            None => PixelMode::default(),
            Some(m) if m.is_unit() => PixelMode::default(),
            Some(m) => {
                let name = m.to_string();
                PixelMode::from_str(&name).map_err(|_| ProxyError::Argument(format!("unknown pixel mode `{name}`")))?
            }
        };
        let width = dimension(width, "width")?;
        let height = dimension(height, "height")?;
        let len = frame_len(mode, width, height, self.capacity).map_err(ProxyError::Buffer)?;
        let pixels = bytes_of(pixels)?;
        if pixels.len() != len {
            return Err(ProxyError::Argument(format!(
                "expected {len} bytes of pixels, got {}",
                pixels.len()
            )));
        }
        {
            let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
            map[..len].copy_from_slice(&pixels);
            map.flush_range(0, len)
                .map_err(|e| ProxyError::Buffer(format!("flush failed: {e}")))?;
        }
        let op = UpwardOp::CallMethodNoReturn {
            handle: self.handle,
            method: "display_shared".into(),
            args: vec![
                WireValue::Str(mode.to_string()),
                WireValue::Int(width as i64),
                WireValue::Int(height as i64),
            ],
            kwargs: BTreeMap::new(),
        };
        self.conduit
            .request(op)
            .map(drop)
            .map_err(|e| ProxyError::Buffer(format!("cannot announce frame: {e}")))
    }
}

fn dimension(value: &Dynamic, name: &str) -> Result<usize, ProxyError> {
    value
        .as_int()
        .ok()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| ProxyError::Argument(format!("`{name}` must be a non-negative integer")))
}

fn bytes_of(value: &Dynamic) -> Result<Vec<u8>, ProxyError> {
    if value.is_blob() {
        return Ok(value.clone().cast::<Blob>());
    }
    if value.is_array() {
        return value
            .clone()
            .cast::<Array>()
            .iter()
            .map(|v| {
                v.as_int()
                    .ok()
                    .and_then(|n| u8::try_from(n).ok())
                    .ok_or_else(|| ProxyError::Argument("pixel values must be integers in 0..=255".into()))
            })
            .collect();
    }
    Err(ProxyError::Argument(format!(
        "pixels must be a blob or an array, got {}",
        value.type_name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{FrameSink, WorkerError, WorkerProbe};
    use panel_protocol::{ToSupervisor, Upward, WorkerId};
    use std::io::Write;

    #[derive(Default)]
    struct Record(Mutex<Vec<UpwardOp>>);

    impl FrameSink for Arc<Record> {
        fn send(&self, frame: ToSupervisor) -> Result<(), WorkerError> {
            if let ToSupervisor::Request(Upward { op, .. }) = frame {
                self.0.lock().unwrap().push(op);
            }
            Ok(())
        }
    }

    fn buffer(capacity: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&vec![0u8; capacity]).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn pixels_land_in_the_file_and_geometry_goes_up() {
        let file = buffer(16);
        let record = Arc::new(Record::default());
        let probe = WorkerProbe::new(4);
        let (conduit, _local) = Conduit::new(WorkerId(1), Box::new(record.clone()), &probe);
        let image = ImageProxy::open(HandleId(3), conduit, file.path(), 16).unwrap();

        let pixels: Blob = vec![1, 2, 3, 4, 5, 6];
        image
            .display(&[
                Dynamic::from_blob(pixels),
                Dynamic::from_int(3),
                Dynamic::from_int(2),
                Dynamic::from("gray"),
            ])
            .unwrap();

        let on_disk = std::fs::read(file.path()).unwrap();
        assert_eq!(&on_disk[..6], &[1, 2, 3, 4, 5, 6]);
        let sent = record.0.lock().unwrap();
        assert!(matches!(
            &sent[..],
            [UpwardOp::CallMethodNoReturn { method, args, .. }]
                if method == "display_shared" && args[1] == WireValue::Int(3)
        ));
    }

    #[test]
    fn oversized_and_mismatched_frames_are_refused() {
        let file = buffer(8);
        let probe = WorkerProbe::new(4);
        let (conduit, _local) = Conduit::new(WorkerId(1), Box::new(Arc::new(Record::default())), &probe);
        let image = ImageProxy::open(HandleId(3), conduit, file.path(), 8).unwrap();
        let frame = |w: i64, h: i64, n: usize, mode: &str| {
            image.display(&[
                Dynamic::from_blob(vec![0; n]),
                Dynamic::from_int(w),
                Dynamic::from_int(h),
                Dynamic::from(mode.to_string()),
            ])
        };
        assert!(matches!(frame(3, 3, 9, "gray"), Err(ProxyError::Buffer(_))));
        assert!(matches!(frame(2, 2, 5, "gray"), Err(ProxyError::Argument(_))));
        assert!(matches!(frame(1, 1, 3, "hsv"), Err(ProxyError::Argument(_))));
        assert!(frame(1, 2, 8, "rgba").is_ok());
    }

    #[test]
    fn short_files_are_not_mapped() {
        let file = buffer(4);
        let probe = WorkerProbe::new(4);
        let (conduit, _local) = Conduit::new(WorkerId(1), Box::new(Arc::new(Record::default())), &probe);
        assert!(ImageProxy::open(HandleId(3), conduit, file.path(), 64).is_err());
    }
}
