//! Newline-delimited JSON framing for stdio transports.
//!
//! Each frame is one line. Blank lines are skipped; anything else that fails to
//! parse is reported to the caller, which decides whether to drop or abort.

use std::io::{BufRead, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ProtocolError;

pub fn encode_line<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(line.trim_end_matches(['\n', '\r']))?)
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, frame: &T) -> Result<(), ProtocolError> {
    writer.write_all(encode_line(frame)?.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Pulls frames off a buffered byte stream.
pub struct FrameReader<R> {
    inner: R,
    line: String,
}

impl<R: BufRead> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            line: String::new(),
        }
    }

    /// `Ok(None)` on end of stream.
    pub fn next_frame<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            self.line.clear();
            if self.inner.read_line(&mut self.line)? == 0 {
                return Ok(None);
            }
            if self.line.trim().is_empty() {
                continue;
            }
            return decode_line(&self.line).map(Some);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Dispatch, ToWorker};
    use crate::CallableRef;
    use std::io::Cursor;

    #[test]
    fn frames_survive_a_byte_stream() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ToWorker::Permit).unwrap();
        buf.extend_from_slice(b"\n\n");
        let invoke = ToWorker::Dispatch(Dispatch::Invoke(CallableRef::new("main", "go")));
        write_frame(&mut buf, &invoke).unwrap();

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert_eq!(reader.next_frame::<ToWorker>().unwrap(), Some(ToWorker::Permit));
        assert_eq!(reader.next_frame::<ToWorker>().unwrap(), Some(invoke));
        assert_eq!(reader.next_frame::<ToWorker>().unwrap(), None);
    }

    #[test]
    fn garbage_is_an_error() {
        let mut reader = FrameReader::new(Cursor::new(b"not json\n".to_vec()));
        assert!(matches!(
            reader.next_frame::<ToWorker>(),
            Err(ProtocolError::Json(_))
        ));
    }
}
