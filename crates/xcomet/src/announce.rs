//! Line decoder for the worker's stdout.
//!
//! The worker prints free-form diagnostics and, once bound, a single
//! `{"port": N}` record. Pipe reads are not aligned to lines, so bytes are
//! buffered until a newline arrives; a partial line is carried over to the
//! next chunk. Works over any AsyncRead via `FramedRead`.

use std::io;

use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::protocol::Announcement;

/// Lines longer than this are flushed as logs without waiting for a newline.
const MAX_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerLine {
    Announce(Announcement),
    Log(String),
}

/// Parse one complete line. Anything that is not a positive-port record is
/// incidental output.
pub fn parse_line(line: &str) -> WorkerLine {
    let trimmed = line.trim();
    if trimmed.starts_with('{')
        && let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed)
        && let Some(port) = value
            .get("port")
            .and_then(serde_json::Value::as_u64)
            .filter(|p| *p > 0)
            .and_then(|p| u16::try_from(p).ok())
    {
        return WorkerLine::Announce(Announcement { port });
    }
    WorkerLine::Log(trimmed.to_string())
}

#[derive(Debug, Default)]
pub struct AnnouncementCodec {
    // Bytes of the current partial line already scanned for '\n'.
    scanned: usize,
}

impl AnnouncementCodec {
    pub fn new() -> Self {
        Self::default()
    }

    fn take_line(&mut self, src: &mut BytesMut, len: usize, skip: usize) -> WorkerLine {
        let raw = src.split_to(len);
        let _ = src.split_to(skip);
        self.scanned = 0;
        let text = String::from_utf8_lossy(&raw);
        parse_line(text.trim_end_matches('\r'))
    }
}

impl Decoder for AnnouncementCodec {
    type Item = WorkerLine;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') {
            let len = self.scanned + offset;
            return Ok(Some(self.take_line(src, len, 1)));
        }
        if src.len() > MAX_LINE_BYTES {
            let len = src.len();
            return Ok(Some(self.take_line(src, len, 0)));
        }
        self.scanned = src.len();
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let len = src.len();
        Ok(Some(self.take_line(src, len, 0)))
    }
}
