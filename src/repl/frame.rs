//! Length-prefixed framing with a crc32c body checksum.
//!
//! Wire layout per frame: 4-byte little-endian body length, 4-byte
//! little-endian crc32c of the body, then the body. Zero-length frames are
//! not legal on the wire; a stream ending between frames reads as a clean
//! end-of-stream rather than an error.

use std::io::{ErrorKind, Read, Write};

use crc32c::crc32c;

use crate::repl::ReplError;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(PartialEq, Eq)]
enum Fill {
    Complete,
    Short,
    Eof,
}

pub struct FrameReader<R> {
    src: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(src: R, max_frame_bytes: usize) -> Self {
        Self {
            src,
            max_frame_bytes,
        }
    }

    /// Next frame body, or `None` when the stream ended between frames.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, ReplError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match self.fill(&mut header)? {
            Fill::Eof => return Ok(None),
            Fill::Short => return Err(truncated("frame header")),
            Fill::Complete => {}
        }

        let body_len = header_word(&header, 0) as usize;
        let expected_crc = header_word(&header, 4);
        if body_len == 0 {
            return Err(ReplError::FrameMalformed {
                reason: "zero-length frame".to_string(),
            });
        }
        if body_len > self.max_frame_bytes {
            return Err(ReplError::FrameOversize {
                limit: self.max_frame_bytes,
                got: body_len,
            });
        }

        let mut body = vec![0u8; body_len];
        if self.fill(&mut body)? != Fill::Complete {
            return Err(truncated("frame body"));
        }
        let got_crc = crc32c(&body);
        if got_crc != expected_crc {
            return Err(ReplError::FrameChecksum {
                expected: expected_crc,
                got: got_crc,
            });
        }
        Ok(Some(body))
    }

    // Fills the whole buffer or reports how far the stream got.
    fn fill(&mut self, buf: &mut [u8]) -> Result<Fill, ReplError> {
        let mut at = 0usize;
        while at < buf.len() {
            match self.src.read(&mut buf[at..]) {
                Ok(0) if at == 0 => return Ok(Fill::Eof),
                Ok(0) => return Ok(Fill::Short),
                Ok(n) => at += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(Fill::Complete)
    }
}

pub struct FrameWriter<W> {
    sink: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(sink: W, max_frame_bytes: usize) -> Self {
        Self {
            sink,
            max_frame_bytes,
        }
    }

    /// Writes one frame and flushes. Returns the bytes put on the wire.
    pub fn write_frame(&mut self, body: &[u8]) -> Result<usize, ReplError> {
        if body.is_empty() {
            return Err(ReplError::FrameMalformed {
                reason: "zero-length frame".to_string(),
            });
        }
        if body.len() > self.max_frame_bytes {
            return Err(ReplError::FrameOversize {
                limit: self.max_frame_bytes,
                got: body.len(),
            });
        }
        let len = u32::try_from(body.len()).map_err(|_| ReplError::FrameMalformed {
            reason: "frame length exceeds u32".to_string(),
        })?;

        let mut header = [0u8; FRAME_HEADER_LEN];
        header[..4].copy_from_slice(&len.to_le_bytes());
        header[4..].copy_from_slice(&crc32c(body).to_le_bytes());
        self.sink.write_all(&header)?;
        self.sink.write_all(body)?;
        self.sink.flush()?;
        Ok(FRAME_HEADER_LEN + body.len())
    }
}

fn truncated(what: &str) -> ReplError {
    std::io::Error::new(ErrorKind::UnexpectedEof, format!("{what} truncated")).into()
}

fn header_word(header: &[u8; FRAME_HEADER_LEN], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&header[at..at + 4]);
    u32::from_le_bytes(word)
}
