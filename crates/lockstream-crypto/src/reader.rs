//! Fixed-size, buffer-reusing reads over any [`std::io::Read`] source.

use std::io::Read;

use crate::error::CipherResult;

/// Wraps a byte source and fills caller-supplied buffers as completely as
/// the source allows. The caller reuses one buffer across calls, which
/// bounds memory no matter how large the stream is.
///
/// A one-byte lookahead makes the end-of-stream report exact: a fill that
/// consumes the last byte of the source reports `eof = true` on that same
/// call, so the block that carries the final bytes can be flagged terminal.
pub struct ByteStreamReader<R: Read> {
    source: Option<R>,
    peeked: Option<u8>,
}

impl<R: Read> ByteStreamReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            source: Some(source),
            peeked: None,
        }
    }

    /// Fill `buf` as far as the source allows. Returns the number of bytes
    /// written and whether the source is exhausted.
    pub fn read_fill(&mut self, buf: &mut [u8]) -> CipherResult<(usize, bool)> {
        let mut filled = 0;

        if let Some(byte) = self.peeked.take() {
            if buf.is_empty() {
                self.peeked = Some(byte);
                return Ok((0, false));
            }
            buf[0] = byte;
            filled = 1;
        }

        let Some(source) = self.source.as_mut() else {
            return Ok((filled, true));
        };

        while filled < buf.len() {
            match source.read(&mut buf[filled..]) {
                Ok(0) => {
                    self.source = None;
                    return Ok((filled, true));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.cleanup();
                    return Err(e.into());
                }
            }
        }

        // Buffer full; probe one byte so eof is reported on this call.
        let mut probe = [0u8; 1];
        loop {
            match source.read(&mut probe) {
                Ok(0) => {
                    self.source = None;
                    return Ok((filled, true));
                }
                Ok(_) => {
                    self.peeked = Some(probe[0]);
                    return Ok((filled, false));
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.cleanup();
                    return Err(e.into());
                }
            }
        }
    }

    /// Read everything left in the source, up to `max` bytes. More than
    /// `max` is an I/O error.
    pub fn read_remaining(&mut self, max: usize) -> CipherResult<Vec<u8>> {
        let mut out = Vec::new();
        if let Some(byte) = self.peeked.take() {
            out.push(byte);
        }
        if let Some(source) = self.source.take() {
            source
                .take(max.saturating_sub(out.len()) as u64 + 1)
                .read_to_end(&mut out)?;
        }
        if out.len() > max {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("stream exceeds {max} bytes"),
            )
            .into());
        }
        Ok(out)
    }

    /// Release the source. Also happens on drop and after any read error.
    pub fn cleanup(&mut self) {
        self.source = None;
        self.peeked = None;
    }
}
