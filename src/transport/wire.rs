//! Length-prefixed framing: `[u32 big-endian length][length bytes]`.

use std::io::{ErrorKind, Read, Write};

use crate::error::ProtocolError;

pub const PREFIX_LEN: usize = 4;
pub const READ_CHUNK: usize = 4096;
/// Larger prefixes are treated as malformed.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Result of reading one frame at a frame boundary.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Frame(Vec<u8>),
    /// The peer closed the connection cleanly between frames.
    Closed,
}

/// Build prefix + payload in one buffer.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_FRAME_BYTES,
        });
    }
    let mut buf = Vec::with_capacity(PREFIX_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Write one frame with a single `write_all`.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    let frame = encode_frame(payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// A zero-byte read before any prefix byte is a graceful close. EOF anywhere
/// later is `ProtocolError::Truncated`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<ReadOutcome, ProtocolError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let mut filled = 0;
    while filled < PREFIX_LEN {
        match reader.read(&mut prefix[filled..]) {
            Ok(0) if filled == 0 => return Ok(ReadOutcome::Closed),
            Ok(0) => {
                return Err(ProtocolError::Truncated {
                    expected: PREFIX_LEN,
                    received: filled,
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut payload = Vec::with_capacity(len.min(READ_CHUNK * 256));
    let mut chunk = [0u8; READ_CHUNK];
    while payload.len() < len {
        let want = (len - payload.len()).min(READ_CHUNK);
        match reader.read(&mut chunk[..want]) {
            Ok(0) => {
                return Err(ProtocolError::Truncated {
                    expected: len,
                    received: payload.len(),
                })
            }
            Ok(n) => payload.extend_from_slice(&chunk[..n]),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(ReadOutcome::Frame(payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Hands out at most `step` bytes per read.
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn prefix_is_big_endian() -> anyhow::Result<()> {
        let mut out = Vec::new();
        write_frame(&mut out, b"abc")?;
        assert_eq!(out, vec![0, 0, 0, 3, b'a', b'b', b'c']);
        Ok(())
    }

    #[test]
    fn empty_stream_is_graceful_close() -> anyhow::Result<()> {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        assert_eq!(read_frame(&mut cursor)?, ReadOutcome::Closed);
        Ok(())
    }

    #[test]
    fn partial_reads_are_accumulated() -> anyhow::Result<()> {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = Trickle {
            data: encode_frame(&payload)?,
            pos: 0,
            step: 3,
        };
        assert_eq!(read_frame(&mut reader)?, ReadOutcome::Frame(payload));
        assert_eq!(read_frame(&mut reader)?, ReadOutcome::Closed);
        Ok(())
    }

    #[test]
    fn eof_mid_payload_is_truncated() {
        let mut data = encode_frame(b"hello world").unwrap();
        data.truncate(7);
        let err = read_frame(&mut Cursor::new(data)).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                expected: 11,
                received: 3
            }
        ));
    }

    #[test]
    fn eof_mid_prefix_is_truncated() {
        let err = read_frame(&mut Cursor::new(vec![0, 0])).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Truncated {
                expected: 4,
                received: 2
            }
        ));
    }

    #[test]
    fn oversized_prefix_is_rejected() {
        let err = read_frame(&mut Cursor::new(vec![0xff, 0xff, 0xff, 0xff])).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn zero_length_frame_is_a_frame() -> anyhow::Result<()> {
        let mut cursor = Cursor::new(vec![0, 0, 0, 0]);
        assert_eq!(read_frame(&mut cursor)?, ReadOutcome::Frame(Vec::new()));
        Ok(())
    }
}
