//! Framing for the inference connection.
//!
//! Every message travels as `u32` little-endian byte count followed by that
//! many payload bytes. A peer hanging up between frames is reported as
//! [`FrameError::Closed`], one hanging up inside a frame as
//! [`FrameError::Truncated`].

use std::io::{self, ErrorKind, Read, Write};

use thiserror::Error;

/// Largest payload either side accepts.
pub const MAX_FRAME_LEN: usize = 64 << 20;

const PREFIX_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame io: {0}")]
    Io(#[from] io::Error),
    #[error("peer closed the connection")]
    Closed,
    #[error("peer closed the connection mid-frame")]
    Truncated,
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
}

/// Write one frame and flush.
pub fn write_frame<W: Write>(w: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    // One write per frame keeps prefix and payload in the same segment.
    let mut out = Vec::with_capacity(PREFIX_LEN + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    w.write_all(&out)?;
    w.flush()?;
    Ok(())
}

/// Read one frame, blocking until it is complete.
pub fn read_frame<R: Read>(r: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; PREFIX_LEN];
    let got = fill(r, &mut prefix)?;
    if got == 0 {
        return Err(FrameError::Closed);
    }
    if got < PREFIX_LEN {
        return Err(FrameError::Truncated);
    }
    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    if fill(r, &mut payload)? < len {
        return Err(FrameError::Truncated);
    }
    Ok(payload)
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
fn fill<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(k) => n += k,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_are_read_back_in_order() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"first").unwrap();
        write_frame(&mut buf, b"").unwrap();
        let mut r = Cursor::new(buf);
        assert_eq!(read_frame(&mut r).unwrap(), b"first");
        assert!(read_frame(&mut r).unwrap().is_empty());
        assert!(matches!(read_frame(&mut r), Err(FrameError::Closed)));
    }

    #[test]
    fn cut_inside_a_frame_is_truncated() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello").unwrap();
        buf.truncate(6);
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, FrameError::Truncated));

        let err = read_frame(&mut Cursor::new(vec![5u8, 0])).unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let buf = ((MAX_FRAME_LEN + 1) as u32).to_le_bytes().to_vec();
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge(n) if n == MAX_FRAME_LEN + 1));
    }
}
