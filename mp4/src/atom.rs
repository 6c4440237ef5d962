//! Box (atom) framing shared by every concrete box type: the 8-byte
//! `size+fourcc` header, a linked-list parse error carrying the field name
//! and byte offset it failed at (grounded on `mp4io.ParseError`'s `prev`
//! chain), and `Dummy`, the escape hatch for boxes this crate doesn't
//! interpret.
//!
//! Only the 32-bit box size form is supported, matching the original; a
//! box whose declared size needs the 64-bit `largesize` extension is
//! rejected rather than silently mishandled.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::convert::{TryFrom, TryInto};
use std::fmt;

/// One parse failure, optionally wrapping the failure of the box it was
/// nested inside, so a caller sees the full path down to the byte that
/// didn't parse (e.g. `sample_count:1822,entries:1826`).
#[derive(Debug)]
pub struct ParseError {
    pub field: &'static str,
    pub offset: usize,
    pub cause: Option<Box<ParseError>>,
}

impl ParseError {
    pub fn new(field: &'static str, offset: usize) -> Self {
        ParseError { field, offset, cause: None }
    }

    /// Wraps `self` as the cause of a new error attributed to `field` at
    /// `offset` in the enclosing box.
    pub fn wrap(self, field: &'static str, offset: usize) -> Self {
        ParseError { field, offset, cause: Some(Box::new(self)) }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.offset)?;
        let mut cur = self.cause.as_deref();
        while let Some(c) = cur {
            write!(f, ",{}:{}", c.field, c.offset)?;
            cur = c.cause.as_deref();
        }
        Ok(())
    }
}

impl failure::Fail for ParseError {}

/// Turns a `bytes::TryGetError`-style buffer underrun into a [`ParseError`]
/// attributed to `field` at `offset`.
pub fn short(field: &'static str, offset: usize) -> ParseError {
    ParseError::new(field, offset)
}

pub type Fourcc = [u8; 4];

pub fn fourcc(s: &str) -> Fourcc {
    let b = s.as_bytes();
    [b[0], b[1], b[2], b[3]]
}

pub fn fourcc_str(f: Fourcc) -> String {
    String::from_utf8_lossy(&f).into_owned()
}

/// An unparsed box: carries its fourcc and raw contents (header excluded)
/// verbatim. Used both as the demuxer's fallback when walking unknown
/// top-level/container children and as a general "don't care" parse for
/// boxes this crate never interprets (e.g. `free`, `udta`, `edts`).
#[derive(Debug, Clone)]
pub struct Dummy {
    pub fourcc: Fourcc,
    pub data: Bytes,
}

impl Dummy {
    pub fn len(&self) -> usize {
        8 + self.data.len()
    }

    pub fn marshal(&self, buf: &mut BytesMut) {
        buf.put_u32(u32::try_from(self.len()).expect("mp4 box over 4 GiB"));
        buf.put_slice(&self.fourcc);
        buf.put_slice(&self.data);
    }
}

/// Reads one box's 8-byte header (size including header, fourcc) at the
/// current position of `buf`, without consuming the body.
pub fn read_header(buf: &[u8], offset: usize) -> Result<(u32, Fourcc), ParseError> {
    if buf.len() < 8 {
        return Err(short("box_header", offset));
    }
    let size = u32::from_be_bytes(buf[0..4].try_into().unwrap());
    let fourcc: Fourcc = buf[4..8].try_into().unwrap();
    Ok((size, fourcc))
}

/// Splits `buf` into a list of top-level `(fourcc, body_without_header)`
/// boxes, erroring if a declared size runs past the end of the buffer.
pub fn split_boxes(mut buf: Bytes, base_offset: usize) -> Result<Vec<(Fourcc, Bytes)>, ParseError> {
    let mut out = Vec::new();
    let mut offset = base_offset;
    while !buf.is_empty() {
        let (size, fourcc) = read_header(&buf, offset)?;
        let size = size as usize;
        if size < 8 || size > buf.len() {
            return Err(short("box_size", offset));
        }
        let mut body = buf.split_to(size);
        body.advance(8);
        out.push((fourcc, body));
        offset += size;
    }
    Ok(out)
}

/// Writes a box with a 4-byte size prefix computed from everything `body`
/// appends, grounded in `rtsp/examples/client/mp4.rs`'s `write_box!` macro,
/// generalized to a function since every call site here already has a
/// `BytesMut` and fourcc in scope.
pub fn write_box(buf: &mut BytesMut, fourcc: Fourcc, body: impl FnOnce(&mut BytesMut)) {
    let pos_start = buf.len();
    buf.put_u32(0);
    buf.put_slice(&fourcc);
    body(buf);
    let len = buf.len() - pos_start;
    buf[pos_start..pos_start + 4].copy_from_slice(&u32::try_from(len).expect("mp4 box over 4 GiB").to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_box_patches_length_prefix() {
        let mut buf = BytesMut::new();
        write_box(&mut buf, fourcc("free"), |b| b.put_slice(b"hello"));
        assert_eq!(&buf[0..4], &13u32.to_be_bytes());
        assert_eq!(&buf[4..8], b"free");
        assert_eq!(&buf[8..], b"hello");
    }

    #[test]
    fn split_boxes_rejects_truncated_size() {
        let mut buf = BytesMut::new();
        buf.put_u32(100);
        buf.put_slice(b"free");
        let err = split_boxes(buf.freeze(), 0).unwrap_err();
        assert_eq!(err.field, "box_size");
    }

    #[test]
    fn parse_error_chain_formats_innermost_first() {
        let inner = ParseError::new("sample_count", 1822);
        let outer = inner.wrap("entries", 1826);
        assert_eq!(outer.to_string(), "entries:1826,sample_count:1822");
    }
}
