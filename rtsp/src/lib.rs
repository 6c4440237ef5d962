use bytes::{Buf, BufMut, Bytes, BytesMut};
use failure::bail;
use once_cell::sync::Lazy;
use rtsp_types::Message;
use std::fmt;
use std::net::SocketAddr;
use std::time::SystemTime;

pub mod client;

pub use client::Timeline;
pub use client::avbridge::RtspAvDemuxer;

/// NTP timestamp as carried in an RTCP Sender Report (64-bit, 32.32 fixed point seconds since
/// 1900-01-01), printed verbatim rather than converted since this toolkit never processes RTCP
/// beyond logging it.
#[derive(Clone, Copy)]
pub struct NtpTimestamp(pub u64);

impl fmt::Debug for NtpTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0 >> 32;
        let frac = self.0 & 0xffff_ffff;
        write!(f, "{}.{:09}s", secs, (frac * 1_000_000_000) >> 32)
    }
}

pub static X_ACCEPT_DYNAMIC_RATE: Lazy<rtsp_types::HeaderName> = Lazy::new(
    || rtsp_types::HeaderName::from_static_str("x-Accept-Dynamic-Rate").expect("is ascii")
);
pub static X_DYNAMIC_RATE: Lazy<rtsp_types::HeaderName> = Lazy::new(
    || rtsp_types::HeaderName::from_static_str("x-Dynamic-Rate").expect("is ascii")
);

/// Where a piece of state (a received message, an RTP/RTCP packet) came from, for error messages.
///
/// Carries enough of the TCP connection's identity that a `Display` of this type alone is
/// useful when printed alongside a parse error: which socket pair, when it was established, and
/// (for interleaved data) the byte offset into the RTSP connection's read stream.
#[derive(Clone, Copy, Debug)]
pub struct Context {
    pub established: SystemTime,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    pub rtsp_message_offset: u64,
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{} (connected {:?}, msg offset {})",
            self.local_addr, self.peer_addr, self.established, self.rtsp_message_offset
        )
    }
}

/// A monotonically non-decreasing timestamp within one stream's RTP clock, rebased onto a
/// 64-bit counter so the caller never has to reason about 32-bit RTP timestamp wraparound.
///
/// See [`client::timeline::Timeline`], which produces these from raw 32-bit RTP timestamps one
/// packet at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timestamp {
    pub(crate) timestamp: u64,
    pub(crate) clock_rate: u32,
    pub(crate) start: u32,
}

impl Timestamp {
    /// Elapsed ticks since `start`, the first timestamp seen on the stream.
    pub fn elapsed(&self) -> u64 {
        self.timestamp - u64::from(self.start)
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    /// Returns a new `Timestamp` `delta` ticks later, erroring on overflow.
    pub fn try_add(&self, delta: u32) -> Result<Self, failure::Error> {
        Ok(Timestamp {
            timestamp: self
                .timestamp
                .checked_add(u64::from(delta))
                .ok_or_else(|| failure::format_err!("timestamp overflow adding {} to {}", delta, self.timestamp))?,
            clock_rate: self.clock_rate,
            start: self.start,
        })
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}Hz", self.timestamp, self.clock_rate)
    }
}

/// A message received from the RTSP connection: either a `rtsp-types` text message or an
/// interleaved binary data block, tagged with the [`Context`] it arrived in.
#[derive(Debug)]
pub struct ReceivedMessage {
    pub ctx: Context,
    pub msg: Message<Bytes>,
}

/// Returns the byte range of `subslice` within `whole`, or `None` if `subslice` doesn't point
/// into `whole`'s backing storage. Used to turn a parser's borrowed sub-slice (e.g. the payload
/// returned by `rtp_rs::RtpReader`) back into an index range so the caller can `split_off`/
/// `advance` the original `Bytes` without copying.
pub(crate) fn as_range(whole: &[u8], subslice: &[u8]) -> Option<std::ops::Range<usize>> {
    let whole_start = whole.as_ptr() as usize;
    let sub_start = subslice.as_ptr() as usize;
    if sub_start < whole_start || sub_start > whole_start.wrapping_add(whole.len()) {
        return None;
    }
    let start = sub_start - whole_start;
    let end = start + subslice.len();
    if end > whole.len() {
        return None;
    }
    Some(start..end)
}

struct Codec {
    ctx: Context,
}

fn map_body<Body, NewBody: AsRef<[u8]>, F: FnOnce(Body) -> NewBody>(m: Message<Body>, f: F) -> Message<NewBody> {
    match m {
        Message::Request(r) => Message::Request(r.map_body(f)),
        Message::Response(r) => Message::Response(r.map_body(f)),
        Message::Data(d) => Message::Data(d.map_body(f)),
    }
}

impl tokio_util::codec::Decoder for Codec {
    type Item = ReceivedMessage;
    type Error = failure::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // TODO: zero-copy.
        let (msg, len): (Message<&[u8]>, _) = match Message::parse(src) {
            Ok((m, l)) => (m, l),
            Err(rtsp_types::ParseError::Error) => bail!("RTSP parse error at {}", &self.ctx),
            Err(rtsp_types::ParseError::Incomplete) => return Ok(None),
        };
        let msg = map_body(msg, Bytes::copy_from_slice);
        let ctx = self.ctx;
        self.ctx.rtsp_message_offset += len as u64;
        src.advance(len);
        Ok(Some(ReceivedMessage { ctx, msg }))
    }
}

impl tokio_util::codec::Encoder<rtsp_types::Message<bytes::Bytes>> for Codec {
    type Error = failure::Error;

    fn encode(&mut self, item: rtsp_types::Message<bytes::Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut w = std::mem::replace(dst, BytesMut::new()).writer();
        item.write(&mut w).expect("bytes Writer is infallible");
        *dst = w.into_inner();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn as_range_finds_subslice_offset() {
        let whole = Bytes::from_static(b"0123456789");
        let sub = &whole[3..6];
        assert_eq!(as_range(&whole, sub), Some(3..6));
        let unrelated = b"abc";
        assert_eq!(as_range(&whole, unrelated), None);
    }

    #[test]
    fn timestamp_elapsed_since_start() {
        let t = Timestamp { timestamp: 1_090_000, clock_rate: 90_000, start: 1_000_000 };
        assert_eq!(t.elapsed(), 90_000);
        let t2 = t.try_add(90_000).unwrap();
        assert_eq!(t2.elapsed(), 180_000);
    }
}
