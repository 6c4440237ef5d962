//! Chunk stream layer: splits RTMP messages into chunks on write, and
//! reassembles chunks back into messages on read, each keyed by chunk
//! stream id (CSID).
//!
//! Grounded in `format/rtmp/rtmp.go`'s `chunkStream`/`readChunk`/`writeChunk`/
//! `ChunkStreamWrite`: per-CSID state (`msghdrtype`, `msgdatalen`,
//! `msgtypeid`, `msgsid`, `timenow`, `timedelta`, `hastimeext`, accumulating
//! `msgdata`) and the basic/message header formats (0 full, 1 timestamp delta
//! + length + type, 2 timestamp delta only, 3 continuation).

use bytes::{Buf, BufMut, BytesMut};
use failure::{bail, Error};
use std::collections::HashMap;
use tokio_util::codec::{Decoder, Encoder};

pub const CSID_PROTOCOL_CONTROL: u32 = 2;
pub const CSID_COMMAND: u32 = 3;
pub const CSID_AUDIO: u32 = 6;
pub const CSID_VIDEO: u32 = 7;

pub const MSG_SET_CHUNK_SIZE: u8 = 1;
pub const MSG_ACK: u8 = 3;
pub const MSG_USER_CONTROL: u8 = 4;
pub const MSG_WINDOW_ACK_SIZE: u8 = 5;
pub const MSG_SET_PEER_BANDWIDTH: u8 = 6;
pub const MSG_AUDIO: u8 = 8;
pub const MSG_VIDEO: u8 = 9;
pub const MSG_DATA_AMF0: u8 = 18;
pub const MSG_COMMAND_AMF0: u8 = 20;

pub const DEFAULT_CHUNK_SIZE: usize = 128;

/// A fully reassembled RTMP message.
#[derive(Debug, Clone)]
pub struct Message {
    pub csid: u32,
    pub timestamp: u32,
    pub msg_type_id: u8,
    pub msg_stream_id: u32,
    pub data: Vec<u8>,
}

#[derive(Default, Clone)]
struct StreamState {
    msg_type_id: u8,
    msg_stream_id: u32,
    msg_len: usize,
    timestamp: u32,
    timestamp_delta: u32,
    /// Whether the most recent format-0/1/2 header for this CSID carried a
    /// 32-bit extended timestamp. A format-3 continuation carries the same
    /// extended timestamp field iff this is set (it does not re-derive it
    /// from its own (absent) timestamp field, since format-3 has none).
    has_ext_ts: bool,
    data: Vec<u8>,
}

/// Decodes a byte stream of chunks into [`Message`]s, tracking per-CSID state
/// across calls (mirrors `rtmp.go`'s `conn.chunkStreams` map).
pub struct ChunkDecoder {
    streams: HashMap<u32, StreamState>,
    read_chunk_size: usize,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        ChunkDecoder { streams: HashMap::new(), read_chunk_size: DEFAULT_CHUNK_SIZE }
    }

    pub fn set_chunk_size(&mut self, size: usize) {
        self.read_chunk_size = size;
    }
}

impl Decoder for ChunkDecoder {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        loop {
            let mut cursor = 0usize;
            if src.len() < 1 {
                return Ok(None);
            }
            let first = src[cursor];
            let fmt = first >> 6;
            let csid_low = first & 0x3f;
            cursor += 1;
            let csid = match csid_low {
                0 => {
                    if src.len() < cursor + 1 {
                        return Ok(None);
                    }
                    let c = 64 + src[cursor] as u32;
                    cursor += 1;
                    c
                }
                1 => {
                    if src.len() < cursor + 2 {
                        return Ok(None);
                    }
                    let c = 64 + src[cursor] as u32 + (src[cursor + 1] as u32) * 256;
                    cursor += 2;
                    c
                }
                n => n as u32,
            };

            let header_len = match fmt {
                0 => 11,
                1 => 7,
                2 => 3,
                3 => 0,
                _ => unreachable!(),
            };
            if src.len() < cursor + header_len {
                return Ok(None);
            }

            let state = self.streams.entry(csid).or_insert_with(StreamState::default);
            if fmt <= 2 && !state.data.is_empty() {
                bail!(
                    "rtmp: chunk stream {} received a format-{} header mid-message ({} of {} bytes buffered)",
                    csid,
                    fmt,
                    state.data.len(),
                    state.msg_len
                );
            }
            let mut ts_field: u32 = 0;
            if fmt <= 2 {
                ts_field = bits::u24be(&src[cursor..cursor + 3]);
                cursor += 3;
            }
            if fmt <= 1 {
                let len = bits::u24be(&src[cursor..cursor + 3]) as usize;
                cursor += 3;
                let type_id = src[cursor];
                cursor += 1;
                state.msg_len = len;
                state.msg_type_id = type_id;
            }
            if fmt == 0 {
                let sid = u32::from_le_bytes([src[cursor], src[cursor + 1], src[cursor + 2], src[cursor + 3]]);
                cursor += 4;
                state.msg_stream_id = sid;
            }

            // A format-3 continuation has no timestamp field of its own; it
            // carries the extended timestamp iff the header that started
            // this message did.
            let has_ext_ts = if fmt == 3 { state.has_ext_ts } else { ts_field == 0x00ff_ffff };
            if has_ext_ts {
                if src.len() < cursor + 4 {
                    return Ok(None);
                }
                ts_field = u32::from_be_bytes([src[cursor], src[cursor + 1], src[cursor + 2], src[cursor + 3]]);
                cursor += 4;
            }

            match fmt {
                0 => {
                    state.timestamp = ts_field;
                    state.has_ext_ts = has_ext_ts;
                }
                1 | 2 => {
                    state.timestamp_delta = ts_field;
                    state.timestamp = state.timestamp.wrapping_add(ts_field);
                    state.has_ext_ts = has_ext_ts;
                }
                3 => {
                    // A format-3 chunk that *starts* a new message (no bytes
                    // buffered yet) ticks the clock by the last-seen delta;
                    // one continuing an in-progress message must not, or
                    // every continuation chunk would advance the timestamp
                    // again.
                    if state.data.is_empty() {
                        state.timestamp = state.timestamp.wrapping_add(state.timestamp_delta);
                    }
                }
                _ => unreachable!(),
            }

            let remaining_in_msg = state.msg_len - state.data.len();
            let take = remaining_in_msg.min(self.read_chunk_size);
            if src.len() < cursor + take {
                return Ok(None);
            }

            state.data.extend_from_slice(&src[cursor..cursor + take]);
            cursor += take;
            src.advance(cursor);

            if state.data.len() == state.msg_len {
                let msg = Message {
                    csid,
                    timestamp: state.timestamp,
                    msg_type_id: state.msg_type_id,
                    msg_stream_id: state.msg_stream_id,
                    data: std::mem::take(&mut state.data),
                };
                return Ok(Some(msg));
            }
            // Partial message; loop to try to parse the next chunk header already buffered.
        }
    }
}

/// One message queued for the chunk-stream writer: format-0 header on the
/// first chunk, format-3 continuation headers afterward, split at
/// `write_max_chunk_size`.
pub struct ChunkEncoder {
    pub write_chunk_size: usize,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        ChunkEncoder { write_chunk_size: DEFAULT_CHUNK_SIZE }
    }

    fn write_basic_header(&self, out: &mut BytesMut, fmt: u8, csid: u32) {
        if csid < 64 {
            out.put_u8((fmt << 6) | csid as u8);
        } else if csid < 320 {
            out.put_u8(fmt << 6);
            out.put_u8((csid - 64) as u8);
        } else {
            out.put_u8((fmt << 6) | 1);
            let v = csid - 64;
            out.put_u8((v & 0xff) as u8);
            out.put_u8((v >> 8) as u8);
        }
    }

    /// Encodes `msg` as one or more chunks into `out`.
    pub fn write_message(&self, out: &mut BytesMut, csid: u32, timestamp: u32, msg_type_id: u8, msg_stream_id: u32, data: &[u8]) {
        let ext_ts = timestamp >= 0x00ff_ffff;
        let ts_field = if ext_ts { 0x00ff_ffff } else { timestamp };

        self.write_basic_header(out, 0, csid);
        out.put_slice(&ts_field.to_be_bytes()[1..]);
        out.put_slice(&(data.len() as u32).to_be_bytes()[1..]);
        out.put_u8(msg_type_id);
        out.put_slice(&msg_stream_id.to_le_bytes());
        if ext_ts {
            out.put_u32(timestamp);
        }

        let mut offset = 0;
        let mut first = true;
        while offset < data.len() || (data.is_empty() && first) {
            if !first {
                self.write_basic_header(out, 3, csid);
                if ext_ts {
                    out.put_u32(timestamp);
                }
            }
            let take = (data.len() - offset).min(self.write_chunk_size);
            out.put_slice(&data[offset..offset + take]);
            offset += take;
            first = false;
            if data.is_empty() {
                break;
            }
        }
    }
}

/// Bundles encoder and decoder state for a connection.
pub struct ChunkCodec {
    pub decoder: ChunkDecoder,
    pub encoder: ChunkEncoder,
}

impl ChunkCodec {
    pub fn new() -> Self {
        ChunkCodec { decoder: ChunkDecoder::new(), encoder: ChunkEncoder::new() }
    }
}

impl Encoder<(u32, u32, u8, u32, Vec<u8>)> for ChunkCodec {
    type Error = Error;

    fn encode(&mut self, item: (u32, u32, u8, u32, Vec<u8>), dst: &mut BytesMut) -> Result<(), Error> {
        let (csid, timestamp, msg_type_id, msg_stream_id, data) = item;
        if msg_type_id == MSG_SET_CHUNK_SIZE {
            if data.len() != 4 {
                bail!("SetChunkSize body must be 4 bytes");
            }
            let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            self.encoder.write_chunk_size = size;
        }
        self.encoder.write_message(dst, csid, timestamp, msg_type_id, msg_stream_id, &data);
        Ok(())
    }
}

impl Decoder for ChunkCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Error> {
        let msg = self.decoder.decode(src)?;
        if let Some(msg) = &msg {
            if msg.msg_type_id == MSG_SET_CHUNK_SIZE && msg.data.len() == 4 {
                let size = u32::from_be_bytes([msg.data[0], msg.data[1], msg.data[2], msg.data[3]]) as usize;
                self.decoder.set_chunk_size(size);
            }
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_message_split_across_several_chunks() {
        let mut codec = ChunkCodec::new();
        codec.encoder.write_chunk_size = 16;
        let payload: Vec<u8> = (0..100u32).map(|i| i as u8).collect();

        let mut buf = BytesMut::new();
        codec.encode((CSID_VIDEO, 1000, MSG_VIDEO, 1, payload.clone()), &mut buf).unwrap();

        // ceil(100/16) = 7 chunks: 1 format-0 + 6 format-3 continuations.
        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(16);
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.csid, CSID_VIDEO);
        assert_eq!(msg.timestamp, 1000);
        assert_eq!(msg.msg_type_id, MSG_VIDEO);
        assert_eq!(msg.msg_stream_id, 1);
        assert_eq!(msg.data, payload);
    }

    #[test]
    fn extended_timestamp_round_trips() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        codec.encode((CSID_VIDEO, 0x0100_0000, MSG_VIDEO, 1, vec![1, 2, 3]), &mut buf).unwrap();
        let mut decoder = ChunkDecoder::new();
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.timestamp, 0x0100_0000);
        assert_eq!(msg.data, vec![1, 2, 3]);
    }

    #[test]
    fn format_0_header_mid_message_is_rejected() {
        let csid = 4u32;
        let mut buf = BytesMut::new();
        // Format-0 header declaring a 10-byte message, but only 4 bytes follow.
        buf.put_u8((0 << 6) | csid as u8);
        buf.put_slice(&0u32.to_be_bytes()[1..]); // timestamp
        buf.put_slice(&10u32.to_be_bytes()[1..]); // message length
        buf.put_u8(MSG_VIDEO);
        buf.put_slice(&1u32.to_le_bytes()); // msg stream id
        buf.put_slice(&[1, 2, 3, 4]);
        // Another format-0 header arrives on the same CSID before the first
        // message's remaining 6 bytes ever show up.
        buf.put_u8((0 << 6) | csid as u8);
        buf.put_slice(&0u32.to_be_bytes()[1..]);
        buf.put_slice(&3u32.to_be_bytes()[1..]);
        buf.put_u8(MSG_VIDEO);
        buf.put_slice(&1u32.to_le_bytes());
        buf.put_slice(&[9, 9, 9]);

        let mut decoder = ChunkDecoder::new();
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(err.to_string().contains("mid-message"));
    }

    #[test]
    fn format_3_ticks_the_clock_only_when_starting_a_new_message() {
        let csid = 4u32;
        let mut buf = BytesMut::new();

        // Message 1: format-0, timestamp 1000, establishes the CSID.
        buf.put_u8((0 << 6) | csid as u8);
        buf.put_slice(&1000u32.to_be_bytes()[1..]);
        buf.put_slice(&3u32.to_be_bytes()[1..]);
        buf.put_u8(MSG_AUDIO);
        buf.put_slice(&1u32.to_le_bytes());
        buf.put_slice(&[1, 2, 3]);

        // Message 2: format-1, delta 40 (-> timestamp 1040), establishes the delta.
        buf.put_u8((1 << 6) | csid as u8);
        buf.put_slice(&40u32.to_be_bytes()[1..]);
        buf.put_slice(&3u32.to_be_bytes()[1..]);
        buf.put_u8(MSG_AUDIO);
        buf.put_slice(&[4, 5, 6]);

        // Message 3: bare format-3 header reusing the prior type/length/delta.
        // It starts a new message (no bytes buffered yet), so it must tick by
        // the stored delta once: 1040 + 40 = 1080.
        buf.put_u8((3 << 6) | csid as u8);
        buf.put_slice(&[7, 8, 9]);

        let mut decoder = ChunkDecoder::new();
        let msg1 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg1.timestamp, 1000);
        let msg2 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg2.timestamp, 1040);
        let msg3 = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg3.timestamp, 1080);
        assert_eq!(msg3.data, vec![7, 8, 9]);
    }

    #[test]
    fn extended_timestamp_survives_a_format3_continuation() {
        let mut codec = ChunkCodec::new();
        codec.encoder.write_chunk_size = 16;
        let payload: Vec<u8> = (0..40u32).map(|i| i as u8).collect();
        let mut buf = BytesMut::new();
        codec.encode((CSID_VIDEO, 0x0100_0000, MSG_VIDEO, 1, payload.clone()), &mut buf).unwrap();

        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(16);
        let msg = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.timestamp, 0x0100_0000);
        assert_eq!(msg.data, payload);
    }

    #[test]
    fn set_chunk_size_updates_subsequent_framing() {
        let mut codec = ChunkCodec::new();
        let mut buf = BytesMut::new();
        codec.encode((CSID_PROTOCOL_CONTROL, 0, MSG_SET_CHUNK_SIZE, 0, 4096u32.to_be_bytes().to_vec()), &mut buf).unwrap();
        let big_payload = vec![7u8; 5000];
        codec.encode((CSID_VIDEO, 0, MSG_VIDEO, 1, big_payload.clone()), &mut buf).unwrap();

        let mut decoder = ChunkDecoder::new();
        let set_chunk = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(set_chunk.msg_type_id, MSG_SET_CHUNK_SIZE);
        decoder.set_chunk_size(4096);
        let video = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(video.data, big_payload);
    }
}
