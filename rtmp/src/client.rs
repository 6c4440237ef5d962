//! Dial-out RTMP: `play` (consume a remote stream as an `av::AsyncDemuxer`)
//! and `publish` (push to a remote stream as an `av::AsyncMuxer`), for the
//! `convert` CLI's `rtmp://host/app/stream` inputs/outputs.
//!
//! Reuses the same chunk/AMF0/FLV-bridge wire layer `conn.rs` drives
//! server-side, just issuing the commands a client sends instead of the ones
//! a server replies with: `connect`→`createStream`→`play`|`publish`.

use crate::amf0::{self, Value};
use crate::chunk::{self, ChunkCodec, Message};
use crate::handshake::handshake_client;
use async_trait::async_trait;
use av::{AsyncDemuxer, AsyncMuxer, CodecData, Packet};
use failure::{bail, format_err, Error};
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

const AVMSGSID: u32 = 1;
const WRITE_CHUNK_SIZE: usize = 65536;

/// Splits `rtmp://host[:port]/app/stream` into `(host:port, app, stream)`.
pub fn parse_url(url: &str) -> Result<(String, String, String), Error> {
    let rest = url.strip_prefix("rtmp://").ok_or_else(|| format_err!("not an rtmp:// url: {}", url))?;
    let mut parts = rest.splitn(3, '/');
    let host = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| format_err!("rtmp url missing host: {}", url))?;
    let app = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| format_err!("rtmp url missing app: {}", url))?;
    let stream = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| format_err!("rtmp url missing stream name: {}", url))?;
    let host = if host.contains(':') { host.to_string() } else { format!("{}:1935", host) };
    Ok((host, app.to_string(), stream.to_string()))
}

fn command(name: &str, transaction_id: f64, rest: Vec<Value>) -> Vec<u8> {
    let mut values = vec![Value::String(name.to_string()), Value::Number(transaction_id)];
    values.extend(rest);
    amf0::encode_all(&values)
}

async fn write_command<S>(framed: &mut Framed<S, ChunkCodec>, msg_stream_id: u32, body: Vec<u8>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send((chunk::CSID_COMMAND, 0, chunk::MSG_COMMAND_AMF0, msg_stream_id, body)).await
}

async fn write_av<S>(framed: &mut Framed<S, ChunkCodec>, is_video: bool, timestamp: u32, body: Vec<u8>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (csid, msg_type_id) = if is_video { (chunk::CSID_VIDEO, chunk::MSG_VIDEO) } else { (chunk::CSID_AUDIO, chunk::MSG_AUDIO) };
    framed.send((csid, timestamp, msg_type_id, AVMSGSID, body)).await
}

/// Reads messages until one carries an AMF0 `_result`/`_error` reply for
/// `transaction_id`, returning its argument list. Other commands (e.g. an
/// `onStatus` the server sends unprompted) and A/V data arriving early are
/// silently dropped, matching the original client's "ignore until the
/// handshake commands settle" behavior.
async fn await_reply<S>(framed: &mut Framed<S, ChunkCodec>, transaction_id: f64) -> Result<Vec<Value>, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let msg = framed.next().await.ok_or_else(|| format_err!("rtmp: connection closed awaiting reply"))??;
        if msg.msg_type_id != chunk::MSG_COMMAND_AMF0 {
            continue;
        }
        let values = amf0::decode_all(&msg.data)?;
        let name = values.get(0).and_then(Value::as_str).unwrap_or("");
        let tx = values.get(1).and_then(Value::as_f64).unwrap_or(-1.0);
        if tx != transaction_id {
            continue;
        }
        match name {
            "_result" => return Ok(values),
            "_error" => bail!("rtmp: server returned _error for transaction {}", transaction_id),
            _ => continue,
        }
    }
}

async fn connect_and_create_stream<S>(framed: &mut Framed<S, ChunkCodec>, app: &str) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.codec_mut().encoder.write_chunk_size = WRITE_CHUNK_SIZE;

    let mut props = BTreeMap::new();
    props.insert("app".to_string(), Value::String(app.to_string()));
    props.insert("type".to_string(), Value::String("nonprivate".to_string()));
    props.insert("flashVer".to_string(), Value::String("FMLE/3.0".to_string()));
    let connect = command("connect", 1.0, vec![Value::Object(props)]);
    write_command(framed, 0, connect).await?;
    await_reply(framed, 1.0).await?;

    let create_stream = command("createStream", 2.0, vec![Value::Null]);
    write_command(framed, 0, create_stream).await?;
    // `conn.rs`'s server always allocates stream id AVMSGSID; every message
    // this client sends after createStream addresses that constant rather
    // than whatever the reply echoes back.
    await_reply(framed, 2.0).await?;
    Ok(())
}

/// Connects to `url`, issues `connect`/`createStream`/`play`, and returns a
/// demuxer that yields the remote stream's tracks and packets.
pub async fn play(url: &str) -> Result<PlayClient<TcpStream>, Error> {
    let (host, app, stream) = parse_url(url)?;
    let mut socket = TcpStream::connect(&host).await?;
    handshake_client(&mut socket).await?;
    let mut framed = Framed::new(socket, ChunkCodec::new());
    connect_and_create_stream(&mut framed, &app).await?;

    let play_cmd = command("play", 0.0, vec![Value::Null, Value::String(stream)]);
    write_command(&mut framed, AVMSGSID, play_cmd).await?;

    Ok(PlayClient { framed, prober: flv::Prober::new() })
}

pub struct PlayClient<S> {
    framed: Framed<S, ChunkCodec>,
    prober: flv::Prober,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PlayClient<S> {
    async fn pump_one(&mut self) -> Result<bool, Error> {
        let msg = match self.framed.next().await {
            Some(m) => m?,
            None => return Ok(false),
        };
        if let Some(is_video) = av_kind(&msg) {
            self.prober.push_tag(is_video, &msg.data, Duration::from_millis(u64::from(msg.timestamp)))?;
        }
        Ok(true)
    }
}

fn av_kind(msg: &Message) -> Option<bool> {
    match msg.msg_type_id {
        chunk::MSG_VIDEO => Some(true),
        chunk::MSG_AUDIO => Some(false),
        _ => None,
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncDemuxer for PlayClient<S> {
    async fn streams(&mut self) -> Result<Vec<CodecData>, Error> {
        while !self.prober.probed() {
            if !self.pump_one().await? {
                bail!("rtmp: connection closed before streams were known");
            }
        }
        Ok(self.prober.streams())
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
        loop {
            if let Some(pkt) = self.prober.pop_packet() {
                return Ok(Some(pkt));
            }
            if !self.pump_one().await? {
                return Ok(None);
            }
        }
    }
}

/// Connects to `url` and issues `connect`/`createStream`/`publish`, returning
/// a muxer that pushes packets to the remote stream.
pub async fn publish(url: &str) -> Result<PublishClient<TcpStream>, Error> {
    let (host, app, stream) = parse_url(url)?;
    let mut socket = TcpStream::connect(&host).await?;
    handshake_client(&mut socket).await?;
    let mut framed = Framed::new(socket, ChunkCodec::new());
    connect_and_create_stream(&mut framed, &app).await?;

    let publish_cmd = command("publish", 0.0, vec![Value::Null, Value::String(stream), Value::String("live".to_string())]);
    write_command(&mut framed, AVMSGSID, publish_cmd).await?;

    Ok(PublishClient { framed, streams: Vec::new(), start: None })
}

pub struct PublishClient<S> {
    framed: Framed<S, ChunkCodec>,
    streams: Vec<CodecData>,
    start: Option<Duration>,
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> AsyncMuxer for PublishClient<S> {
    async fn write_header(&mut self, streams: &[CodecData]) -> Result<(), Error> {
        self.streams = streams.to_vec();
        for cd in streams {
            if let Some(body) = flv::codec_data_to_tag_body(cd) {
                write_av(&mut self.framed, cd.is_video(), 0, body).await?;
            }
        }
        Ok(())
    }

    async fn write_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        let cd = self
            .streams
            .get(usize::from(pkt.idx.max(0) as u8))
            .ok_or_else(|| format_err!("rtmp publish: packet references unknown stream index {}", pkt.idx))?;
        let start = *self.start.get_or_insert(pkt.time);
        let timestamp = pkt.time.saturating_sub(start).as_millis() as u32;
        let is_video = cd.is_video();
        let body = flv::packet_to_tag_body(&pkt, cd)?;
        write_av(&mut self.framed, is_video, timestamp, body).await
    }

    async fn write_trailer(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_app_and_stream() {
        let (host, app, stream) = parse_url("rtmp://example.com/live/mystream").unwrap();
        assert_eq!(host, "example.com:1935");
        assert_eq!(app, "live");
        assert_eq!(stream, "mystream");
    }

    #[test]
    fn parses_explicit_port() {
        let (host, app, stream) = parse_url("rtmp://example.com:1936/live/mystream").unwrap();
        assert_eq!(host, "example.com:1936");
        assert_eq!(app, "live");
        assert_eq!(stream, "mystream");
    }

    #[test]
    fn rejects_non_rtmp_scheme() {
        assert!(parse_url("rtsp://example.com/live/mystream").is_err());
    }
}
