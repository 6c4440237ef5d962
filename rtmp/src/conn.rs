//! `connect` → `createStream` → `publish`|`play` server state machine, A/V
//! transport, and the publish→play tee (GOP buffer replay to late joiners).
//!
//! Grounded in `format/rtmp/rtmp.go`'s `Conn`/`Server`: `writeBasicConf`
//! (SetChunkSize/WindowAckSize/SetPeerBandwidth), `handleCmdConnect`/
//! `handleCmdCreateStream`/`handleCmdPublish`/`handleCmdPlay`, the
//! `StreamBegin` user-control event ahead of `onStatus`, and the server-wide
//! stream table a publisher registers into and a player looks up (`Server`'s
//! map keyed by stream key).

use crate::amf0::Value;
use crate::chunk::{self, ChunkCodec, Message};
use crate::handshake::handshake_server;
use crate::{amf0, flv_bridge};
use bits::ringbuf::{BufPos, RingBuf};
use failure::{bail, format_err, Error};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::codec::Framed;

const AVMSGSID: u32 = 1;
const CSID_VIDEO_DATA: u32 = chunk::CSID_VIDEO;
const CSID_AUDIO_DATA: u32 = chunk::CSID_AUDIO;
const WRITE_CHUNK_SIZE: usize = 65536;
const WINDOW_ACK_SIZE: u32 = 2_500_000;
const PEER_BANDWIDTH: u32 = 10_000_000;

/// One tag queued in a publisher's tee buffer: enough to replay framing
/// (video vs. audio, timestamp) to a late-joining player.
#[derive(Clone)]
pub struct TeeTag {
    pub is_video: bool,
    pub timestamp: u32,
    pub body: Vec<u8>,
}

fn tee_tag_size(t: &TeeTag) -> usize {
    t.body.len()
}

/// Live state for one published stream: sequence headers (for a late
/// joiner), the key-frame-aligned tee buffer, and a broadcast channel that
/// wakes waiting players as new tags arrive.
pub struct PublishedStream {
    pub video_seq_header: Option<Vec<u8>>,
    pub audio_seq_header: Option<Vec<u8>>,
    pub tee: RingBuf<TeeTag>,
    pub last_key_frame_pos: Option<BufPos>,
    notify: broadcast::Sender<()>,
}

impl PublishedStream {
    fn new() -> Self {
        let (notify, _) = broadcast::channel(16);
        PublishedStream { video_seq_header: None, audio_seq_header: None, tee: RingBuf::with_capacity(256), last_key_frame_pos: None, notify }
    }

    fn push_tag(&mut self, tag: TeeTag, is_key_frame: bool) {
        if is_key_frame {
            self.last_key_frame_pos = Some(self.tee.tail_pos());
        }
        self.tee.push(tag, tee_tag_size);
        let _ = self.notify.send(());
        // Keep the tee buffer from growing unboundedly between key frames.
        while self.tee.size_bytes() > 32 * 1024 * 1024 && self.tee.len() > 1 {
            self.tee.pop(tee_tag_size);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<()> {
        self.notify.subscribe()
    }
}

/// Server-wide table of currently published streams, keyed by `app/stream`.
#[derive(Default)]
pub struct Registry {
    streams: Mutex<HashMap<String, Arc<AsyncMutex<PublishedStream>>>>,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry::default())
    }

    fn publish(&self, key: &str) -> Arc<AsyncMutex<PublishedStream>> {
        let mut streams = self.streams.lock().unwrap();
        let stream = Arc::new(AsyncMutex::new(PublishedStream::new()));
        streams.insert(key.to_string(), stream.clone());
        stream
    }

    fn unpublish(&self, key: &str) {
        self.streams.lock().unwrap().remove(key);
    }

    fn lookup(&self, key: &str) -> Option<Arc<AsyncMutex<PublishedStream>>> {
        self.streams.lock().unwrap().get(key).cloned()
    }
}

fn command(name: &str, transaction_id: f64, rest: Vec<Value>) -> Vec<u8> {
    let mut values = vec![Value::String(name.to_string()), Value::Number(transaction_id)];
    values.extend(rest);
    amf0::encode_all(&values)
}

fn status_object(level: &str, code: &str, description: &str) -> Value {
    let mut m = BTreeMap::new();
    m.insert("level".to_string(), Value::String(level.to_string()));
    m.insert("code".to_string(), Value::String(code.to_string()));
    m.insert("description".to_string(), Value::String(description.to_string()));
    Value::Object(m)
}

/// Serves one accepted RTMP connection until the peer disconnects or an
/// unrecoverable protocol error occurs.
pub async fn serve(socket: TcpStream, registry: Arc<Registry>) -> Result<(), Error> {
    let mut socket = socket;
    handshake_server(&mut socket).await?;
    serve_io(socket, registry).await
}

async fn serve_io<S>(io: S, registry: Arc<Registry>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(io, ChunkCodec::new());
    framed.codec_mut().encoder.write_chunk_size = WRITE_CHUNK_SIZE;
    write_ctrl(&mut framed, chunk::MSG_SET_CHUNK_SIZE, (WRITE_CHUNK_SIZE as u32).to_be_bytes().to_vec()).await?;
    write_ctrl(&mut framed, chunk::MSG_WINDOW_ACK_SIZE, WINDOW_ACK_SIZE.to_be_bytes().to_vec()).await?;
    let mut peer_bw = PEER_BANDWIDTH.to_be_bytes().to_vec();
    peer_bw.push(2); // limit type "dynamic"
    write_ctrl(&mut framed, chunk::MSG_SET_PEER_BANDWIDTH, peer_bw).await?;

    let mut app = String::new();
    let mut stream_key = String::new();
    let mut role: Option<Role> = None;

    loop {
        let msg = match framed.next().await {
            Some(m) => m?,
            None => return Ok(()),
        };
        match msg.msg_type_id {
            chunk::MSG_COMMAND_AMF0 => {
                let values = amf0::decode_all(&msg.data)?;
                let name = values.get(0).and_then(Value::as_str).unwrap_or("").to_string();
                let transaction_id = values.get(1).and_then(Value::as_f64).unwrap_or(0.0);
                match name.as_str() {
                    "connect" => {
                        app = values.get(2).and_then(Value::as_object).and_then(|o| o.get("app")).and_then(Value::as_str).unwrap_or("").to_string();
                        let mut props = BTreeMap::new();
                        props.insert("fmsVer".to_string(), Value::String("FMS/3,0,1,123".to_string()));
                        props.insert("capabilities".to_string(), Value::Number(31.0));
                        let result = command("_result", transaction_id, vec![Value::Object(props), status_object("status", "NetConnection.Connect.Success", "Connection succeeded.")]);
                        write_command(&mut framed, 0, result).await?;
                    }
                    "createStream" => {
                        let result = command("_result", transaction_id, vec![Value::Null, Value::Number(AVMSGSID as f64)]);
                        write_command(&mut framed, 0, result).await?;
                    }
                    "publish" => {
                        let name = values.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                        stream_key = format!("{}/{}", app, name);
                        let published = registry.publish(&stream_key);
                        role = Some(Role::Publisher(published));
                        let status = command("onStatus", 0.0, vec![Value::Null, status_object("status", "NetStream.Publish.Start", "Start publishing")]);
                        write_command(&mut framed, AVMSGSID, status).await?;
                    }
                    "play" => {
                        let name = values.get(3).and_then(Value::as_str).unwrap_or("").to_string();
                        stream_key = format!("{}/{}", app, name);
                        let published = registry.lookup(&stream_key).ok_or_else(|| format_err!("play: no published stream {}", stream_key))?;
                        write_user_control(&mut framed, 0, AVMSGSID).await?;
                        let status = command("onStatus", 0.0, vec![Value::Null, status_object("status", "NetStream.Play.Start", "Start live")]);
                        write_command(&mut framed, AVMSGSID, status).await?;
                        let sample_access = amf0::encode_all(&[Value::String("|RtmpSampleAccess".to_string()), Value::Boolean(true), Value::Boolean(true)]);
                        write_data(&mut framed, AVMSGSID, sample_access).await?;
                        role = Some(Role::Player(published));
                        serve_player(&mut framed, role.take().unwrap()).await?;
                        return Ok(());
                    }
                    other => debug!("rtmp: ignoring command {}", other),
                }
            }
            chunk::MSG_AUDIO | chunk::MSG_VIDEO => {
                if let Some(Role::Publisher(published)) = &role {
                    handle_publisher_tag(published, msg).await?;
                }
            }
            chunk::MSG_SET_CHUNK_SIZE | chunk::MSG_ACK | chunk::MSG_WINDOW_ACK_SIZE => {}
            other => debug!("rtmp: ignoring message type {}", other),
        }
    }
}

enum Role {
    Publisher(Arc<AsyncMutex<PublishedStream>>),
    Player(Arc<AsyncMutex<PublishedStream>>),
}

async fn handle_publisher_tag(published: &Arc<AsyncMutex<PublishedStream>>, msg: Message) -> Result<(), Error> {
    let is_video = msg.msg_type_id == chunk::MSG_VIDEO;
    let is_seq_header = flv_bridge::is_sequence_header(is_video, &msg.data)?;
    let is_key_frame = flv_bridge::is_key_frame(is_video, &msg.data)?;
    let mut s = published.lock().await;
    if is_seq_header {
        if is_video {
            s.video_seq_header = Some(msg.data);
        } else {
            s.audio_seq_header = Some(msg.data);
        }
    } else {
        s.push_tag(TeeTag { is_video, timestamp: msg.timestamp, body: msg.data }, is_key_frame);
    }
    Ok(())
}

/// Replays sequence headers plus everything buffered since the last key
/// frame, then streams new tags as the publisher sends them, until the
/// player disconnects.
async fn serve_player<S>(framed: &mut Framed<S, ChunkCodec>, role: Role) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let published = match role {
        Role::Player(p) => p,
        Role::Publisher(_) => bail!("serve_player called with a publisher role"),
    };

    let mut notify = {
        let s = published.lock().await;
        s.subscribe()
    };

    let metadata = amf0::encode_all(&[Value::String("onMetaData".to_string()), Value::EcmaArray(BTreeMap::new())]);
    write_data(framed, AVMSGSID, metadata).await?;

    let mut next_pos;
    {
        let s = published.lock().await;
        if let Some(cfg) = &s.video_seq_header {
            write_av(framed, true, 0, cfg.clone()).await?;
        }
        if let Some(cfg) = &s.audio_seq_header {
            write_av(framed, false, 0, cfg.clone()).await?;
        }
        next_pos = s.last_key_frame_pos.unwrap_or_else(|| s.tee.head_pos());
        for tag in s.tee.iter_from(next_pos) {
            write_av(framed, tag.is_video, tag.timestamp, tag.body.clone()).await?;
        }
        next_pos = s.tee.tail_pos();
    }

    loop {
        tokio::select! {
            biased;
            incoming = framed.next() => {
                match incoming {
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                }
            }
            notified = notify.recv() => {
                if notified.is_err() {
                    return Ok(());
                }
                let s = published.lock().await;
                if s.tee.is_valid_pos(next_pos) || s.tee.len() == 0 {
                    for tag in s.tee.iter_from(next_pos) {
                        write_av(framed, tag.is_video, tag.timestamp, tag.body.clone()).await?;
                    }
                }
                next_pos = s.tee.tail_pos();
            }
        }
    }
}

async fn write_av<S>(framed: &mut Framed<S, ChunkCodec>, is_video: bool, timestamp: u32, body: Vec<u8>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (csid, msg_type_id) = if is_video { (CSID_VIDEO_DATA, chunk::MSG_VIDEO) } else { (CSID_AUDIO_DATA, chunk::MSG_AUDIO) };
    framed.send((csid, timestamp, msg_type_id, AVMSGSID, body)).await
}

async fn write_ctrl<S>(framed: &mut Framed<S, ChunkCodec>, msg_type_id: u8, body: Vec<u8>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send((chunk::CSID_PROTOCOL_CONTROL, 0, msg_type_id, 0, body)).await
}

async fn write_command<S>(framed: &mut Framed<S, ChunkCodec>, msg_stream_id: u32, body: Vec<u8>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send((chunk::CSID_COMMAND, 0, chunk::MSG_COMMAND_AMF0, msg_stream_id, body)).await
}

async fn write_data<S>(framed: &mut Framed<S, ChunkCodec>, msg_stream_id: u32, body: Vec<u8>) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send((chunk::CSID_COMMAND, 0, chunk::MSG_DATA_AMF0, msg_stream_id, body)).await
}

async fn write_user_control<S>(framed: &mut Framed<S, ChunkCodec>, event_type: u16, stream_id: u32) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut body = Vec::with_capacity(6);
    body.extend_from_slice(&event_type.to_be_bytes());
    body.extend_from_slice(&stream_id.to_be_bytes());
    write_ctrl(framed, chunk::MSG_USER_CONTROL, body).await
}

/// Accepts exactly one connection, runs it through `connect`/`createStream`/
/// `publish` only (no `play`, no stream table), and returns its A/V as an
/// `av::AsyncDemuxer` once both tracks' sequence headers have arrived. Used
/// for the `convert` CLI's `listen:rtmp://host:port/app/stream` inputs,
/// which want a single producer's stream rather than the full tee-and-fan-out
/// server `listen_and_serve` runs.
pub async fn listen_single_publisher(addr: &str) -> Result<PublishReceiver<TcpStream>, Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("rtmp: listening on {} for a single publisher", addr);
    let (mut socket, peer) = listener.accept().await?;
    debug!("rtmp: accepted publisher connection from {}", peer);
    handshake_server(&mut socket).await?;

    let mut framed = Framed::new(socket, ChunkCodec::new());
    framed.codec_mut().encoder.write_chunk_size = WRITE_CHUNK_SIZE;
    write_ctrl(&mut framed, chunk::MSG_SET_CHUNK_SIZE, (WRITE_CHUNK_SIZE as u32).to_be_bytes().to_vec()).await?;
    write_ctrl(&mut framed, chunk::MSG_WINDOW_ACK_SIZE, WINDOW_ACK_SIZE.to_be_bytes().to_vec()).await?;
    let mut peer_bw = PEER_BANDWIDTH.to_be_bytes().to_vec();
    peer_bw.push(2); // limit type "dynamic"
    write_ctrl(&mut framed, chunk::MSG_SET_PEER_BANDWIDTH, peer_bw).await?;

    loop {
        let msg = framed.next().await.ok_or_else(|| format_err!("rtmp: connection closed before publish"))??;
        if msg.msg_type_id != chunk::MSG_COMMAND_AMF0 {
            continue;
        }
        let values = amf0::decode_all(&msg.data)?;
        let name = values.get(0).and_then(Value::as_str).unwrap_or("");
        let transaction_id = values.get(1).and_then(Value::as_f64).unwrap_or(0.0);
        match name {
            "connect" => {
                let mut props = BTreeMap::new();
                props.insert("fmsVer".to_string(), Value::String("FMS/3,0,1,123".to_string()));
                props.insert("capabilities".to_string(), Value::Number(31.0));
                let result = command(
                    "_result",
                    transaction_id,
                    vec![Value::Object(props), status_object("status", "NetConnection.Connect.Success", "Connection succeeded.")],
                );
                write_command(&mut framed, 0, result).await?;
            }
            "createStream" => {
                let result = command("_result", transaction_id, vec![Value::Null, Value::Number(AVMSGSID as f64)]);
                write_command(&mut framed, 0, result).await?;
            }
            "publish" => {
                let status = command("onStatus", 0.0, vec![Value::Null, status_object("status", "NetStream.Publish.Start", "Start publishing")]);
                write_command(&mut framed, AVMSGSID, status).await?;
                break;
            }
            other => debug!("rtmp: listen_single_publisher ignoring command {} before publish", other),
        }
    }

    Ok(PublishReceiver { framed, prober: flv::Prober::new() })
}

/// The demuxer `listen_single_publisher` hands back once a client has
/// published; pumps incoming A/V tags through the same [`flv::Prober`]
/// `client::PlayClient` uses.
pub struct PublishReceiver<S> {
    framed: Framed<S, ChunkCodec>,
    prober: flv::Prober,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> PublishReceiver<S> {
    async fn pump_one(&mut self) -> Result<bool, Error> {
        let msg = match self.framed.next().await {
            Some(m) => m?,
            None => return Ok(false),
        };
        let is_video = match msg.msg_type_id {
            chunk::MSG_VIDEO => Some(true),
            chunk::MSG_AUDIO => Some(false),
            _ => None,
        };
        if let Some(is_video) = is_video {
            self.prober.push_tag(is_video, &msg.data, std::time::Duration::from_millis(u64::from(msg.timestamp)))?;
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> av::AsyncDemuxer for PublishReceiver<S> {
    async fn streams(&mut self) -> Result<Vec<av::CodecData>, Error> {
        while !self.prober.probed() {
            if !self.pump_one().await? {
                bail!("rtmp: publisher disconnected before streams were known");
            }
        }
        Ok(self.prober.streams())
    }

    async fn read_packet(&mut self) -> Result<Option<av::Packet>, Error> {
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

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(is_video: bool, n: u8) -> TeeTag {
        TeeTag { is_video, timestamp: u32::from(n), body: vec![n] }
    }

    #[test]
    fn registry_publish_lookup_unpublish() {
        let registry = Registry::default();
        assert!(registry.lookup("live/stream1").is_none());
        let published = registry.publish("live/stream1");
        assert!(Arc::ptr_eq(&published, &registry.lookup("live/stream1").unwrap()));
        registry.unpublish("live/stream1");
        assert!(registry.lookup("live/stream1").is_none());
    }

    #[test]
    fn push_tag_tracks_last_key_frame_position() {
        let mut s = PublishedStream::new();
        s.push_tag(tag(true, 1), false);
        s.push_tag(tag(true, 2), true);
        let key_pos = s.last_key_frame_pos.unwrap();
        s.push_tag(tag(true, 3), false);
        let replayed: Vec<u8> = s.tee.iter_from(key_pos).map(|t| t.body[0]).collect();
        assert_eq!(replayed, vec![2, 3]);
    }

    #[test]
    fn push_tag_notifies_subscribers() {
        let mut s = PublishedStream::new();
        let mut rx = s.subscribe();
        s.push_tag(tag(false, 1), false);
        assert!(rx.try_recv().is_ok());
    }
}

/// Accepts connections forever, spawning one task per connection (mirrors
/// `rtmp.go`'s `Server.ListenAndServe`).
pub async fn listen_and_serve(addr: &str, registry: Arc<Registry>) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("rtmp: listening on {}", addr);
    loop {
        let (socket, peer) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            debug!("rtmp: accepted connection from {}", peer);
            if let Err(e) = serve(socket, registry).await {
                warn!("rtmp: connection from {} ended with error: {}", peer, e);
            }
        });
    }
}
