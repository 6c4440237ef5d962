use async_trait::async_trait;
use bytes::Bytes;
use failure::{Error, bail, format_err};
use futures::{SinkExt, StreamExt};
use sdp::session_description::SessionDescription;
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::codec::Framed;
use url::Url;

pub mod audio;
pub mod avbridge;
mod parse;
pub mod rtcp;
pub mod rtp;
pub mod timeline;
pub mod video;

pub use parse::{join_control, parse_play, parse_setup};
pub use timeline::Timeline;

/// How often to send a `GET_PARAMETER` keepalive on an idle session, so a server doesn't tear
/// down the session for inactivity while we're just waiting on RTP/RTCP data.
pub const KEEPALIVE_DURATION: Duration = Duration::from_secs(30);

pub struct Credentials {
    pub username: String,
    pub password: String,
}

pub struct Session {
    creds: Option<Credentials>,
    requested_auth: Option<digest_auth::WwwAuthenticateHeader>,
    stream: Framed<tokio::net::TcpStream, crate::Codec>,
    user_agent: String,
    cseq: u32,
    session_id: Option<String>,
    next_channel_id: u8,
    channels: HashMap<u8, ChannelMapping>,
}

/// A stream described by a `DESCRIBE` response, plus the presentation-level metadata needed to
/// `SETUP`/`PLAY` it. Grounded in the `rtsp_types`/`sdp` crates' own DESCRIBE/SDP handling.
#[derive(Debug)]
pub struct Presentation {
    pub streams: Vec<Stream>,
    pub accept_dynamic_rate: bool,
    pub base_url: Url,
    pub control: Url,
    pub sdp: SessionDescription,
}

/// One `m=` media section of the SDP answer.
#[derive(Debug)]
pub struct Stream {
    pub media: String,
    pub encoding_name: String,
    pub clock_rate: u32,
    pub rtp_payload_type: u8,
    pub metadata: Option<video::h264::Parameters>,
    /// Raw `a=fmtp` format-specific-params, verbatim from the SDP, for codecs (e.g. AAC) whose
    /// metadata isn't parsed into `metadata` at `DESCRIBE` time.
    pub fmtp: Option<String>,
    pub control: Url,
    pub state: StreamState,
}

/// Where a [`Stream`] is in the `SETUP`/`PLAY` lifecycle.
#[derive(Clone, Copy, Debug)]
pub enum StreamState {
    /// Not yet `SETUP`.
    Uninit,

    /// `SETUP` but not yet (or not successfully) `PLAY`ed.
    Init(StreamStateInit),

    /// `PLAY`ed: the fields a [`rtp::StrictSequenceChecker`] needs are all known.
    Playing { ssrc: u32, initial_seq: u16, initial_rtptime: u32 },
}

/// Fields gathered from the `SETUP` response's `Transport` header and the `PLAY` response's
/// `RTP-Info` header. Not every server supplies all three up front (`ssrc` is commonly missing
/// from `SETUP` and filled in by `RTP-Info` instead), so each is optional until `play()` checks
/// that they're all present and promotes the stream to [`StreamState::Playing`].
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamStateInit {
    pub ssrc: Option<u32>,
    pub initial_seq: Option<u16>,
    pub initial_rtptime: Option<u32>,
}

/// Which of the paired interleaved channels (`2i`/`2i+1`) a [`ChannelMapping`] refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelType {
    Rtp,
    Rtcp,
}

/// Which stream an interleaved data channel belongs to, and whether it carries RTP or RTCP.
#[derive(Clone, Copy, Debug)]
pub struct ChannelMapping {
    pub stream_i: usize,
    pub channel_type: ChannelType,
}

/// Handles data from a RTSP data channel.
#[async_trait]
pub trait ChannelHandler {
    async fn data(&mut self, ctx: crate::Context, timeline: &mut timeline::Timeline, data: Bytes) -> Result<(), Error>;
    async fn end(&mut self) -> Result<(), Error>;
}

/// One access unit produced by a codec-specific per-stream depacketizer (`push`/`pull`).
/// `WaitKeyFrame`/`FixTime`/the MP4 muxer consume these indirectly via [`av::Packet`] once a
/// caller (e.g. `rtsp/examples/client/mp4.rs`) adapts them onto the shared packet model.
pub enum DemuxedItem {
    Picture(video::Picture),
    AudioFrame(audio::aac::Frame),
    ParameterChange(video::h264::Parameters),
}

/// Per-stream depacketizer: reassembles RTP packets into access units. `push` never blocks or
/// produces output directly; callers must `pull` in a loop until it returns `Ok(None)` before
/// pushing the next packet, mirroring the one-NAL-unit-in-flight buffering used by
/// `video::h264::Demuxer`.
pub trait Demuxer: Send {
    fn push(&mut self, pkt: rtp::Packet) -> Result<(), Error>;
    fn pull(&mut self) -> Result<Option<DemuxedItem>, Error>;
}

impl Demuxer for Box<dyn Demuxer> {
    fn push(&mut self, pkt: rtp::Packet) -> Result<(), Error> {
        (**self).push(pkt)
    }

    fn pull(&mut self) -> Result<Option<DemuxedItem>, Error> {
        (**self).pull()
    }
}

/// Receives each [`DemuxedItem`] a [`DemuxerAdapter`] pulls.
#[async_trait]
pub trait DemuxedItemSink: Send {
    async fn item(&mut self, item: DemuxedItem) -> Result<(), Error>;
}

/// Bridges a `push`/`pull` [`Demuxer`] into a [`rtp::PacketHandler`], so it can be wrapped in a
/// [`rtp::StrictSequenceChecker`] like any other per-packet handler: every `pkt` call pushes the
/// packet in, then drains `pull` to exhaustion before returning.
pub struct DemuxerAdapter<D: Demuxer, S: DemuxedItemSink> {
    demuxer: D,
    sink: S,
}

impl<D: Demuxer, S: DemuxedItemSink> DemuxerAdapter<D, S> {
    pub fn new(demuxer: D, sink: S) -> Self {
        Self { demuxer, sink }
    }
}

#[async_trait]
impl<D: Demuxer, S: DemuxedItemSink> rtp::PacketHandler for DemuxerAdapter<D, S> {
    async fn pkt(&mut self, pkt: rtp::Packet) -> Result<(), Error> {
        self.demuxer.push(pkt)?;
        while let Some(item) = self.demuxer.pull()? {
            self.sink.item(item).await?;
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct DescribeResponse {
    /// True iff `X-Accept-Dynamic-Rate: 1` is set.
    pub accept_dynamic_rate: bool,

    /// The `Content-Base`, `Content-Location`, or request URL, as specified in RFC 2326 section C.1.1.
    pub base_url: Url,

    pub sdp: SessionDescription,
}

/// Converts from an RTSP method to a digest method.
/// Unfortunately all [digest_auth::HttpMethod]s have to be `&'static`, where all the other parameters are `Cow`.
/// Therefore extension methods aren't supported for now.
fn http_method(method: &rtsp_types::Method) -> Result<digest_auth::HttpMethod, Error> {
    use rtsp_types::Method;
    Ok(digest_auth::HttpMethod::OTHER(match method {
        Method::Describe => "DESCRIBE",
        Method::GetParameter => "GET_PARAMETER",
        Method::Options => "OPTIONS",
        Method::Pause => "PAUSE",
        Method::Play => "PLAY",
        Method::PlayNotify => "PLAY_NOTIFY",
        Method::Redirect => "REDIRECT",
        Method::Setup => "SETUP",
        Method::SetParameter => "SET_PARAMETER",
        Method::Teardown => "TEARDOWN",
        Method::Extension(m) => bail!("can't authenticate with method {:?}", &m),
    }))
}

impl Session {
    pub async fn connect(url: &Url, creds: Option<Credentials>) -> Result<Self, Error> {
        if url.scheme() != "rtsp" {
            bail!("Only rtsp urls supported (no rtsps yet)");
        }
        if url.username() != "" || url.password().is_some() {
            // Url apparently doesn't even have a way to clear the credentials,
            // so this has to be an error.
            bail!("URL must not contain credentials");
        }
        let host = url.host_str().ok_or_else(|| format_err!("Must specify host in rtsp url {}", &url))?;
        let port = url.port().unwrap_or(554);
        let stream = tokio::net::TcpStream::connect((host, port)).await?;
        let established = std::time::SystemTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let stream = Framed::new(stream, crate::Codec {
            ctx: crate::Context {
                established,
                local_addr,
                peer_addr,
                rtsp_message_offset: 0,
            },
        });
        Ok(Session {
            creds,
            requested_auth: None,
            stream,
            user_agent: "moonfire-rtsp test".to_string(),
            cseq: 1,
            session_id: None,
            next_channel_id: 0,
            channels: HashMap::new(),
        })
    }

    /// Reconnects to `url`'s host/port, discarding the prior connection's session id and
    /// interleaved-channel assignments (the new server doesn't know about either). Used to
    /// recover from a 3xx redirect, which retargets the request at a new authority but keeps
    /// its request-line URI otherwise unchanged.
    async fn reconnect(&mut self, url: &Url) -> Result<(), Error> {
        if url.scheme() != "rtsp" {
            bail!("redirect target {} is not an rtsp:// url", url);
        }
        let host = url.host_str().ok_or_else(|| format_err!("redirect target {} has no host", url))?;
        let port = url.port().unwrap_or(554);
        let stream = tokio::net::TcpStream::connect((host, port)).await?;
        let established = std::time::SystemTime::now();
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        self.stream = Framed::new(stream, crate::Codec {
            ctx: crate::Context { established, local_addr, peer_addr, rtsp_message_offset: 0 },
        });
        self.session_id = None;
        self.next_channel_id = 0;
        self.channels.clear();
        Ok(())
    }

    /// Sends a request and expects the next message from the peer to be its response.
    /// Takes care of authorization, redirects, and `C-Seq`. Returns `Error` if not successful.
    ///
    /// A 401 is recovered once per request (add digest auth, retry); a 3xx is recovered once per
    /// request too (reconnect to the `Location` and retry the same request on the new
    /// connection); any other non-2xx is surfaced as an error.
    pub async fn send(&mut self, req: &mut rtsp_types::Request<Bytes>) -> Result<rtsp_types::Response<Bytes>, Error> {
        let mut redirected = false;
        loop {
            let cseq = self.send_nowait(req).await?;
            let msg = self.stream.next().await.ok_or_else(|| format_err!("unexpected EOF while waiting for reply"))??;
            let resp = match msg.msg {
                rtsp_types::Message::Response(r) => r,
                o => bail!("Unexpected RTSP message {:?}", &o),
            };
            if !matches!(resp.header(&rtsp_types::headers::CSEQ), Some(v) if v.as_str() == &cseq[..]) {
                bail!("didn't get expected CSeq {:?} on {:?} at {:#?}", &cseq, &resp, &msg.ctx);
            }
            if resp.status().is_redirection() {
                if redirected {
                    bail!("Received another redirect ({}) after already following one at {:#?}", resp.status(), &msg.ctx);
                }
                let location = resp.header(&rtsp_types::headers::LOCATION)
                    .ok_or_else(|| format_err!("redirect response has no Location header at {:#?}", &msg.ctx))?;
                let location = Url::parse(location.as_str())
                    .map_err(|e| format_err!("bad Location header {:?}: {}", location.as_str(), e))?;
                self.reconnect(&location).await?;
                redirected = true;
                self.requested_auth = None;
                continue;
            }
            if resp.status() == rtsp_types::StatusCode::Unauthorized {
                if self.requested_auth.is_some() {
                    bail!("Received Unauthorized after trying digest auth at {:#?}", &msg.ctx);
                }
                let www_authenticate = match resp.header(&rtsp_types::headers::WWW_AUTHENTICATE) {
                    None => bail!("Unauthorized without WWW-Authenticate header at {:#?}", &msg.ctx),
                    Some(h) => h,
                };
                let www_authenticate = www_authenticate.as_str();
                if !www_authenticate.starts_with("Digest ") {
                    bail!("Non-digest authentication requested at {:#?}", &msg.ctx);
                }
                let www_authenticate = digest_auth::WwwAuthenticateHeader::parse(www_authenticate)?;
                self.requested_auth = Some(www_authenticate);
                continue;
            } else if !resp.status().is_success() {
                bail!("RTSP {:?} request returned {} at {:#?}", req.method(), resp.status(), &msg.ctx);
            }
            return Ok(resp);
        }
    }

    /// Sends a request without waiting for a response, returning the `CSeq` as a string.
    pub async fn send_nowait(&mut self, req: &mut rtsp_types::Request<Bytes>) -> Result<String, Error> {
        let cseq = self.cseq.to_string();
        self.cseq += 1;
        match (self.requested_auth.as_mut(), self.creds.as_ref()) {
            (None, _) => {},
            (Some(auth), Some(creds)) => {
                let uri = req.request_uri().map(|u| u.as_str()).unwrap_or("*");
                let ctx = digest_auth::AuthContext::new_with_method(
                    &creds.username, &creds.password, uri, Option::<&'static [u8]>::None, http_method(req.method())?);
                let authorization = auth.respond(&ctx)?.to_string();
                req.insert_header(rtsp_types::headers::AUTHORIZATION, authorization);
            },
            (Some(_), None) => bail!("Authentication required; no credentials supplied"),
        }
        req.insert_header(rtsp_types::headers::CSEQ, cseq.clone());
        req.insert_header(rtsp_types::headers::USER_AGENT, self.user_agent.clone());
        self.stream.send(rtsp_types::Message::Request(req.clone())).await?;
        Ok(cseq)
    }

    pub async fn describe(&mut self, url: Url) -> Result<Presentation, Error> {
        let mut req = rtsp_types::Request::builder(rtsp_types::Method::Describe, rtsp_types::Version::V1_0)
            .header(rtsp_types::headers::ACCEPT, "application/sdp")
            .request_uri(url.clone())
            .build(Bytes::new());
        let resp = self.send(&mut req).await?;
        parse::parse_describe(url, resp)
    }

    /// Sets up interleaved (RTP-over-TCP) delivery of `presentation.streams[stream_i]`,
    /// claiming the next pair of interleaved channel numbers. All streams of a presentation must
    /// share one RTSP session, so every `setup` call after the first must agree on the session id
    /// the server assigned.
    pub async fn setup(&mut self, presentation: &mut Presentation, stream_i: usize) -> Result<(), Error> {
        let control = presentation.streams.get(stream_i)
            .ok_or_else(|| format_err!("stream index {} out of range", stream_i))?
            .control.clone();
        let channel_id = self.next_channel_id;
        let transport = format!("RTP/AVP/TCP;unicast;interleaved={}-{}", channel_id, channel_id + 1);
        let mut req = rtsp_types::Request::builder(rtsp_types::Method::Setup, rtsp_types::Version::V1_0)
            .header(rtsp_types::headers::TRANSPORT, transport)
            .request_uri(control)
            .build(Bytes::new());
        if let Some(session_id) = &self.session_id {
            req.insert_header(rtsp_types::headers::SESSION, session_id.clone());
        }
        let resp = self.send(&mut req).await?;
        let setup = parse::parse_setup(&resp)?;
        match &self.session_id {
            None => self.session_id = Some(setup.session_id.to_owned()),
            Some(id) if id == setup.session_id => {},
            Some(id) => bail!("Session id changed from {} to {} on SETUP of stream {}", id, setup.session_id, stream_i),
        }
        self.channels.insert(setup.channel_id, ChannelMapping { stream_i, channel_type: ChannelType::Rtp });
        self.channels.insert(setup.channel_id + 1, ChannelMapping { stream_i, channel_type: ChannelType::Rtcp });
        self.next_channel_id = setup.channel_id.checked_add(2)
            .ok_or_else(|| format_err!("exhausted interleaved channel numbers"))?;
        presentation.streams[stream_i].state = StreamState::Init(StreamStateInit {
            ssrc: setup.ssrc,
            initial_seq: None,
            initial_rtptime: None,
        });
        Ok(())
    }

    /// Starts playback of every `SETUP` stream in `presentation`, filling in the `ssrc`/
    /// `initial_seq`/`initial_rtptime` each needs to hand off to a [`rtp::StrictSequenceChecker`].
    pub async fn play(&mut self, presentation: &mut Presentation) -> Result<(), Error> {
        let session_id = self.session_id.clone()
            .ok_or_else(|| format_err!("PLAY requires at least one prior SETUP"))?;
        let mut req = rtsp_types::Request::builder(rtsp_types::Method::Play, rtsp_types::Version::V1_0)
            .header(rtsp_types::headers::SESSION, session_id)
            .header(rtsp_types::headers::RANGE, "npt=0.000-")
            .request_uri(presentation.control.clone())
            .build(Bytes::new());
        let resp = self.send(&mut req).await?;
        parse::parse_play(resp, presentation)?;
        for (i, stream) in presentation.streams.iter_mut().enumerate() {
            if let StreamState::Init(init) = stream.state {
                let ssrc = init.ssrc.ok_or_else(|| format_err!("stream {} has no ssrc after PLAY", i))?;
                let initial_seq = init.initial_seq.ok_or_else(|| format_err!("stream {} has no initial_seq after PLAY", i))?;
                let initial_rtptime = init.initial_rtptime.ok_or_else(|| format_err!("stream {} has no initial_rtptime after PLAY", i))?;
                stream.state = StreamState::Playing { ssrc, initial_seq, initial_rtptime };
            }
        }
        Ok(())
    }

    /// Looks up which stream (and RTP-vs-RTCP) an interleaved data channel belongs to.
    pub fn channel(&self, channel_id: u8) -> Option<ChannelMapping> {
        self.channels.get(&channel_id).copied()
    }

    /// Sends a `GET_PARAMETER` with no body, the usual RTSP keepalive, to prevent the server
    /// from timing out an idle session.
    pub async fn send_keepalive(&mut self, presentation: &Presentation) -> Result<(), Error> {
        let mut req = rtsp_types::Request::builder(rtsp_types::Method::GetParameter, rtsp_types::Version::V1_0)
            .request_uri(presentation.control.clone())
            .build(Bytes::new());
        if let Some(session_id) = &self.session_id {
            req.insert_header(rtsp_types::headers::SESSION, session_id.clone());
        }
        self.send(&mut req).await?;
        Ok(())
    }

    pub async fn next(&mut self) -> Option<Result<crate::ReceivedMessage, Error>> {
        self.stream.next().await
    }
}
