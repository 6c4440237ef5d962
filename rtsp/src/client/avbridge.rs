//! Bridges a played-out [`Session`] onto `av::Packet`/`av::CodecData`, so it
//! looks like any other `av::AsyncDemuxer` to the `convert` CLI.
//!
//! Grounded in `rtsp/examples/client/mp4.rs`'s own `Session::next` dispatch
//! loop (DESCRIBE/SETUP/PLAY, then `Message::Data` → `session.channel` →
//! per-track `ChannelHandler`): generalized here from that example's single
//! hardcoded H.264 track and bespoke `.mp4` writer onto however many
//! audio/video streams the SDP offers and the shared packet pipeline.
//! H.264's push/pull [`Demuxer`] and AAC's direct [`rtp::PacketHandler`]
//! impl are different shapes, so each gets its own
//! [`DemuxedItemSink`]/[`aac::FrameHandler`] that funnels into one shared
//! queue.

use crate::client::audio::aac;
use crate::client::rtp::StrictSequenceChecker;
use crate::client::video::h264;
use crate::client::{
    ChannelHandler, ChannelType, Credentials, DemuxedItem, DemuxedItemSink, DemuxerAdapter,
    Presentation, Session, StreamState,
};
use crate::Timeline;
use async_trait::async_trait;
use av::{AsyncDemuxer, ChannelLayout, CodecData, CodecType, Packet, SampleFormat};
use bytes::Buf;
use failure::{bail, format_err, Error};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

fn duration_from_timestamp(ts: &crate::Timestamp) -> Duration {
    Duration::from_secs_f64(ts.elapsed() as f64 / f64::from(ts.clock_rate()))
}

fn video_codec_data(params: &h264::Parameters) -> CodecData {
    use crate::client::video::Metadata;
    let (width, height) = params.pixel_dimensions();
    CodecData::Video {
        codec: CodecType::H264,
        width,
        height,
        config: params.avc_decoder_config().to_vec(),
    }
}

fn audio_codec_data(params: &aac::Parameters) -> Result<CodecData, Error> {
    let channel_layout = match params.channels() {
        1 => ChannelLayout::mono(),
        2 => ChannelLayout::stereo(),
        n => bail!("AAC stream has unsupported channel count {}", n),
    };
    Ok(CodecData::Audio {
        codec: CodecType::Aac,
        sample_format: SampleFormat::S16,
        sample_rate: params.sample_rate(),
        channel_layout,
        config: params.raw_config().to_vec(),
        samples_per_packet: 1024,
    })
}

/// Shared sink every per-track handler funnels its decoded output into.
/// `Session::next` drives one interleaved connection serially, so a plain
/// mutex (rather than a channel) is enough: there's never more than one
/// producer active at a time.
#[derive(Default)]
struct Queue {
    packets: VecDeque<Packet>,
    /// Set when the video track's in-band parameters change mid-stream;
    /// cleared by the next `streams()` call, which callers must re-read and
    /// use to build a fresh muxer before consuming further packets.
    param_change: Option<CodecData>,
}

struct VideoSink {
    idx: i8,
    queue: Arc<Mutex<Queue>>,
}

#[async_trait]
impl DemuxedItemSink for VideoSink {
    async fn item(&mut self, item: DemuxedItem) -> Result<(), Error> {
        match item {
            DemuxedItem::Picture(mut pic) => {
                let time = duration_from_timestamp(&pic.rtp_timestamp);
                let is_key_frame = pic.is_random_access_point;
                let mut data = Vec::with_capacity(pic.remaining());
                while pic.has_remaining() {
                    let n = pic.chunk().len();
                    data.extend_from_slice(pic.chunk());
                    pic.advance(n);
                }
                self.queue.lock().unwrap().packets.push_back(Packet {
                    is_key_frame,
                    idx: self.idx,
                    composition_time: Duration::ZERO,
                    time,
                    duration: None,
                    data,
                });
            }
            DemuxedItem::ParameterChange(params) => {
                self.queue.lock().unwrap().param_change = Some(video_codec_data(&params));
            }
            DemuxedItem::AudioFrame(_) => unreachable!("the h264 demuxer never yields an audio frame"),
        }
        Ok(())
    }
}

struct AudioSink {
    idx: i8,
    queue: Arc<Mutex<Queue>>,
}

#[async_trait]
impl aac::FrameHandler for AudioSink {
    async fn frame(&mut self, frame: aac::Frame) -> Result<(), Error> {
        let time = duration_from_timestamp(&frame.timestamp);
        self.queue.lock().unwrap().packets.push_back(Packet {
            is_key_frame: true,
            idx: self.idx,
            composition_time: Duration::ZERO,
            time,
            duration: None,
            data: frame.data.to_vec(),
        });
        Ok(())
    }
}

/// An `av::AsyncDemuxer` over a live RTSP session: DESCRIBEs, SETUPs every
/// stream whose encoding this toolkit understands, PLAYs, and translates
/// each track's depacketized output into `av::Packet`s as `Session::next`
/// is pumped.
pub struct RtspAvDemuxer {
    session: Session,
    presentation: Presentation,
    handlers: HashMap<usize, Box<dyn ChannelHandler + Send>>,
    timelines: HashMap<usize, Timeline>,
    queue: Arc<Mutex<Queue>>,
    streams: Vec<CodecData>,
    next_keepalive: tokio::time::Instant,
}

impl RtspAvDemuxer {
    /// Parses `url`, connects, and drives DESCRIBE/SETUP/PLAY to completion.
    pub async fn open(url: &str, creds: Option<Credentials>) -> Result<Self, Error> {
        let url = Url::parse(url)?;
        Self::connect(url, creds).await
    }

    pub async fn connect(url: Url, creds: Option<Credentials>) -> Result<Self, Error> {
        let mut session = Session::connect(&url, creds).await?;
        let mut presentation = session.describe(url).await?;

        for stream_i in 0..presentation.streams.len() {
            match presentation.streams[stream_i].encoding_name.to_ascii_uppercase().as_str() {
                "H264" | "MPEG4-GENERIC" => session.setup(&mut presentation, stream_i).await?,
                other => log::info!("avbridge: ignoring unsupported RTSP media encoding {}", other),
            }
        }
        session.play(&mut presentation).await?;

        let queue = Arc::new(Mutex::new(Queue::default()));
        let mut handlers = HashMap::new();
        let mut timelines = HashMap::new();
        let mut streams = Vec::new();

        for (stream_i, stream) in presentation.streams.iter().enumerate() {
            let (ssrc, initial_seq, initial_rtptime) = match stream.state {
                StreamState::Playing { ssrc, initial_seq, initial_rtptime } => (ssrc, initial_seq, initial_rtptime),
                _ => continue,
            };
            let idx = streams.len() as i8;
            timelines.insert(stream_i, Timeline::new(Some(initial_rtptime), stream.clock_rate)?);
            match stream.encoding_name.to_ascii_uppercase().as_str() {
                "H264" => {
                    let params = stream
                        .metadata
                        .clone()
                        .ok_or_else(|| format_err!("H264 stream {} has no sprop-parameter-sets", stream_i))?;
                    streams.push(video_codec_data(&params));
                    let sink = VideoSink { idx, queue: queue.clone() };
                    let demuxer = h264::Demuxer::new(params);
                    let adapter = DemuxerAdapter::new(demuxer, sink);
                    let checker = StrictSequenceChecker::new(ssrc, initial_seq, adapter);
                    handlers.insert(stream_i, Box::new(checker) as Box<dyn ChannelHandler + Send>);
                }
                "MPEG4-GENERIC" => {
                    let fmtp = stream
                        .fmtp
                        .as_deref()
                        .ok_or_else(|| format_err!("AAC stream {} has no fmtp", stream_i))?;
                    let params = aac::Parameters::from_format_specific_params(fmtp)?;
                    streams.push(audio_codec_data(&params)?);
                    let sink = AudioSink { idx, queue: queue.clone() };
                    let handler = aac::Handler::new(params, sink);
                    let checker = StrictSequenceChecker::new(ssrc, initial_seq, handler);
                    handlers.insert(stream_i, Box::new(checker) as Box<dyn ChannelHandler + Send>);
                }
                other => bail!("unsupported RTSP media encoding {} on stream {}", other, stream_i),
            }
        }

        Ok(RtspAvDemuxer {
            session,
            presentation,
            handlers,
            timelines,
            queue,
            streams,
            next_keepalive: tokio::time::Instant::now() + super::KEEPALIVE_DURATION,
        })
    }

    /// Pumps exactly one interleaved message (or sends a keepalive), routing
    /// RTP data to its track's handler and dropping RTCP/unsolicited replies.
    /// Returns `false` at EOF.
    async fn pump_one(&mut self) -> Result<bool, Error> {
        tokio::select! {
            msg = self.session.next() => {
                let msg = match msg {
                    Some(m) => m?,
                    None => return Ok(false),
                };
                if let rtsp_types::Message::Data(data) = msg.msg {
                    let channel_id = data.channel_id();
                    if let Some(mapping) = self.session.channel(channel_id) {
                        if mapping.channel_type == ChannelType::Rtp {
                            if let Some(handler) = self.handlers.get_mut(&mapping.stream_i) {
                                let timeline = self.timelines.get_mut(&mapping.stream_i)
                                    .expect("every handler has a timeline");
                                handler.data(msg.ctx, timeline, data.into_body()).await?;
                            }
                        }
                        // RTCP: ignoring the channel beyond routing is all this toolkit does with it.
                    }
                }
                Ok(true)
            }
            () = tokio::time::sleep_until(self.next_keepalive) => {
                self.session.send_keepalive(&self.presentation).await?;
                self.next_keepalive = tokio::time::Instant::now() + super::KEEPALIVE_DURATION;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl AsyncDemuxer for RtspAvDemuxer {
    async fn streams(&mut self) -> Result<Vec<CodecData>, Error> {
        if let Some(cd) = self.queue.lock().unwrap().param_change.take() {
            if let Some(slot) = self.streams.iter_mut().find(|s| s.is_video()) {
                *slot = cd;
            }
        }
        Ok(self.streams.clone())
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
        loop {
            {
                let mut q = self.queue.lock().unwrap();
                if q.param_change.is_some() {
                    bail!("video parameters changed mid-stream; call streams() again before reading further packets");
                }
                if let Some(pkt) = q.packets.pop_front() {
                    return Ok(Some(pkt));
                }
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

    fn h264_params() -> h264::Parameters {
        let sps = base64::encode(b"\x67\x4d\x00\x1e\x95\xa8\x2d\x0f\x69\xb8\x08\x08\x08\x10");
        let pps = base64::encode(b"\x68\xee\x3c\x80");
        h264::Parameters::from_format_specific_params(&format!("sprop-parameter-sets={},{}", sps, pps)).unwrap()
    }

    fn aac_params() -> aac::Parameters {
        let config = codecs::aac::AudioSpecificConfig::build_aac_lc(44_100, 2).unwrap();
        let fmtp = format!(
            "mode=AAC-hbr;config={};sizeLength=13;indexLength=3;indexDeltaLength=3",
            hex::encode(config)
        );
        aac::Parameters::from_format_specific_params(&fmtp).unwrap()
    }

    #[test]
    fn video_codec_data_carries_dimensions_and_avc_config() {
        let params = h264_params();
        let cd = video_codec_data(&params);
        assert!(cd.is_video());
        assert!(cd.width().unwrap() > 0);
        assert!(cd.height().unwrap() > 0);
        assert_eq!(cd.config(), params.avc_decoder_config());
    }

    #[test]
    fn audio_codec_data_rejects_unsupported_channel_counts() {
        let params = aac_params();
        let cd = audio_codec_data(&params).unwrap();
        assert!(cd.is_audio());
        match cd {
            CodecData::Audio { sample_rate, channel_layout, .. } => {
                assert_eq!(sample_rate, 44_100);
                assert_eq!(channel_layout.count(), 2);
            }
            _ => panic!("expected audio codec data"),
        }
    }
}
