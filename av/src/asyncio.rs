//! Async counterparts of [`crate::Demuxer`]/[`crate::Muxer`], for sources and
//! sinks backed by network I/O (RTMP, RTSP) rather than a local file.
//!
//! Network I/O is naturally presented as async `.await` points; a file-backed
//! [`crate::Demuxer`]/[`crate::Muxer`] has no actual blocking of consequence,
//! so it's given a blanket impl here rather than two parallel implementations
//! of every format. Network-native sources (RTMP client, RTSP client)
//! implement [`AsyncDemuxer`]/[`AsyncMuxer`] directly instead.

use crate::{CodecData, Packet};
use async_trait::async_trait;
use failure::Error;

#[async_trait]
pub trait AsyncDemuxer: Send {
    async fn streams(&mut self) -> Result<Vec<CodecData>, Error>;
    async fn read_packet(&mut self) -> Result<Option<Packet>, Error>;
}

#[async_trait]
pub trait AsyncMuxer: Send {
    async fn write_header(&mut self, streams: &[CodecData]) -> Result<(), Error>;
    async fn write_packet(&mut self, pkt: Packet) -> Result<(), Error>;
    async fn write_trailer(&mut self) -> Result<(), Error>;
}

#[async_trait]
impl<D: crate::Demuxer + Send> AsyncDemuxer for D {
    async fn streams(&mut self) -> Result<Vec<CodecData>, Error> {
        crate::Demuxer::streams(self)
    }

    async fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
        use crate::PacketReader;
        self.read_packet()
    }
}

#[async_trait]
impl<M: crate::Muxer + Send> AsyncMuxer for M {
    async fn write_header(&mut self, streams: &[CodecData]) -> Result<(), Error> {
        crate::Muxer::write_header(self, streams)
    }

    async fn write_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        use crate::PacketWriter;
        self.write_packet(pkt)
    }

    async fn write_trailer(&mut self) -> Result<(), Error> {
        crate::Muxer::write_trailer(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CodecType, SampleFormat, ChannelLayout};
    use std::time::Duration;

    struct FakeDemuxer {
        streams: Vec<CodecData>,
        packets: std::collections::VecDeque<Packet>,
    }

    impl crate::PacketReader for FakeDemuxer {
        fn read_packet(&mut self) -> Result<Option<Packet>, Error> {
            Ok(self.packets.pop_front())
        }
    }

    impl crate::Demuxer for FakeDemuxer {
        fn streams(&mut self) -> Result<Vec<CodecData>, Error> {
            Ok(self.streams.clone())
        }
    }

    fn audio_codec_data() -> CodecData {
        CodecData::Audio {
            codec: CodecType::Aac,
            sample_format: SampleFormat::S16,
            sample_rate: 44_100,
            channel_layout: ChannelLayout::stereo(),
            config: vec![],
            samples_per_packet: 1024,
        }
    }

    #[tokio::test]
    async fn blanket_impl_forwards_to_sync_demuxer() {
        let mut d = FakeDemuxer {
            streams: vec![audio_codec_data()],
            packets: vec![Packet {
                is_key_frame: true,
                idx: 0,
                composition_time: Duration::ZERO,
                time: Duration::from_millis(10),
                duration: None,
                data: vec![1, 2, 3],
            }]
            .into(),
        };
        let streams = AsyncDemuxer::streams(&mut d).await.unwrap();
        assert_eq!(streams.len(), 1);
        let pkt = AsyncDemuxer::read_packet(&mut d).await.unwrap().unwrap();
        assert_eq!(pkt.data, vec![1, 2, 3]);
        assert!(AsyncDemuxer::read_packet(&mut d).await.unwrap().is_none());
    }
}
