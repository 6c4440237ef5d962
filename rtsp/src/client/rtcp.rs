use async_trait::async_trait;
use bytes::Bytes;
use failure::{Error, bail};
use log::{debug, info, trace};
use rtcp::packet::Packet;

pub struct TimestampPrinter {
    prev_sr: Option<rtcp::sender_report::SenderReport>,
}

impl TimestampPrinter {
    pub fn new() -> Self {
        TimestampPrinter {
            prev_sr: None,
        }
    }
}

#[async_trait]
impl super::ChannelHandler for TimestampPrinter {
    async fn data(&mut self, rtsp_ctx: crate::Context, timeline: &mut super::Timeline, mut data: Bytes) -> Result<(), Error> {
        while !data.is_empty() {
            let h = match rtcp::header::Header::unmarshal(&data) {
                Err(e) => bail!("corrupt RTCP header at {:#?}: {}", &rtsp_ctx, e),
                Ok(h) => h,
            };
            let pkt_len = (usize::from(h.length) + 1) * 4;
            if pkt_len > data.len() {
                bail!("rtcp pkt len {} vs remaining body len {} at {:#?}", pkt_len, data.len(), &rtsp_ctx);
            }
            let pkt = data.split_to(pkt_len);
            if h.packet_type == rtcp::header::PacketType::SenderReport {
                let pkt = match rtcp::sender_report::SenderReport::unmarshal(&pkt) {
                    Err(e) => bail!("corrupt RTCP SR at {:#?}: {}", &rtsp_ctx, e),
                    Ok(p) => p,
                };

                let timestamp = match timeline.advance(pkt.rtp_time) {
                    Ok(ts) => ts,
                    Err(e) => return Err(e.context(format!("bad RTP timestamp in RTCP SR {:#?} at {:#?}", &pkt, &rtsp_ctx)).into()),
                };
                info!("rtcp sender report, ts={} ntp={:?}", timestamp, crate::NtpTimestamp(pkt.ntp_time));
                self.prev_sr = Some(pkt);
            } else if h.packet_type == rtcp::header::PacketType::SourceDescription {
                let _pkt = rtcp::source_description::SourceDescription::unmarshal(&pkt)?;
                trace!("rtcp source description: {:#?}", &pkt);
            } else {
                debug!("rtcp: {:?}", h.packet_type);
            }
        }
        Ok(())
    }

    async fn end(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ChannelHandler;

    fn ctx() -> crate::Context {
        let addr: std::net::SocketAddr = "127.0.0.1:0".parse().unwrap();
        crate::Context {
            established: std::time::SystemTime::now(),
            local_addr: addr,
            peer_addr: addr,
            rtsp_message_offset: 0,
        }
    }

    /// Hand-builds a minimal RTCP Sender Report: header + ssrc + NTP time +
    /// RTP time + packet count + octet count, no report blocks.
    fn sender_report(ssrc: u32, ntp_time: u64, rtp_time: u32) -> Bytes {
        let mut buf = Vec::with_capacity(28);
        buf.push(0x80); // V=2, P=0, RC=0
        buf.push(200); // PT=SR
        buf.extend_from_slice(&6u16.to_be_bytes()); // length = 7 words - 1
        buf.extend_from_slice(&ssrc.to_be_bytes());
        buf.extend_from_slice(&ntp_time.to_be_bytes());
        buf.extend_from_slice(&rtp_time.to_be_bytes());
        buf.extend_from_slice(&0u32.to_be_bytes()); // packet count
        buf.extend_from_slice(&0u32.to_be_bytes()); // octet count
        Bytes::from(buf)
    }

    #[tokio::test]
    async fn advances_timeline_from_sender_report_rtp_time() {
        let mut printer = TimestampPrinter::new();
        let mut timeline = crate::Timeline::new(Some(1000), 90_000).unwrap();
        printer
            .data(ctx(), &mut timeline, sender_report(0x1234, 0, 1090))
            .await
            .unwrap();
        assert!(printer.prev_sr.is_some());
        assert_eq!(printer.prev_sr.as_ref().unwrap().rtp_time, 1090);
    }

    #[tokio::test]
    async fn rejects_truncated_packet() {
        let mut printer = TimestampPrinter::new();
        let mut timeline = crate::Timeline::new(Some(1000), 90_000).unwrap();
        let mut short = sender_report(0x1234, 0, 1090);
        short.truncate(10);
        assert!(printer.data(ctx(), &mut timeline, short).await.is_err());
    }
}
