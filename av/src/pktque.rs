//! Packet-queue filters: wall-clock pacing, A/V synchronization, timestamp
//! repair, and key-frame gating.
//!
//! Grounded in `av/pktque/filters.go`.

use crate::{CodecData, Demuxer, Packet, PacketReader};
use std::time::{Duration, Instant};

/// A transform applied to one packet in place, with the option to drop it.
/// A filter chain evaluates filters in order; the first filter to drop a
/// packet short-circuits the rest.
pub trait Filter {
    fn modify_packet(
        &mut self,
        pkt: &mut Packet,
        streams: &[CodecData],
        video_idx: i8,
        audio_idx: i8,
    ) -> Result<bool, failure::Error>;
}

/// Combines multiple filters into one, evaluated in order.
pub struct Filters(pub Vec<Box<dyn Filter + Send>>);

impl Filter for Filters {
    fn modify_packet(
        &mut self,
        pkt: &mut Packet,
        streams: &[CodecData],
        video_idx: i8,
        audio_idx: i8,
    ) -> Result<bool, failure::Error> {
        for filter in self.0.iter_mut() {
            if filter.modify_packet(pkt, streams, video_idx, audio_idx)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Wraps a [`Demuxer`] and a [`Filter`] into a new `Demuxer`: on first read
/// it captures `streams()` and identifies the first video/audio stream
/// index, then loops pulling packets and applying the chain until one
/// survives.
pub struct FilterDemuxer<D, F> {
    demuxer: D,
    filter: F,
    streams: Option<Vec<CodecData>>,
    video_idx: i8,
    audio_idx: i8,
}

impl<D: Demuxer, F: Filter> FilterDemuxer<D, F> {
    pub fn new(demuxer: D, filter: F) -> Self {
        FilterDemuxer { demuxer, filter, streams: None, video_idx: -1, audio_idx: -1 }
    }

    pub fn into_inner(self) -> D {
        self.demuxer
    }

    fn ensure_streams(&mut self) -> Result<(), failure::Error> {
        if self.streams.is_some() {
            return Ok(());
        }
        let streams = self.demuxer.streams()?;
        for (i, s) in streams.iter().enumerate() {
            if s.is_video() {
                self.video_idx = i as i8;
            } else if s.is_audio() {
                self.audio_idx = i as i8;
            }
        }
        self.streams = Some(streams);
        Ok(())
    }
}

impl<D: Demuxer, F: Filter> PacketReader for FilterDemuxer<D, F> {
    fn read_packet(&mut self) -> Result<Option<Packet>, failure::Error> {
        self.ensure_streams()?;
        let streams = self.streams.as_ref().unwrap();
        loop {
            let mut pkt = match self.demuxer.read_packet()? {
                None => return Ok(None),
                Some(p) => p,
            };
            if !self.filter.modify_packet(&mut pkt, streams, self.video_idx, self.audio_idx)? {
                return Ok(Some(pkt));
            }
        }
    }
}

impl<D: Demuxer, F: Filter> Demuxer for FilterDemuxer<D, F> {
    fn streams(&mut self) -> Result<Vec<CodecData>, failure::Error> {
        self.ensure_streams()?;
        Ok(self.streams.clone().unwrap())
    }
}

/// Drops every packet until the first video key frame; passes everything
/// (including audio that was being dropped) from there on.
#[derive(Default)]
pub struct WaitKeyFrame {
    ok: bool,
}

impl Filter for WaitKeyFrame {
    fn modify_packet(
        &mut self,
        pkt: &mut Packet,
        _streams: &[CodecData],
        video_idx: i8,
        _audio_idx: i8,
    ) -> Result<bool, failure::Error> {
        if !self.ok && pkt.idx == video_idx && pkt.is_key_frame {
            self.ok = true;
        }
        Ok(!self.ok)
    }
}

/// Repairs packet timestamps: optionally rebases to zero on the first
/// packet, and optionally forces non-decreasing time by clamping jumps.
#[derive(Default)]
pub struct FixTime {
    pub start_from_zero: bool,
    pub make_increment: bool,
    zerobase: Option<Duration>,
    incrbase: Duration,
    lasttime: Option<Duration>,
}

impl Filter for FixTime {
    fn modify_packet(
        &mut self,
        pkt: &mut Packet,
        _streams: &[CodecData],
        _video_idx: i8,
        _audio_idx: i8,
    ) -> Result<bool, failure::Error> {
        if self.start_from_zero {
            let zerobase = *self.zerobase.get_or_insert(pkt.time);
            pkt.time = pkt.time.saturating_sub(zerobase);
        }

        if self.make_increment {
            pkt.time = pkt.time.saturating_sub(self.incrbase);
            let lasttime = *self.lasttime.get_or_insert(pkt.time);
            if pkt.time < lasttime || pkt.time > lasttime + Duration::from_millis(500) {
                // Accumulate the skew (forward or backward) so later packets
                // stay on the corrected axis, then clamp this one.
                if pkt.time >= lasttime {
                    self.incrbase += pkt.time - lasttime;
                } else {
                    self.incrbase = self.incrbase.saturating_sub(lasttime - pkt.time);
                }
                pkt.time = lasttime;
            }
            self.lasttime = Some(pkt.time);
        }

        Ok(false)
    }
}

/// Drops packets whose stream has drifted far from the others; corrects
/// recoverable drift by rewriting the offending packet's time and
/// resynchronizing every stream's recorded time to it.
pub struct AVSync {
    pub max_time_diff: Duration,
    time: Option<Vec<Duration>>,
}

impl Default for AVSync {
    fn default() -> Self {
        AVSync { max_time_diff: Duration::from_millis(500), time: None }
    }
}

impl AVSync {
    /// Returns `(window_start, window_end, correctable, correct_time)` for
    /// stream `i`, given the other streams' last recorded times.
    fn check(&self, i: usize) -> (Duration, Duration, bool, Duration) {
        let time = self.time.as_ref().unwrap();
        let (mut min_idx, mut max_idx) = (0usize, 0usize);
        for j in 0..time.len() {
            if time[j] < time[min_idx] {
                min_idx = j;
            }
            if time[j] > time[max_idx] {
                max_idx = j;
            }
        }
        let all_the_same = time[min_idx] == time[max_idx];
        // Preserved verbatim per the original: correctable is false only
        // when this stream is the single worst offender.
        let correctable = i != max_idx || all_the_same;
        let start = time[min_idx];
        let end = start + self.max_time_diff;
        let correct_time = start + Duration::from_millis(40);
        (start, end, correctable, correct_time)
    }
}

impl Filter for AVSync {
    fn modify_packet(
        &mut self,
        pkt: &mut Packet,
        streams: &[CodecData],
        _video_idx: i8,
        _audio_idx: i8,
    ) -> Result<bool, failure::Error> {
        if self.time.is_none() {
            self.time = Some(vec![Duration::ZERO; streams.len()]);
        }
        let i = pkt.idx as usize;
        let (start, end, correctable, correct_time) = self.check(i);
        if pkt.time >= start && pkt.time < end {
            self.time.as_mut().unwrap()[i] = pkt.time;
            Ok(false)
        } else if correctable {
            pkt.time = correct_time;
            for t in self.time.as_mut().unwrap().iter_mut() {
                *t = correct_time;
            }
            Ok(false)
        } else {
            Ok(true)
        }
    }
}

/// Emulates `-re`: for packets on stream 0, sleeps until real elapsed time
/// matches `pkt.time` measured from the first such packet.
#[derive(Default)]
pub struct Walltime {
    first_time: Option<Instant>,
}

impl Filter for Walltime {
    fn modify_packet(
        &mut self,
        pkt: &mut Packet,
        _streams: &[CodecData],
        _video_idx: i8,
        _audio_idx: i8,
    ) -> Result<bool, failure::Error> {
        if pkt.idx == 0 {
            let first_time = *self.first_time.get_or_insert_with(Instant::now);
            let target = first_time + pkt.time;
            let now = Instant::now();
            if target > now {
                std::thread::sleep(target - now);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CodecType;

    fn pkt(idx: i8, key: bool, time_ms: u64) -> Packet {
        Packet { is_key_frame: key, idx, composition_time: Duration::ZERO, time: Duration::from_millis(time_ms), duration: None, data: vec![] }
    }

    fn video_cd() -> CodecData {
        CodecData::Video { codec: CodecType::H264, width: 1, height: 1, config: vec![] }
    }

    #[test]
    fn wait_key_frame_drops_until_first_video_key() {
        let mut f = WaitKeyFrame::default();
        let streams = [video_cd()];
        let mut p = pkt(1, false, 0); // audio, dropped
        assert!(f.modify_packet(&mut p, &streams, 0, 1).unwrap());
        let mut p = pkt(0, false, 1); // non-key video, dropped
        assert!(f.modify_packet(&mut p, &streams, 0, 1).unwrap());
        let mut p = pkt(0, true, 2); // key video, passes
        assert!(!f.modify_packet(&mut p, &streams, 0, 1).unwrap());
        let mut p = pkt(1, false, 3); // audio now passes too
        assert!(!f.modify_packet(&mut p, &streams, 0, 1).unwrap());
    }

    #[test]
    fn fix_time_start_from_zero() {
        let mut f = FixTime { start_from_zero: true, ..Default::default() };
        let streams = [video_cd()];
        let mut p = pkt(0, true, 1000);
        f.modify_packet(&mut p, &streams, 0, -1).unwrap();
        assert_eq!(p.time, Duration::ZERO);
        let mut p = pkt(0, true, 1033);
        f.modify_packet(&mut p, &streams, 0, -1).unwrap();
        assert_eq!(p.time, Duration::from_millis(33));
    }

    #[test]
    fn avsync_corrects_drifted_audio() {
        let mut f = AVSync::default();
        let streams = [video_cd(), video_cd()];
        for ms in [0, 33, 66, 99] {
            let mut p = pkt(0, true, ms);
            assert!(!f.modify_packet(&mut p, &streams, 0, 1).unwrap());
        }
        let mut p = pkt(1, false, 1000);
        assert!(!f.modify_packet(&mut p, &streams, 0, 1).unwrap());
        assert_eq!(p.time, Duration::from_millis(139)); // min(99) + 40ms
    }
}
