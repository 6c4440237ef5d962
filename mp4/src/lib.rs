//! ISO BMFF (`.mp4`) demuxing and muxing: atom framing, typed boxes, the
//! `moov` container tree, and a sample-table-driven demuxer/muxer pair
//! implementing `av::Demuxer`/`av::Muxer`.
//!
//! Fragmented MP4 (`moof`/`mvex`) and 64-bit chunk offsets (`co64`) are out
//! of scope; see `boxes::ChunkOffset` and `container::Movie` for why.

pub mod atom;
pub mod boxes;
pub mod container;
pub mod demuxer;
pub mod muxer;

pub use demuxer::Demuxer;
pub use muxer::Muxer;

/// Converts a [`std::time::Duration`] into ticks of a track's timescale,
/// rounding to the nearest tick so constant-rate streams (e.g. 30000/1001
/// video re-quantized to a 90 kHz track timescale) survive a demux/remux
/// round trip without the `stts` run-length table fragmenting from
/// accumulated truncation error.
pub fn nanos_to_ticks(d: std::time::Duration, timescale: u32) -> u64 {
    let nanos = d.as_nanos();
    (nanos * u128::from(timescale) + 500_000_000) / 1_000_000_000
}

/// Converts ticks of a track's timescale back into a [`std::time::Duration`],
/// truncating like the original packet timestamps this crate reads would
/// have been computed.
pub fn ticks_to_nanos(ticks: u64, timescale: u32) -> std::time::Duration {
    let nanos = (u128::from(ticks) * 1_000_000_000) / u128::from(timescale.max(1));
    std::time::Duration::from_nanos(nanos as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tick_conversion_round_trips_constant_frame_rate() {
        let per_frame = Duration::from_nanos(33_333_333);
        let ticks = nanos_to_ticks(per_frame, 90_000);
        assert_eq!(ticks, 3000);
        let total_ticks = ticks * 299;
        assert_eq!(ticks_to_nanos(total_ticks, 90_000), Duration::from_nanos(9_966_666_666));
    }
}
