//! Codec-internal parsers treated as utilities the container/protocol
//! crates call into: H.264 SPS/PPS and AAC ADTS/AudioConfig.

pub mod aac;
pub mod adts;
pub mod h264;
