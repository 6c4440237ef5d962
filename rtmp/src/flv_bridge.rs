//! Thin glue between raw FLV tag bodies moving over the wire and the
//! sequence-header/key-frame classification the server state machine needs,
//! without re-parsing full [`av::Packet`]s for every tag.

use failure::Error;
use flv::tag::{AacPacketType, AvcPacketType};

pub fn is_sequence_header(is_video: bool, body: &[u8]) -> Result<bool, Error> {
    Ok(if is_video {
        flv::tag::parse_video_tag(body)?.0.packet_type == AvcPacketType::SeqHeader
    } else {
        flv::tag::parse_audio_tag(body)?.0.packet_type == AacPacketType::SeqHeader
    })
}

pub fn is_key_frame(is_video: bool, body: &[u8]) -> Result<bool, Error> {
    Ok(if is_video {
        flv::tag::parse_video_tag(body)?.0.frame_type == flv::tag::FrameType::Key
    } else {
        true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flv::tag::{write_audio_tag, write_video_tag, AacPacketType, AvcPacketType, FrameType};

    #[test]
    fn classifies_video_sequence_header_and_key_frame() {
        let seq = write_video_tag(FrameType::Key, AvcPacketType::SeqHeader, 0, b"config");
        assert!(is_sequence_header(true, &seq).unwrap());
        assert!(is_key_frame(true, &seq).unwrap());

        let inter = write_video_tag(FrameType::Inter, AvcPacketType::Nalu, 0, b"nalu");
        assert!(!is_sequence_header(true, &inter).unwrap());
        assert!(!is_key_frame(true, &inter).unwrap());
    }

    #[test]
    fn audio_tags_are_always_key_frames() {
        let seq = write_audio_tag(AacPacketType::SeqHeader, b"config");
        assert!(is_sequence_header(false, &seq).unwrap());
        assert!(is_key_frame(false, &seq).unwrap());

        let raw = write_audio_tag(AacPacketType::Raw, b"aac frame");
        assert!(!is_sequence_header(false, &raw).unwrap());
        assert!(is_key_frame(false, &raw).unwrap());
    }
}
