//! `convert`: the reduced `ffmpeg`-style CLI this toolkit exposes over the
//! packet pipeline — `-i <input> [-t seconds] [-re] [-v] <output>`.
//!
//! Grounded in `av/avconv/avconv.go`'s `ConvertCmdline`: open the input,
//! create the output, copy `streams()`/`read_packet()`/`write_packet()`
//! straight through (this toolkit never transcodes — decode/encode is out of
//! scope), optionally pacing on stream 0 via `-re` and truncating once a
//! packet's time passes `-t` seconds, then `write_trailer()`. Argument
//! parsing itself uses `structopt`, as `avcc` and `rtsp/examples/write_mp4.rs`
//! do, rather than `avconv.go`'s own hand-rolled flag scan.

use av::pktque::Walltime;
use av::{CodecData, Packet};
use failure::{format_err, Error};
use log::{error, info};
use std::fmt::Write as _;
use std::time::Duration;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "convert", about = "copy packets between the formats this toolkit supports")]
struct Opt {
    /// Input URL or path. A `rtmp://`/`rtsp://` scheme dials out over that
    /// protocol; `listen:rtmp://host:port/app/stream` instead starts a
    /// server and reads from the first publisher; anything else is opened
    /// as a file, dispatched by extension.
    #[structopt(short = "i", long)]
    input: String,

    /// Stop once a packet's time passes this many seconds.
    #[structopt(short = "t", long)]
    seconds: Option<f64>,

    /// Pace stream 0 to wall-clock time, as if reading a live source.
    #[structopt(long = "re")]
    realtime: bool,

    /// Print each packet's stream index, time, size, and key-frame flag.
    #[structopt(short = "v", long)]
    verbose: bool,

    /// Output URL or path, dispatched the same way as `input`.
    output: String,
}

fn prettify_failure(e: &Error) -> String {
    let mut msg = e.to_string();
    for cause in e.iter_causes() {
        write!(&mut msg, "\ncaused by: {}", cause).unwrap();
    }
    msg
}

fn video_and_audio_index(streams: &[CodecData]) -> (i8, i8) {
    let mut video_idx = -1i8;
    let mut audio_idx = -1i8;
    for (i, s) in streams.iter().enumerate() {
        if s.is_video() {
            video_idx = i as i8;
        } else if s.is_audio() {
            audio_idx = i as i8;
        }
    }
    (video_idx, audio_idx)
}

fn log_packet(streams: &[CodecData], pkt: &Packet) {
    let kind = streams.get(usize::from(pkt.idx.max(0) as u8)).map(CodecData::codec_type);
    println!(
        "stream {} ({:?}) time={:?} size={} key={}",
        pkt.idx,
        kind,
        pkt.time,
        pkt.data.len(),
        pkt.is_key_frame
    );
}

async fn run(opt: Opt) -> Result<(), Error> {
    let registry = registry::Registry::register_all();
    let mut demuxer = registry.open(&opt.input).await?;
    let mut muxer = registry.create(&opt.output).await?;

    let streams = demuxer.streams().await?;
    let (video_idx, audio_idx) = video_and_audio_index(&streams);
    muxer.write_header(&streams).await?;

    let mut walltime = Walltime::default();
    let mut start_time: Option<Duration> = None;
    let limit = opt.seconds.map(Duration::from_secs_f64);

    loop {
        let mut pkt = match demuxer.read_packet().await? {
            Some(p) => p,
            None => break,
        };

        let start = *start_time.get_or_insert(pkt.time);
        if let Some(limit) = limit {
            if pkt.time.saturating_sub(start) >= limit {
                break;
            }
        }

        if opt.realtime {
            use av::pktque::Filter;
            walltime.modify_packet(&mut pkt, &streams, video_idx, audio_idx)?;
        }

        if opt.verbose {
            log_packet(&streams, &pkt);
        }

        muxer.write_packet(pkt).await?;
    }

    muxer.write_trailer().await?;
    info!("convert: done");
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let opt = Opt::from_args();
    if let Err(e) = run(opt).await {
        error!("{}", prettify_failure(&e));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use av::CodecType;

    #[test]
    fn finds_video_and_audio_indices() {
        let streams = vec![
            CodecData::Video { codec: CodecType::H264, width: 1, height: 1, config: vec![] },
            CodecData::Audio {
                codec: CodecType::Aac,
                sample_format: av::SampleFormat::S16,
                sample_rate: 44_100,
                channel_layout: av::ChannelLayout::stereo(),
                config: vec![],
                samples_per_packet: 1024,
            },
        ];
        assert_eq!(video_and_audio_index(&streams), (0, 1));
    }

    #[test]
    fn finds_indices_when_only_audio_present() {
        let streams = vec![CodecData::Audio {
            codec: CodecType::Aac,
            sample_format: av::SampleFormat::S16,
            sample_rate: 44_100,
            channel_layout: av::ChannelLayout::mono(),
            config: vec![],
            samples_per_packet: 1024,
        }];
        assert_eq!(video_and_audio_index(&streams), (-1, 0));
    }
}
