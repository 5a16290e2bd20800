//! End-to-end playback through the public player API.

use std::io::Write;
use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use tempfile::NamedTempFile;

use kinescope::clock::ClockState;
use kinescope::container::{ByteOrder, ContainerShape, ContainerWriter, FrameHeader};
use kinescope::demux::SkipReason;
use kinescope::display::{Color, FrameBuffer};
use kinescope::error::TransportError;
use kinescope::transport::ChannelTransport;
use kinescope::{Config, StepOutcome, VideoPlayer};

const WIDTH: u32 = 160;
const HEIGHT: u32 = 120;
const FPS: u32 = 10;
const INTERVAL: u32 = 1000 / FPS;

const RED: [u8; 3] = [255, 0, 0];
const GREEN: [u8; 3] = [0, 255, 0];
const BLUE: [u8; 3] = [0, 0, 255];

fn solid_jpeg(rgb: [u8; 3]) -> Vec<u8> {
    let image = RgbImage::from_pixel(WIDTH, HEIGHT, Rgb(rgb));
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, 90)
        .encode_image(&image)
        .unwrap();
    jpeg
}

fn container(order: ByteOrder, frames: &[Vec<u8>]) -> Vec<u8> {
    let count = frames.len() as u32;
    let mut writer =
        ContainerWriter::with_byte_order(Vec::new(), WIDTH, HEIGHT, count, FPS, order).unwrap();
    for frame in frames {
        writer.write_frame(frame).unwrap();
    }
    writer.finish().unwrap()
}

fn temp_file(bytes: &[u8]) -> NamedTempFile {
    let mut tmp = NamedTempFile::new().unwrap();
    tmp.write_all(bytes).unwrap();
    tmp.flush().unwrap();
    tmp
}

fn file_player(path: &Path, looping: bool) -> VideoPlayer<FrameBuffer> {
    let mut config = Config::default();
    config.player.path = Some(path.to_path_buf());
    config.player.looping = looping;
    let mut player = VideoPlayer::new(config, FrameBuffer::new(WIDTH, HEIGHT)).unwrap();
    player.init(0).unwrap();
    player
}

fn stream_config() -> Config {
    let mut config = Config::default();
    config.player.url = Some("http://camera.local/video.mjpg".into());
    config.memory.stream_buffer_bytes = 64 * 1024;
    config
}

fn center(player: &VideoPlayer<FrameBuffer>) -> Color {
    player.display().pixel(WIDTH / 2, HEIGHT / 2).unwrap()
}

fn assert_dominant(color: Color, rgb: [u8; 3]) {
    let channels = [color.r, color.g, color.b];
    for (value, wanted) in channels.into_iter().zip(rgb) {
        if wanted == 255 {
            assert!(value > 180, "{color:?} should be close to {rgb:?}");
        } else {
            assert!(value < 80, "{color:?} should be close to {rgb:?}");
        }
    }
}

fn expect_drawn(outcome: StepOutcome) -> bool {
    match outcome {
        StepOutcome::Drawn { wrapped, .. } => wrapped,
        other => panic!("expected a drawn frame, got {other:?}"),
    }
}

#[test]
fn container_file_plays_in_order_and_loops() {
    let frames = [solid_jpeg(RED), solid_jpeg(GREEN), solid_jpeg(BLUE)];
    let tmp = temp_file(&container(ByteOrder::Little, &frames));
    let mut player = file_player(tmp.path(), true);
    assert_eq!(player.frame_interval_ms(), INTERVAL);
    assert_eq!(player.header().unwrap().shape, ContainerShape::Framed);

    assert!(!expect_drawn(player.step(0).unwrap()));
    assert_dominant(center(&player), RED);

    assert_eq!(player.step(INTERVAL / 2).unwrap(), StepOutcome::NotDue);

    assert!(!expect_drawn(player.step(INTERVAL).unwrap()));
    assert_dominant(center(&player), GREEN);
    assert!(!expect_drawn(player.step(2 * INTERVAL).unwrap()));
    assert_dominant(center(&player), BLUE);

    assert!(
        expect_drawn(player.step(3 * INTERVAL).unwrap()),
        "fourth tick wraps to the first frame"
    );
    assert_dominant(center(&player), RED);

    let stats = player.stats();
    assert_eq!(stats.frames_drawn, 4);
    assert_eq!(stats.loops, 1);
    assert_eq!(player.display().presented(), 4);
}

#[test]
fn big_endian_container_plays() {
    let tmp = temp_file(&container(ByteOrder::Big, &[solid_jpeg(GREEN)]));
    let mut player = file_player(tmp.path(), true);
    assert_eq!(player.header().unwrap().byte_order, ByteOrder::Big);

    expect_drawn(player.step(0).unwrap());
    assert_dominant(center(&player), GREEN);
}

#[test]
fn playback_stops_at_end_without_looping() {
    let tmp = temp_file(&container(ByteOrder::Little, &[solid_jpeg(RED), solid_jpeg(BLUE)]));
    let mut player = file_player(tmp.path(), false);

    expect_drawn(player.step(0).unwrap());
    expect_drawn(player.step(INTERVAL).unwrap());
    assert_eq!(player.step(2 * INTERVAL).unwrap(), StepOutcome::Stopped);
    assert_eq!(player.state(), ClockState::Stopped);
    assert_eq!(player.step(10 * INTERVAL).unwrap(), StepOutcome::Stopped);

    assert_dominant(center(&player), BLUE);
    assert_eq!(player.stats().frames_drawn, 2);
}

#[test]
fn oversized_frame_is_skipped_and_playback_continues() {
    let mut writer = ContainerWriter::new(Vec::new(), WIDTH, HEIGHT, 2, FPS).unwrap();
    writer
        .write_record(FrameHeader { size: 2_000_000, timestamp_ms: 0 }, &[])
        .unwrap();
    writer.write_frame(&solid_jpeg(BLUE)).unwrap();
    let tmp = temp_file(&writer.finish().unwrap());
    let mut player = file_player(tmp.path(), true);

    assert_eq!(
        player.step(0).unwrap(),
        StepOutcome::Skipped(SkipReason::InvalidSize(2_000_000))
    );
    expect_drawn(player.step(INTERVAL).unwrap());
    assert_dominant(center(&player), BLUE);

    let stats = player.stats();
    assert_eq!((stats.frames_skipped, stats.frames_drawn), (1, 1));
}

#[test]
fn corrupt_frame_keeps_previous_image() {
    let frames = [solid_jpeg(RED), b"not a jpeg at all".to_vec(), solid_jpeg(BLUE)];
    let tmp = temp_file(&container(ByteOrder::Little, &frames));
    let mut player = file_player(tmp.path(), true);

    expect_drawn(player.step(0).unwrap());
    assert_eq!(player.step(INTERVAL).unwrap(), StepOutcome::FrameDropped);
    assert_dominant(center(&player), RED);
    expect_drawn(player.step(2 * INTERVAL).unwrap());
    assert_dominant(center(&player), BLUE);

    assert_eq!(player.stats().decode_failures, 1);
    assert_eq!(player.display().presented(), 2);
}

#[test]
fn raw_mjpeg_file_plays_through_marker_scan() {
    let mut bytes = Vec::new();
    for rgb in [RED, GREEN] {
        bytes.extend_from_slice(&solid_jpeg(rgb));
    }
    let tmp = temp_file(&bytes);
    let mut player = file_player(tmp.path(), true);
    let header = *player.header().unwrap();
    assert_eq!(header.shape, ContainerShape::RawJpeg);
    let interval = player.frame_interval_ms();

    assert!(!expect_drawn(player.step(0).unwrap()));
    assert_dominant(center(&player), RED);
    assert!(!expect_drawn(player.step(interval).unwrap()));
    assert_dominant(center(&player), GREEN);
    assert!(expect_drawn(player.step(2 * interval).unwrap()));
    assert_dominant(center(&player), RED);
}

#[test]
fn settings_apply_on_the_next_tick() {
    let frames = vec![solid_jpeg(RED); 3];
    let tmp = temp_file(&container(ByteOrder::Little, &frames));
    let mut player = file_player(tmp.path(), true);
    let settings = player.settings();

    expect_drawn(player.step(0).unwrap());
    let mut next = **settings.load();
    next.update_interval_ms = 40;
    next.looping = false;
    settings.store(std::sync::Arc::new(next));

    expect_drawn(player.step(40).unwrap());
    assert_eq!(player.frame_interval_ms(), 40);
    expect_drawn(player.step(80).unwrap());
    assert_eq!(player.step(120).unwrap(), StepOutcome::Stopped);
}

#[test]
fn stream_delivered_in_small_chunks_plays_and_loops_in_buffer() {
    let frames = [solid_jpeg(RED), solid_jpeg(GREEN), solid_jpeg(BLUE)];
    let bytes = container(ByteOrder::Little, &frames);
    let (transport, pusher) = ChannelTransport::new(bytes.len());
    let mut player = VideoPlayer::new(stream_config(), FrameBuffer::new(WIDTH, HEIGHT))
        .unwrap()
        .with_transport(transport);

    player.init(0).unwrap();
    assert_eq!(player.state(), ClockState::AwaitingSource);
    assert_eq!(pusher.last_url().as_deref(), Some("http://camera.local/video.mjpg"));

    pusher.connected(Some(bytes.len() as u64)).unwrap();
    for chunk in bytes.chunks(37) {
        pusher.push(chunk.to_vec()).unwrap();
    }
    pusher.finish().unwrap();

    assert_eq!(player.step(1).unwrap(), StepOutcome::Waiting);
    assert_eq!(player.state(), ClockState::Ready);
    assert_eq!(player.frame_interval_ms(), INTERVAL);

    let mut now = 1;
    for rgb in [RED, GREEN, BLUE] {
        assert!(!expect_drawn(player.step(now).unwrap()));
        assert_dominant(center(&player), rgb);
        now += INTERVAL;
    }
    assert!(expect_drawn(player.step(now).unwrap()), "stream origin is still buffered");
    assert_dominant(center(&player), RED);

    let stats = player.stats();
    assert_eq!(stats.frames_drawn, 4);
    assert_eq!(stats.loops, 1);
    assert_eq!(stats.reconnects, 0);
    assert_eq!(stats.bytes_received, bytes.len() as u64);
}

#[test]
fn failed_stream_reconnects_after_backoff() {
    let bytes = container(ByteOrder::Little, &[solid_jpeg(RED), solid_jpeg(GREEN)]);
    let (transport, pusher) = ChannelTransport::new(bytes.len());
    let mut player = VideoPlayer::new(stream_config(), FrameBuffer::new(WIDTH, HEIGHT))
        .unwrap()
        .with_transport(transport);
    player.init(0).unwrap();

    for chunk in bytes.chunks(512) {
        pusher.push(chunk.to_vec()).unwrap();
    }
    pusher.fail(TransportError::Read("connection reset".into())).unwrap();

    assert_eq!(player.step(1).unwrap(), StepOutcome::Waiting);
    expect_drawn(player.step(1).unwrap());
    expect_drawn(player.step(1 + INTERVAL).unwrap());

    let failed_at = 1 + 2 * INTERVAL;
    assert_eq!(player.step(failed_at).unwrap(), StepOutcome::Waiting);
    assert_eq!(player.state(), ClockState::AwaitingSource);
    assert!(!pusher.is_open(), "the failed link is released");
    assert_eq!(player.stats().reconnects, 1);

    player.step(failed_at + 4_999).unwrap();
    assert!(!pusher.is_open(), "reconnect waits for the retry interval");
    player.step(failed_at + 5_000).unwrap();
    assert!(pusher.is_open());
    assert_dominant(center(&player), GREEN);
}
