use std::sync::{
    Arc, Mutex as StdMutex, OnceLock, Weak,
    atomic::{AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::json;

use super::*;
use crate::video_output::VideoOutputInfo;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct TestCodec {
    counter: u64,
    keyframe_every: u64,
    fail_pts: Option<i64>,
    sei: Option<Bytes>,
    frame_size: usize,
}

impl CodecInstance for TestCodec {
    fn encode(
        &mut self,
        frame: &EncoderFrame<'_>,
        packet: &mut EncoderPacket,
    ) -> anyhow::Result<bool> {
        if self.fail_pts == Some(frame.pts) {
            anyhow::bail!("codec rejected frame {}", frame.pts);
        }
        packet.pts = frame.pts;
        packet.dts = frame.pts;
        packet.keyframe = self.counter % self.keyframe_every == 0;
        packet.set_data(vec![self.counter as u8]);
        self.counter += 1;
        Ok(true)
    }

    fn extra_data(&self) -> Option<Bytes> {
        Some(Bytes::from_static(b"hdr"))
    }

    fn sei_data(&self) -> Option<Bytes> {
        self.sei.clone()
    }

    fn frame_size(&self) -> usize {
        self.frame_size
    }
}

struct TestInfo {
    kind: EncoderType,
    keyframe_every: u64,
    fail_create: bool,
    fail_pts: Option<i64>,
    sei: Option<Bytes>,
}

impl TestInfo {
    fn video() -> Self {
        Self {
            kind: EncoderType::Video,
            keyframe_every: 3,
            fail_create: false,
            fail_pts: None,
            sei: Some(Bytes::from_static(&[0xAA, 0xBB])),
        }
    }

    fn audio() -> Self {
        Self {
            kind: EncoderType::Audio,
            keyframe_every: 1000,
            ..Self::video()
        }
    }
}

impl EncoderInfo for TestInfo {
    fn id(&self) -> &str {
        match self.kind {
            EncoderType::Video => "test_video",
            EncoderType::Audio => "test_audio",
        }
    }

    fn kind(&self) -> EncoderType {
        self.kind
    }

    fn codec(&self) -> &str {
        "test"
    }

    fn default_settings(&self) -> Settings {
        json!({ "bitrate": 2500 })
    }

    fn create(&self, settings: &Settings) -> anyhow::Result<Box<dyn CodecInstance>> {
        if self.fail_create {
            anyhow::bail!("no such device");
        }
        Ok(Box::new(TestCodec {
            counter: 0,
            keyframe_every: self.keyframe_every,
            fail_pts: self.fail_pts,
            sei: self.sei.clone(),
            frame_size: settings
                .get("frame_size")
                .and_then(Value::as_u64)
                .unwrap_or(4) as usize,
        }))
    }
}

fn encoder(info: TestInfo) -> Arc<Encoder> {
    Encoder::new(Arc::new(info), "enc", None, Weak::new())
}

type Received = Arc<StdMutex<Vec<EncoderPacket>>>;

fn collector() -> (Arc<dyn PacketSink>, Received) {
    let received: Received = Arc::new(StdMutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    let sink: Arc<dyn PacketSink> = Arc::new(move |packet: &EncoderPacket| {
        received_clone.lock().unwrap().push(packet.share());
    });
    (sink, received)
}

fn payloads(received: &Received) -> Vec<Vec<u8>> {
    received
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.data().to_vec())
        .collect()
}

static BLANK: [u8; 4] = [0; 4];

fn raw(pts: i64) -> EncoderFrame<'static> {
    EncoderFrame {
        data: vec![&BLANK[..]],
        linesize: vec![4],
        frames: 0,
        pts,
    }
}

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn test_initialize_and_shutdown() {
    let enc = encoder(TestInfo::video());
    assert!(!enc.initialized());
    enc.initialize().unwrap();
    assert!(enc.initialized());
    assert_eq!(enc.extra_data().as_deref(), Some(&b"hdr"[..]));
    // second call is a no-op
    enc.initialize().unwrap();

    enc.shutdown().unwrap();
    assert!(!enc.initialized());
    assert!(enc.extra_data().is_none());
    assert!(matches!(enc.encode(&raw(0)), Err(Error::State(_))));
}

#[test]
fn test_initialize_failure_is_reported() {
    let enc = encoder(TestInfo {
        fail_create: true,
        ..TestInfo::video()
    });
    assert!(matches!(enc.initialize(), Err(Error::Codec(_))));
    assert!(!enc.initialized());
    assert!(enc.last_error().unwrap().contains("no such device"));
}

#[test]
fn test_start_requires_initialized_encoder() {
    let enc = encoder(TestInfo::video());
    let (sink, _) = collector();
    assert!(matches!(enc.start(sink), Err(Error::State(_))));
    assert!(!enc.active());
}

#[test]
fn test_first_keyframe_carries_header_per_sink() {
    let enc = encoder(TestInfo::video());
    enc.initialize().unwrap();

    let (a, a_received) = collector();
    enc.start(a).unwrap();
    enc.encode(&raw(0)).unwrap();
    enc.encode(&raw(1)).unwrap();

    let (b, b_received) = collector();
    enc.start(b).unwrap();
    enc.encode(&raw(2)).unwrap();
    enc.encode(&raw(3)).unwrap();
    enc.encode(&raw(4)).unwrap();

    assert_eq!(
        payloads(&a_received),
        vec![vec![0xAA, 0xBB, 0], vec![1], vec![2], vec![3], vec![4]]
    );
    // b joins mid-GOP and starts on the next keyframe
    assert_eq!(payloads(&b_received), vec![vec![0xAA, 0xBB, 3], vec![4]]);
    assert!(b_received.lock().unwrap()[0].keyframe);
    assert_eq!(enc.encoded_packets(), 5);
}

#[test]
fn test_first_keyframe_without_header_is_unmodified() {
    let enc = encoder(TestInfo {
        sei: None,
        ..TestInfo::video()
    });
    enc.initialize().unwrap();
    let (sink, received) = collector();
    enc.start(sink).unwrap();

    let packet = enc.encode(&raw(0)).unwrap().unwrap();
    assert_eq!(payloads(&received), vec![vec![0]]);
    assert!(received.lock().unwrap()[0].shares_payload_with(&packet));
}

#[test]
fn test_audio_packets_are_not_gated() {
    let enc = encoder(TestInfo::audio());
    enc.initialize().unwrap();
    let (sink, received) = collector();
    enc.start(sink).unwrap();

    enc.encode(&raw(0)).unwrap();
    enc.encode(&raw(1)).unwrap();
    // counter 0 is a keyframe, counter 1 is not, both arrive undecorated
    assert_eq!(payloads(&received), vec![vec![0], vec![1]]);
}

#[test]
fn test_start_is_deduplicated() {
    let enc = encoder(TestInfo::video());
    enc.initialize().unwrap();
    let (sink, received) = collector();
    enc.start(Arc::clone(&sink)).unwrap();
    enc.start(Arc::clone(&sink)).unwrap();
    assert!(enc.active());

    enc.encode(&raw(0)).unwrap();
    assert_eq!(received.lock().unwrap().len(), 1);

    assert!(enc.stop(&sink));
    assert!(!enc.stop(&sink));
    assert!(!enc.active());
    assert!(!enc.initialized());
}

#[test]
fn test_sinks_receive_newest_first() {
    let enc = encoder(TestInfo::audio());
    enc.initialize().unwrap();

    let order = Arc::new(StdMutex::new(Vec::new()));
    for tag in ["first", "second", "third"] {
        let order = Arc::clone(&order);
        let sink: Arc<dyn PacketSink> = Arc::new(move |_: &EncoderPacket| {
            order.lock().unwrap().push(tag);
        });
        enc.start(sink).unwrap();
    }
    enc.encode(&raw(0)).unwrap();
    assert_eq!(*order.lock().unwrap(), vec!["third", "second", "first"]);
}

#[test]
fn test_encode_failure_keeps_encoder_usable() {
    let enc = encoder(TestInfo {
        fail_pts: Some(1),
        ..TestInfo::video()
    });
    enc.initialize().unwrap();
    let (sink, received) = collector();
    enc.start(sink).unwrap();

    enc.encode(&raw(0)).unwrap();
    assert!(matches!(enc.encode(&raw(1)), Err(Error::Codec(_))));
    assert!(enc.last_error().unwrap().contains("rejected frame 1"));

    let packet = enc.encode(&raw(2)).unwrap().unwrap();
    assert_eq!(packet.pts, 2);
    assert_eq!(received.lock().unwrap().len(), 2);
    assert!(enc.active());
}

#[test]
fn test_packet_timing_is_offset_by_first_packet() {
    let enc = encoder(TestInfo::audio());
    enc.initialize().unwrap();
    let (sink, _) = collector();
    enc.start(sink).unwrap();
    assert_eq!(enc.timebase(), (1, 48000));

    let first = enc.encode(&raw(4800)).unwrap().unwrap();
    let second = enc.encode(&raw(9600)).unwrap().unwrap();
    assert_eq!(first.dts_usec, 0);
    assert_eq!(second.dts_usec, 100_000);
    assert_eq!(second.sys_dts_usec, second.dts_usec);
    assert_eq!((second.timebase_num, second.timebase_den), (1, 48000));
    assert!(enc.first_received());
}

#[test]
fn test_sink_can_stop_itself() {
    let enc = encoder(TestInfo::audio());
    enc.initialize().unwrap();

    let me: Arc<OnceLock<Weak<dyn PacketSink>>> = Arc::new(OnceLock::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let weak_enc = Arc::downgrade(&enc);
    let me_clone = Arc::clone(&me);
    let calls_clone = Arc::clone(&calls);
    let once: Arc<dyn PacketSink> = Arc::new(move |_: &EncoderPacket| {
        calls_clone.fetch_add(1, Ordering::SeqCst);
        if let (Some(enc), Some(me)) = (
            weak_enc.upgrade(),
            me_clone.get().and_then(Weak::upgrade),
        ) {
            assert!(enc.stop(&me));
        }
    });
    me.set(Arc::downgrade(&once)).ok();

    let (other, other_received) = collector();
    enc.start(other).unwrap();
    enc.start(Arc::clone(&once)).unwrap();

    enc.encode(&raw(0)).unwrap();
    enc.encode(&raw(1)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(other_received.lock().unwrap().len(), 2);
    assert!(enc.active());
}

#[derive(Default)]
struct OutputEvents {
    connected: AtomicUsize,
    disconnected: AtomicUsize,
    removed: AtomicUsize,
}

impl EncoderOutput for OutputEvents {
    fn encoder_connected(&self, _encoder: &Encoder) {
        self.connected.fetch_add(1, Ordering::SeqCst);
    }

    fn encoder_disconnected(&self, _encoder: &Encoder) {
        self.disconnected.fetch_add(1, Ordering::SeqCst);
    }

    fn remove_encoder(&self, _encoder: &Encoder) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_destroy_is_deferred_until_last_stop() {
    let registry: Arc<EncoderRegistry> = Arc::new(Mutex::new(Vec::new()));
    let enc = Encoder::new(
        Arc::new(TestInfo::video()),
        "deferred",
        None,
        Arc::downgrade(&registry),
    );
    registry.lock().push(Arc::clone(&enc));

    let events = Arc::new(OutputEvents::default());
    let output: Arc<dyn EncoderOutput> = events.clone();
    enc.add_output(&output);

    enc.initialize().unwrap();
    let (sink, received) = collector();
    enc.start(Arc::clone(&sink)).unwrap();
    assert_eq!(events.connected.load(Ordering::SeqCst), 1);

    let weak = enc.downgrade();
    enc.destroy().unwrap();
    assert!(registry.lock().is_empty());
    assert!(!enc.destroyed());
    assert!(weak.upgrade().is_some());
    assert!(matches!(enc.destroy(), Err(Error::State(_))));

    // in-flight callers keep working
    enc.encode(&raw(0)).unwrap();
    assert_eq!(received.lock().unwrap().len(), 1);
    let (late, _) = collector();
    assert!(matches!(enc.start(late), Err(Error::State(_))));

    assert!(enc.stop(&sink));
    assert!(enc.destroyed());
    assert!(weak.upgrade().is_none());
    assert_eq!(events.disconnected.load(Ordering::SeqCst), 1);
    assert_eq!(events.removed.load(Ordering::SeqCst), 1);
    assert!(matches!(enc.initialize(), Err(Error::State(_))));
}

#[test]
fn test_destroy_without_sinks_is_immediate() {
    let enc = encoder(TestInfo::video());
    enc.initialize().unwrap();
    let weak = enc.downgrade();

    enc.destroy().unwrap();
    assert!(enc.destroyed());
    assert!(weak.upgrade().is_none());
    assert!(matches!(enc.encode(&raw(0)), Err(Error::State(_))));
}

#[test]
fn test_weak_encoder_outlives_encoder() {
    let enc = encoder(TestInfo::video());
    let weak = enc.downgrade();
    assert!(weak.upgrade().is_some());
    drop(enc);
    assert!(weak.upgrade().is_none());
    assert!(WeakEncoder::default().upgrade().is_none());
}

#[test]
fn test_update_merges_settings() {
    let enc = encoder(TestInfo::video());
    enc.update(json!({ "keyint": 60 })).unwrap();
    let settings = enc.settings();
    assert_eq!(settings["bitrate"], 2500);
    assert_eq!(settings["keyint"], 60);
}

#[test]
fn test_video_setters_reject_audio_encoders() {
    let enc = encoder(TestInfo::audio());
    assert!(matches!(
        enc.set_preferred_format(VideoFormat::I420),
        Err(Error::InvalidParameter(_))
    ));
    assert!(matches!(enc.set_scaled_size(2, 2), Err(Error::InvalidParameter(_))));
    assert!(matches!(
        enc.push_audio(&[&[0.0]], 0),
        Err(Error::State(_))
    ));
}

fn video_info() -> VideoOutputInfo {
    VideoOutputInfo {
        name: "enc-test".to_string(),
        format: VideoFormat::Bgra,
        fps_num: 30,
        fps_den: 1,
        width: 4,
        height: 4,
        cache_size: 3,
        ..Default::default()
    }
}

#[test]
fn test_video_output_drives_encoder() {
    init_logging();
    let video = Arc::new(VideoOutput::open(video_info()).unwrap());
    let enc = encoder(TestInfo::video());
    enc.set_video(&video).unwrap();
    enc.set_scaled_size(2, 2).unwrap();
    assert_eq!(enc.timebase(), (1, 30));

    enc.initialize().unwrap();
    let (sink, received) = collector();
    enc.start(Arc::clone(&sink)).unwrap();
    assert_eq!(video.input_count(), 1);
    assert!(matches!(enc.set_scaled_size(4, 4), Err(Error::State(_))));

    let frame = VideoFrame::new(VideoFormat::Bgra, 4, 4).unwrap();
    video.submit_frame(&frame, 1, 2_000_000).unwrap();
    video.submit_frame(&frame, 1, 2_000_000 + video.frame_time()).unwrap();
    assert!(wait_for(|| received.lock().unwrap().len() == 2));

    let packets = received.lock().unwrap().clone();
    assert_eq!(packets[0].pts, 0);
    assert_eq!(packets[1].pts, 1);
    assert_eq!(packets[0].dts_usec, 2000);
    assert_eq!(packets[1].dts_usec, 2000 + 33_333);

    assert!(enc.stop(&sink));
    assert_eq!(video.input_count(), 0);
}

#[test]
fn test_paused_encoder_drops_raw_frames() {
    let video = Arc::new(VideoOutput::open(video_info()).unwrap());
    let enc = encoder(TestInfo::video());
    enc.set_video(&video).unwrap();
    enc.initialize().unwrap();
    let (sink, received) = collector();
    enc.start(sink).unwrap();

    enc.set_paused(true);
    let frame = VideoFrame::new(VideoFormat::Bgra, 4, 4).unwrap();
    video.submit_frame(&frame, 1, 1000).unwrap();
    assert!(wait_for(|| enc.paused_frames() == 1));
    assert!(received.lock().unwrap().is_empty());

    enc.set_paused(false);
    video.submit_frame(&frame, 1, 2000).unwrap();
    assert!(wait_for(|| received.lock().unwrap().len() == 1));
}

#[test]
fn test_paired_video_waits_for_audio() {
    let video_enc = encoder(TestInfo::video());
    let audio_enc = encoder(TestInfo::audio());
    video_enc.initialize().unwrap();
    audio_enc.initialize().unwrap();
    video_enc.set_paired(Some(&audio_enc));

    let (video_sink, video_received) = collector();
    video_enc.start(video_sink).unwrap();
    let (audio_sink, _) = collector();
    audio_enc.start(audio_sink).unwrap();

    let frame = Arc::new(VideoFrame::new(VideoFormat::Bgra, 4, 4).unwrap());
    video_enc.receive_video(&VideoData::new(Arc::clone(&frame), 1000));
    assert!(video_received.lock().unwrap().is_empty());

    assert_eq!(audio_enc.push_audio(&[&[0.0; 4], &[0.0; 4]], 1000).unwrap(), 1);
    assert!(audio_enc.first_received());

    video_enc.receive_video(&VideoData::new(frame, 2000));
    let packets = video_received.lock().unwrap().clone();
    assert_eq!(packets.len(), 1);
    // the skipped frame still consumed a tick
    assert_eq!(packets[0].pts, 1);
}

#[test]
fn test_audio_buffers_accumulate_full_frames() {
    let enc = Encoder::new(
        Arc::new(TestInfo::audio()),
        "mic",
        Some(json!({ "channels": 2, "sample_rate": 44100, "frame_size": 4 })),
        Weak::new(),
    );
    enc.initialize().unwrap();
    assert_eq!(enc.audio_channels(), 2);
    assert_eq!(enc.sample_rate(), 44100);
    assert_eq!(enc.timebase(), (1, 44100));

    let (sink, received) = collector();
    enc.start(sink).unwrap();

    let left = [0.5f32; 6];
    let right = [0.25f32; 6];
    assert_eq!(enc.push_audio(&[&left, &right], 10).unwrap(), 1);
    assert_eq!(enc.pending_audio_samples(), 2);
    assert_eq!(enc.push_audio(&[&left[..2], &right[..2]], 20).unwrap(), 1);
    assert_eq!(enc.pending_audio_samples(), 0);

    let pts: Vec<i64> = received.lock().unwrap().iter().map(|p| p.pts).collect();
    assert_eq!(pts, vec![0, 4]);

    assert!(matches!(
        enc.push_audio(&[&left], 30),
        Err(Error::InvalidParameter(_))
    ));
    enc.set_paused(true);
    assert_eq!(enc.push_audio(&[&left, &right], 40).unwrap(), 0);
    assert_eq!(enc.paused_frames(), 1);
}

#[tokio::test]
async fn test_subscribe_streams_packets() -> anyhow::Result<()> {
    let enc = encoder(TestInfo::video());
    enc.initialize()?;
    let mut packets = enc.subscribe()?;
    assert!(enc.active());

    enc.encode(&raw(0))?;
    let packet = tokio::time::timeout(Duration::from_secs(5), packets.next())
        .await?
        .ok_or_else(|| anyhow::anyhow!("stream ended"))?;
    assert!(packet.keyframe);
    assert_eq!(packet.data(), &[0xAA, 0xBB, 0]);

    drop(packets);
    assert!(!enc.active());
    Ok(())
}
