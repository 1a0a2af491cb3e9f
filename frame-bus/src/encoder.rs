use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use bytes::Bytes;
use parking_lot::{Mutex, ReentrantMutex};
use serde_json::{Map, Value};

use crate::{
    error::{Error, Result},
    format::VideoFormat,
    frame::{VideoData, VideoFrame},
    packet::{EncoderPacket, EncoderType},
    scaler::ScaleInfo,
    video_input::VideoConsumer,
    video_output::VideoOutput,
};

pub type Settings = Value;

pub(crate) type EncoderRegistry = Mutex<Vec<Arc<Encoder>>>;

const DEFAULT_SAMPLE_RATE: u32 = 48000;
const DEFAULT_CHANNELS: usize = 2;

/// Describes one kind of encoder and builds codec instances for it.
pub trait EncoderInfo: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> EncoderType;

    fn codec(&self) -> &str;

    fn default_settings(&self) -> Settings {
        Value::Object(Map::new())
    }

    fn create(&self, settings: &Settings) -> anyhow::Result<Box<dyn CodecInstance>>;
}

/// A live codec. `encode` produces at most one packet per call and reports
/// whether it did.
pub trait CodecInstance: Send {
    fn encode(&mut self, frame: &EncoderFrame<'_>, packet: &mut EncoderPacket)
    -> anyhow::Result<bool>;

    /// Codec headers for muxers.
    fn extra_data(&self) -> Option<Bytes> {
        None
    }

    /// Out-of-band data placed in front of the first keyframe each sink sees.
    fn sei_data(&self) -> Option<Bytes> {
        None
    }

    fn update(&mut self, _settings: &Settings) -> anyhow::Result<()> {
        Ok(())
    }

    /// Samples per channel in one audio frame.
    fn frame_size(&self) -> usize {
        1024
    }
}

/// Receives encoded packets. The packet is borrowed for the duration of the
/// call; `share` it to keep the payload.
pub trait PacketSink: Send + Sync {
    fn receive(&self, packet: &EncoderPacket);
}

impl<F> PacketSink for F
where
    F: Fn(&EncoderPacket) + Send + Sync,
{
    fn receive(&self, packet: &EncoderPacket) {
        self(packet)
    }
}

fn same_sink(a: &Arc<dyn PacketSink>, b: &Arc<dyn PacketSink>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Something that uses an encoder, e.g. a file writer or network sender.
pub trait EncoderOutput: Send + Sync {
    fn encoder_connected(&self, _encoder: &Encoder) {}

    fn encoder_disconnected(&self, _encoder: &Encoder) {}

    /// The encoder is going away; drop any reference to it.
    fn remove_encoder(&self, encoder: &Encoder);
}

/// Raw input handed to a codec: plane views plus a presentation timestamp in
/// the encoder's timebase.
#[derive(Debug, Clone, Default)]
pub struct EncoderFrame<'a> {
    pub data: Vec<&'a [u8]>,
    pub linesize: Vec<u32>,
    /// Audio samples per channel; 0 for video.
    pub frames: u32,
    pub pts: i64,
}

impl<'a> EncoderFrame<'a> {
    pub fn from_video(frame: &'a VideoFrame, pts: i64) -> Self {
        Self {
            data: frame.planes().iter().map(|p| p.data()).collect(),
            linesize: frame.planes().iter().map(|p| p.linesize()).collect(),
            frames: 0,
            pts,
        }
    }
}

struct EncoderCallback {
    sink: Arc<dyn PacketSink>,
    sent_first_packet: bool,
}

#[derive(Debug, Default)]
struct Timing {
    start_ts: u64,
    offset_usec: i64,
    cur_pts: i64,
    timebase_num: u32,
    timebase_den: u32,
    paused_frames: u64,
}

#[derive(Debug, Default)]
struct AudioBuffers {
    sample_rate: u32,
    frame_size: usize,
    pending: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct VideoTarget {
    format: VideoFormat,
    width: u32,
    height: u32,
}

/// Consumer registered with the video output while the encoder runs.
struct RawVideo(Weak<Encoder>);

impl VideoConsumer for RawVideo {
    fn deliver(&self, frame: &VideoData) {
        if let Some(encoder) = self.0.upgrade() {
            encoder.receive_video(frame);
        }
    }
}

pub struct Encoder {
    info: Arc<dyn EncoderInfo>,
    name: String,
    settings: Mutex<Settings>,

    init_lock: ReentrantMutex<()>,
    codec: Mutex<Option<Box<dyn CodecInstance>>>,
    callbacks: Mutex<Vec<EncoderCallback>>,
    outputs: Mutex<Vec<Weak<dyn EncoderOutput>>>,

    initialized: AtomicBool,
    destroy_on_stop: AtomicBool,
    destroyed: AtomicBool,
    first_received: AtomicBool,
    paused: AtomicBool,
    encoded_packets: AtomicU64,

    timing: Mutex<Timing>,
    paired: Mutex<Weak<Encoder>>,
    last_error: Mutex<Option<String>>,

    media: Mutex<Weak<VideoOutput>>,
    target: Mutex<VideoTarget>,
    raw_consumer: Arc<dyn VideoConsumer>,
    audio: Mutex<AudioBuffers>,

    registry: Weak<EncoderRegistry>,
}

impl Encoder {
    pub(crate) fn new(
        info: Arc<dyn EncoderInfo>,
        name: &str,
        settings: Option<Settings>,
        registry: Weak<EncoderRegistry>,
    ) -> Arc<Self> {
        let mut merged = info.default_settings();
        if let Some(settings) = settings {
            merge_settings(&mut merged, settings);
        }

        Arc::new_cyclic(|weak| Self {
            name: name.to_string(),
            settings: Mutex::new(merged),
            init_lock: ReentrantMutex::new(()),
            codec: Mutex::new(None),
            callbacks: Mutex::new(Vec::new()),
            outputs: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            destroy_on_stop: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            first_received: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            encoded_packets: AtomicU64::new(0),
            timing: Mutex::new(Timing {
                timebase_num: 1,
                timebase_den: 1,
                ..Default::default()
            }),
            paired: Mutex::new(Weak::new()),
            last_error: Mutex::new(None),
            media: Mutex::new(Weak::new()),
            target: Mutex::new(VideoTarget::default()),
            raw_consumer: Arc::new(RawVideo(weak.clone())),
            audio: Mutex::new(AudioBuffers::default()),
            registry,
            info,
        })
    }

    pub fn id(&self) -> &str {
        self.info.id()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EncoderType {
        self.info.kind()
    }

    pub fn codec(&self) -> &str {
        self.info.codec()
    }

    pub fn settings(&self) -> Settings {
        self.settings.lock().clone()
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// True while at least one sink is registered.
    pub fn active(&self) -> bool {
        !self.callbacks.lock().is_empty()
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn first_received(&self) -> bool {
        self.first_received.load(Ordering::Acquire)
    }

    pub fn encoded_packets(&self) -> u64 {
        self.encoded_packets.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn set_last_error(&self, message: String) {
        *self.last_error.lock() = Some(message);
    }

    pub fn timebase(&self) -> (u32, u32) {
        let timing = self.timing.lock();
        (timing.timebase_num, timing.timebase_den)
    }

    pub fn downgrade(self: &Arc<Self>) -> WeakEncoder {
        WeakEncoder(Arc::downgrade(self))
    }

    // ==================== lifecycle ====================

    /// Creates the codec instance. Does nothing if the encoder is already
    /// initialized or running.
    pub fn initialize(&self) -> Result<()> {
        let _init = self.init_lock.lock();
        if self.destroyed() {
            return Err(Error::state(format!("encoder '{}' is destroyed", self.name)));
        }
        if self.active() || self.initialized() {
            return Ok(());
        }

        self.shutdown_locked();
        *self.last_error.lock() = None;

        let settings = self.settings();
        let codec = self.info.create(&settings).map_err(|e| {
            log::error!("encoder '{}' ({}): failed to create codec: {:#}", self.name, self.id(), e);
            self.set_last_error(format!("{:#}", e));
            Error::codec(&e)
        })?;

        if self.kind() == EncoderType::Audio {
            let sample_rate = settings
                .get("sample_rate")
                .and_then(Value::as_u64)
                .map(|v| v as u32)
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_SAMPLE_RATE);
            let channels = settings
                .get("channels")
                .and_then(Value::as_u64)
                .map(|v| v as usize)
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_CHANNELS);
            let frame_size = codec.frame_size().max(1);

            *self.audio.lock() = AudioBuffers {
                sample_rate,
                frame_size,
                pending: (0..channels).map(|_| Vec::with_capacity(frame_size)).collect(),
            };
            let mut timing = self.timing.lock();
            timing.timebase_num = 1;
            timing.timebase_den = sample_rate;
        }

        *self.codec.lock() = Some(codec);
        self.initialized.store(true, Ordering::Release);
        log::info!("encoder '{}' ({}) initialized", self.name, self.codec());
        Ok(())
    }

    /// Tears down the codec instance and sync state. Refused while running.
    pub fn shutdown(&self) -> Result<()> {
        let _init = self.init_lock.lock();
        if self.active() {
            return Err(Error::state(format!(
                "encoder '{}' cannot shut down while active",
                self.name
            )));
        }
        self.shutdown_locked();
        Ok(())
    }

    fn shutdown_locked(&self) {
        self.codec.lock().take();
        *self.paired.lock() = Weak::new();
        {
            let mut timing = self.timing.lock();
            timing.offset_usec = 0;
            timing.start_ts = 0;
        }
        self.first_received.store(false, Ordering::Release);
        self.initialized.store(false, Ordering::Release);
    }

    /// Registers `sink`. The first sink starts the encoder: it is hooked to
    /// its video output and attached outputs are told it is connected.
    pub fn start(&self, sink: Arc<dyn PacketSink>) -> Result<()> {
        let _init = self.init_lock.lock();
        if self.destroyed() || self.destroy_on_stop.load(Ordering::Acquire) {
            return Err(Error::state(format!("encoder '{}' is destroyed", self.name)));
        }
        if !self.initialized() {
            return Err(Error::state(format!("encoder '{}' is not initialized", self.name)));
        }

        let first = {
            let mut callbacks = self.callbacks.lock();
            if callbacks.iter().any(|cb| same_sink(&cb.sink, &sink)) {
                return Ok(());
            }
            callbacks.push(EncoderCallback {
                sink: Arc::clone(&sink),
                sent_first_packet: false,
            });
            callbacks.len() == 1
        };

        if first {
            self.paused.store(false, Ordering::Release);
            {
                let mut timing = self.timing.lock();
                timing.paused_frames = 0;
                timing.cur_pts = 0;
            }

            if let Err(e) = self.add_connection() {
                self.callbacks.lock().retain(|cb| !same_sink(&cb.sink, &sink));
                return Err(e);
            }
            for output in self.live_outputs() {
                output.encoder_connected(self);
            }
            log::info!("encoder '{}' started", self.name);
        }
        Ok(())
    }

    /// Unregisters `sink`; returns whether it was registered. The last sink
    /// stops the encoder and completes a pending destroy.
    pub fn stop(&self, sink: &Arc<dyn PacketSink>) -> bool {
        let _init = self.init_lock.lock();
        let last = {
            let mut callbacks = self.callbacks.lock();
            let Some(pos) = callbacks.iter().position(|cb| same_sink(&cb.sink, sink)) else {
                return false;
            };
            callbacks.remove(pos);
            callbacks.is_empty()
        };

        if last {
            self.remove_connection();
            self.initialized.store(false, Ordering::Release);
            for output in self.live_outputs() {
                output.encoder_disconnected(self);
            }
            log::info!("encoder '{}' stopped", self.name);

            if self.destroy_on_stop.load(Ordering::Acquire) {
                self.actually_destroy();
            }
        }
        true
    }

    /// Leaves the registry and frees the encoder, or defers that to the last
    /// `stop` while sinks are still registered.
    pub fn destroy(&self) -> Result<()> {
        let _init = self.init_lock.lock();
        if self.destroyed() || self.destroy_on_stop.load(Ordering::Acquire) {
            return Err(Error::state(format!(
                "encoder '{}' is already destroyed",
                self.name
            )));
        }

        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .retain(|encoder| !std::ptr::eq(Arc::as_ptr(encoder), self));
        }

        if self.active() {
            log::debug!("encoder '{}' destroy deferred until last stop", self.name);
            self.destroy_on_stop.store(true, Ordering::Release);
        } else {
            self.actually_destroy();
        }
        Ok(())
    }

    fn actually_destroy(&self) {
        self.destroyed.store(true, Ordering::Release);

        let outputs = std::mem::take(&mut *self.outputs.lock());
        for output in outputs.iter().filter_map(Weak::upgrade) {
            output.remove_encoder(self);
        }

        self.codec.lock().take();
        *self.audio.lock() = AudioBuffers::default();
        *self.paired.lock() = Weak::new();
        *self.media.lock() = Weak::new();
        log::info!("encoder '{}' destroyed", self.name);
    }

    // ==================== configuration ====================

    /// Binds a video encoder to the output it will consume. The timebase
    /// becomes the output's frame duration.
    pub fn set_video(&self, video: &Arc<VideoOutput>) -> Result<()> {
        self.require_video("set_video")?;
        if self.active() {
            return Err(Error::state(format!(
                "encoder '{}' cannot change video while active",
                self.name
            )));
        }
        let info = video.info();
        {
            let mut timing = self.timing.lock();
            timing.timebase_num = info.fps_den;
            timing.timebase_den = info.fps_num;
        }
        *self.media.lock() = Arc::downgrade(video);
        Ok(())
    }

    pub fn video(&self) -> Option<Arc<VideoOutput>> {
        self.media.lock().upgrade()
    }

    pub fn set_preferred_format(&self, format: VideoFormat) -> Result<()> {
        self.require_video("set_preferred_format")?;
        if self.active() {
            log::warn!("encoder '{}': cannot change format while active", self.name);
            return Err(Error::state("cannot change format while active"));
        }
        self.target.lock().format = format;
        Ok(())
    }

    pub fn preferred_format(&self) -> VideoFormat {
        self.target.lock().format
    }

    /// Requests frames at `width`x`height` instead of the output's size.
    pub fn set_scaled_size(&self, width: u32, height: u32) -> Result<()> {
        self.require_video("set_scaled_size")?;
        if self.active() {
            log::warn!("encoder '{}': cannot change size while active", self.name);
            return Err(Error::state("cannot change scaled size while active"));
        }
        let mut target = self.target.lock();
        target.width = width;
        target.height = height;
        Ok(())
    }

    /// Merges `settings` into the current ones and forwards them to a live
    /// codec instance.
    pub fn update(&self, settings: Settings) -> Result<()> {
        let merged = {
            let mut current = self.settings.lock();
            merge_settings(&mut current, settings);
            current.clone()
        };
        if let Some(codec) = self.codec.lock().as_mut() {
            codec.update(&merged).map_err(|e| {
                self.set_last_error(format!("{:#}", e));
                Error::codec(&e)
            })?;
        }
        Ok(())
    }

    pub fn extra_data(&self) -> Option<Bytes> {
        self.codec.lock().as_ref().and_then(|codec| codec.extra_data())
    }

    fn sei_data(&self) -> Option<Bytes> {
        self.codec.lock().as_ref().and_then(|codec| codec.sei_data())
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Raw frames dropped while paused since the encoder last started.
    pub fn paused_frames(&self) -> u64 {
        self.timing.lock().paused_frames
    }

    /// Pairs a video encoder with its audio counterpart; video waits for the
    /// pair's first packet before it begins encoding.
    pub fn set_paired(&self, pair: Option<&Arc<Encoder>>) {
        *self.paired.lock() = pair.map(Arc::downgrade).unwrap_or_default();
    }

    pub fn paired(&self) -> Option<Arc<Encoder>> {
        self.paired.lock().upgrade()
    }

    pub fn add_output(&self, output: &Arc<dyn EncoderOutput>) {
        let mut outputs = self.outputs.lock();
        outputs.retain(|o| o.strong_count() > 0);
        outputs.push(Arc::downgrade(output));
    }

    pub fn remove_output(&self, output: &Arc<dyn EncoderOutput>) {
        self.outputs
            .lock()
            .retain(|o| !std::ptr::addr_eq(o.as_ptr(), Arc::as_ptr(output)));
    }

    fn live_outputs(&self) -> Vec<Arc<dyn EncoderOutput>> {
        self.outputs.lock().iter().filter_map(Weak::upgrade).collect()
    }

    fn require_video(&self, op: &str) -> Result<()> {
        if self.kind() != EncoderType::Video {
            return Err(Error::invalid(format!(
                "{}: encoder '{}' is not a video encoder",
                op, self.name
            )));
        }
        Ok(())
    }

    fn add_connection(&self) -> Result<()> {
        if self.kind() != EncoderType::Video {
            return Ok(());
        }
        let Some(video) = self.video() else {
            log::warn!("encoder '{}' has no live video output to connect to", self.name);
            return Ok(());
        };

        let source = video.info().scale_info();
        let target = *self.target.lock();
        let conversion = ScaleInfo {
            format: match target.format {
                VideoFormat::None => source.format,
                format => format,
            },
            width: target.width,
            height: target.height,
            ..source
        };
        video.connect(Some(conversion), Arc::clone(&self.raw_consumer))
    }

    fn remove_connection(&self) {
        if let Some(video) = self.video() {
            video.disconnect(&self.raw_consumer);
        }
    }

    // ==================== encoding ====================

    /// Runs the codec on one raw frame and broadcasts the packet it yields.
    /// A codec failure is returned and recorded; the encoder stays usable.
    pub fn encode(&self, frame: &EncoderFrame<'_>) -> Result<Option<EncoderPacket>> {
        let mut packet = EncoderPacket::new(self.kind());
        let received = {
            let mut codec = self.codec.lock();
            let Some(codec) = codec.as_mut() else {
                return Err(Error::state(format!(
                    "encoder '{}' is not initialized",
                    self.name
                )));
            };
            codec.encode(frame, &mut packet).map_err(|e| {
                log::error!("encoder '{}': encode failed: {:#}", self.name, e);
                self.set_last_error(format!("{:#}", e));
                Error::codec(&e)
            })?
        };

        if !received {
            return Ok(None);
        }

        {
            let (num, den) = self.timebase();
            packet.timebase_num = num;
            packet.timebase_den = den;
            packet.kind = self.kind();
        }
        self.send_off(&mut packet);
        Ok(Some(packet))
    }

    fn send_off(&self, packet: &mut EncoderPacket) {
        {
            let mut timing = self.timing.lock();
            let packet_usec = packet.packet_dts_usec();
            if !self.first_received.load(Ordering::Acquire) {
                timing.offset_usec = packet_usec;
                self.first_received.store(true, Ordering::Release);
            }
            packet.dts_usec = (timing.start_ts / 1000) as i64 + packet_usec - timing.offset_usec;
            packet.sys_dts_usec = packet.dts_usec;
        }
        self.encoded_packets.fetch_add(1, Ordering::Relaxed);
        self.broadcast(packet);
    }

    /// Newest sink first. The list lock is not held while a sink runs, so a
    /// sink may stop itself or register others.
    fn broadcast(&self, packet: &EncoderPacket) {
        let gated = self.kind() == EncoderType::Video;
        let sinks: Vec<Arc<dyn PacketSink>> = self
            .callbacks
            .lock()
            .iter()
            .rev()
            .map(|cb| Arc::clone(&cb.sink))
            .collect();
        let mut first_packet: Option<EncoderPacket> = None;

        for sink in sinks {
            let sent_first = {
                let callbacks = self.callbacks.lock();
                match callbacks.iter().find(|cb| same_sink(&cb.sink, &sink)) {
                    Some(cb) => cb.sent_first_packet,
                    None => continue,
                }
            };

            if !gated || sent_first {
                sink.receive(packet);
                continue;
            }
            if !packet.keyframe {
                continue;
            }

            let decorated = first_packet.get_or_insert_with(|| match self.sei_data() {
                Some(sei) if !sei.is_empty() => packet.with_prefix(&sei),
                _ => packet.share(),
            });
            sink.receive(decorated);

            if let Some(cb) = self
                .callbacks
                .lock()
                .iter_mut()
                .find(|cb| same_sink(&cb.sink, &sink))
            {
                cb.sent_first_packet = true;
            }
        }
    }

    fn receive_video(&self, frame: &VideoData) {
        if !self.initialized() {
            return;
        }
        if self.paused() {
            self.timing.lock().paused_frames += 1;
            return;
        }

        let waiting = !self.first_received()
            && self
                .paired()
                .is_some_and(|pair| !pair.first_received());

        let pts = {
            let mut timing = self.timing.lock();
            let pts = timing.cur_pts;
            timing.cur_pts += timing.timebase_num as i64;
            if !waiting && timing.start_ts == 0 {
                timing.start_ts = frame.timestamp();
            }
            pts
        };
        if waiting {
            return;
        }

        // failures are recorded in last_error
        let _ = self.encode(&EncoderFrame::from_video(frame.frame(), pts));
    }

    /// Queues planar audio, one slice per channel, and encodes every full
    /// codec frame. Returns the number of packets produced.
    pub fn push_audio(&self, channels: &[&[f32]], timestamp: u64) -> Result<usize> {
        if self.kind() != EncoderType::Audio {
            return Err(Error::invalid(format!(
                "push_audio: encoder '{}' is not an audio encoder",
                self.name
            )));
        }
        if !self.initialized() {
            return Err(Error::state(format!(
                "encoder '{}' is not initialized",
                self.name
            )));
        }
        if self.paused() {
            self.timing.lock().paused_frames += 1;
            return Ok(0);
        }

        let (frame_size, chunks) = {
            let mut audio = self.audio.lock();
            if channels.len() != audio.pending.len() {
                return Err(Error::invalid(format!(
                    "expected {} audio channels, got {}",
                    audio.pending.len(),
                    channels.len()
                )));
            }
            for (pending, samples) in audio.pending.iter_mut().zip(channels) {
                pending.extend_from_slice(samples);
            }

            let frame_size = audio.frame_size;
            let mut chunks: Vec<Vec<Vec<u8>>> = Vec::new();
            while audio.pending.first().is_some_and(|ch| ch.len() >= frame_size) {
                chunks.push(
                    audio
                        .pending
                        .iter_mut()
                        .map(|ch| ch.drain(..frame_size).flat_map(f32::to_ne_bytes).collect())
                        .collect(),
                );
            }
            (frame_size, chunks)
        };

        {
            let mut timing = self.timing.lock();
            if timing.start_ts == 0 {
                timing.start_ts = timestamp;
            }
        }

        let mut produced = 0;
        for chunk in &chunks {
            let pts = {
                let mut timing = self.timing.lock();
                let pts = timing.cur_pts;
                timing.cur_pts += frame_size as i64;
                pts
            };
            let frame = EncoderFrame {
                data: chunk.iter().map(Vec::as_slice).collect(),
                linesize: chunk.iter().map(|ch| ch.len() as u32).collect(),
                frames: frame_size as u32,
                pts,
            };
            if self.encode(&frame)?.is_some() {
                produced += 1;
            }
        }
        Ok(produced)
    }

    /// Samples per channel waiting for a full codec frame.
    pub fn pending_audio_samples(&self) -> usize {
        self.audio.lock().pending.first().map(Vec::len).unwrap_or(0)
    }

    pub fn audio_channels(&self) -> usize {
        self.audio.lock().pending.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.audio.lock().sample_rate
    }

    /// Starts a channel-backed sink and exposes it as a stream. Dropping the
    /// subscription stops the sink.
    pub fn subscribe(self: &Arc<Self>) -> Result<PacketSubscription> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let sink: Arc<dyn PacketSink> = Arc::new(move |packet: &EncoderPacket| {
            let _ = tx.send(packet.share());
        });
        self.start(Arc::clone(&sink))?;
        Ok(PacketSubscription {
            stream: tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
            encoder: Arc::downgrade(self),
            sink,
        })
    }
}

impl std::fmt::Debug for Encoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encoder")
            .field("id", &self.id())
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("initialized", &self.initialized())
            .field("destroyed", &self.destroyed())
            .finish()
    }
}

/// Merges object keys from `update` into `base`; any other value replaces it.
fn merge_settings(base: &mut Settings, update: Settings) {
    match (base, update) {
        (Value::Object(base), Value::Object(update)) => {
            for (key, value) in update {
                base.insert(key, value);
            }
        }
        (base, update) => *base = update,
    }
}

/// Handle that does not keep the encoder alive and reports it gone once it
/// has been destroyed.
#[derive(Clone, Debug, Default)]
pub struct WeakEncoder(Weak<Encoder>);

impl WeakEncoder {
    pub fn upgrade(&self) -> Option<Arc<Encoder>> {
        self.0.upgrade().filter(|encoder| !encoder.destroyed())
    }
}

pub struct PacketSubscription {
    stream: tokio_stream::wrappers::UnboundedReceiverStream<EncoderPacket>,
    encoder: Weak<Encoder>,
    sink: Arc<dyn PacketSink>,
}

impl futures::Stream for PacketSubscription {
    type Item = EncoderPacket;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl Drop for PacketSubscription {
    fn drop(&mut self) {
        if let Some(encoder) = self.encoder.upgrade() {
            encoder.stop(&self.sink);
        }
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;
