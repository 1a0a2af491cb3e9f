use std::{
    cell::RefCell,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{Error, Result},
    format::{ColorRange, ColorSpace, VideoFormat},
    frame::{VideoData, VideoFrame},
    scaler::{ScaleInfo, ScaleType, ScalerFactory, SoftwareScalerFactory},
    video_input::{VideoConsumer, VideoInput, same_consumer},
};

/// Hard cap on cache slots per output.
pub const MAX_CACHE_SIZE: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoOutputInfo {
    pub name: String,
    pub format: VideoFormat,
    pub fps_num: u32,
    pub fps_den: u32,
    pub width: u32,
    pub height: u32,
    pub cache_size: usize,
    pub colorspace: ColorSpace,
    pub range: ColorRange,
}

impl Default for VideoOutputInfo {
    fn default() -> Self {
        Self {
            name: "video".to_string(),
            format: VideoFormat::Nv12,
            fps_num: 30,
            fps_den: 1,
            width: 1280,
            height: 720,
            cache_size: 16,
            colorspace: ColorSpace::Default,
            range: ColorRange::Default,
        }
    }
}

impl VideoOutputInfo {
    pub fn scale_info(&self) -> ScaleInfo {
        ScaleInfo {
            format: self.format,
            width: self.width,
            height: self.height,
            range: self.range,
            colorspace: self.colorspace,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.format == VideoFormat::None {
            return Err(Error::invalid("video output format is None"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(Error::invalid(format!(
                "invalid video output size {}x{}",
                self.width, self.height
            )));
        }
        if self.fps_num == 0 || self.fps_den == 0 {
            return Err(Error::invalid(format!(
                "invalid video output fps {}/{}",
                self.fps_num, self.fps_den
            )));
        }
        if self.cache_size == 0 {
            return Err(Error::invalid("video output cache size is 0"));
        }
        Ok(())
    }
}

/// Nominal frame duration in nanoseconds.
pub fn frame_interval_ns(fps_num: u32, fps_den: u32) -> u64 {
    if fps_num == 0 {
        return 0;
    }
    (1_000_000_000u128 * fps_den as u128 / fps_num as u128) as u64
}

struct CachedFrameInfo {
    /// `None` while a producer is filling the slot.
    frame: Option<Arc<VideoFrame>>,
    timestamp: u64,
    skipped: u32,
    count: u32,
}

struct FrameCache {
    slots: Vec<CachedFrameInfo>,
    available_frames: usize,
    first_added: usize,
    last_added: usize,
}

impl FrameCache {
    fn new(info: &VideoOutputInfo, capacity: usize) -> Result<Self> {
        let slots = (0..capacity)
            .map(|_| {
                VideoFrame::new(info.format, info.width, info.height).map(|frame| {
                    CachedFrameInfo {
                        frame: Some(Arc::new(frame)),
                        timestamp: 0,
                        skipped: 0,
                        count: 0,
                    }
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            slots,
            available_frames: capacity,
            first_added: 0,
            last_added: 0,
        })
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            slot.count = 0;
            slot.skipped = 0;
        }
        self.available_frames = self.capacity();
        self.first_added = 0;
        self.last_added = 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presented {
    /// Nothing was queued.
    Idle,
    /// The oldest queued slot is still held by its producer.
    Pending,
    /// Delivered; the slot still owes more presentations.
    Repeated,
    /// Delivered and the slot was released.
    Completed,
    /// A discarded slot was released without delivery.
    Discarded,
}

type InputList = ReentrantMutex<RefCell<Vec<VideoInput>>>;

struct OutputShared {
    info: VideoOutputInfo,
    frame_time: u64,
    cache: Mutex<FrameCache>,
    inputs: InputList,
    skipped_frames: AtomicU64,
    total_frames: AtomicU64,
    raw_active: AtomicBool,
    producer_refs: AtomicUsize,
    cancel: CancellationToken,
    update_tx: UnboundedSender<()>,
    scaler_factory: Arc<dyn ScalerFactory>,
    scale_type: ScaleType,
}

impl OutputShared {
    fn present_one(&self) -> Presented {
        let (frame, timestamp) = {
            let mut cache = self.cache.lock();
            let capacity = cache.capacity();
            if cache.available_frames == capacity {
                return Presented::Idle;
            }
            let first = cache.first_added;
            let slot = &cache.slots[first];
            match &slot.frame {
                Some(frame) if slot.count > 0 => (Arc::clone(frame), slot.timestamp),
                Some(_) => {
                    cache.first_added = (first + 1) % capacity;
                    cache.available_frames += 1;
                    if cache.available_frames == capacity {
                        cache.last_added = cache.first_added;
                    }
                    return Presented::Discarded;
                }
                None => return Presented::Pending,
            }
        };

        self.deliver(&VideoData::new(frame, timestamp));

        let mut cache = self.cache.lock();
        let capacity = cache.capacity();
        let first = cache.first_added;
        let slot = &mut cache.slots[first];
        slot.timestamp += self.frame_time;
        slot.count = slot.count.saturating_sub(1);

        if slot.count == 0 {
            cache.first_added = (first + 1) % capacity;
            cache.available_frames += 1;
            if cache.available_frames == capacity {
                cache.last_added = cache.first_added;
            }
            Presented::Completed
        } else {
            if slot.skipped > 0 {
                slot.skipped -= 1;
                self.skipped_frames.fetch_add(1, Ordering::Relaxed);
            }
            Presented::Repeated
        }
    }

    /// Runs every input's scale step and callback. The inputs lock is held,
    /// the cache lock is not; the list borrow is released around each
    /// callback so a consumer may connect or disconnect from inside it.
    fn deliver(&self, data: &VideoData) {
        let guard = self.inputs.lock();
        let mut i = 0;
        loop {
            let (scaled, consumer) = {
                let mut inputs = guard.borrow_mut();
                let Some(input) = inputs.get_mut(i) else {
                    break;
                };
                (input.scale(data), Arc::clone(input.consumer()))
            };

            if let Some(scaled) = scaled {
                consumer.deliver(&scaled);
            }

            let inputs = guard.borrow();
            i = match inputs.iter().position(|x| same_consumer(x.consumer(), &consumer)) {
                Some(pos) => pos + 1,
                None => i,
            };
        }
    }

    fn delivery_loop(self: Arc<Self>, mut update_rx: UnboundedReceiver<()>) {
        log::debug!("video-io: delivery thread for '{}' started", self.info.name);
        // wakes consumed while the oldest slot was still being filled
        let mut owed = 0usize;
        while update_rx.blocking_recv().is_some() {
            if self.cancel.is_cancelled() {
                break;
            }

            // one wake drains one slot, repeats included; total_frames counts
            // each presentation once
            let mut budget = 1 + owed;
            owed = 0;
            while budget > 0 && !self.cancel.is_cancelled() {
                match self.present_one() {
                    Presented::Idle => break,
                    Presented::Pending => {
                        owed = budget;
                        break;
                    }
                    Presented::Repeated => {
                        self.total_frames.fetch_add(1, Ordering::Relaxed);
                    }
                    Presented::Completed => {
                        self.total_frames.fetch_add(1, Ordering::Relaxed);
                        budget -= 1;
                    }
                    Presented::Discarded => {}
                }
            }
        }
        log::debug!("video-io: delivery thread for '{}' finished", self.info.name);
    }

    fn unlock_slot(&self, index: usize, frame: Arc<VideoFrame>) {
        {
            let mut cache = self.cache.lock();
            if let Some(slot) = cache.slots.get_mut(index) {
                slot.frame = Some(frame);
            }
        }
        self.producer_refs.fetch_sub(1, Ordering::AcqRel);
        let _ = self.update_tx.send(());
    }

    /// Returns a claimed slot unqueued. The newest claim is rolled back
    /// outright; an older one is left with a zero count and released by the
    /// delivery thread when it reaches the front.
    fn discard_slot(&self, index: usize, frame: Arc<VideoFrame>) {
        {
            let mut cache = self.cache.lock();
            let capacity = cache.capacity();
            if let Some(slot) = cache.slots.get_mut(index) {
                slot.frame = Some(frame);
                slot.count = 0;
                slot.skipped = 0;
                if cache.last_added == index {
                    cache.available_frames += 1;
                    if cache.available_frames == capacity {
                        cache.last_added = cache.first_added;
                    } else {
                        cache.last_added = (index + capacity - 1) % capacity;
                    }
                }
            }
        }
        self.producer_refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Frame cache plus delivery thread for one raw video stream.
///
/// Producers claim slots with [`VideoOutput::lock_frame`] (or
/// [`VideoOutput::submit_frame`]); the delivery thread presents each slot
/// `count` times to every connected consumer, advancing its timestamp by one
/// frame interval per presentation.
pub struct VideoOutput {
    shared: Arc<OutputShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl VideoOutput {
    pub fn open(info: VideoOutputInfo) -> Result<Self> {
        Self::open_with_scaler(info, Arc::new(SoftwareScalerFactory), ScaleType::default())
    }

    pub fn open_with_scaler(
        mut info: VideoOutputInfo,
        scaler_factory: Arc<dyn ScalerFactory>,
        scale_type: ScaleType,
    ) -> Result<Self> {
        info.validate().inspect_err(|e| {
            log::error!("video-io: {}", e);
        })?;

        if info.cache_size > MAX_CACHE_SIZE {
            log::warn!(
                "video-io: cache size {} clamped to {}",
                info.cache_size,
                MAX_CACHE_SIZE
            );
            info.cache_size = MAX_CACHE_SIZE;
        }

        let frame_time = frame_interval_ns(info.fps_num, info.fps_den);
        let cache = FrameCache::new(&info, info.cache_size)?;
        let (update_tx, update_rx) = tokio::sync::mpsc::unbounded_channel();

        let shared = Arc::new(OutputShared {
            frame_time,
            cache: Mutex::new(cache),
            inputs: ReentrantMutex::new(RefCell::new(Vec::new())),
            skipped_frames: AtomicU64::new(0),
            total_frames: AtomicU64::new(0),
            raw_active: AtomicBool::new(false),
            producer_refs: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            update_tx,
            scaler_factory,
            scale_type,
            info,
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(format!("video-io: {}", shared.info.name))
            .spawn(move || thread_shared.delivery_loop(update_rx))
            .map_err(|e| {
                log::error!("video-io: failed to spawn delivery thread: {}", e);
                Error::ResourceExhausted(format!("failed to spawn delivery thread: {}", e))
            })?;

        log::info!(
            "video-io: opened '{}' {}x{} {} @ {}/{} fps, cache {}",
            shared.info.name,
            shared.info.width,
            shared.info.height,
            shared.info.format,
            shared.info.fps_num,
            shared.info.fps_den,
            shared.info.cache_size
        );

        Ok(Self {
            thread: Mutex::new(Some(handle)),
            shared,
        })
    }

    /// Registers `consumer`. `conversion` of `None` delivers source frames
    /// unchanged; a zero width or height defaults to the source's.
    pub fn connect(
        &self,
        conversion: Option<ScaleInfo>,
        consumer: Arc<dyn VideoConsumer>,
    ) -> Result<()> {
        if self.stopped() {
            return Err(Error::state("video output is closed"));
        }

        let source = self.shared.info.scale_info();
        let mut conversion = conversion.unwrap_or(source);
        if conversion.width == 0 {
            conversion.width = source.width;
        }
        if conversion.height == 0 {
            conversion.height = source.height;
        }

        let guard = self.shared.inputs.lock();
        if guard
            .borrow()
            .iter()
            .any(|input| same_consumer(input.consumer(), &consumer))
        {
            return Err(Error::state("consumer already connected"));
        }

        let input = VideoInput::new(
            conversion,
            &source,
            consumer,
            self.shared.scaler_factory.as_ref(),
            self.shared.scale_type,
        )?;

        let mut inputs = guard.borrow_mut();
        if inputs.is_empty() {
            self.reset_frames();
            self.shared.raw_active.store(true, Ordering::Release);
        }
        log::debug!(
            "video-io: '{}' consumer connected ({} {}x{}, scaled: {})",
            self.shared.info.name,
            input.conversion().format,
            input.conversion().width,
            input.conversion().height,
            input.has_scaler()
        );
        inputs.push(input);
        Ok(())
    }

    /// Removes `consumer`; returns whether it was connected.
    pub fn disconnect(&self, consumer: &Arc<dyn VideoConsumer>) -> bool {
        let guard = self.shared.inputs.lock();
        let removed = {
            let mut inputs = guard.borrow_mut();
            let Some(pos) = inputs
                .iter()
                .position(|input| same_consumer(input.consumer(), consumer))
            else {
                return false;
            };
            let input = inputs.remove(pos);
            if inputs.is_empty() {
                self.shared.raw_active.store(false, Ordering::Release);
            }
            input
        };
        // scaler and buffers go with the input
        drop(removed);
        true
    }

    /// Async view of this output: a consumer that forwards every frame into
    /// a stream. Dropping the subscription disconnects it.
    pub fn subscribe(&self, conversion: Option<ScaleInfo>) -> Result<FrameSubscription> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let consumer: Arc<dyn VideoConsumer> = Arc::new(move |frame: &VideoData| {
            let _ = tx.send(frame.clone());
        });
        self.connect(conversion, Arc::clone(&consumer))?;
        Ok(FrameSubscription {
            stream: tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
            output: Arc::downgrade(&self.shared),
            consumer,
        })
    }

    /// Claims the next cache slot for a frame that should be presented
    /// `count` times starting at `timestamp`.
    ///
    /// When every slot is queued the newest one absorbs the repeats instead
    /// and `None` is returned; those extra presentations are counted as
    /// skipped frames as they drain.
    pub fn lock_frame(&self, count: u32, timestamp: u64) -> Option<FrameGuard<'_>> {
        if self.stopped() || count == 0 {
            return None;
        }

        let mut cache = self.shared.cache.lock();
        let capacity = cache.capacity();
        if capacity == 0 {
            return None;
        }
        if cache.available_frames == 0 {
            let last = cache.last_added;
            let slot = &mut cache.slots[last];
            slot.count += count;
            slot.skipped += count;
            return None;
        }

        let index = if cache.available_frames == capacity {
            cache.last_added
        } else {
            (cache.last_added + 1) % capacity
        };
        let slot = &mut cache.slots[index];
        let frame = slot.frame.take()?;
        slot.timestamp = timestamp;
        slot.count = count;
        slot.skipped = 0;
        cache.last_added = index;
        cache.available_frames -= 1;
        self.shared.producer_refs.fetch_add(1, Ordering::AcqRel);

        Some(FrameGuard {
            output: &self.shared,
            index,
            frame,
            discarded: false,
        })
    }

    /// Copies `frame` into the cache. Returns `Ok(false)` when the cache was
    /// full and the frame was folded into the newest queued slot.
    pub fn submit_frame(&self, frame: &VideoFrame, count: u32, timestamp: u64) -> Result<bool> {
        if self.stopped() {
            return Err(Error::state("video output is closed"));
        }
        let info = &self.shared.info;
        if frame.format() != info.format
            || frame.width() != info.width
            || frame.height() != info.height
        {
            return Err(Error::invalid(format!(
                "cannot submit {} {}x{} to '{}' ({} {}x{})",
                frame.format(),
                frame.width(),
                frame.height(),
                info.name,
                info.format,
                info.width,
                info.height
            )));
        }
        match self.lock_frame(count, timestamp) {
            Some(mut guard) => match guard.frame_mut().copy_from(frame) {
                Ok(()) => Ok(true),
                Err(e) => {
                    guard.discard();
                    Err(e)
                }
            },
            None => Ok(false),
        }
    }

    /// Marks an external producer as attached; while any lease is alive the
    /// first connect leaves the cache untouched.
    pub fn producer_lease(&self) -> ProducerLease {
        self.shared.producer_refs.fetch_add(1, Ordering::AcqRel);
        ProducerLease {
            output: Arc::downgrade(&self.shared),
        }
    }

    /// Clears the cache and counters unless a producer holds a slot or lease.
    /// Slots are claimed under the cache lock, so the check and the reset
    /// cannot interleave with `lock_frame`.
    fn reset_frames(&self) {
        let mut cache = self.shared.cache.lock();
        if self.shared.producer_refs.load(Ordering::Acquire) != 0 {
            return;
        }
        cache.reset();
        self.shared.skipped_frames.store(0, Ordering::Relaxed);
        self.shared.total_frames.store(0, Ordering::Relaxed);
    }

    /// Stops and joins the delivery thread, then frees inputs and cache.
    pub fn close(&self) {
        let Some(handle) = self.thread.lock().take() else {
            return;
        };

        self.shared.cancel.cancel();
        let _ = self.shared.update_tx.send(());
        if handle.thread().id() != std::thread::current().id() && handle.join().is_err() {
            log::error!("video-io: delivery thread for '{}' panicked", self.shared.info.name);
        }

        {
            let guard = self.shared.inputs.lock();
            guard.borrow_mut().clear();
        }
        self.shared.raw_active.store(false, Ordering::Release);
        {
            let mut cache = self.shared.cache.lock();
            cache.slots.clear();
            cache.reset();
        }
        log::info!("video-io: closed '{}'", self.shared.info.name);
    }

    pub fn stopped(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    pub fn active(&self) -> bool {
        self.shared.raw_active.load(Ordering::Acquire)
    }

    pub fn info(&self) -> &VideoOutputInfo {
        &self.shared.info
    }

    pub fn format(&self) -> VideoFormat {
        self.shared.info.format
    }

    pub fn width(&self) -> u32 {
        self.shared.info.width
    }

    pub fn height(&self) -> u32 {
        self.shared.info.height
    }

    pub fn frame_rate(&self) -> f64 {
        self.shared.info.fps_num as f64 / self.shared.info.fps_den as f64
    }

    pub fn frame_time(&self) -> u64 {
        self.shared.frame_time
    }

    pub fn skipped_frames(&self) -> u64 {
        self.shared.skipped_frames.load(Ordering::Relaxed)
    }

    pub fn total_frames(&self) -> u64 {
        self.shared.total_frames.load(Ordering::Relaxed)
    }

    pub fn input_count(&self) -> usize {
        self.shared.inputs.lock().borrow().len()
    }

    /// Queued slots not yet fully presented.
    pub fn queued_frames(&self) -> usize {
        let cache = self.shared.cache.lock();
        cache.capacity().saturating_sub(cache.available_frames)
    }
}

impl Drop for VideoOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// Exclusive access to a claimed cache slot. Dropping the guard queues the
/// slot and wakes the delivery thread.
pub struct FrameGuard<'a> {
    output: &'a OutputShared,
    index: usize,
    frame: Arc<VideoFrame>,
    discarded: bool,
}

impl FrameGuard<'_> {
    pub fn frame_mut(&mut self) -> &mut VideoFrame {
        Arc::make_mut(&mut self.frame)
    }

    pub fn frame(&self) -> &VideoFrame {
        &self.frame
    }

    /// Gives the slot back without queuing it; nothing is delivered for it.
    pub fn discard(mut self) {
        self.discarded = true;
    }

    pub fn timestamp(&self) -> u64 {
        self.output
            .cache
            .lock()
            .slots
            .get(self.index)
            .map(|slot| slot.timestamp)
            .unwrap_or_default()
    }
}

impl Drop for FrameGuard<'_> {
    fn drop(&mut self) {
        let frame = std::mem::take(&mut self.frame);
        if self.discarded {
            self.output.discard_slot(self.index, frame);
        } else {
            self.output.unlock_slot(self.index, frame);
        }
    }
}

pub struct ProducerLease {
    output: Weak<OutputShared>,
}

impl Drop for ProducerLease {
    fn drop(&mut self) {
        if let Some(output) = self.output.upgrade() {
            output.producer_refs.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

pub struct FrameSubscription {
    stream: tokio_stream::wrappers::UnboundedReceiverStream<VideoData>,
    output: Weak<OutputShared>,
    consumer: Arc<dyn VideoConsumer>,
}

impl futures::Stream for FrameSubscription {
    type Item = VideoData;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        let Some(output) = self.output.upgrade() else {
            return;
        };
        let guard = output.inputs.lock();
        let mut inputs = guard.borrow_mut();
        inputs.retain(|input| !same_consumer(input.consumer(), &self.consumer));
        if inputs.is_empty() {
            output.raw_active.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
#[path = "video_output_test.rs"]
mod video_output_test;
