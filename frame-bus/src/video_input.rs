use std::sync::Arc;

use crate::{
    error::Result,
    frame::{VideoData, VideoFrame},
    scaler::{ScaleInfo, ScaleType, ScalerFactory, VideoScaler},
};

/// Scaled output buffers kept per consumer, so the scaler can fill the next
/// one while a slow consumer still holds the previous.
pub(crate) const MAX_CONVERT_BUFFERS: usize = 3;

/// Receives raw frames from a video output.
///
/// Identity for connect/disconnect is the `Arc` allocation, so the same
/// consumer connected twice is rejected and disconnect takes the same `Arc`.
pub trait VideoConsumer: Send + Sync {
    fn deliver(&self, frame: &VideoData);
}

impl<F> VideoConsumer for F
where
    F: Fn(&VideoData) + Send + Sync,
{
    fn deliver(&self, frame: &VideoData) {
        self(frame)
    }
}

pub(crate) fn same_consumer(a: &Arc<dyn VideoConsumer>, b: &Arc<dyn VideoConsumer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

pub(crate) struct VideoInput {
    conversion: ScaleInfo,
    scaler: Option<Box<dyn VideoScaler>>,
    frames: Vec<Arc<VideoFrame>>,
    cur_frame: usize,
    consumer: Arc<dyn VideoConsumer>,
}

impl VideoInput {
    /// Builds the registration; a scaler and its buffer ring exist only when
    /// `conversion` differs from `source`.
    pub(crate) fn new(
        conversion: ScaleInfo,
        source: &ScaleInfo,
        consumer: Arc<dyn VideoConsumer>,
        factory: &dyn ScalerFactory,
        scale_type: ScaleType,
    ) -> Result<Self> {
        let mut input = Self {
            conversion,
            scaler: None,
            frames: Vec::new(),
            cur_frame: 0,
            consumer,
        };

        if needs_scaler(&conversion, source) {
            let scaler = factory.create(&conversion, source, scale_type).inspect_err(|e| {
                log::error!("video input: failed to create scaler: {}", e);
            })?;

            input.frames = (0..MAX_CONVERT_BUFFERS)
                .map(|_| {
                    VideoFrame::new(conversion.format, conversion.width, conversion.height)
                        .map(Arc::new)
                })
                .collect::<Result<Vec<_>>>()?;
            input.scaler = Some(scaler);
        }

        Ok(input)
    }

    pub(crate) fn consumer(&self) -> &Arc<dyn VideoConsumer> {
        &self.consumer
    }

    pub(crate) fn conversion(&self) -> &ScaleInfo {
        &self.conversion
    }

    pub(crate) fn has_scaler(&self) -> bool {
        self.scaler.is_some()
    }

    /// Produces the frame this consumer should see. Returns `None` when the
    /// scaler fails; only this consumer misses the frame.
    pub(crate) fn scale(&mut self, data: &VideoData) -> Option<VideoData> {
        let Some(scaler) = self.scaler.as_mut() else {
            return Some(data.clone());
        };

        self.cur_frame = (self.cur_frame + 1) % self.frames.len();
        let target = &mut self.frames[self.cur_frame];
        // copies only if a consumer still holds this buffer
        let dst = Arc::make_mut(target);

        match scaler.scale(dst, data.frame()) {
            Ok(()) => Some(VideoData::new(Arc::clone(target), data.timestamp())),
            Err(e) => {
                log::warn!("video-io: could not scale frame: {:#}", e);
                None
            }
        }
    }
}

fn needs_scaler(conversion: &ScaleInfo, source: &ScaleInfo) -> bool {
    conversion.format != source.format
        || conversion.width != source.width
        || conversion.height != source.height
        || conversion.colorspace != source.colorspace
        || conversion.range != source.range
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{error::Error, format::VideoFormat, scaler::SoftwareScalerFactory};

    fn source() -> ScaleInfo {
        ScaleInfo::new(VideoFormat::Bgra, 4, 4)
    }

    fn noop() -> Arc<dyn VideoConsumer> {
        Arc::new(|_: &VideoData| {})
    }

    fn frame(value: u8) -> VideoData {
        let mut frame = VideoFrame::new(VideoFormat::Bgra, 4, 4).unwrap();
        frame.data_mut(0).fill(value);
        VideoData::new(Arc::new(frame), 1000)
    }

    #[test]
    fn test_passthrough_has_no_scaler() {
        let mut input = VideoInput::new(
            source(),
            &source(),
            noop(),
            &SoftwareScalerFactory,
            ScaleType::default(),
        )
        .unwrap();
        assert!(!input.has_scaler());

        let data = frame(9);
        let out = input.scale(&data).unwrap();
        assert!(Arc::ptr_eq(out.shared_frame(), data.shared_frame()));
    }

    #[test]
    fn test_scaled_buffers_rotate() {
        let target = ScaleInfo::new(VideoFormat::Bgra, 2, 2);
        let mut input = VideoInput::new(
            target,
            &source(),
            noop(),
            &SoftwareScalerFactory,
            ScaleType::default(),
        )
        .unwrap();
        assert!(input.has_scaler());

        let first = input.scale(&frame(1)).unwrap();
        let second = input.scale(&frame(2)).unwrap();
        assert_eq!(first.width(), 2);
        assert_eq!(first.timestamp(), 1000);
        assert!(!Arc::ptr_eq(first.shared_frame(), second.shared_frame()));
        assert!(first.data(0).iter().all(|b| *b == 1));
        assert!(second.data(0).iter().all(|b| *b == 2));
    }

    #[test]
    fn test_bad_conversion_fails_construction() {
        let target = ScaleInfo::new(VideoFormat::I444, 4, 4);
        let err = VideoInput::new(
            target,
            &source(),
            noop(),
            &SoftwareScalerFactory,
            ScaleType::default(),
        );
        assert!(matches!(err, Err(Error::Conversion(_))));
    }

    struct FailingScaler;

    impl VideoScaler for FailingScaler {
        fn scale(&mut self, _dst: &mut VideoFrame, _src: &VideoFrame) -> anyhow::Result<()> {
            anyhow::bail!("scaler exploded")
        }
    }

    struct FailingFactory;

    impl ScalerFactory for FailingFactory {
        fn create(
            &self,
            _dst: &ScaleInfo,
            _src: &ScaleInfo,
            _scale_type: ScaleType,
        ) -> Result<Box<dyn VideoScaler>> {
            Ok(Box::new(FailingScaler))
        }
    }

    #[test]
    fn test_scale_failure_skips_delivery() {
        let target = ScaleInfo::new(VideoFormat::Bgra, 2, 2);
        let mut input =
            VideoInput::new(target, &source(), noop(), &FailingFactory, ScaleType::Point)
                .unwrap();
        assert!(input.scale(&frame(1)).is_none());
    }

    #[test]
    fn test_closure_identity() {
        let seen = Arc::new(Mutex::new(0));
        let seen_clone = Arc::clone(&seen);
        let a: Arc<dyn VideoConsumer> = Arc::new(move |_: &VideoData| {
            *seen_clone.lock().unwrap() += 1;
        });
        let b = Arc::clone(&a);
        assert!(same_consumer(&a, &b));
        assert!(!same_consumer(&a, &noop()));
        a.deliver(&frame(0));
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
