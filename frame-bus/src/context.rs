use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    encoder::{Encoder, EncoderInfo, EncoderRegistry, Settings},
    error::{Error, Result},
    packet::EncoderType,
    scaler::{ScaleType, ScalerFactory, SoftwareScalerFactory},
    video_output::{VideoOutput, VideoOutputInfo},
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Opened at init when present.
    pub video: Option<VideoOutputInfo>,
    pub scale_type: ScaleType,
}

/// Owns the video output and every encoder created through it.
pub struct Core {
    video: Mutex<Option<Arc<VideoOutput>>>,
    encoder_types: Mutex<Vec<Arc<dyn EncoderInfo>>>,
    encoders: Arc<EncoderRegistry>,
    scaler_factory: Arc<dyn ScalerFactory>,
    scale_type: ScaleType,
}

impl Core {
    pub fn init(config: CoreConfig) -> Result<Self> {
        Self::init_with_scaler(config, Arc::new(SoftwareScalerFactory))
    }

    pub fn init_with_scaler(
        config: CoreConfig,
        scaler_factory: Arc<dyn ScalerFactory>,
    ) -> Result<Self> {
        let core = Self {
            video: Mutex::new(None),
            encoder_types: Mutex::new(Vec::new()),
            encoders: Arc::new(Mutex::new(Vec::new())),
            scaler_factory,
            scale_type: config.scale_type,
        };
        if let Some(info) = config.video {
            core.reset_video(info)?;
        }
        log::info!("core initialized");
        Ok(core)
    }

    /// Destroys every remaining encoder and closes the video output.
    pub fn shutdown(self) {
        let encoders = std::mem::take(&mut *self.encoders.lock());
        for encoder in encoders {
            if let Err(e) = encoder.destroy() {
                log::warn!("failed to destroy encoder '{}': {}", encoder.name(), e);
            }
        }
        if let Some(video) = self.video.lock().take() {
            video.close();
        }
        log::info!("core shut down");
    }

    pub fn register_encoder(&self, info: Arc<dyn EncoderInfo>) -> Result<()> {
        let mut types = self.encoder_types.lock();
        if types.iter().any(|t| t.id() == info.id()) {
            return Err(Error::state(format!(
                "encoder '{}' already registered",
                info.id()
            )));
        }
        log::debug!("registered encoder type '{}' ({})", info.id(), info.codec());
        types.push(info);
        Ok(())
    }

    /// Replaces the video output. Refused while the current one has
    /// consumers.
    pub fn reset_video(&self, mut info: VideoOutputInfo) -> Result<()> {
        let mut video = self.video.lock();
        if video.as_ref().is_some_and(|v| v.active()) {
            return Err(Error::state("video output is active"));
        }

        info.width &= !3;
        info.height &= !1;
        if info.width == 0 || info.height == 0 {
            return Err(Error::invalid(format!(
                "invalid base size {}x{}",
                info.width, info.height
            )));
        }

        log::info!("---------------------------------");
        log::info!("video settings reset:");
        log::info!("\tbase resolution:   {}x{}", info.width, info.height);
        log::info!(
            "\tfps:               {}/{}",
            info.fps_num,
            info.fps_den
        );
        log::info!("\tformat:            {}", info.format);
        log::info!(
            "\tYUV mode:          {}/{}",
            info.colorspace.name(),
            info.range.name(info.format)
        );

        if let Some(old) = video.take() {
            old.close();
        }
        let output = Arc::new(VideoOutput::open_with_scaler(
            info,
            Arc::clone(&self.scaler_factory),
            self.scale_type,
        )?);
        *video = Some(Arc::clone(&output));
        drop(video);

        let encoders = self.encoders.lock().clone();
        for encoder in encoders.iter().filter(|e| e.kind() == EncoderType::Video) {
            if let Err(e) = encoder.set_video(&output) {
                log::warn!("encoder '{}' kept its old video output: {}", encoder.name(), e);
            }
        }
        Ok(())
    }

    pub fn video(&self) -> Option<Arc<VideoOutput>> {
        self.video.lock().clone()
    }

    pub fn create_video_encoder(
        &self,
        id: &str,
        name: &str,
        settings: Option<Settings>,
    ) -> Result<Arc<Encoder>> {
        self.create_encoder(id, name, settings, EncoderType::Video)
    }

    pub fn create_audio_encoder(
        &self,
        id: &str,
        name: &str,
        settings: Option<Settings>,
    ) -> Result<Arc<Encoder>> {
        self.create_encoder(id, name, settings, EncoderType::Audio)
    }

    fn create_encoder(
        &self,
        id: &str,
        name: &str,
        settings: Option<Settings>,
        kind: EncoderType,
    ) -> Result<Arc<Encoder>> {
        let info = self
            .encoder_types
            .lock()
            .iter()
            .find(|t| t.id() == id)
            .cloned()
            .ok_or_else(|| {
                log::error!("encoder '{}' not found", id);
                Error::invalid(format!("encoder '{}' not found", id))
            })?;
        if info.kind() != kind {
            return Err(Error::invalid(format!(
                "encoder '{}' is not a {:?} encoder",
                id, kind
            )));
        }

        let encoder = Encoder::new(info, name, settings, Arc::downgrade(&self.encoders));
        if kind == EncoderType::Video {
            if let Some(video) = self.video() {
                encoder.set_video(&video)?;
            }
        }
        self.encoders.lock().push(Arc::clone(&encoder));
        log::info!("encoder '{}' ({}) created", name, id);
        Ok(encoder)
    }

    pub fn get_encoder_by_name(&self, name: &str) -> Option<Arc<Encoder>> {
        self.encoders
            .lock()
            .iter()
            .find(|encoder| encoder.name() == name)
            .cloned()
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.lock().len()
    }
}
