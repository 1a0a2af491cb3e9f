use std::sync::LazyLock;

use frame_bus::{VideoOutputInfo, scaler::ScaleType};
use serde::{Deserialize, Serialize};

const CONFIG_ENV: &str = "CAPTURE_ENGINE_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub video: VideoOutputInfo,
    pub scale_type: ScaleType,
    /// Scale through libswscale instead of the built-in scaler.
    pub swscale: bool,
    /// Encoder input size; the output size when absent.
    pub scaled_size: Option<(u32, u32)>,
    pub keyframe_interval: u64,
    pub audio: bool,
    pub sample_rate: u32,
    pub channels: u32,
    /// Stop after this many seconds instead of waiting for ctrl-c.
    pub run_seconds: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            video: VideoOutputInfo {
                name: "main".to_string(),
                width: 640,
                height: 360,
                cache_size: 4,
                ..Default::default()
            },
            scale_type: ScaleType::default(),
            swscale: false,
            scaled_size: None,
            keyframe_interval: 60,
            audio: true,
            sample_rate: 48000,
            channels: 2,
            run_seconds: None,
        }
    }
}

impl EngineConfig {
    fn load() -> anyhow::Result<Self> {
        let Ok(path) = std::env::var(CONFIG_ENV) else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("read config {}: {}", path, e))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn encoder_settings(&self) -> serde_json::Value {
        serde_json::json!({
            "keyframe_interval": self.keyframe_interval,
        })
    }

    pub fn audio_settings(&self) -> serde_json::Value {
        serde_json::json!({
            "sample_rate": self.sample_rate,
            "channels": self.channels,
        })
    }
}

pub fn config() -> &'static EngineConfig {
    static CONFIG: LazyLock<EngineConfig> = LazyLock::new(|| {
        EngineConfig::load().unwrap_or_else(|e| {
            log::error!("invalid config, using defaults: {:#}", e);
            EngineConfig::default()
        })
    });
    &CONFIG
}
