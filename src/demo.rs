use bytes::{BufMut, Bytes, BytesMut};
use frame_bus::{
    CodecInstance, Encoder, EncoderFrame, EncoderInfo, EncoderOutput, EncoderPacket, EncoderType,
    encoder::Settings,
};

const HEADER: &[u8] = b"\x00\x00\x00\x01DEMO";

/// Encoder type backed by [`DemoVideoCodec`] / [`DemoAudioCodec`].
pub struct DemoEncoder(pub EncoderType);

impl EncoderInfo for DemoEncoder {
    fn id(&self) -> &str {
        match self.0 {
            EncoderType::Video => "demo_video",
            EncoderType::Audio => "demo_audio",
        }
    }

    fn kind(&self) -> EncoderType {
        self.0
    }

    fn codec(&self) -> &str {
        match self.0 {
            EncoderType::Video => "demo-checksum",
            EncoderType::Audio => "demo-peak",
        }
    }

    fn default_settings(&self) -> Settings {
        serde_json::json!({ "keyframe_interval": 30 })
    }

    fn create(&self, settings: &Settings) -> anyhow::Result<Box<dyn CodecInstance>> {
        match self.0 {
            EncoderType::Video => {
                let keyint = settings
                    .get("keyframe_interval")
                    .and_then(serde_json::Value::as_u64)
                    .unwrap_or(30);
                if keyint == 0 {
                    anyhow::bail!("keyframe_interval must be positive");
                }
                Ok(Box::new(DemoVideoCodec {
                    keyint,
                    frame_index: 0,
                }))
            }
            EncoderType::Audio => Ok(Box::new(DemoAudioCodec)),
        }
    }
}

/// Emits a checksum of each picture; every `keyint`th frame is a keyframe.
struct DemoVideoCodec {
    keyint: u64,
    frame_index: u64,
}

impl CodecInstance for DemoVideoCodec {
    fn encode(&mut self, frame: &EncoderFrame<'_>, packet: &mut EncoderPacket) -> anyhow::Result<bool> {
        let luma = frame
            .data
            .first()
            .ok_or_else(|| anyhow::anyhow!("frame has no planes"))?;
        let sum = luma.iter().fold(0u32, |acc, b| acc.wrapping_add(*b as u32));

        let mut buf = BytesMut::with_capacity(12);
        buf.put_u64(self.frame_index);
        buf.put_u32(sum);

        packet.pts = frame.pts;
        packet.dts = frame.pts;
        packet.keyframe = self.frame_index % self.keyint == 0;
        packet.set_data(buf.freeze());
        self.frame_index += 1;
        Ok(true)
    }

    fn extra_data(&self) -> Option<Bytes> {
        Some(Bytes::from_static(HEADER))
    }

    fn sei_data(&self) -> Option<Bytes> {
        Some(Bytes::from_static(HEADER))
    }

    fn update(&mut self, settings: &Settings) -> anyhow::Result<()> {
        if let Some(keyint) = settings.get("keyframe_interval").and_then(|v| v.as_u64()) {
            if keyint == 0 {
                anyhow::bail!("keyframe_interval must be positive");
            }
            self.keyint = keyint;
        }
        Ok(())
    }
}

/// Emits the peak sample of every channel.
struct DemoAudioCodec;

impl CodecInstance for DemoAudioCodec {
    fn encode(&mut self, frame: &EncoderFrame<'_>, packet: &mut EncoderPacket) -> anyhow::Result<bool> {
        let mut buf = BytesMut::with_capacity(frame.data.len() * 4);
        for channel in &frame.data {
            let peak = channel
                .chunks_exact(4)
                .map(|s| f32::from_ne_bytes([s[0], s[1], s[2], s[3]]).abs())
                .fold(0f32, f32::max);
            buf.put_f32(peak);
        }
        packet.pts = frame.pts;
        packet.dts = frame.pts;
        packet.keyframe = true;
        packet.set_data(buf.freeze());
        Ok(true)
    }

    fn frame_size(&self) -> usize {
        1024
    }
}

/// Logs encoder lifecycle notifications.
pub struct LogOutput;

impl EncoderOutput for LogOutput {
    fn encoder_connected(&self, encoder: &Encoder) {
        log::info!("output: encoder '{}' connected", encoder.name());
    }

    fn encoder_disconnected(&self, encoder: &Encoder) {
        log::info!("output: encoder '{}' disconnected", encoder.name());
    }

    fn remove_encoder(&self, encoder: &Encoder) {
        log::info!("output: encoder '{}' removed", encoder.name());
    }
}
