use std::sync::Arc;
use std::time::Duration;

use frame_bus::{
    Core, CoreConfig, EncoderOutput, EncoderType, VideoOutput,
    clock::FrameClock,
    format::VideoFormat,
    scaler::{ScalerFactory, SoftwareScalerFactory},
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

mod config;
mod demo;

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("frame_bus", log::LevelFilter::Debug)
        .filter_module("capture_engine", log::LevelFilter::Debug)
        .init();
}

#[cfg(feature = "ffmpeg")]
fn scaler_factory(config: &config::EngineConfig) -> anyhow::Result<Arc<dyn ScalerFactory>> {
    if config.swscale {
        frame_bus::init()?;
        return Ok(Arc::new(frame_bus::sws::SwsScalerFactory));
    }
    Ok(Arc::new(SoftwareScalerFactory))
}

#[cfg(not(feature = "ffmpeg"))]
fn scaler_factory(config: &config::EngineConfig) -> anyhow::Result<Arc<dyn ScalerFactory>> {
    if config.swscale {
        log::warn!("swscale requested but the ffmpeg feature is disabled");
    }
    Ok(Arc::new(SoftwareScalerFactory))
}

fn init_core(config: &config::EngineConfig) -> anyhow::Result<Core> {
    let core_config = CoreConfig {
        video: Some(config.video.clone()),
        scale_type: config.scale_type,
    };
    Ok(Core::init_with_scaler(core_config, scaler_factory(config)?)?)
}

/// Renders a moving gradient into the output until cancelled.
fn spawn_producer(
    video: Arc<VideoOutput>,
    audio: Option<Arc<frame_bus::Encoder>>,
    cancel: CancellationToken,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let mut clock = FrameClock::new(video.frame_time());
        let info = video.info().clone();
        let samples_per_tick = audio
            .as_ref()
            .map(|a| (a.sample_rate() as u64 * info.fps_den as u64 / info.fps_num as u64) as usize)
            .unwrap_or(0);
        let silence = vec![0f32; samples_per_tick];

        while !cancel.is_cancelled() {
            let tick = clock.wait_next();
            let shade = (tick.timestamp / 1_000_000 % 256) as u8;

            if let Some(mut guard) = video.lock_frame(tick.count, tick.timestamp) {
                let frame = guard.frame_mut();
                let width = info.width as usize;
                let luma = frame.data_mut(0);
                for (i, px) in luma.iter_mut().enumerate() {
                    *px = shade.wrapping_add((i % width) as u8);
                }
            }

            if let Some(audio) = &audio {
                let channels: Vec<&[f32]> =
                    (0..audio.audio_channels()).map(|_| silence.as_slice()).collect();
                for _ in 0..tick.count {
                    if let Err(e) = audio.push_audio(&channels, tick.timestamp) {
                        log::error!("audio push failed: {}", e);
                    }
                }
            }
        }

        log::info!(
            "producer finished: {} ticks, {} lagged",
            clock.total_frames(),
            clock.lagged_frames()
        );
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let config = config::config();
    log::info!("config: {:#?}", config);

    let core = init_core(config)?;
    core.register_encoder(Arc::new(demo::DemoEncoder(EncoderType::Video)))?;
    core.register_encoder(Arc::new(demo::DemoEncoder(EncoderType::Audio)))?;

    let video = core
        .video()
        .ok_or_else(|| anyhow::anyhow!("video output not initialized"))?;

    let output: Arc<dyn EncoderOutput> = Arc::new(demo::LogOutput);
    let video_enc =
        core.create_video_encoder("demo_video", "main", Some(config.encoder_settings()))?;
    video_enc.add_output(&output);
    if video.format() == VideoFormat::Nv12 {
        video_enc.set_preferred_format(VideoFormat::I420)?;
    }
    if let Some((width, height)) = config.scaled_size {
        video_enc.set_scaled_size(width, height)?;
    }

    let audio_enc = if config.audio {
        let audio_enc =
            core.create_audio_encoder("demo_audio", "mic", Some(config.audio_settings()))?;
        audio_enc.add_output(&output);
        audio_enc.initialize()?;
        video_enc.set_paired(Some(&audio_enc));
        Some(audio_enc)
    } else {
        None
    };

    video_enc.initialize()?;
    let mut video_packets = video_enc.subscribe()?;
    let mut audio_packets = match &audio_enc {
        Some(audio_enc) => Some(audio_enc.subscribe()?),
        None => None,
    };

    let cancel = CancellationToken::new();
    let producer = spawn_producer(Arc::clone(&video), audio_enc.clone(), cancel.clone());

    let deadline = async {
        match config.run_seconds {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut video_count = 0u64;
    let mut audio_count = 0u64;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                break;
            },
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
            },
            _ = &mut deadline, if !cancel.is_cancelled() => {
                cancel.cancel();
            },
            Some(packet) = video_packets.next() => {
                video_count += 1;
                if packet.keyframe {
                    log::debug!(
                        "video keyframe pts={} dts_usec={} size={}",
                        packet.pts,
                        packet.dts_usec,
                        packet.size()
                    );
                }
            },
            Some(packet) = async {
                match audio_packets.as_mut() {
                    Some(stream) => stream.next().await,
                    None => std::future::pending().await,
                }
            } => {
                audio_count += 1;
                log::trace!("audio pts={} size={}", packet.pts, packet.size());
            },
        }
    }

    if producer.join().is_err() {
        log::error!("producer thread panicked");
    }
    drop(video_packets);
    drop(audio_packets);

    log::info!(
        "video: {} packets, {} frames presented, {} skipped; audio: {} packets",
        video_count,
        video.total_frames(),
        video.skipped_frames(),
        audio_count
    );
    core.shutdown();
    Ok(())
}
