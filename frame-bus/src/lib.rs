//! Raw video fan-out and encoder packet distribution.
//!
//! A [`VideoOutput`] caches frames pushed by a render loop and presents them
//! to every connected consumer from its own delivery thread, scaling per
//! consumer when needed. An [`Encoder`] turns raw frames into packets and
//! broadcasts them to its sinks, starting each sink on a keyframe.

/// Registers FFmpeg components. Call once at startup before creating
/// [`sws::SwsScalerFactory`] scalers.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod clock;
pub mod context;
pub mod encoder;
pub mod error;
pub mod format;
pub mod frame;
pub mod packet;
pub mod scaler;
#[cfg(feature = "ffmpeg")]
pub mod sws;
pub mod video_input;
pub mod video_output;

pub use context::{Core, CoreConfig};
pub use encoder::{
    CodecInstance, Encoder, EncoderFrame, EncoderInfo, EncoderOutput, PacketSink,
    PacketSubscription, WeakEncoder,
};
pub use error::{Error, Result};
pub use frame::{VideoData, VideoFrame};
pub use packet::{EncoderPacket, EncoderType};
pub use video_input::VideoConsumer;
pub use video_output::{FrameSubscription, VideoOutput, VideoOutputInfo};
