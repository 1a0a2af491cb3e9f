use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling::{Context, Flags};

use crate::{
    error::{Error, Result},
    format::VideoFormat,
    frame::VideoFrame,
    scaler::{ScaleInfo, ScaleType, ScalerFactory, VideoScaler},
};

fn pixel_format(format: VideoFormat) -> Option<Pixel> {
    match format {
        VideoFormat::I420 => Some(Pixel::YUV420P),
        VideoFormat::Nv12 => Some(Pixel::NV12),
        VideoFormat::I422 => Some(Pixel::YUV422P),
        VideoFormat::I444 => Some(Pixel::YUV444P),
        VideoFormat::Yuy2 => Some(Pixel::YUYV422),
        VideoFormat::Uyvy => Some(Pixel::UYVY422),
        VideoFormat::Rgba => Some(Pixel::RGBA),
        VideoFormat::Bgra => Some(Pixel::BGRA),
        VideoFormat::Bgrx => Some(Pixel::BGRZ),
        VideoFormat::Y800 => Some(Pixel::GRAY8),
        VideoFormat::None => None,
    }
}

fn flags(scale_type: ScaleType) -> Flags {
    match scale_type {
        ScaleType::Point => Flags::POINT,
        ScaleType::FastBilinear => Flags::FAST_BILINEAR,
        ScaleType::Bilinear => Flags::BILINEAR,
        ScaleType::Bicubic => Flags::BICUBIC,
    }
}

/// libswscale-backed scaler. Frames are staged through ffmpeg frames because
/// swscale wants its own aligned buffers.
pub struct SwsScaler {
    context: Context,
    input: ffmpeg_next::frame::Video,
    output: ffmpeg_next::frame::Video,
}

unsafe impl Send for SwsScaler {}

impl VideoScaler for SwsScaler {
    fn scale(&mut self, dst: &mut VideoFrame, src: &VideoFrame) -> anyhow::Result<()> {
        for plane in 0..src.plane_count() {
            let stride = self.input.stride(plane);
            let rows = src.data(plane).len() / src.linesize(plane).max(1) as usize;
            let src_linesize = src.linesize(plane) as usize;
            let data = self.input.data_mut(plane);
            let copy = src_linesize.min(stride);
            for y in 0..rows {
                let s = y * src_linesize;
                let d = y * stride;
                if d + copy > data.len() {
                    break;
                }
                data[d..d + copy].copy_from_slice(&src.data(plane)[s..s + copy]);
            }
        }

        self.context.run(&self.input, &mut self.output)?;

        for plane in 0..dst.plane_count() {
            let stride = self.output.stride(plane) as u32;
            dst.copy_plane_from(plane, self.output.data(plane), stride)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SwsScalerFactory;

impl ScalerFactory for SwsScalerFactory {
    fn create(
        &self,
        dst: &ScaleInfo,
        src: &ScaleInfo,
        scale_type: ScaleType,
    ) -> Result<Box<dyn VideoScaler>> {
        let (Some(src_fmt), Some(dst_fmt)) = (pixel_format(src.format), pixel_format(dst.format))
        else {
            return Err(Error::conversion("bad scale conversion type"));
        };

        let context = Context::get(
            src_fmt,
            src.width,
            src.height,
            dst_fmt,
            dst.width,
            dst.height,
            flags(scale_type),
        )
        .map_err(|e| Error::conversion(format!("failed to create scaler: {}", e)))?;

        Ok(Box::new(SwsScaler {
            context,
            input: ffmpeg_next::frame::Video::new(src_fmt, src.width, src.height),
            output: ffmpeg_next::frame::Video::new(dst_fmt, dst.width, dst.height),
        }))
    }
}
