use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    format::{ColorRange, ColorSpace, VideoFormat},
    frame::VideoFrame,
};

/// Conversion target or source description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScaleInfo {
    pub format: VideoFormat,
    pub width: u32,
    pub height: u32,
    pub range: ColorRange,
    pub colorspace: ColorSpace,
}

impl ScaleInfo {
    pub fn new(format: VideoFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleType {
    Point,
    #[default]
    FastBilinear,
    Bilinear,
    Bicubic,
}

pub trait VideoScaler: Send {
    /// Converts `src` into `dst`; both frames already have the geometry the
    /// scaler was created for.
    fn scale(&mut self, dst: &mut VideoFrame, src: &VideoFrame) -> anyhow::Result<()>;
}

pub trait ScalerFactory: Send + Sync {
    fn create(
        &self,
        dst: &ScaleInfo,
        src: &ScaleInfo,
        scale_type: ScaleType,
    ) -> Result<Box<dyn VideoScaler>>;
}

/// Nearest-neighbour scaler working directly on plane memory.
///
/// Supported: any format to itself at any size, swizzles among the packed
/// RGB formats, and I420 <-> NV12. Colorspace and range are carried through
/// untouched.
pub struct SoftwareScaler {
    src: ScaleInfo,
    dst: ScaleInfo,
    kind: Conversion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Conversion {
    Resample,
    Swizzle([usize; 4]),
    Chroma,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SoftwareScalerFactory;

impl ScalerFactory for SoftwareScalerFactory {
    fn create(
        &self,
        dst: &ScaleInfo,
        src: &ScaleInfo,
        _scale_type: ScaleType,
    ) -> Result<Box<dyn VideoScaler>> {
        Ok(Box::new(SoftwareScaler::new(dst, src)?))
    }
}

impl SoftwareScaler {
    pub fn new(dst: &ScaleInfo, src: &ScaleInfo) -> Result<Self> {
        if dst.width == 0 || dst.height == 0 || src.width == 0 || src.height == 0 {
            return Err(Error::conversion(format!(
                "invalid scale size {}x{} -> {}x{}",
                src.width, src.height, dst.width, dst.height
            )));
        }

        let kind = match (src.format, dst.format) {
            (VideoFormat::None, _) | (_, VideoFormat::None) => {
                return Err(Error::conversion("bad scale conversion type"));
            }
            (a, b) if a == b => Conversion::Resample,
            (a, b) if a.is_packed_rgb() && b.is_packed_rgb() => {
                Conversion::Swizzle(rgb_swizzle(a, b))
            }
            (VideoFormat::I420, VideoFormat::Nv12) | (VideoFormat::Nv12, VideoFormat::I420) => {
                Conversion::Chroma
            }
            (a, b) => {
                return Err(Error::conversion(format!(
                    "bad scale conversion type {} -> {}",
                    a, b
                )));
            }
        };

        Ok(Self {
            src: *src,
            dst: *dst,
            kind,
        })
    }

    fn check(&self, dst: &VideoFrame, src: &VideoFrame) -> anyhow::Result<()> {
        if src.format() != self.src.format
            || src.width() != self.src.width
            || src.height() != self.src.height
        {
            anyhow::bail!(
                "source frame {} {}x{} does not match scaler input",
                src.format(),
                src.width(),
                src.height()
            );
        }
        if dst.format() != self.dst.format
            || dst.width() != self.dst.width
            || dst.height() != self.dst.height
        {
            anyhow::bail!(
                "destination frame {} {}x{} does not match scaler output",
                dst.format(),
                dst.width(),
                dst.height()
            );
        }
        Ok(())
    }
}

impl VideoScaler for SoftwareScaler {
    fn scale(&mut self, dst: &mut VideoFrame, src: &VideoFrame) -> anyhow::Result<()> {
        self.check(dst, src)?;
        match self.kind {
            Conversion::Resample => {
                for plane in 0..src.plane_count() {
                    resample_plane(dst, src, plane, plane, None);
                }
            }
            Conversion::Swizzle(order) => resample_plane(dst, src, 0, 0, Some(order)),
            Conversion::Chroma => {
                resample_plane(dst, src, 0, 0, None);
                convert_chroma(dst, src);
            }
        }
        Ok(())
    }
}

fn rgb_channels(format: VideoFormat) -> [u8; 4] {
    match format {
        VideoFormat::Rgba => *b"RGBA",
        VideoFormat::Bgra => *b"BGRA",
        _ => *b"BGRX",
    }
}

/// For each destination byte, the source byte index it is read from.
fn rgb_swizzle(src: VideoFormat, dst: VideoFormat) -> [usize; 4] {
    let from = rgb_channels(src);
    let to = rgb_channels(dst);
    let mut order = [0, 1, 2, 3];
    for (i, channel) in to.iter().enumerate() {
        let wanted = if *channel == b'X' { b'A' } else { *channel };
        order[i] = from
            .iter()
            .position(|c| *c == wanted || (wanted == b'A' && *c == b'X'))
            .unwrap_or(i);
    }
    order
}

fn resample_plane(
    dst: &mut VideoFrame,
    src: &VideoFrame,
    dst_plane: usize,
    src_plane: usize,
    swizzle: Option<[usize; 4]>,
) {
    let bpe = src.format().bytes_per_element(src_plane) as usize;
    let (src_w, src_h) = src
        .format()
        .plane_dimensions(src_plane, src.width(), src.height());
    let (dst_w, dst_h) = dst
        .format()
        .plane_dimensions(dst_plane, dst.width(), dst.height());
    let src_linesize = src.linesize(src_plane) as usize;
    let dst_linesize = dst.linesize(dst_plane) as usize;
    let src_data = src.data(src_plane);
    let dst_data = dst.data_mut(dst_plane);

    for y in 0..dst_h as usize {
        let sy = y * src_h as usize / dst_h as usize;
        for x in 0..dst_w as usize {
            let sx = x * src_w as usize / dst_w as usize;
            let s = sy * src_linesize + sx * bpe;
            let d = y * dst_linesize + x * bpe;
            if s + bpe > src_data.len() || d + bpe > dst_data.len() {
                continue;
            }
            match swizzle {
                Some(order) => {
                    for (i, from) in order.iter().enumerate().take(bpe) {
                        dst_data[d + i] = src_data[s + from];
                    }
                }
                None => dst_data[d..d + bpe].copy_from_slice(&src_data[s..s + bpe]),
            }
        }
    }
}

fn read_chroma(frame: &VideoFrame, x: usize, y: usize) -> (u8, u8) {
    match frame.format() {
        VideoFormat::Nv12 => {
            let i = y * frame.linesize(1) as usize + x * 2;
            let uv = frame.data(1);
            (
                uv.get(i).copied().unwrap_or(128),
                uv.get(i + 1).copied().unwrap_or(128),
            )
        }
        _ => {
            let u = frame.data(1).get(y * frame.linesize(1) as usize + x);
            let v = frame.data(2).get(y * frame.linesize(2) as usize + x);
            (u.copied().unwrap_or(128), v.copied().unwrap_or(128))
        }
    }
}

fn write_chroma(frame: &mut VideoFrame, x: usize, y: usize, (u, v): (u8, u8)) {
    match frame.format() {
        VideoFormat::Nv12 => {
            let i = y * frame.linesize(1) as usize + x * 2;
            let uv = frame.data_mut(1);
            if i + 1 < uv.len() {
                uv[i] = u;
                uv[i + 1] = v;
            }
        }
        _ => {
            let iu = y * frame.linesize(1) as usize + x;
            let iv = y * frame.linesize(2) as usize + x;
            if let Some(b) = frame.data_mut(1).get_mut(iu) {
                *b = u;
            }
            if let Some(b) = frame.data_mut(2).get_mut(iv) {
                *b = v;
            }
        }
    }
}

fn convert_chroma(dst: &mut VideoFrame, src: &VideoFrame) {
    let (src_w, src_h) = src.format().plane_dimensions(1, src.width(), src.height());
    let (dst_w, dst_h) = dst.format().plane_dimensions(1, dst.width(), dst.height());
    for y in 0..dst_h as usize {
        let sy = y * src_h as usize / dst_h as usize;
        for x in 0..dst_w as usize {
            let sx = x * src_w as usize / dst_w as usize;
            let uv = read_chroma(src, sx, sy);
            write_chroma(dst, x, y, uv);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(format: VideoFormat, width: u32, height: u32) -> ScaleInfo {
        ScaleInfo::new(format, width, height)
    }

    #[test]
    fn test_rejects_unsupported_conversion() {
        let err = SoftwareScaler::new(
            &info(VideoFormat::Rgba, 4, 4),
            &info(VideoFormat::I420, 4, 4),
        );
        assert!(matches!(err, Err(Error::Conversion(_))));
        assert!(matches!(
            SoftwareScaler::new(&info(VideoFormat::I420, 0, 4), &info(VideoFormat::I420, 4, 4)),
            Err(Error::Conversion(_))
        ));
        match SoftwareScaler::new(&info(VideoFormat::None, 4, 4), &info(VideoFormat::I420, 4, 4)) {
            Err(Error::Conversion(msg)) => assert_eq!(msg, "bad scale conversion type"),
            _ => panic!("expected a conversion error"),
        }
    }

    #[test]
    fn test_downscale_picks_nearest_pixels() {
        let mut src = VideoFrame::new(VideoFormat::Y800, 4, 2).unwrap();
        src.data_mut(0).copy_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);
        let mut dst = VideoFrame::new(VideoFormat::Y800, 2, 1).unwrap();
        let mut scaler =
            SoftwareScaler::new(&info(VideoFormat::Y800, 2, 1), &info(VideoFormat::Y800, 4, 2))
                .unwrap();
        scaler.scale(&mut dst, &src).unwrap();
        assert_eq!(dst.data(0), &[0, 2]);
    }

    #[test]
    fn test_rgba_to_bgra_swaps_red_and_blue() {
        let mut src = VideoFrame::new(VideoFormat::Rgba, 1, 1).unwrap();
        src.data_mut(0).copy_from_slice(&[10, 20, 30, 40]);
        let mut dst = VideoFrame::new(VideoFormat::Bgra, 1, 1).unwrap();
        let mut scaler =
            SoftwareScaler::new(&info(VideoFormat::Bgra, 1, 1), &info(VideoFormat::Rgba, 1, 1))
                .unwrap();
        scaler.scale(&mut dst, &src).unwrap();
        assert_eq!(dst.data(0), &[30, 20, 10, 40]);
    }

    #[test]
    fn test_i420_to_nv12_interleaves_chroma() {
        let mut src = VideoFrame::new(VideoFormat::I420, 2, 2).unwrap();
        src.data_mut(0).copy_from_slice(&[1, 2, 3, 4]);
        src.data_mut(1).copy_from_slice(&[50]);
        src.data_mut(2).copy_from_slice(&[60]);
        let mut dst = VideoFrame::new(VideoFormat::Nv12, 2, 2).unwrap();
        let mut scaler =
            SoftwareScaler::new(&info(VideoFormat::Nv12, 2, 2), &info(VideoFormat::I420, 2, 2))
                .unwrap();
        scaler.scale(&mut dst, &src).unwrap();
        assert_eq!(dst.data(0), &[1, 2, 3, 4]);
        assert_eq!(dst.data(1), &[50, 60]);
    }

    #[test]
    fn test_scale_rejects_mismatched_frames() {
        let src = VideoFrame::new(VideoFormat::Y800, 8, 8).unwrap();
        let mut dst = VideoFrame::new(VideoFormat::Y800, 2, 1).unwrap();
        let mut scaler =
            SoftwareScaler::new(&info(VideoFormat::Y800, 2, 1), &info(VideoFormat::Y800, 4, 2))
                .unwrap();
        assert!(scaler.scale(&mut dst, &src).is_err());
    }
}
