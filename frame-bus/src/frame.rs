use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::{
    error::{Error, Result},
    format::{MAX_AV_PLANES, VideoFormat},
};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Plane {
    data: Vec<u8>,
    linesize: u32,
}

impl Plane {
    pub fn new(data: Vec<u8>, linesize: u32) -> Self {
        Self { data, linesize }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn linesize(&self) -> u32 {
        self.linesize
    }

    /// Copies `rows` rows of `row_bytes` from a buffer with stride `src_linesize`.
    /// A single copy is used when both strides match.
    fn copy_rows(&mut self, src: &[u8], src_linesize: u32, row_bytes: u32, rows: u32) {
        let dst_linesize = self.linesize as usize;
        let src_linesize = src_linesize as usize;
        if src_linesize == dst_linesize {
            let len = (dst_linesize * rows as usize)
                .min(src.len())
                .min(self.data.len());
            self.data[..len].copy_from_slice(&src[..len]);
            return;
        }

        let copy = (row_bytes as usize).min(dst_linesize).min(src_linesize);
        for y in 0..rows as usize {
            let s = y * src_linesize;
            let d = y * dst_linesize;
            if s + copy > src.len() || d + copy > self.data.len() {
                break;
            }
            self.data[d..d + copy].copy_from_slice(&src[s..s + copy]);
        }
    }
}

/// An uncompressed picture: format, geometry and owned planes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VideoFrame {
    format: VideoFormat,
    width: u32,
    height: u32,
    planes: Vec<Plane>,
}

impl VideoFrame {
    /// Allocates zeroed, tightly packed planes.
    pub fn new(format: VideoFormat, width: u32, height: u32) -> Result<Self> {
        if format == VideoFormat::None {
            return Err(Error::invalid("video frame format is None"));
        }
        if width == 0 || height == 0 {
            return Err(Error::invalid(format!(
                "invalid video frame size {}x{}",
                width, height
            )));
        }

        let planes = format
            .plane_layouts(width, height)
            .into_iter()
            .map(|layout| {
                Plane::new(
                    vec![0u8; layout.linesize as usize * layout.rows as usize],
                    layout.linesize,
                )
            })
            .collect();

        Ok(Self {
            format,
            width,
            height,
            planes,
        })
    }

    /// Wraps caller-provided planes. Every plane must hold at least
    /// `linesize * rows` bytes and `linesize` must cover one row.
    pub fn from_planes(
        format: VideoFormat,
        width: u32,
        height: u32,
        planes: Vec<Plane>,
    ) -> Result<Self> {
        if format == VideoFormat::None || width == 0 || height == 0 {
            return Err(Error::invalid(format!(
                "invalid video frame {} {}x{}",
                format, width, height
            )));
        }
        let layouts = format.plane_layouts(width, height);
        if planes.len() != layouts.len() || planes.len() > MAX_AV_PLANES {
            return Err(Error::invalid(format!(
                "{} expects {} planes, got {}",
                format,
                layouts.len(),
                planes.len()
            )));
        }
        for (i, (plane, layout)) in planes.iter().zip(layouts.iter()).enumerate() {
            if plane.linesize < layout.linesize
                || plane.data.len() < plane.linesize as usize * layout.rows as usize
            {
                return Err(Error::invalid(format!(
                    "plane {} too small: linesize {}, {} bytes",
                    i,
                    plane.linesize,
                    plane.data.len()
                )));
            }
        }

        Ok(Self {
            format,
            width,
            height,
            planes,
        })
    }

    pub fn format(&self) -> VideoFormat {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }

    pub fn data(&self, plane: usize) -> &[u8] {
        self.planes.get(plane).map(Plane::data).unwrap_or_default()
    }

    pub fn data_mut(&mut self, plane: usize) -> &mut [u8] {
        match self.planes.get_mut(plane) {
            Some(p) => p.data_mut(),
            None => &mut [],
        }
    }

    pub fn linesize(&self, plane: usize) -> u32 {
        self.planes.get(plane).map(Plane::linesize).unwrap_or(0)
    }

    /// Copies one plane from a foreign buffer, row by row when strides differ.
    pub fn copy_plane_from(&mut self, plane: usize, src: &[u8], src_linesize: u32) -> Result<()> {
        let (elements, rows) = self.format.plane_dimensions(plane, self.width, self.height);
        let row_bytes = elements * self.format.bytes_per_element(plane);
        let dst = self
            .planes
            .get_mut(plane)
            .ok_or_else(|| Error::invalid(format!("plane {} out of range", plane)))?;
        dst.copy_rows(src, src_linesize, row_bytes, rows);
        Ok(())
    }

    /// Copies the picture of `src`, which must share format and size.
    pub fn copy_from(&mut self, src: &VideoFrame) -> Result<()> {
        if src.format != self.format || src.width != self.width || src.height != self.height {
            return Err(Error::invalid(format!(
                "cannot copy {} {}x{} into {} {}x{}",
                src.format, src.width, src.height, self.format, self.width, self.height
            )));
        }
        for (i, plane) in src.planes.iter().enumerate() {
            self.copy_plane_from(i, &plane.data, plane.linesize)?;
        }
        Ok(())
    }
}

impl Display for VideoFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "VideoFrame format: {}, width: {}, height: {}, planes: {}",
            self.format,
            self.width,
            self.height,
            self.planes.len()
        )
    }
}

/// A frame as handed to consumers: shared picture plus presentation time in
/// nanoseconds. Cloning only bumps the picture's reference count.
#[derive(Clone, Debug)]
pub struct VideoData {
    frame: Arc<VideoFrame>,
    timestamp: u64,
}

impl VideoData {
    pub fn new(frame: Arc<VideoFrame>, timestamp: u64) -> Self {
        Self { frame, timestamp }
    }

    pub fn frame(&self) -> &VideoFrame {
        &self.frame
    }

    pub fn shared_frame(&self) -> &Arc<VideoFrame> {
        &self.frame
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn format(&self) -> VideoFormat {
        self.frame.format()
    }

    pub fn width(&self) -> u32 {
        self.frame.width()
    }

    pub fn height(&self) -> u32 {
        self.frame.height()
    }

    pub fn data(&self, plane: usize) -> &[u8] {
        self.frame.data(plane)
    }

    pub fn linesize(&self, plane: usize) -> u32 {
        self.frame.linesize(plane)
    }
}
