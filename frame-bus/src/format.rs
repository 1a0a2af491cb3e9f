use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Upper bound on planes per frame.
pub const MAX_AV_PLANES: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoFormat {
    #[default]
    None,
    /// Planar 4:2:0, three planes.
    I420,
    /// Y plane plus one interleaved UV plane, 4:2:0.
    Nv12,
    /// Planar 4:2:2.
    I422,
    /// Planar 4:4:4.
    I444,
    /// Packed 4:2:2, Y0 U Y1 V.
    Yuy2,
    /// Packed 4:2:2, U Y0 V Y1.
    Uyvy,
    Rgba,
    Bgra,
    Bgrx,
    /// Single luma plane.
    Y800,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorSpace {
    #[default]
    Default,
    Cs601,
    Cs709,
    Srgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorRange {
    #[default]
    Default,
    Partial,
    Full,
}

/// Geometry of one plane: bytes per row and number of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneLayout {
    pub linesize: u32,
    pub rows: u32,
}

impl VideoFormat {
    pub fn is_yuv(&self) -> bool {
        matches!(
            self,
            VideoFormat::I420
                | VideoFormat::Nv12
                | VideoFormat::I422
                | VideoFormat::I444
                | VideoFormat::Yuy2
                | VideoFormat::Uyvy
        )
    }

    pub fn is_packed_rgb(&self) -> bool {
        matches!(self, VideoFormat::Rgba | VideoFormat::Bgra | VideoFormat::Bgrx)
    }

    pub fn plane_count(&self) -> usize {
        match self {
            VideoFormat::None => 0,
            VideoFormat::I420 | VideoFormat::I422 | VideoFormat::I444 => 3,
            VideoFormat::Nv12 => 2,
            VideoFormat::Yuy2
            | VideoFormat::Uyvy
            | VideoFormat::Rgba
            | VideoFormat::Bgra
            | VideoFormat::Bgrx
            | VideoFormat::Y800 => 1,
        }
    }

    /// Bytes occupied by one sampled element of `plane`.
    pub fn bytes_per_element(&self, plane: usize) -> u32 {
        match (self, plane) {
            (VideoFormat::Nv12, 1) => 2,
            (VideoFormat::Yuy2 | VideoFormat::Uyvy, _) => 4,
            (VideoFormat::Rgba | VideoFormat::Bgra | VideoFormat::Bgrx, _) => 4,
            _ => 1,
        }
    }

    /// Element count per row and row count of `plane` for a `width`x`height` frame.
    pub fn plane_dimensions(&self, plane: usize, width: u32, height: u32) -> (u32, u32) {
        let half_w = width.div_ceil(2);
        let half_h = height.div_ceil(2);
        match (self, plane) {
            (VideoFormat::I420, 0) | (VideoFormat::Nv12, 0) => (width, height),
            (VideoFormat::I420, _) | (VideoFormat::Nv12, _) => (half_w, half_h),
            (VideoFormat::I422, 0) => (width, height),
            (VideoFormat::I422, _) => (half_w, height),
            (VideoFormat::Yuy2 | VideoFormat::Uyvy, _) => (half_w, height),
            _ => (width, height),
        }
    }

    /// Tightly packed layout of every plane.
    pub fn plane_layouts(&self, width: u32, height: u32) -> Vec<PlaneLayout> {
        (0..self.plane_count())
            .map(|plane| {
                let (elements, rows) = self.plane_dimensions(plane, width, height);
                PlaneLayout {
                    linesize: elements * self.bytes_per_element(plane),
                    rows,
                }
            })
            .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            VideoFormat::None => "None",
            VideoFormat::I420 => "I420",
            VideoFormat::Nv12 => "NV12",
            VideoFormat::I422 => "I422",
            VideoFormat::I444 => "I444",
            VideoFormat::Yuy2 => "YUY2",
            VideoFormat::Uyvy => "UYVY",
            VideoFormat::Rgba => "RGBA",
            VideoFormat::Bgra => "BGRA",
            VideoFormat::Bgrx => "BGRX",
            VideoFormat::Y800 => "Y800",
        }
    }
}

impl Display for VideoFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl ColorSpace {
    pub fn name(&self) -> &'static str {
        match self {
            ColorSpace::Default | ColorSpace::Cs709 => "709",
            ColorSpace::Cs601 => "601",
            ColorSpace::Srgb => "sRGB",
        }
    }
}

impl ColorRange {
    pub fn name(&self, format: VideoFormat) -> &'static str {
        match (self, format.is_yuv()) {
            (ColorRange::Full, _) | (_, false) => "Full",
            _ => "Partial",
        }
    }
}
