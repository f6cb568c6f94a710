use ffmpeg_next::{self as ffmpeg};

/// Pixel layout / coded format identifier used throughout the engine.
///
/// Raw layouts describe the byte interpretation of a [`VideoFrame`] buffer;
/// coded variants mark a frame that carries an encoder packet instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Codec {
    Rgba,
    Rgb,
    Bgr,
    Uyvy,
    Yuyv,
    V210,
    H264,
    H265,
    Mjpg,
    J2k,
    Vp8,
}

impl Codec {
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Rgba => "RGBA",
            Codec::Rgb => "RGB",
            Codec::Bgr => "BGR",
            Codec::Uyvy => "UYVY",
            Codec::Yuyv => "YUYV",
            Codec::V210 => "v210",
            Codec::H264 => "H.264",
            Codec::H265 => "H.265",
            Codec::Mjpg => "MJPEG",
            Codec::J2k => "J2K",
            Codec::Vp8 => "VP8",
        }
    }

    /// Case-insensitive lookup accepting both dotted and plain spellings
    /// ("H.264" and "H264").
    pub fn from_name(name: &str) -> Option<Codec> {
        let folded: String = name
            .chars()
            .filter(|c| *c != '.')
            .collect::<String>()
            .to_ascii_uppercase();
        match folded.as_str() {
            "RGBA" => Some(Codec::Rgba),
            "RGB" => Some(Codec::Rgb),
            "BGR" => Some(Codec::Bgr),
            "UYVY" => Some(Codec::Uyvy),
            "YUYV" => Some(Codec::Yuyv),
            "V210" => Some(Codec::V210),
            "H264" => Some(Codec::H264),
            "H265" | "HEVC" => Some(Codec::H265),
            "MJPG" | "MJPEG" => Some(Codec::Mjpg),
            "J2K" | "JPEG2000" => Some(Codec::J2k),
            "VP8" => Some(Codec::Vp8),
            _ => None,
        }
    }

    pub fn is_compressed(&self) -> bool {
        matches!(
            self,
            Codec::H264 | Codec::H265 | Codec::Mjpg | Codec::J2k | Codec::Vp8
        )
    }

    /// Bytes per scanline for raw layouts. v210 packs 6 pixels into four
    /// 32-bit words, padded to 48-pixel groups.
    pub fn linesize(&self, width: u32) -> usize {
        let width = width as usize;
        match self {
            Codec::Rgba => width * 4,
            Codec::Rgb | Codec::Bgr => width * 3,
            Codec::Uyvy | Codec::Yuyv => width * 2,
            Codec::V210 => (width + 47) / 48 * 128,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interlacing {
    Progressive,
    InterlacedMerged,
}

/// The configuration subset of a frame; two frames with equal descs can be
/// fed to the same encoder context without reconfiguration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VideoDesc {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub color_spec: Codec,
    pub interlacing: Interlacing,
    pub tile_count: u32,
}

impl VideoDesc {
    pub fn from_frame(frame: &VideoFrame) -> Self {
        Self {
            width: frame.width,
            height: frame.height,
            fps: frame.fps,
            color_spec: frame.color_spec,
            interlacing: frame.interlacing,
            tile_count: 1,
        }
    }

    /// Equality ignoring `tile_count`, the reconfiguration trigger.
    pub fn eq_excluding_tiles(&self, other: &VideoDesc) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.fps == other.fps
            && self.color_spec == other.color_spec
            && self.interlacing == other.interlacing
    }
}

enum FrameData {
    Owned(Vec<u8>),
    /// A coded frame borrows its bytes from the packet; dropping the frame
    /// releases the packet.
    Packet(ffmpeg::codec::packet::Packet),
}

/// An owned, single-tile raster or coded frame.
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub color_spec: Codec,
    pub fps: f64,
    pub interlacing: Interlacing,
    pub pts: Option<i64>,
    data: FrameData,
    data_len: usize,
}

impl VideoFrame {
    /// Allocate an owned frame with a zeroed buffer sized for the layout.
    pub fn alloc(
        width: u32,
        height: u32,
        color_spec: Codec,
        fps: f64,
        interlacing: Interlacing,
    ) -> Self {
        let len = color_spec.linesize(width) * height as usize;
        Self {
            width,
            height,
            color_spec,
            fps,
            interlacing,
            pts: None,
            data: FrameData::Owned(vec![0u8; len]),
            data_len: len,
        }
    }

    /// Wrap an encoder packet as a coded output frame.
    pub fn from_packet(desc: VideoDesc, packet: ffmpeg::codec::packet::Packet, pts: i64) -> Self {
        let data_len = packet.data().map_or(0, <[u8]>::len);
        Self {
            width: desc.width,
            height: desc.height,
            color_spec: desc.color_spec,
            fps: desc.fps,
            interlacing: desc.interlacing,
            pts: Some(pts),
            data: FrameData::Packet(packet),
            data_len,
        }
    }

    pub fn desc(&self) -> VideoDesc {
        VideoDesc::from_frame(self)
    }

    pub fn apply_desc(&mut self, desc: &VideoDesc) {
        self.width = desc.width;
        self.height = desc.height;
        self.fps = desc.fps;
        self.color_spec = desc.color_spec;
        self.interlacing = desc.interlacing;
    }

    /// The valid bytes of the frame (may be shorter than the backing buffer
    /// after a crop).
    pub fn data(&self) -> &[u8] {
        match &self.data {
            FrameData::Owned(buf) => &buf[..self.data_len],
            FrameData::Packet(pkt) => pkt.data().unwrap_or(&[]),
        }
    }

    /// Mutable access to the full backing buffer of an owned frame.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        match &mut self.data {
            FrameData::Owned(buf) => buf.as_mut_slice(),
            FrameData::Packet(_) => &mut [],
        }
    }

    pub fn buffer_len(&self) -> usize {
        match &self.data {
            FrameData::Owned(buf) => buf.len(),
            FrameData::Packet(pkt) => pkt.data().map_or(0, <[u8]>::len),
        }
    }

    pub fn set_data_len(&mut self, len: usize) {
        debug_assert!(len <= self.buffer_len());
        self.data_len = len;
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    pub fn is_coded(&self) -> bool {
        matches!(self.data, FrameData::Packet(_))
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("color_spec", &self.color_spec)
            .field("fps", &self.fps)
            .field("pts", &self.pts)
            .field("data_len", &self.data_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn desc_round_trips_through_frame() {
        let desc = VideoDesc {
            width: 1280,
            height: 720,
            fps: 30.0,
            color_spec: Codec::Uyvy,
            interlacing: Interlacing::Progressive,
            tile_count: 1,
        };
        let mut frame = VideoFrame::alloc(16, 16, Codec::Rgba, 60.0, Interlacing::Progressive);
        frame.apply_desc(&desc);
        assert_eq!(frame.desc(), desc);
    }

    #[test]
    fn desc_comparison_ignores_tile_count() {
        let a = VideoDesc {
            width: 1920,
            height: 1080,
            fps: 25.0,
            color_spec: Codec::Rgba,
            interlacing: Interlacing::Progressive,
            tile_count: 1,
        };
        let mut b = a;
        b.tile_count = 4;
        assert!(a.eq_excluding_tiles(&b));
        b.width = 1280;
        assert!(!a.eq_excluding_tiles(&b));
    }

    #[test]
    fn codec_names_round_trip() {
        for codec in [
            Codec::Rgba,
            Codec::Uyvy,
            Codec::V210,
            Codec::H264,
            Codec::H265,
            Codec::Mjpg,
            Codec::J2k,
            Codec::Vp8,
        ] {
            assert_eq!(Codec::from_name(codec.name()), Some(codec));
        }
        assert_eq!(Codec::from_name("h264"), Some(Codec::H264));
        assert_eq!(Codec::from_name("nonsense"), None);
    }

    #[test]
    fn v210_linesize_is_block_padded() {
        assert_eq!(Codec::V210.linesize(48), 128);
        assert_eq!(Codec::V210.linesize(49), 256);
        assert_eq!(Codec::V210.linesize(1280), 3456);
    }

    #[test]
    fn cropped_frame_reports_short_data() {
        let mut frame = VideoFrame::alloc(8, 8, Codec::Rgba, 30.0, Interlacing::Progressive);
        assert_eq!(frame.data().len(), 8 * 8 * 4);
        frame.set_data_len(4 * 4 * 4);
        assert_eq!(frame.data().len(), 64);
        assert_eq!(frame.buffer_len(), 8 * 8 * 4);
    }
}
