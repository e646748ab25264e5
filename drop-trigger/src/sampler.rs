//! Average color of the central region of a frame.

use std::any::{TypeId, type_name};

use machine_vision_formats::{
    ImageStride, PixelFormat,
    pixel_format::{Mono8, RGB8},
};

use drop_trigger_types::ColorReading;

/// Reason a frame could not be sampled. The frame should be skipped.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SampleError {
    #[error("unsupported pixel format {0}")]
    UnsupportedPixelFormat(String),
    #[error("image has no pixels ({width}x{height})")]
    Empty { width: u32, height: u32 },
    #[error("image buffer has {actual} bytes, need at least {needed}")]
    Truncated { needed: usize, actual: usize },
}

/// Pixel rectangle, half-open on the right and bottom.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Roi {
    pub(crate) x0: usize,
    pub(crate) y0: usize,
    pub(crate) x1: usize,
    pub(crate) y1: usize,
}

impl Roi {
    /// The centered region covering half the width and half the height.
    pub(crate) fn center_half(width: usize, height: usize) -> Self {
        let (x0, x1) = center_half_span(width);
        let (y0, y1) = center_half_span(height);
        Self { x0, y0, x1, y1 }
    }

    fn n_pixels(&self) -> usize {
        (self.x1 - self.x0) * (self.y1 - self.y0)
    }
}

fn center_half_span(len: usize) -> (usize, usize) {
    let n = (len / 2).max(1).min(len);
    let start = (len - n) / 2;
    (start, start + n)
}

/// Mean color of the central 50% x 50% region of `frame`.
///
/// `RGB8` frames are sampled directly; `Mono8` frames give a gray reading.
/// Anything else cannot be sampled.
pub fn sample<IM, FMT>(frame: &IM) -> Result<ColorReading, SampleError>
where
    IM: ImageStride<FMT>,
    FMT: PixelFormat + 'static,
{
    let fmt = TypeId::of::<FMT>();
    let bytes_per_pixel = if fmt == TypeId::of::<RGB8>() {
        3
    } else if fmt == TypeId::of::<Mono8>() {
        1
    } else {
        return Err(SampleError::UnsupportedPixelFormat(type_name::<FMT>().into()));
    };

    let width = frame.width() as usize;
    let height = frame.height() as usize;
    if width == 0 || height == 0 {
        return Err(SampleError::Empty {
            width: frame.width(),
            height: frame.height(),
        });
    }

    let stride = frame.stride();
    let data = frame.image_data();
    let roi = Roi::center_half(width, height);
    let needed = (roi.y1 - 1) * stride + roi.x1 * bytes_per_pixel;
    if data.len() < needed || stride < width * bytes_per_pixel {
        return Err(SampleError::Truncated {
            needed: needed.max(height * width * bytes_per_pixel),
            actual: data.len(),
        });
    }

    let mut sums = [0u64; 3];
    for row in data.chunks(stride).skip(roi.y0).take(roi.y1 - roi.y0) {
        let row = &row[roi.x0 * bytes_per_pixel..roi.x1 * bytes_per_pixel];
        if bytes_per_pixel == 3 {
            for px in row.chunks_exact(3) {
                sums[0] += u64::from(px[0]);
                sums[1] += u64::from(px[1]);
                sums[2] += u64::from(px[2]);
            }
        } else {
            let gray: u64 = row.iter().map(|v| u64::from(*v)).sum();
            sums[0] += gray;
        }
    }
    if bytes_per_pixel == 1 {
        sums[1] = sums[0];
        sums[2] = sums[0];
    }

    let denom = roi.n_pixels() as f64 * 255.0;
    Ok(ColorReading::from_rgb(
        sums[0] as f64 / denom,
        sums[1] as f64 / denom,
        sums[2] as f64 / denom,
    ))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use machine_vision_formats::{owned::OImage, pixel_format::BayerRG8};

    /// An RGB8 frame of `border` color with the center region set to `center`.
    pub(crate) fn frame_with_center(
        w: u32,
        h: u32,
        border: [u8; 3],
        center: [u8; 3],
    ) -> OImage<RGB8> {
        let stride = w as usize * 3;
        let roi = Roi::center_half(w as usize, h as usize);
        let mut buf = vec![0u8; stride * h as usize];
        for (y, row) in buf.chunks_exact_mut(stride).enumerate() {
            for (x, px) in row.chunks_exact_mut(3).enumerate() {
                let inside = (roi.x0..roi.x1).contains(&x) && (roi.y0..roi.y1).contains(&y);
                px.copy_from_slice(if inside { &center } else { &border });
            }
        }
        OImage::new(w, h, stride, buf).unwrap()
    }

    #[test]
    fn center_region_bounds() {
        assert_eq!(
            Roi::center_half(640, 480),
            Roi {
                x0: 160,
                y0: 120,
                x1: 480,
                y1: 360
            }
        );
        assert_eq!(
            Roi::center_half(1, 1),
            Roi {
                x0: 0,
                y0: 0,
                x1: 1,
                y1: 1
            }
        );
        assert_eq!(Roi::center_half(5, 3).n_pixels(), 2);
    }

    #[test]
    fn only_center_is_sampled() {
        let frame = frame_with_center(64, 48, [0, 255, 255], [255, 0, 51]);
        let reading = sample(&frame).unwrap();
        assert_relative_eq!(reading.red, 1.0);
        assert_relative_eq!(reading.green, 0.0);
        assert_relative_eq!(reading.blue, 0.2);
        assert_relative_eq!(reading.brightness, 0.4);
    }

    #[test]
    fn padded_stride() {
        let (w, h) = (4u32, 4u32);
        let stride = 16;
        let mut buf = vec![99u8; stride * h as usize];
        for row in buf.chunks_exact_mut(stride) {
            for px in row[..12].chunks_exact_mut(3) {
                px.copy_from_slice(&[255, 0, 0]);
            }
        }
        let frame: OImage<RGB8> = OImage::new(w, h, stride, buf).unwrap();
        let reading = sample(&frame).unwrap();
        assert_relative_eq!(reading.red, 1.0);
        assert_relative_eq!(reading.green, 0.0);
    }

    #[test]
    fn mono_is_gray() {
        let frame: OImage<Mono8> = OImage::new(8, 8, 8, vec![51; 64]).unwrap();
        let reading = sample(&frame).unwrap();
        assert_relative_eq!(reading.red, 0.2);
        assert_eq!(reading.red, reading.green);
        assert_eq!(reading.red, reading.blue);
        assert_relative_eq!(reading.red_dominance(), 0.0);
    }

    #[test]
    fn unsupported_format_is_unavailable() {
        let frame: OImage<BayerRG8> = OImage::new(4, 4, 4, vec![255; 16]).unwrap();
        assert!(matches!(
            sample(&frame),
            Err(SampleError::UnsupportedPixelFormat(_))
        ));
    }
}
