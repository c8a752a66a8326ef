/// Pixel layout handed out by [`Camera::read_frame`](crate::Camera::read_frame).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
    /// Raw sensor data, one byte per pixel in GRBG order.
    Bayer,
    /// Demosaiced, blue first.
    Bgr,
    /// Demosaiced, red first.
    #[default]
    Rgb,
}

impl Format {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            Format::Bayer => 1,
            Format::Bgr | Format::Rgb => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demosaiced_formats_use_three_bytes() {
        assert_eq!(Format::Bayer.bytes_per_pixel(), 1);
        assert_eq!(Format::Rgb.bytes_per_pixel(), 3);
        assert_eq!(Format::Bgr.bytes_per_pixel(), 3);
        assert_eq!(Format::default(), Format::Rgb);
    }
}
