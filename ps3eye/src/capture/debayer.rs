const CHANNELS: usize = 3;

#[inline]
fn avg2(a: u8, b: u8) -> u8 {
    ((u16::from(a) + u16::from(b) + 1) >> 1) as u8
}

#[inline]
fn avg4(a: u8, b: u8, c: u8, d: u8) -> u8 {
    ((u16::from(a) + u16::from(b) + u16::from(c) + u16::from(d) + 2) >> 2) as u8
}

/// Bilinear demosaic of a GRBG frame into interleaved RGB (or BGR).
///
/// The sensor delivers
///
/// ```text
/// G R G R G R
/// B G B G B G
/// G R G R G R
/// B G B G B G
/// ```
///
/// Only interior pixels are interpolated. The outer ring is copied from the
/// nearest interior row or column. `width` must be even and both dimensions
/// at least 3.
pub fn debayer(bayer: &[u8], width: usize, height: usize, out: &mut [u8], bgr: bool) {
    debug_assert!(width >= 3 && height >= 3 && width % 2 == 0);
    debug_assert!(bayer.len() >= width * height);
    debug_assert!(out.len() >= width * height * CHANNELS);

    let stride = width * CHANNELS;
    let (red, blue) = if bgr { (2, 0) } else { (0, 2) };

    for y in 1..height - 1 {
        let up = &bayer[(y - 1) * width..y * width];
        let mid = &bayer[y * width..(y + 1) * width];
        let down = &bayer[(y + 1) * width..(y + 2) * width];
        let row = &mut out[y * stride..(y + 1) * stride];

        for x in 1..width - 1 {
            let cross = || avg4(up[x], mid[x - 1], mid[x + 1], down[x]);
            let diagonal = || avg4(up[x - 1], up[x + 1], down[x - 1], down[x + 1]);
            let horizontal = || avg2(mid[x - 1], mid[x + 1]);
            let vertical = || avg2(up[x], down[x]);

            let (r, g, b) = match (y % 2, x % 2) {
                // G R row
                (0, 0) => (horizontal(), mid[x], vertical()),
                (0, _) => (mid[x], cross(), diagonal()),
                // B G row
                (_, 0) => (diagonal(), cross(), mid[x]),
                _ => (vertical(), mid[x], horizontal()),
            };

            let pixel = &mut row[x * CHANNELS..(x + 1) * CHANNELS];
            pixel[red] = r;
            pixel[1] = g;
            pixel[blue] = b;
        }

        row.copy_within(CHANNELS..2 * CHANNELS, 0);
        row.copy_within((width - 2) * CHANNELS..(width - 1) * CHANNELS, (width - 1) * CHANNELS);
    }

    out.copy_within(stride..2 * stride, 0);
    out.copy_within((height - 2) * stride..(height - 1) * stride, (height - 1) * stride);
}
