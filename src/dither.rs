//! Error-diffusion dithering for receipt images
//!
//! Dithering normally happens inside the printed document: [`DITHER_SCRIPT`]
//! is appended to every rendered template and converts each
//! `<img dither="N">` to 1-bit monochrome once it has loaded. The native
//! functions below run the same arithmetic for previews and tests.
//!
//! The diffusion weights are 7:3:5:1 over a divisor of 23, not the classic
//! sixteenths. Printed output depends on this exact choice.

use image::{imageops::FilterType, DynamicImage, RgbaImage};

/// Luminance cut between black and white
pub const DEFAULT_THRESHOLD: u8 = 150;

/// Error divisor of the diffusion step
pub const DIFFUSION_DIVISOR: i32 = 23;

/// Script embedded in rendered documents
///
/// Scale attributes below 1 (or not a number) are treated as 1.
pub const DITHER_SCRIPT: &str = r#"
<script>
  function floyd_steinberg(image, threshold) {
    threshold = threshold || 150;

    let imageData = image.data;
    let imageDataLength = imageData.length;
    let w = image.width;
    let lumR = [],
        lumG = [],
        lumB = [];

    let newPixel, err;

    for (let i = 0; i < 256; i++) {
      lumR[i] = i * 0.299;
      lumG[i] = i * 0.587;
      lumB[i] = i * 0.114;
    }

    for (let i = 0; i <= imageDataLength; i += 4) {
      imageData[i] = Math.floor(lumR[imageData[i]] + lumG[imageData[i + 1]] + lumB[imageData[i + 2]]);
    }

    for (let p = 0; p <= imageDataLength; p += 4) {
      newPixel = imageData[p] < threshold ? 0 : 255;
      err = Math.floor((imageData[p] - newPixel) / 23);
      imageData[p] = newPixel;
      imageData[p + 4] += err * 7;
      imageData[p + 4 * w - 4] += err * 3;
      imageData[p + 4 * w] += err * 5;
      imageData[p + 4 * w + 4] += err * 1;
      imageData[p + 1] = imageData[p + 2] = imageData[p];
    }

    return image;
  }

  document.querySelectorAll('img').forEach(img => {
    if (!img.getAttribute('dither')) {
      return;
    }

    let src = img.getAttribute('src') || '';
    if (src[0] !== '/' && src.indexOf('data') !== 0) {
      img.setAttribute('src', '/proxy/' + src);
    }

    img.addEventListener('load', () => {
      let scale = Math.max(1, parseInt(img.getAttribute('dither'), 10) || 1);
      let threshold = img.getAttribute('dither-threshold')
        ? parseInt(img.getAttribute('dither-threshold'), 10)
        : undefined;

      let width = img.width / scale;
      let height = img.height / scale;
      let canvas = document.createElement('canvas');
      canvas.width = width;
      canvas.height = height;

      let context = canvas.getContext('2d');
      context.drawImage(img, 0, 0, width, height);
      context.imageSmoothingEnabled = false;

      context.putImageData(floyd_steinberg(context.getImageData(0, 0, width, height), threshold), 0, 0);
      img.src = canvas.toDataURL();
    }, { once: true });
  });
</script>
"#;

/// Normalize a `dither` attribute value; anything below 1 means 1
pub fn effective_scale(scale: i64) -> u32 {
    scale.clamp(1, u32::MAX as i64) as u32
}

/// Source the script loads a dithered image from
///
/// Remote sources go through the `/proxy/` route so the canvas is not
/// tainted by cross-origin data.
pub fn proxied_src(src: &str) -> String {
    if src.starts_with('/') || src.starts_with("data") {
        src.to_string()
    } else {
        format!("/proxy/{}", src)
    }
}

/// Dither an RGBA buffer in place
///
/// `data` is row-major RGBA with `width` pixels per row. Writes behave like
/// the browser's clamped byte buffer: stored values saturate to `0..=255`,
/// neighbour offsets are flat (the left-below neighbour of column 0 is the
/// last pixel of the current row) and writes past the end are dropped.
/// Alpha is left untouched.
pub fn floyd_steinberg(data: &mut [u8], width: usize, threshold: u8) {
    let len = data.len() - data.len() % 4;
    if len == 0 || width == 0 {
        return;
    }

    for p in (0..len).step_by(4) {
        data[p] = luminance(data[p], data[p + 1], data[p + 2]);
    }

    let row = 4 * width as isize;
    let neighbours: [(isize, i32); 4] = [(4, 7), (row - 4, 3), (row, 5), (row + 4, 1)];

    for p in (0..len).step_by(4) {
        let old = data[p] as i32;
        let new = if old < threshold as i32 { 0 } else { 255 };
        let err = (old - new).div_euclid(DIFFUSION_DIVISOR);
        data[p] = new as u8;

        for (offset, weight) in neighbours {
            let target = p as isize + offset;
            if target < 0 || target as usize >= data.len() {
                continue;
            }
            let target = target as usize;
            data[target] = (data[target] as i32 + err * weight).clamp(0, 255) as u8;
        }

        data[p + 1] = data[p];
        data[p + 2] = data[p];
    }
}

/// Downscale by `scale` and dither, the way the embedded script does
pub fn dither_image(image: &DynamicImage, scale: i64, threshold: Option<u8>) -> RgbaImage {
    let scale = effective_scale(scale);
    let width = (image.width() / scale).max(1);
    let height = (image.height() / scale).max(1);

    let mut canvas = if scale == 1 {
        image.to_rgba8()
    } else {
        image::imageops::resize(&image.to_rgba8(), width, height, FilterType::Triangle)
    };

    let canvas_width = canvas.width() as usize;
    floyd_steinberg(
        &mut canvas,
        canvas_width,
        threshold.unwrap_or(DEFAULT_THRESHOLD),
    );
    canvas
}

fn luminance(r: u8, g: u8, b: u8) -> u8 {
    let y = (r as f64 * 0.299 + g as f64 * 0.587) + b as f64 * 0.114;
    y.floor().clamp(0.0, 255.0) as u8
}
