//! Raster encoding for thermal receipt printers
//!
//! Turns a captured bitmap into the printer's native image command and wraps
//! it with the configured [`PrintCommands`]. With the default commands the
//! output is the image command followed by two line feeds.
//!
//! The encoder reads the bitmap and never modifies it. Pixels are
//! thresholded while packing, so greyscale input prints without a prior
//! dithering pass.

use crate::config::{DriverType, PrintCommands};
use crate::error::EncodeError;
use image::{DynamicImage, Rgba, RgbaImage};

const ESC: u8 = 0x1B;
const GS: u8 = 0x1D;
const LF: u8 = 0x0A;

/// Luminance below which an opaque pixel prints black
pub const BLACK_LUMINANCE: f64 = 185.0;

/// Band height of the `ESC *` column mode
const ESC_STAR_BAND: u32 = 24;

/// Raw command builders
pub mod commands {
    use super::*;

    /// ESC @ - reset the printer and drop pending data
    pub fn init() -> Vec<u8> {
        vec![ESC, b'@', LF]
    }

    /// ESC S - print data as it arrives
    pub fn standard_mode() -> Vec<u8> {
        vec![ESC, b'S', LF]
    }

    pub fn line_feed() -> Vec<u8> {
        vec![LF]
    }

    /// Paper cut for the given command set
    pub fn cut(driver: DriverType) -> Vec<u8> {
        match driver {
            DriverType::Epson | DriverType::EpsonEscStar => vec![ESC, b'm', LF],
            // ESC d 2: feed to cut position, partial cut
            DriverType::Star => vec![ESC, b'd', 0x02],
        }
    }
}

/// Whether a pixel prints as a black dot
pub fn is_black(pixel: &Rgba<u8>) -> bool {
    let [r, g, b, a] = pixel.0;
    if a <= 127 {
        return false;
    }
    let grey = 0.2126 * r as f64 + 0.7152 * g as f64 + 0.0722 * b as f64;
    grey < BLACK_LUMINANCE
}

/// Pack rows MSB first, one bit per pixel, each row padded to whole bytes
pub fn pack_rows(image: &RgbaImage) -> (usize, Vec<u8>) {
    let width = image.width() as usize;
    let bytes_per_row = (width + 7) / 8;
    let mut packed = vec![0u8; bytes_per_row * image.height() as usize];

    for (x, y, pixel) in image.enumerate_pixels() {
        if is_black(pixel) {
            let index = y as usize * bytes_per_row + x as usize / 8;
            packed[index] |= 0x80 >> (x % 8);
        }
    }

    (bytes_per_row, packed)
}

/// GS v 0 raster image
pub fn raster_gs_v0(image: &RgbaImage) -> Result<Vec<u8>, EncodeError> {
    check_dimensions(image)?;
    let (bytes_per_row, packed) = pack_rows(image);
    let height = image.height() as usize;

    let mut out = Vec::with_capacity(8 + packed.len());
    out.extend_from_slice(&[GS, b'v', b'0', b'0']);
    out.extend_from_slice(&u16_le(bytes_per_row));
    out.extend_from_slice(&u16_le(height));
    out.extend_from_slice(&packed);
    Ok(out)
}

/// ESC * 24-dot double density column image, one 24-row band per line
pub fn raster_esc_star(image: &RgbaImage) -> Result<Vec<u8>, EncodeError> {
    check_dimensions(image)?;
    let (width, height) = image.dimensions();

    let bands = (height + ESC_STAR_BAND - 1) / ESC_STAR_BAND;
    let mut out = Vec::with_capacity(5 + bands as usize * (6 + width as usize * 3));

    // ESC 3 24: line spacing equal to one band
    out.extend_from_slice(&[ESC, b'3', ESC_STAR_BAND as u8]);

    for band in 0..bands {
        let top = band * ESC_STAR_BAND;
        out.extend_from_slice(&[ESC, b'*', 33]);
        out.extend_from_slice(&u16_le(width as usize));

        for x in 0..width {
            for slice in 0..3 {
                let mut byte = 0u8;
                for bit in 0..8 {
                    let y = top + slice * 8 + bit;
                    if y < height && is_black(image.get_pixel(x, y)) {
                        byte |= 0x80 >> bit;
                    }
                }
                out.push(byte);
            }
        }

        out.push(LF);
    }

    // ESC 2: default line spacing
    out.extend_from_slice(&[ESC, b'2']);
    Ok(out)
}

/// StarPRNT ESC GS S raster image
pub fn raster_star(image: &RgbaImage) -> Result<Vec<u8>, EncodeError> {
    check_dimensions(image)?;
    let (bytes_per_row, packed) = pack_rows(image);
    let height = image.height() as usize;

    let mut out = Vec::with_capacity(9 + packed.len());
    out.extend_from_slice(&[ESC, GS, b'S', 0x01]);
    out.extend_from_slice(&u16_le(bytes_per_row));
    out.extend_from_slice(&u16_le(height));
    out.push(0x00);
    out.extend_from_slice(&packed);
    Ok(out)
}

/// Converts captured bitmaps into device buffers for one printer target
#[derive(Debug, Clone)]
pub struct RasterEncoder {
    driver: DriverType,
    commands: PrintCommands,
}

impl RasterEncoder {
    pub fn new(driver: DriverType, commands: PrintCommands) -> Self {
        Self { driver, commands }
    }

    /// Encode a bitmap into a complete device buffer
    pub fn encode(&self, image: &DynamicImage) -> Result<Vec<u8>, EncodeError> {
        let rgba = image.to_rgba8();
        let raster = match self.driver {
            DriverType::Epson => raster_gs_v0(&rgba)?,
            DriverType::EpsonEscStar => raster_esc_star(&rgba)?,
            DriverType::Star => raster_star(&rgba)?,
        };

        let mut buffer = Vec::with_capacity(raster.len() + 16);
        if self.commands.explicit_init {
            buffer.extend(commands::init());
        }
        if self.commands.force_standard_mode && self.driver != DriverType::Star {
            buffer.extend(commands::standard_mode());
        }
        for _ in 0..self.commands.lines_before {
            buffer.extend(commands::line_feed());
        }

        buffer.extend(raster);

        for _ in 0..self.commands.lines_after {
            buffer.extend(commands::line_feed());
        }
        if self.commands.cut {
            buffer.extend(commands::cut(self.driver));
        }

        Ok(buffer)
    }

    /// Decode an encoded image file (PNG from the capture stage) and encode it
    pub fn encode_bytes(&self, bytes: &[u8]) -> Result<Vec<u8>, EncodeError> {
        let image = image::load_from_memory(bytes)?;
        self.encode(&image)
    }
}

fn check_dimensions(image: &RgbaImage) -> Result<(), EncodeError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(EncodeError::EmptyImage { width, height });
    }
    if (width as usize + 7) / 8 > u16::MAX as usize || height > u16::MAX as u32 {
        return Err(EncodeError::TooLarge { width, height });
    }
    Ok(())
}

fn u16_le(value: usize) -> [u8; 2] {
    [(value & 0xFF) as u8, ((value >> 8) & 0xFF) as u8]
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

    fn checker(width: u32, height: u32) -> RgbaImage {
        RgbaImage::from_fn(width, height, |x, y| if (x + y) % 2 == 0 { BLACK } else { WHITE })
    }

    #[test]
    fn test_threshold() {
        assert!(is_black(&BLACK));
        assert!(!is_black(&WHITE));
        assert!(is_black(&Rgba([150, 150, 150, 255])));
        assert!(!is_black(&Rgba([200, 200, 200, 255])));
        // Transparent pixels never print
        assert!(!is_black(&Rgba([0, 0, 0, 0])));
    }

    #[test]
    fn test_pack_rows_pads_to_bytes() {
        let image = RgbaImage::from_pixel(10, 2, BLACK);
        let (bytes_per_row, packed) = pack_rows(&image);
        assert_eq!(bytes_per_row, 2);
        assert_eq!(packed, vec![0xFF, 0xC0, 0xFF, 0xC0]);
    }

    #[test]
    fn test_gs_v0_header() {
        let out = raster_gs_v0(&checker(380, 300)).unwrap();
        assert_eq!(&out[..8], &[0x1D, 0x76, 0x30, 0x30, 48, 0, 44, 1]);
        assert_eq!(out.len(), 8 + 48 * 300);
        assert_eq!(out[8], 0b1010_1010);
        assert_eq!(out[8 + 48], 0b0101_0101);
    }

    #[test]
    fn test_default_layout_is_image_then_two_feeds() {
        let image = DynamicImage::ImageRgba8(checker(16, 4));
        let encoder = RasterEncoder::new(DriverType::Epson, PrintCommands::default());
        let out = encoder.encode(&image).unwrap();
        let raster = raster_gs_v0(&image.to_rgba8()).unwrap();
        assert_eq!(&out[..raster.len()], raster.as_slice());
        assert_eq!(&out[raster.len()..], &[LF, LF]);
    }

    #[test]
    fn test_encode_does_not_modify_bitmap() {
        let image = DynamicImage::ImageRgba8(checker(9, 9));
        let before = image.to_rgba8().into_raw();
        RasterEncoder::new(DriverType::Epson, PrintCommands::default())
            .encode(&image)
            .unwrap();
        assert_eq!(image.to_rgba8().into_raw(), before);
    }

    #[test]
    fn test_print_commands_wrap_the_raster() {
        let commands = PrintCommands {
            explicit_init: true,
            force_standard_mode: true,
            lines_before: 1,
            lines_after: 5,
            cut: true,
        };
        let image = DynamicImage::ImageRgba8(checker(8, 1));
        let out = RasterEncoder::new(DriverType::Epson, commands)
            .encode(&image)
            .unwrap();
        assert_eq!(&out[..7], &[ESC, b'@', LF, ESC, b'S', LF, LF]);
        assert_eq!(&out[out.len() - 8..], &[LF, LF, LF, LF, LF, ESC, b'm', LF]);
    }

    #[test]
    fn test_esc_star_bands() {
        let image = RgbaImage::from_pixel(3, 30, BLACK);
        let out = raster_esc_star(&image).unwrap();
        assert_eq!(&out[..3], &[ESC, b'3', 24]);
        assert_eq!(&out[3..8], &[ESC, b'*', 33, 3, 0]);
        // first band is fully black
        assert_eq!(&out[8..17], &[0xFF; 9]);
        assert_eq!(out[17], LF);
        // second band holds 6 rows
        assert_eq!(&out[18..23], &[ESC, b'*', 33, 3, 0]);
        assert_eq!(&out[23..26], &[0xFC, 0x00, 0x00]);
        assert_eq!(&out[out.len() - 2..], &[ESC, b'2']);
    }

    #[test]
    fn test_star_header() {
        let out = raster_star(&RgbaImage::from_pixel(576, 2, WHITE)).unwrap();
        assert_eq!(&out[..9], &[ESC, GS, b'S', 1, 72, 0, 2, 0, 0]);
        assert!(out[9..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let image = DynamicImage::ImageRgba8(RgbaImage::new(0, 10));
        let err = RasterEncoder::new(DriverType::Epson, PrintCommands::default())
            .encode(&image)
            .unwrap_err();
        assert!(matches!(err, EncodeError::EmptyImage { width: 0, height: 10 }));
    }

    #[test]
    fn test_encode_bytes_rejects_garbage() {
        let encoder = RasterEncoder::new(DriverType::Star, PrintCommands::default());
        assert!(matches!(
            encoder.encode_bytes(b"not a png"),
            Err(EncodeError::Decode(_))
        ));
    }
}
