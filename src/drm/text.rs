//! Bitmap-text rendering for the stub screens.
//!
//! Every glyph is an 8x8 raster encoded row-wise in 8 bytes; the least
//! significant bit of each byte is the leftmost pixel of its row. 'A' is
//!
//! ```text
//! 0x0C => ..XX....
//! 0x1E => .XXXX...
//! 0x33 => XX..XX..
//! 0x33 => XX..XX..
//! 0x3F => XXXXXX..
//! 0x33 => XX..XX..
//! 0x33 => XX..XX..
//! 0x00 => ........
//! ```

const GLYPH_WIDTH: usize = 8;
const GLYPH_HEIGHT: usize = 8;
const PIXEL_VALUE: u8 = 0x65; // Light gray, RGB/BGR-friendly

const GLYPH_BLANK: [u8; 8] = [0x00; 8];
const GLYPH_UNKNOWN: [u8; 8] = [0x1E, 0x33, 0x30, 0x18, 0x0C, 0x00, 0x0C, 0x00]; // '?'

fn glyph(ch: u8) -> &'static [u8; 8] {
    match ch.to_ascii_uppercase() {
        b' ' => &GLYPH_BLANK,
        b'.' => &[0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C, 0x00],
        b'-' => &[0x00, 0x00, 0x00, 0x3F, 0x00, 0x00, 0x00, 0x00],
        b'=' => &[0x00, 0x00, 0x3F, 0x00, 0x00, 0x3F, 0x00, 0x00],
        b'<' => &[0x18, 0x0C, 0x06, 0x03, 0x06, 0x0C, 0x18, 0x00],
        b'>' => &[0x06, 0x0C, 0x18, 0x30, 0x18, 0x0C, 0x06, 0x00],
        b'0' => &[0x3E, 0x63, 0x73, 0x7B, 0x6F, 0x67, 0x3E, 0x00],
        b'1' => &[0x0C, 0x0E, 0x0C, 0x0C, 0x0C, 0x0C, 0x3F, 0x00],
        b'2' => &[0x1E, 0x33, 0x30, 0x1C, 0x06, 0x33, 0x3F, 0x00],
        b'3' => &[0x1E, 0x33, 0x30, 0x1C, 0x30, 0x33, 0x1E, 0x00],
        b'4' => &[0x38, 0x3C, 0x36, 0x33, 0x7F, 0x30, 0x78, 0x00],
        b'5' => &[0x3F, 0x03, 0x1F, 0x30, 0x30, 0x33, 0x1E, 0x00],
        b'6' => &[0x1C, 0x06, 0x03, 0x1F, 0x33, 0x33, 0x1E, 0x00],
        b'7' => &[0x3F, 0x33, 0x30, 0x18, 0x0C, 0x0C, 0x0C, 0x00],
        b'8' => &[0x1E, 0x33, 0x33, 0x1E, 0x33, 0x33, 0x1E, 0x00],
        b'9' => &[0x1E, 0x33, 0x33, 0x3E, 0x30, 0x18, 0x0E, 0x00],
        b'A' => &[0x0C, 0x1E, 0x33, 0x33, 0x3F, 0x33, 0x33, 0x00],
        b'B' => &[0x3F, 0x66, 0x66, 0x3E, 0x66, 0x66, 0x3F, 0x00],
        b'C' => &[0x3C, 0x66, 0x03, 0x03, 0x03, 0x66, 0x3C, 0x00],
        b'D' => &[0x1F, 0x36, 0x66, 0x66, 0x66, 0x36, 0x1F, 0x00],
        b'E' => &[0x7F, 0x46, 0x16, 0x1E, 0x16, 0x46, 0x7F, 0x00],
        b'F' => &[0x7F, 0x46, 0x16, 0x1E, 0x16, 0x06, 0x0F, 0x00],
        b'G' => &[0x3C, 0x66, 0x03, 0x03, 0x73, 0x66, 0x7C, 0x00],
        b'H' => &[0x33, 0x33, 0x33, 0x3F, 0x33, 0x33, 0x33, 0x00],
        b'I' => &[0x1E, 0x0C, 0x0C, 0x0C, 0x0C, 0x0C, 0x1E, 0x00],
        b'J' => &[0x78, 0x30, 0x30, 0x30, 0x33, 0x33, 0x1E, 0x00],
        b'K' => &[0x67, 0x66, 0x36, 0x1E, 0x36, 0x66, 0x67, 0x00],
        b'L' => &[0x0F, 0x06, 0x06, 0x06, 0x46, 0x66, 0x7F, 0x00],
        b'M' => &[0x63, 0x77, 0x7F, 0x7F, 0x6B, 0x63, 0x63, 0x00],
        b'N' => &[0x63, 0x67, 0x6F, 0x7B, 0x73, 0x63, 0x63, 0x00],
        b'O' => &[0x1C, 0x36, 0x63, 0x63, 0x63, 0x36, 0x1C, 0x00],
        b'P' => &[0x3F, 0x66, 0x66, 0x3E, 0x06, 0x06, 0x0F, 0x00],
        b'Q' => &[0x1E, 0x33, 0x33, 0x33, 0x3B, 0x1E, 0x38, 0x00],
        b'R' => &[0x3F, 0x66, 0x66, 0x3E, 0x36, 0x66, 0x67, 0x00],
        b'S' => &[0x1E, 0x33, 0x07, 0x0E, 0x38, 0x33, 0x1E, 0x00],
        b'T' => &[0x3F, 0x2D, 0x0C, 0x0C, 0x0C, 0x0C, 0x1E, 0x00],
        b'U' => &[0x33, 0x33, 0x33, 0x33, 0x33, 0x33, 0x3F, 0x00],
        b'V' => &[0x33, 0x33, 0x33, 0x33, 0x33, 0x1E, 0x0C, 0x00],
        b'W' => &[0x63, 0x63, 0x63, 0x6B, 0x7F, 0x77, 0x63, 0x00],
        b'X' => &[0x63, 0x63, 0x36, 0x1C, 0x1C, 0x36, 0x63, 0x00],
        b'Y' => &[0x33, 0x33, 0x33, 0x1E, 0x0C, 0x0C, 0x1E, 0x00],
        b'Z' => &[0x7F, 0x63, 0x31, 0x18, 0x4C, 0x66, 0x7F, 0x00],
        _ => &GLYPH_UNKNOWN,
    }
}

/// Renders banner text into a black RGB24 canvas, scaled to the display and
/// centered. The canvas is cached and only redrawn when the text or the
/// resolution changes.
pub struct TextRenderer {
    canvas: Vec<u8>,
    width: u32,
    height: u32,
    text: String,
}

impl TextRenderer {
    pub fn new() -> Self {
        Self {
            canvas: Vec::new(),
            width: 0,
            height: 0,
            text: String::new(),
        }
    }

    /// Draws `text` (lines separated by `\n`) onto a `width`x`height`
    /// canvas and returns the packed RGB24 pixels.
    pub fn draw(&mut self, text: &str, width: u32, height: u32) -> &[u8] {
        if self.width == width && self.height == height && self.text == text {
            return &self.canvas;
        }
        self.width = width;
        self.height = height;
        self.text.clear();
        self.text.push_str(text);

        let (width, height) = (width as usize, height as usize);
        self.canvas.clear();
        self.canvas.resize(width * height * 3, 0);

        let lines: Vec<&str> = text.split('\n').collect();
        let max_len = lines.iter().map(|line| line.len()).max().unwrap_or(0);
        if max_len == 0 {
            return &self.canvas;
        }

        // Use half the display budget so the banner floats in the middle.
        let scale_x = width / 2 / (max_len * GLYPH_WIDTH);
        let scale_y = height / 2 / (lines.len() * GLYPH_HEIGHT);
        let scale = scale_x.min(scale_y).max(1);

        let block_height = lines.len() * GLYPH_HEIGHT * scale;
        let start_y = height.saturating_sub(block_height) / 2;

        for (n, line) in lines.iter().enumerate() {
            let line_width = line.len() * GLYPH_WIDTH * scale;
            let start_x = width.saturating_sub(line_width) / 2;
            self.draw_line(line, scale, start_x, start_y + n * GLYPH_HEIGHT * scale);
        }
        &self.canvas
    }

    fn draw_line(&mut self, line: &str, scale: usize, start_x: usize, start_y: usize) {
        let width = self.width as usize;
        let height = self.height as usize;
        let chars = line.as_bytes();

        for ch_y in 0..GLYPH_HEIGHT * scale {
            let canvas_y = start_y + ch_y;
            if canvas_y >= height {
                break;
            }
            for ch_x in 0..GLYPH_WIDTH * chars.len() * scale {
                let canvas_x = start_x + ch_x;
                if canvas_x >= width {
                    break;
                }
                let rows = glyph(chars[ch_x / GLYPH_WIDTH / scale]);
                let row = rows[(ch_y / scale) % GLYPH_HEIGHT];
                let bit = (ch_x / scale) % GLYPH_WIDTH;
                if row & (1 << bit) != 0 {
                    let offset = (canvas_y * width + canvas_x) * 3;
                    self.canvas[offset..offset + 3].fill(PIXEL_VALUE);
                }
            }
        }
    }
}

impl Default for TextRenderer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit_pixels(canvas: &[u8]) -> usize {
        canvas.chunks_exact(3).filter(|px| px[0] != 0).count()
    }

    #[test]
    fn test_draw_fills_canvas() {
        let mut renderer = TextRenderer::new();
        let canvas = renderer.draw("NO SIGNAL", 320, 240);
        assert_eq!(canvas.len(), 320 * 240 * 3);
        assert!(lit_pixels(canvas) > 0, "banner has no lit pixels");
    }

    #[test]
    fn test_multiline_banner() {
        let mut renderer = TextRenderer::new();
        let one = renderer.draw("NO SIGNAL", 640, 480).to_vec();
        let two = renderer.draw("UNSUPPORTED RESOLUTION\n1920X1080", 640, 480).to_vec();
        assert!(lit_pixels(&one) > 0);
        assert!(lit_pixels(&two) > 0);
        assert_ne!(one, two);

        // The second line sits below the first.
        let row_lit = |canvas: &[u8], y: usize| {
            canvas[y * 640 * 3..(y + 1) * 640 * 3].iter().any(|&b| b != 0)
        };
        let top_half = (0..240).any(|y| row_lit(&two, y));
        let bottom_half = (240..480).any(|y| row_lit(&two, y));
        assert!(top_half && bottom_half);
    }

    #[test]
    fn test_cache_keeps_content() {
        let mut renderer = TextRenderer::new();
        let first = renderer.draw("ONLINE IS ACTIVE", 320, 240).to_vec();
        let second = renderer.draw("ONLINE IS ACTIVE", 320, 240).to_vec();
        assert_eq!(first, second);

        let changed = renderer.draw("NO SIGNAL", 320, 240).to_vec();
        assert_ne!(first, changed);
    }

    #[test]
    fn test_tiny_canvas_does_not_panic() {
        let mut renderer = TextRenderer::new();
        let canvas = renderer.draw("UNSUPPORTED RESOLUTION", 16, 8);
        assert_eq!(canvas.len(), 16 * 8 * 3);
    }

    #[test]
    fn test_glyph_encoding_of_a() {
        // Row 0 of 'A' is ..XX....: bits 2 and 3 set.
        let rows = glyph(b'A');
        assert_eq!(rows[0], 0x0C);
        assert!(rows[0] & (1 << 2) != 0);
        assert!(rows[0] & (1 << 3) != 0);
        assert!(rows[0] & 1 == 0);
    }
}
