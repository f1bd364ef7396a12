use std::io::Cursor;

use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{ImageFormat, Rgba, RgbaImage};

use crate::error::FetchError;

pub const ERROR_FLAG_HEADER: &str = "x-error";
pub const ERROR_STATUS_HEADER: &str = "x-error-status";
pub const ERROR_MESSAGE_HEADER: &str = "x-error-message";
pub const MAX_HEADER_MESSAGE_CHARS: usize = 200;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;
const MARGIN: u32 = 24;
const GLYPH: u32 = 8;
const TITLE_SCALE: u32 = 3;
const BODY_SCALE: u32 = 2;
const LINE_GAP: u32 = 6;

const BACKGROUND: Rgba<u8> = Rgba([38, 20, 24, 255]);
const ACCENT: Rgba<u8> = Rgba([214, 69, 80, 255]);
const TEXT: Rgba<u8> = Rgba([240, 232, 232, 255]);
const MUTED: Rgba<u8> = Rgba([176, 160, 164, 255]);

/// A failure rendered as a picture, so `<img>` consumers still get something
/// to draw while scripts can read the diagnostic headers.
#[derive(Debug, Clone)]
pub struct ErrorImage {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub status: u16,
    pub message: String,
}

impl ErrorImage {
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("cache-control", "no-store".to_string()),
            (ERROR_FLAG_HEADER, "true".to_string()),
            (ERROR_STATUS_HEADER, self.status.to_string()),
            (ERROR_MESSAGE_HEADER, header_safe(&self.message)),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorImageRenderer;

impl ErrorImageRenderer {
    pub fn render_error(&self, err: &FetchError) -> ErrorImage {
        self.render(err.status_code(), &err.to_string())
    }

    /// Never fails: if encoding breaks, the message bytes go out as-is.
    pub fn render(&self, status: u16, message: &str) -> ErrorImage {
        let bytes = match self.draw(status, message) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::error!(error = %err, "failed to encode error image");
                message.as_bytes().to_vec()
            }
        };
        ErrorImage {
            bytes,
            content_type: "image/png",
            status,
            message: message.to_string(),
        }
    }

    fn draw(&self, status: u16, message: &str) -> anyhow::Result<Vec<u8>> {
        let mut canvas = RgbaImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);
        fill_rect(&mut canvas, 0, 0, WIDTH, 8, ACCENT);

        let mut y = MARGIN + 8;
        draw_text(&mut canvas, MARGIN, y, "Image unavailable", TITLE_SCALE, TEXT);
        y += GLYPH * TITLE_SCALE + LINE_GAP * 2;
        draw_text(&mut canvas, MARGIN, y, &format!("status {status}"), BODY_SCALE, ACCENT);
        y += GLYPH * BODY_SCALE + LINE_GAP * 2;

        let columns = ((WIDTH - MARGIN * 2) / (GLYPH * BODY_SCALE)) as usize;
        let line_height = GLYPH * BODY_SCALE + LINE_GAP;
        for line in wrap(message, columns) {
            if y + line_height > HEIGHT - MARGIN {
                break;
            }
            draw_text(&mut canvas, MARGIN, y, &line, BODY_SCALE, MUTED);
            y += line_height;
        }

        let mut encoded = Cursor::new(Vec::new());
        canvas.write_to(&mut encoded, ImageFormat::Png)?;
        Ok(encoded.into_inner())
    }
}

fn draw_text(canvas: &mut RgbaImage, x: u32, y: u32, text: &str, scale: u32, color: Rgba<u8>) {
    let mut cursor = x;
    for ch in text.chars() {
        if cursor + GLYPH * scale > canvas.width() {
            break;
        }
        let glyph = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?'));
        if let Some(rows) = glyph {
            for (row, bits) in rows.iter().copied().enumerate() {
                for col in 0..GLYPH {
                    if bits & (1u8 << col) != 0 {
                        fill_rect(
                            canvas,
                            cursor + col * scale,
                            y + row as u32 * scale,
                            scale,
                            scale,
                            color,
                        );
                    }
                }
            }
        }
        cursor += GLYPH * scale;
    }
}

fn fill_rect(canvas: &mut RgbaImage, x: u32, y: u32, w: u32, h: u32, color: Rgba<u8>) {
    for py in y..(y + h).min(canvas.height()) {
        for px in x..(x + w).min(canvas.width()) {
            canvas.put_pixel(px, py, color);
        }
    }
}

fn wrap(message: &str, columns: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in message.split_whitespace() {
        let mut word: String = word.to_string();
        while word.chars().count() > columns {
            if !current.is_empty() {
                lines.push(std::mem::take(&mut current));
            }
            let head: String = word.chars().take(columns).collect();
            word = word.chars().skip(columns).collect();
            lines.push(head);
        }
        let needed = current.chars().count() + usize::from(!current.is_empty()) + word.chars().count();
        if needed > columns && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

/// Printable ASCII only, capped for use as a header value.
pub fn header_safe(message: &str) -> String {
    message
        .chars()
        .map(|ch| match ch {
            ' '..='~' => ch,
            '\t' | '\n' | '\r' => ' ',
            _ => '?',
        })
        .take(MAX_HEADER_MESSAGE_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use crate::error::FetchError;

    use super::{
        header_safe, wrap, ErrorImageRenderer, ERROR_FLAG_HEADER, ERROR_MESSAGE_HEADER,
        ERROR_STATUS_HEADER,
    };

    #[test]
    fn renders_decodable_png_with_diagnostics() -> anyhow::Result<()> {
        let image = ErrorImageRenderer.render_error(&FetchError::Upstream("model said no".to_string()));
        let decoded = image::load_from_memory(&image.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
        assert_eq!(image.content_type, "image/png");
        assert_eq!(image.status, 502);

        let headers = image.headers();
        let value = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.clone())
        };
        assert_eq!(value(ERROR_FLAG_HEADER).as_deref(), Some("true"));
        assert_eq!(value(ERROR_STATUS_HEADER).as_deref(), Some("502"));
        assert_eq!(value("cache-control").as_deref(), Some("no-store"));
        Ok(())
    }

    #[test]
    fn long_messages_still_render() -> anyhow::Result<()> {
        let message = "word ".repeat(500);
        let image = ErrorImageRenderer.render(500, &message);
        image::load_from_memory(&image.bytes)?;
        Ok(())
    }

    #[test]
    fn empty_messages_still_render() -> anyhow::Result<()> {
        let image = ErrorImageRenderer.render(500, "");
        let decoded = image::load_from_memory(&image.bytes)?;
        assert_eq!((decoded.width(), decoded.height()), (640, 360));
        let headers = image.headers();
        assert!(headers.contains(&(ERROR_FLAG_HEADER, "true".to_string())));
        assert!(headers.contains(&(ERROR_STATUS_HEADER, "500".to_string())));
        assert!(headers.contains(&(ERROR_MESSAGE_HEADER, String::new())));
        Ok(())
    }

    #[test]
    fn header_message_is_ascii_and_bounded() {
        let safe = header_safe(&format!("bad\nvalue ✨ {}", "x".repeat(400)));
        assert!(safe.starts_with("bad value ? "));
        assert!(safe.chars().count() <= 200);
        assert!(safe.chars().all(|ch| (' '..='~').contains(&ch)));
    }

    #[test]
    fn wrap_breaks_on_words_and_splits_long_tokens() {
        assert_eq!(wrap("one two three", 7), vec!["one two", "three"]);
        assert_eq!(wrap("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        assert!(wrap("", 10).is_empty());
    }
}
