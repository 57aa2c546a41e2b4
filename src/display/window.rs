//! Live preview windows.

use image::RgbImage;
use minifb::{Key, KeyRepeat, ScaleMode, Window, WindowOptions};
use std::time::Duration;

use super::{format_quality, DisplayError, PresentationSink};
use crate::engine::QualitySnapshot;

const WINDOW_WIDTH: usize = 1280;
const WINDOW_HEIGHT: usize = 720;

/// Screen positions of the "Matches" and "Warping" windows.
const MATCHES_POSITION: (isize, isize) = (200, 100);
const WARPING_POSITION: (isize, isize) = (WINDOW_WIDTH as isize + 250, 100);

/// Two windows: "Matches" on the left, "Warping" to its right.
///
/// Closing either window counts as a `q` key.
pub struct WindowSink {
    matches: Window,
    warping: Window,
}

impl WindowSink {
    pub fn new() -> Result<Self, DisplayError> {
        let options = WindowOptions {
            resize: true,
            scale_mode: ScaleMode::AspectRatioStretch,
            ..WindowOptions::default()
        };

        let mut matches = Window::new("Matches", WINDOW_WIDTH, WINDOW_HEIGHT, options)
            .map_err(|e| DisplayError::Window(e.to_string()))?;
        let mut warping = Window::new("Warping", WINDOW_WIDTH, WINDOW_HEIGHT, options)
            .map_err(|e| DisplayError::Window(e.to_string()))?;

        matches.set_position(MATCHES_POSITION.0, MATCHES_POSITION.1);
        warping.set_position(WARPING_POSITION.0, WARPING_POSITION.1);

        Ok(Self { matches, warping })
    }

    fn shifted(&self) -> bool {
        [&self.matches, &self.warping].iter().any(|w| {
            w.is_key_down(Key::LeftShift) || w.is_key_down(Key::RightShift)
        })
    }
}

/// Pack RGB pixels as 0RGB words.
fn to_buffer(image: &RgbImage) -> Vec<u32> {
    image
        .pixels()
        .map(|p| ((p[0] as u32) << 16) | ((p[1] as u32) << 8) | p[2] as u32)
        .collect()
}

fn key_char(key: Key) -> Option<char> {
    match key {
        Key::C => Some('c'),
        Key::S => Some('s'),
        Key::R => Some('r'),
        Key::Q => Some('q'),
        _ => None,
    }
}

impl PresentationSink for WindowSink {
    fn present(
        &mut self,
        matches: &RgbImage,
        stitched: &RgbImage,
        quality: &QualitySnapshot,
    ) -> Result<(), DisplayError> {
        self.matches
            .update_with_buffer(
                &to_buffer(matches),
                matches.width() as usize,
                matches.height() as usize,
            )
            .map_err(|e| DisplayError::Window(e.to_string()))?;
        self.warping
            .set_title(&format!("Warping | {}", format_quality(quality)));
        self.warping
            .update_with_buffer(
                &to_buffer(stitched),
                stitched.width() as usize,
                stitched.height() as usize,
            )
            .map_err(|e| DisplayError::Window(e.to_string()))?;
        Ok(())
    }

    async fn poll_key(&mut self, wait: Duration) -> Option<char> {
        tokio::time::sleep(wait).await;
        self.matches.update();
        self.warping.update();

        if !self.matches.is_open() || !self.warping.is_open() {
            return Some('q');
        }

        let shifted = self.shifted();
        let pressed = self
            .matches
            .get_keys_pressed(KeyRepeat::No)
            .into_iter()
            .chain(self.warping.get_keys_pressed(KeyRepeat::No));
        for key in pressed {
            if let Some(c) = key_char(key) {
                return Some(if shifted { c.to_ascii_uppercase() } else { c });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_to_buffer_packs_0rgb() {
        let img = RgbImage::from_pixel(2, 1, Rgb([0x12, 0x34, 0x56]));
        assert_eq!(to_buffer(&img), vec![0x0012_3456, 0x0012_3456]);
    }

    #[test]
    fn test_window_positions() {
        assert_eq!(MATCHES_POSITION, (200, 100));
        assert_eq!(WARPING_POSITION, (1530, 100));
        // The second window starts past the right edge of the first.
        assert!(WARPING_POSITION.0 > MATCHES_POSITION.0 + WINDOW_WIDTH as isize);
    }

    #[test]
    fn test_key_char() {
        assert_eq!(key_char(Key::C), Some('c'));
        assert_eq!(key_char(Key::Q), Some('q'));
        assert_eq!(key_char(Key::Space), None);
    }
}
