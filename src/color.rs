use std::str::FromStr;

use palette::{Hsl, IntoColor, Srgb};

use crate::data::model::Rejection;

/// Display colour of a channel, evaluation or point class.
pub type Color = Srgb<u8>;

pub const SEA: Color = Srgb::new(39, 118, 148);
pub const PURPLE: Color = Srgb::new(92, 98, 214);
pub const MAGENTA: Color = Srgb::new(214, 73, 183);
pub const RED: Color = Srgb::new(230, 55, 55);
pub const BLUE: Color = Srgb::new(87, 187, 187);
pub const BROWN: Color = Srgb::new(153, 84, 21);
pub const ORANGE: Color = Srgb::new(213, 121, 19);
pub const YELLOW: Color = Srgb::new(241, 192, 38);
pub const GRAY: Color = Srgb::new(200, 200, 200);

// ---------------------------------------------------------------------------
// Color palette generator
// ---------------------------------------------------------------------------

/// Generates `n` visually distinct colours using evenly spaced hues.
pub fn generate_palette(n: usize) -> Vec<Color> {
    if n == 0 {
        return Vec::new();
    }
    (0..n)
        .map(|i| {
            let hue = (i as f32 / n as f32) * 360.0;
            let hsl = Hsl::new(hue, 0.75, 0.55);
            let rgb: Srgb = hsl.into_color();
            Srgb::new(
                (rgb.red * 255.0) as u8,
                (rgb.green * 255.0) as u8,
                (rgb.blue * 255.0) as u8,
            )
        })
        .collect()
}

/// Default colours for `n` series: the four classic comb channel colours,
/// followed by generated hues once those run out.
pub fn series_palette(n: usize) -> Vec<Color> {
    let fixed = [SEA, PURPLE, MAGENTA, RED];
    if n <= fixed.len() {
        return fixed[..n].to_vec();
    }
    let mut colors = fixed.to_vec();
    colors.extend(generate_palette(n - fixed.len()));
    colors
}

// ---------------------------------------------------------------------------
// Hex conversion
// ---------------------------------------------------------------------------

/// Parse `#rrggbb` (or `rrggbb`, `#rgb`). Returns `None` on malformed input.
pub fn parse_hex(text: &str) -> Option<Color> {
    Srgb::<u8>::from_str(text.trim()).ok()
}

pub fn to_hex(color: Color) -> String {
    format!("#{:02x}{:02x}{:02x}", color.red, color.green, color.blue)
}

/// Colour used by the display layer for each point class.
pub fn rejection_color(class: Rejection) -> Color {
    match class {
        Rejection::Good => BLUE,
        Rejection::Masked => GRAY,
        Rejection::Unlocked => BROWN,
        Rejection::Transferred => ORANGE,
        Rejection::Outlier => YELLOW,
    }
}
