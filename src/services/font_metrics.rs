//! Built-in advance widths for the supported font families.
//!
//! Widths are in 1/1000 em and grouped by glyph class, which is close enough
//! for line wrapping and keeps layout identical on every host regardless of
//! which font files are installed.

use crate::models::style::FontFamily;

#[derive(Debug, Clone, Copy)]
struct ClassWidths {
    space: u32,
    narrow: u32,
    lower: u32,
    wide_lower: u32,
    upper: u32,
    wide_upper: u32,
    digit: u32,
    punct: u32,
    /// Anything outside ASCII.
    other: u32,
}

const ARIAL: ClassWidths = ClassWidths {
    space: 278,
    narrow: 222,
    lower: 556,
    wide_lower: 833,
    upper: 667,
    wide_upper: 944,
    digit: 556,
    punct: 333,
    other: 600,
};

const DEJAVU_SANS: ClassWidths = ClassWidths {
    space: 318,
    narrow: 278,
    lower: 612,
    wide_lower: 974,
    upper: 698,
    wide_upper: 989,
    digit: 636,
    punct: 400,
    other: 650,
};

const ROBOTO: ClassWidths = ClassWidths {
    space: 248,
    narrow: 243,
    lower: 551,
    wide_lower: 877,
    upper: 652,
    wide_upper: 873,
    digit: 562,
    punct: 330,
    other: 600,
};

// Condensed display face.
const IMPACT: ClassWidths = ClassWidths {
    space: 177,
    narrow: 265,
    lower: 470,
    wide_lower: 710,
    upper: 510,
    wide_upper: 770,
    digit: 550,
    punct: 260,
    other: 520,
};

const COURIER_NEW: ClassWidths = ClassWidths {
    space: 600,
    narrow: 600,
    lower: 600,
    wide_lower: 600,
    upper: 600,
    wide_upper: 600,
    digit: 600,
    punct: 600,
    other: 600,
};

fn table(family: FontFamily) -> &'static ClassWidths {
    match family {
        FontFamily::Arial => &ARIAL,
        FontFamily::DejaVuSans => &DEJAVU_SANS,
        FontFamily::Roboto => &ROBOTO,
        FontFamily::Impact => &IMPACT,
        FontFamily::CourierNew => &COURIER_NEW,
    }
}

fn advance(widths: &ClassWidths, c: char) -> u32 {
    match c {
        ' ' => widths.space,
        'i' | 'j' | 'l' | 'f' | 't' | 'r' | 'I' | '!' | '.' | ',' | '\'' | '|' | ':' | ';' => {
            widths.narrow
        }
        'm' | 'w' => widths.wide_lower,
        'M' | 'W' | '@' => widths.wide_upper,
        'a'..='z' => widths.lower,
        'A'..='Z' => widths.upper,
        '0'..='9' => widths.digit,
        c if c.is_ascii() => widths.punct,
        _ => widths.other,
    }
}

/// Width of `text` in whole pixels at `font_size`, rounded up.
pub fn text_width(text: &str, family: FontFamily, font_size: u32) -> u32 {
    let widths = table(family);
    let units: u64 = text.chars().map(|c| advance(widths, c) as u64).sum();
    (units * font_size as u64).div_ceil(1000) as u32
}
