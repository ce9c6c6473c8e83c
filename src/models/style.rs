use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Font families the renderer carries metrics for.
///
/// The set is closed: a family outside it is rejected at submission instead
/// of being substituted by whatever the host happens to have installed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
    AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum FontFamily {
    #[default]
    Arial,
    #[serde(alias = "DejaVu Sans")]
    #[strum(to_string = "DejaVuSans", serialize = "DejaVu Sans")]
    DejaVuSans,
    Roboto,
    Impact,
    #[serde(alias = "Courier New")]
    #[strum(to_string = "CourierNew", serialize = "Courier New")]
    CourierNew,
}

impl FontFamily {
    /// File name looked up in the configured font directory.
    pub fn file_name(self) -> &'static str {
        match self {
            FontFamily::Arial => "Arial.ttf",
            FontFamily::DejaVuSans => "DejaVuSans.ttf",
            FontFamily::Roboto => "Roboto-Regular.ttf",
            FontFamily::Impact => "Impact.ttf",
            FontFamily::CourierNew => "CourierNew.ttf",
        }
    }
}

/// Vertical anchor of the caption box.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Display, EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum CaptionPosition {
    Top,
    Center,
    #[default]
    Bottom,
}

/// Caption styling, validated once at submission and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CaptionStyle {
    #[garde(skip)]
    pub font_family: FontFamily,

    #[garde(range(min = 8, max = 72))]
    pub font_size: u32,

    #[garde(custom(hex_color))]
    pub font_color: String,

    #[garde(custom(hex_color))]
    pub stroke_color: String,

    #[garde(range(min = 0, max = 10))]
    pub stroke_width: u32,

    #[garde(range(min = 0, max = 50))]
    pub padding: u32,

    #[garde(skip)]
    pub position: CaptionPosition,
}

impl Default for CaptionStyle {
    fn default() -> Self {
        Self {
            font_family: FontFamily::Arial,
            font_size: 24,
            font_color: "#FFFFFF".to_string(),
            stroke_color: "#000000".to_string(),
            stroke_width: 2,
            padding: 10,
            position: CaptionPosition::Bottom,
        }
    }
}

impl CaptionStyle {
    /// Copy with colours in canonical `#RRGGBB` upper-case form.
    pub fn normalized(&self) -> Self {
        Self {
            font_color: self.font_color.to_ascii_uppercase(),
            stroke_color: self.stroke_color.to_ascii_uppercase(),
            ..self.clone()
        }
    }
}

fn hex_color(value: &str, _ctx: &()) -> garde::Result {
    if is_hex_color(value) {
        Ok(())
    } else {
        Err(garde::Error::new(format!(
            "'{}' is not a #RRGGBB colour",
            value
        )))
    }
}

pub fn is_hex_color(value: &str) -> bool {
    value.len() == 7
        && value.starts_with('#')
        && value[1..].chars().all(|c| c.is_ascii_hexdigit())
}
