//! Property vocabulary and capability descriptors.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{CaptureError, Result};

/// Camera controls this crate knows how to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Property {
    Brightness,
    Contrast,
    Saturation,
    Hue,
    Sharpness,
    Gamma,
    Gain,
    WhiteBalance,
    AutoWhiteBalance,
    Exposure,
    AutoExposure,
    BacklightCompensation,
    PowerLineFrequency,
    Focus,
    AutoFocus,
    Zoom,
    Pan,
    Tilt,
}

impl Property {
    pub const ALL: [Property; 18] = [
        Property::Brightness,
        Property::Contrast,
        Property::Saturation,
        Property::Hue,
        Property::Sharpness,
        Property::Gamma,
        Property::Gain,
        Property::WhiteBalance,
        Property::AutoWhiteBalance,
        Property::Exposure,
        Property::AutoExposure,
        Property::BacklightCompensation,
        Property::PowerLineFrequency,
        Property::Focus,
        Property::AutoFocus,
        Property::Zoom,
        Property::Pan,
        Property::Tilt,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Property::Brightness => "brightness",
            Property::Contrast => "contrast",
            Property::Saturation => "saturation",
            Property::Hue => "hue",
            Property::Sharpness => "sharpness",
            Property::Gamma => "gamma",
            Property::Gain => "gain",
            Property::WhiteBalance => "whitebalance",
            Property::AutoWhiteBalance => "auto_whitebalance",
            Property::Exposure => "exposure",
            Property::AutoExposure => "auto_exposure",
            Property::BacklightCompensation => "backlight_compensation",
            Property::PowerLineFrequency => "power_line_frequency",
            Property::Focus => "focus",
            Property::AutoFocus => "auto_focus",
            Property::Zoom => "zoom",
            Property::Pan => "pan",
            Property::Tilt => "tilt",
        }
    }

    /// Unit of the raw device value, where UVC defines one.
    pub fn unit(self) -> Option<&'static str> {
        match self {
            Property::WhiteBalance => Some("K"),
            Property::Exposure => Some("100us"),
            Property::Pan | Property::Tilt => Some("arcsec"),
            _ => None,
        }
    }
}

impl fmt::Display for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

impl FromStr for Property {
    type Err = CaptureError;

    fn from_str(name: &str) -> Result<Self> {
        let wanted = normalize(name);
        Property::ALL
            .into_iter()
            .find(|p| normalize(p.name()) == wanted)
            .ok_or_else(|| CaptureError::UnknownProperty(name.to_string()))
    }
}

/// One entry of an enumerated control.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MenuOption {
    pub value: i64,
    pub label: String,
}

/// Shape of a control's value space.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PropertyKind {
    Boolean,
    Ranged {
        min: i64,
        max: i64,
        step: u64,
        default: i64,
    },
    Enumerated {
        options: Vec<MenuOption>,
    },
}

impl PropertyKind {
    /// Inclusive numeric bounds of the value space.
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            PropertyKind::Boolean => (0.0, 1.0),
            PropertyKind::Ranged { min, max, .. } => (*min as f64, *max as f64),
            PropertyKind::Enumerated { options } => {
                let min = options.iter().map(|o| o.value).min().unwrap_or(0);
                let max = options.iter().map(|o| o.value).max().unwrap_or(0);
                (min as f64, max as f64)
            }
        }
    }

    /// Check `value` against the value space and convert it to the raw
    /// integer the device expects.
    pub fn validate(&self, property: Property, value: f64) -> Result<i64> {
        let (min, max) = self.bounds();
        let out_of_range = || CaptureError::OutOfRange {
            property: property.name().to_string(),
            value,
            min,
            max,
        };

        if !value.is_finite() || value.fract() != 0.0 || value < min || value > max {
            return Err(out_of_range());
        }
        let raw = value as i64;

        match self {
            PropertyKind::Boolean => Ok(raw),
            // Must land on min + k * step
            PropertyKind::Ranged { min, step, .. } if *step > 1 => {
                if (i128::from(raw) - i128::from(*min)) % i128::from(*step) == 0 {
                    Ok(raw)
                } else {
                    Err(out_of_range())
                }
            }
            PropertyKind::Ranged { .. } => Ok(raw),
            PropertyKind::Enumerated { options } => {
                if options.iter().any(|o| o.value == raw) {
                    Ok(raw)
                } else {
                    Err(out_of_range())
                }
            }
        }
    }
}

/// Snapshot of a property as read from the device.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDescriptor {
    pub property: Property,
    pub value: f64,
    pub kind: PropertyKind,
    pub unit: Option<&'static str>,
    pub controllable: bool,
}

impl PropertyDescriptor {
    pub fn name(&self) -> &'static str {
        self.property.name()
    }

    pub fn range(&self) -> (f64, f64) {
        self.kind.bounds()
    }
}

impl fmt::Display for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (min, max) = self.range();
        write!(f, "{:<24} {:>8}", self.name(), self.value)?;
        match &self.kind {
            PropertyKind::Boolean => write!(f, "  bool")?,
            PropertyKind::Ranged { step, default, .. } => {
                write!(f, "  [{min}, {max}] step {step} default {default}")?
            }
            PropertyKind::Enumerated { options } => {
                let labels: Vec<String> = options
                    .iter()
                    .map(|o| format!("{}={}", o.value, o.label))
                    .collect();
                write!(f, "  {{{}}}", labels.join(", "))?
            }
        }
        if let Some(unit) = self.unit {
            write!(f, " {unit}")?;
        }
        if !self.controllable {
            write!(f, " (read-only)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_loosely() {
        assert_eq!("Brightness".parse::<Property>().unwrap(), Property::Brightness);
        assert_eq!("white-balance".parse::<Property>().unwrap(), Property::WhiteBalance);
        assert_eq!("auto exposure".parse::<Property>().unwrap(), Property::AutoExposure);
        assert!(matches!(
            "warp_drive".parse::<Property>(),
            Err(CaptureError::UnknownProperty(name)) if name == "warp_drive"
        ));
    }

    #[test]
    fn every_name_round_trips() {
        for p in Property::ALL {
            assert_eq!(p.name().parse::<Property>().unwrap(), p);
        }
    }

    #[test]
    fn ranged_validation() {
        let kind = PropertyKind::Ranged {
            min: -64,
            max: 64,
            step: 1,
            default: 0,
        };
        assert_eq!(kind.validate(Property::Brightness, -64.0).unwrap(), -64);
        assert_eq!(kind.validate(Property::Brightness, 64.0).unwrap(), 64);
        assert!(matches!(
            kind.validate(Property::Brightness, 65.0),
            Err(CaptureError::OutOfRange { min, max, .. }) if min == -64.0 && max == 64.0
        ));
        assert!(kind.validate(Property::Brightness, 1.5).is_err());
        assert!(kind.validate(Property::Brightness, f64::INFINITY).is_err());
    }

    #[test]
    fn ranged_values_must_sit_on_the_step_grid() {
        let kind = PropertyKind::Ranged {
            min: 2800,
            max: 6500,
            step: 10,
            default: 4600,
        };
        assert_eq!(kind.validate(Property::WhiteBalance, 2800.0).unwrap(), 2800);
        assert_eq!(kind.validate(Property::WhiteBalance, 5010.0).unwrap(), 5010);
        assert!(matches!(
            kind.validate(Property::WhiteBalance, 5005.0),
            Err(CaptureError::OutOfRange { value, .. }) if value == 5005.0
        ));

        let odd = PropertyKind::Ranged {
            min: -3,
            max: 3,
            step: 2,
            default: 1,
        };
        assert!(odd.validate(Property::Exposure, -1.0).is_ok());
        assert!(odd.validate(Property::Exposure, 0.0).is_err());
    }

    #[test]
    fn boolean_and_enumerated_validation() {
        assert_eq!(PropertyKind::Boolean.validate(Property::AutoFocus, 1.0).unwrap(), 1);
        assert!(PropertyKind::Boolean.validate(Property::AutoFocus, 2.0).is_err());

        let menu = PropertyKind::Enumerated {
            options: vec![
                MenuOption { value: 0, label: "Disabled".into() },
                MenuOption { value: 1, label: "50 Hz".into() },
                MenuOption { value: 3, label: "Auto".into() },
            ],
        };
        assert_eq!(menu.bounds(), (0.0, 3.0));
        assert_eq!(menu.validate(Property::PowerLineFrequency, 3.0).unwrap(), 3);
        assert!(menu.validate(Property::PowerLineFrequency, 2.0).is_err());
    }
}
