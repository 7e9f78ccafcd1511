//! Unit handling: a dimension-scoped conversion lookup plus the typed
//! quantities the reference model computes with.
//!
//! The conversion table is a pure lookup service: boundary values arrive
//! in whatever unit the template declares and are converted to the
//! model's internal units (`hm^3` for volumes, `hm^3 day^-1` for flows)
//! on the way in, and back again on the way out.
use crate::errors::ConfigurationError;

/// A dimension the conversion table knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
pub enum Dimension {
    /// Stored water.
    #[strum(serialize = "Volume")]
    Volume,
    /// Water moving per unit time.
    #[strum(serialize = "Volumetric flow rate")]
    VolumetricFlowRate,
}

/// Internal model unit for volumes.
pub const MODEL_VOLUME_UNIT: &str = "hm^3";
/// Internal model unit for flows.
pub const MODEL_FLOW_UNIT: &str = "hm^3 day^-1";

/// Factors to the base unit of each dimension (m^3 and m^3/day).
const VOLUME_FACTORS: &[(&str, f64)] = &[
    ("m^3", 1.0),
    ("hm^3", 1e6),
    ("km^3", 1e9),
    ("1e6 m^3", 1e6),
    ("ft^3", 0.028_316_846_592),
    ("ac-ft", 1_233.481_837_547_52),
    ("TAF", 1.233_481_837_547_52e6),
];

const FLOW_FACTORS: &[(&str, f64)] = &[
    ("m^3 day^-1", 1.0),
    ("hm^3 day^-1", 1e6),
    ("m^3 s^-1", 86_400.0),
    ("ft^3 s^-1", 2_446.575_545_549_0),
    ("ML day^-1", 1_000.0),
    ("ac-ft day^-1", 1_233.481_837_547_52),
];

fn factor(dimension: Dimension, unit: &str) -> Result<f64, ConfigurationError> {
    let table = match dimension {
        Dimension::Volume => VOLUME_FACTORS,
        Dimension::VolumetricFlowRate => FLOW_FACTORS,
    };
    table
        .iter()
        .find(|(name, _)| *name == unit)
        .map(|(_, f)| *f)
        .ok_or_else(|| ConfigurationError(format!("unknown {dimension} unit '{unit}'")))
}

/// Convert `value` from one unit to another within a dimension.
pub fn convert(
    value: f64,
    dimension: Dimension,
    from_unit: &str,
    to_unit: &str,
) -> Result<f64, ConfigurationError> {
    if from_unit == to_unit {
        return Ok(value);
    }
    Ok(value * factor(dimension, from_unit)? / factor(dimension, to_unit)?)
}

macro_rules! unit_struct {
    ($name:ident) => {
        /// A typed quantity in the model's internal units.
        #[derive(Debug, Clone, Copy, PartialEq, derive_more::Add, derive_more::Sub)]
        pub struct $name(pub f64);

        impl $name {
            /// The value as a bare f64.
            pub fn value(self) -> f64 {
                self.0
            }
        }

        impl From<f64> for $name {
            fn from(val: f64) -> Self {
                Self(val)
            }
        }
    };
}

unit_struct!(Volume);
unit_struct!(FlowRate);

impl std::ops::Mul<f64> for FlowRate {
    type Output = Volume;

    /// Flow times days gives volume.
    fn mul(self, days: f64) -> Volume {
        Volume(self.0 * days)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;
    use std::str::FromStr;

    #[test]
    fn test_dimension_names() {
        assert_eq!(
            Dimension::from_str("Volumetric flow rate").unwrap(),
            Dimension::VolumetricFlowRate
        );
        assert_eq!(Dimension::Volume.to_string(), "Volume");
        assert!(Dimension::from_str("Temperature").is_err());
    }

    #[test]
    fn test_volume_conversion() {
        assert_approx_eq!(
            f64,
            convert(2.0, Dimension::Volume, "hm^3", "m^3").unwrap(),
            2e6
        );
        assert_approx_eq!(
            f64,
            convert(1.0, Dimension::Volume, "TAF", "ac-ft").unwrap(),
            1000.0
        );
    }

    #[test]
    fn test_flow_conversion() {
        assert_approx_eq!(
            f64,
            convert(1.0, Dimension::VolumetricFlowRate, "m^3 s^-1", "m^3 day^-1").unwrap(),
            86_400.0
        );
    }

    #[test]
    fn test_same_unit_is_identity() {
        assert_approx_eq!(
            f64,
            convert(3.5, Dimension::Volume, "whatever", "whatever").unwrap(),
            3.5
        );
    }

    #[test]
    fn test_unknown_unit_errors() {
        assert!(convert(1.0, Dimension::Volume, "bushels", "m^3").is_err());
    }

    #[test]
    fn test_typed_quantities() {
        let v = Volume(1.0) + FlowRate(2.0) * 1.5;
        assert_approx_eq!(f64, v.value(), 4.0);
    }
}
