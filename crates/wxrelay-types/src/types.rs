//! Core types for weather station readings.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ParseError;

/// A named numeric field of a [`Reading`].
///
/// Units are the calibrated units the reading store holds: degrees Celsius,
/// percent, metres per second, millimetres, hectopascals and lux. Wind
/// direction is a 16-point compass index (0 = N, 4 = E, 8 = S, 12 = W).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[non_exhaustive]
pub enum Field {
    /// Outdoor temperature (°C).
    TempOut,
    /// Outdoor relative humidity (%).
    HumOut,
    /// Average wind speed (m/s).
    WindAve,
    /// Wind gust speed (m/s).
    WindGust,
    /// Wind direction as a 16-point compass index.
    WindDir,
    /// Cumulative rain counter (mm). Monotonic, but may reset.
    Rain,
    /// Pressure reduced to sea level (hPa).
    RelPressure,
    /// Pressure at the station (hPa).
    AbsPressure,
    /// Illuminance (lux). Only reported by the WS3080 hardware class.
    Illuminance,
    /// UV index. Only reported by the WS3080 hardware class.
    Uv,
}

impl Field {
    /// Every field, in declaration order.
    pub const ALL: [Field; 10] = [
        Field::TempOut,
        Field::HumOut,
        Field::WindAve,
        Field::WindGust,
        Field::WindDir,
        Field::Rain,
        Field::RelPressure,
        Field::AbsPressure,
        Field::Illuminance,
        Field::Uv,
    ];

    /// The snake_case name used in configuration and logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::TempOut => "temp_out",
            Field::HumOut => "hum_out",
            Field::WindAve => "wind_ave",
            Field::WindGust => "wind_gust",
            Field::WindDir => "wind_dir",
            Field::Rain => "rain",
            Field::RelPressure => "rel_pressure",
            Field::AbsPressure => "abs_pressure",
            Field::Illuminance => "illuminance",
            Field::Uv => "uv",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Field {
    type Err = ParseError;

    /// Parse a field from its snake_case name.
    ///
    /// ```
    /// use wxrelay_types::Field;
    ///
    /// assert_eq!("temp_out".parse::<Field>(), Ok(Field::TempOut));
    /// assert!("co2".parse::<Field>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Field::ALL
            .iter()
            .copied()
            .find(|field| field.as_str() == s)
            .ok_or_else(|| ParseError::UnknownField(s.to_string()))
    }
}

/// Station hardware class.
///
/// Determines which optional fields a station reports and therefore which
/// template fields apply to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum HardwareClass {
    /// Basic station (WH1080 family): no light or UV sensor.
    #[default]
    #[cfg_attr(feature = "serde", serde(alias = "1080"))]
    Standard,
    /// WS3080 family: adds illuminance and UV.
    #[cfg_attr(feature = "serde", serde(alias = "3080"))]
    Ws3080,
}

impl HardwareClass {
    /// Whether this hardware reports illuminance.
    #[must_use]
    pub fn has_illuminance(&self) -> bool {
        matches!(self, HardwareClass::Ws3080)
    }
}

impl fmt::Display for HardwareClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareClass::Standard => write!(f, "standard"),
            HardwareClass::Ws3080 => write!(f, "ws3080"),
        }
    }
}

impl FromStr for HardwareClass {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "standard" | "1080" => Ok(HardwareClass::Standard),
            "ws3080" | "3080" => Ok(HardwareClass::Ws3080),
            other => Err(ParseError::UnknownHardware(other.to_string())),
        }
    }
}

/// One timestamped, calibrated sample from the station.
///
/// Readings are immutable once stored. Every numeric field is optional
/// because sensors drop out (a lost outdoor link leaves only the timestamp
/// and the rain counter, for example).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    /// UTC timestamp of the sample.
    #[cfg_attr(feature = "serde", serde(with = "time::serde::rfc3339"))]
    pub timestamp: OffsetDateTime,
    /// Outdoor temperature (°C).
    pub temp_out: Option<f64>,
    /// Outdoor relative humidity (%).
    pub hum_out: Option<u8>,
    /// Average wind speed (m/s).
    pub wind_ave: Option<f64>,
    /// Wind gust speed (m/s).
    pub wind_gust: Option<f64>,
    /// Wind direction as a 16-point compass index.
    pub wind_dir: Option<u8>,
    /// Cumulative rain counter (mm).
    pub rain: Option<f64>,
    /// Pressure reduced to sea level (hPa).
    pub rel_pressure: Option<f64>,
    /// Pressure at the station (hPa).
    pub abs_pressure: Option<f64>,
    /// Illuminance (lux).
    pub illuminance: Option<f64>,
    /// UV index.
    pub uv: Option<u8>,
}

impl Reading {
    /// Create a reading with only a timestamp; all fields empty.
    #[must_use]
    pub fn new(timestamp: OffsetDateTime) -> Self {
        Self {
            timestamp,
            temp_out: None,
            hum_out: None,
            wind_ave: None,
            wind_gust: None,
            wind_dir: None,
            rain: None,
            rel_pressure: None,
            abs_pressure: None,
            illuminance: None,
            uv: None,
        }
    }

    /// Get a field as `f64`, or `None` when the sensor did not report it.
    #[must_use]
    pub fn get(&self, field: Field) -> Option<f64> {
        match field {
            Field::TempOut => self.temp_out,
            Field::HumOut => self.hum_out.map(f64::from),
            Field::WindAve => self.wind_ave,
            Field::WindGust => self.wind_gust,
            Field::WindDir => self.wind_dir.map(f64::from),
            Field::Rain => self.rain,
            Field::RelPressure => self.rel_pressure,
            Field::AbsPressure => self.abs_pressure,
            Field::Illuminance => self.illuminance,
            Field::Uv => self.uv.map(f64::from),
        }
    }

    /// Set a field from an `f64`.
    ///
    /// Integer fields (humidity, wind direction, UV) are rounded and
    /// rejected when out of range.
    pub fn set(&mut self, field: Field, value: f64) -> Result<(), ParseError> {
        match field {
            Field::TempOut => self.temp_out = Some(value),
            Field::HumOut => self.hum_out = Some(to_u8(field, value, 100)?),
            Field::WindAve => self.wind_ave = Some(value),
            Field::WindGust => self.wind_gust = Some(value),
            Field::WindDir => self.wind_dir = Some(to_u8(field, value, 15)?),
            Field::Rain => self.rain = Some(value),
            Field::RelPressure => self.rel_pressure = Some(value),
            Field::AbsPressure => self.abs_pressure = Some(value),
            Field::Illuminance => self.illuminance = Some(value),
            Field::Uv => self.uv = Some(to_u8(field, value, u8::MAX)?),
        }
        Ok(())
    }

    /// Builder-style [`Reading::set`] for fields known to be in range.
    ///
    /// Out-of-range integer values leave the field empty.
    #[must_use]
    pub fn with(mut self, field: Field, value: f64) -> Self {
        let _ = self.set(field, value);
        self
    }
}

fn to_u8(field: Field, value: f64, max: u8) -> Result<u8, ParseError> {
    let rounded = value.round();
    if !rounded.is_finite() || rounded < 0.0 || rounded > f64::from(max) {
        return Err(ParseError::InvalidValue(format!(
            "{} = {} (expected 0..={})",
            field, value, max
        )));
    }
    Ok(rounded as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_field_round_trip_names() {
        for field in Field::ALL {
            assert_eq!(field.as_str().parse::<Field>().unwrap(), field);
        }
    }

    #[test]
    fn test_unknown_field() {
        let err = "co2".parse::<Field>().unwrap_err();
        assert_eq!(err, ParseError::UnknownField("co2".to_string()));
    }

    #[test]
    fn test_hardware_class_parse() {
        assert_eq!("3080".parse::<HardwareClass>(), Ok(HardwareClass::Ws3080));
        assert_eq!("WS3080".parse::<HardwareClass>(), Ok(HardwareClass::Ws3080));
        assert_eq!("1080".parse::<HardwareClass>(), Ok(HardwareClass::Standard));
        assert!("davis".parse::<HardwareClass>().is_err());
        assert!(HardwareClass::Ws3080.has_illuminance());
        assert!(!HardwareClass::default().has_illuminance());
    }

    #[test]
    fn test_reading_get_and_set() {
        let mut reading = Reading::new(datetime!(2024-06-01 12:00 UTC));
        assert_eq!(reading.get(Field::TempOut), None);

        reading.set(Field::TempOut, 21.5).unwrap();
        reading.set(Field::HumOut, 64.4).unwrap();
        reading.set(Field::WindDir, 12.0).unwrap();

        assert_eq!(reading.get(Field::TempOut), Some(21.5));
        assert_eq!(reading.hum_out, Some(64));
        assert_eq!(reading.get(Field::WindDir), Some(12.0));
    }

    #[test]
    fn test_reading_rejects_out_of_range_integers() {
        let mut reading = Reading::new(datetime!(2024-06-01 12:00 UTC));
        assert!(reading.set(Field::HumOut, 101.0).is_err());
        assert!(reading.set(Field::WindDir, 16.0).is_err());
        assert!(reading.set(Field::Uv, -1.0).is_err());
        assert_eq!(reading.hum_out, None);

        let reading = reading.with(Field::HumOut, f64::NAN);
        assert_eq!(reading.hum_out, None);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_reading_serialization() {
        let reading = Reading::new(datetime!(2024-06-01 12:00 UTC))
            .with(Field::TempOut, 18.25)
            .with(Field::Rain, 301.2);

        let json = serde_json::to_string(&reading).unwrap();
        assert!(json.contains("2024-06-01T12:00:00Z"));
        assert!(json.contains("18.25"));

        let parsed: Reading = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reading);
    }
}
