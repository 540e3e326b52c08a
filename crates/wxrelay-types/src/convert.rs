//! Pure unit conversions.
//!
//! Every conversion returns `None` when the result is undefined for its
//! input (non-finite values, humidity of zero for a dew point, a compass
//! index outside 0..16). `Some(0.0)` is always a genuine zero.

/// Degrees Celsius to degrees Fahrenheit.
#[must_use]
pub fn temp_f(celsius: f64) -> Option<f64> {
    finite(celsius).map(|c| c * 9.0 / 5.0 + 32.0)
}

/// Metres per second to miles per hour.
#[must_use]
pub fn wind_mph(metres_per_second: f64) -> Option<f64> {
    finite(metres_per_second).map(|v| v * 3.6 / 1.609344)
}

/// Millimetres to inches.
#[must_use]
pub fn rain_inch(millimetres: f64) -> Option<f64> {
    finite(millimetres).map(|v| v / 25.4)
}

/// Metres to feet.
#[must_use]
pub fn altitude_feet(metres: f64) -> Option<f64> {
    finite(metres).map(|v| v / 0.3048)
}

/// Lux to an approximate irradiance in W/m².
#[must_use]
pub fn illuminance_wm2(lux: f64) -> Option<f64> {
    finite(lux).map(|v| v * 0.005)
}

/// 16-point compass index (0 = N, 4 = E, ...) to degrees.
///
/// ```
/// use wxrelay_types::convert::winddir_degrees;
///
/// assert_eq!(winddir_degrees(0.0), Some(0.0));
/// assert_eq!(winddir_degrees(6.0), Some(135.0));
/// assert_eq!(winddir_degrees(16.0), None);
/// ```
#[must_use]
pub fn winddir_degrees(points: f64) -> Option<f64> {
    let points = finite(points)?;
    if points.fract() != 0.0 || !(0.0..16.0).contains(&points) {
        return None;
    }
    Some(points * 22.5)
}

/// Dew point (°C) from temperature (°C) and relative humidity (%).
///
/// Uses the Magnus approximation. Undefined for non-positive humidity.
#[must_use]
pub fn dew_point(celsius: f64, humidity: f64) -> Option<f64> {
    let t = finite(celsius)?;
    let rh = finite(humidity)?;
    if rh <= 0.0 {
        return None;
    }
    const A: f64 = 17.27;
    const B: f64 = 237.7;
    let gamma = (A * t) / (B + t) + (rh / 100.0).ln();
    finite((B * gamma) / (A - gamma))
}

/// Decimal degrees latitude to APRS `DDMM.mmN` notation.
///
/// ```
/// use wxrelay_types::convert::aprs_latitude;
///
/// assert_eq!(aprs_latitude(51.501).as_deref(), Some("5130.06N"));
/// assert_eq!(aprs_latitude(-33.5).as_deref(), Some("3330.00S"));
/// ```
#[must_use]
pub fn aprs_latitude(degrees: f64) -> Option<String> {
    if !(-90.0..=90.0).contains(&finite(degrees)?) {
        return None;
    }
    let hemisphere = if degrees < 0.0 { 'S' } else { 'N' };
    let (whole, minutes, hundredths) = split_minutes(degrees.abs());
    Some(format!("{:02}{:02}.{:02}{}", whole, minutes, hundredths, hemisphere))
}

/// Decimal degrees longitude to APRS `DDDMM.mmE` notation.
#[must_use]
pub fn aprs_longitude(degrees: f64) -> Option<String> {
    if !(-180.0..=180.0).contains(&finite(degrees)?) {
        return None;
    }
    let hemisphere = if degrees < 0.0 { 'W' } else { 'E' };
    let (whole, minutes, hundredths) = split_minutes(degrees.abs());
    Some(format!("{:03}{:02}.{:02}{}", whole, minutes, hundredths, hemisphere))
}

/// Split positive degrees into whole degrees, whole minutes and hundredths
/// of a minute, rounding on the hundredths so 59.999' carries into the degree.
fn split_minutes(degrees: f64) -> (u32, u32, u32) {
    let total = (degrees * 6000.0).round() as u32;
    (total / 6000, (total % 6000) / 100, total % 100)
}

fn finite(value: f64) -> Option<f64> {
    value.is_finite().then_some(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 0.01)
    }

    #[test]
    fn test_temperature() {
        assert!(close(temp_f(0.0), 32.0));
        assert!(close(temp_f(-40.0), -40.0));
        assert!(close(temp_f(21.0), 69.8));
        assert_eq!(temp_f(f64::NAN), None);
    }

    #[test]
    fn test_speed_and_lengths() {
        assert!(close(wind_mph(10.0), 22.37));
        assert!(close(rain_inch(25.4), 1.0));
        assert!(close(altitude_feet(155.0), 508.53));
        assert!(close(illuminance_wm2(20_000.0), 100.0));
        assert_eq!(rain_inch(0.0), Some(0.0));
    }

    #[test]
    fn test_winddir_rejects_fractional_points() {
        assert_eq!(winddir_degrees(15.0), Some(337.5));
        assert_eq!(winddir_degrees(2.5), None);
        assert_eq!(winddir_degrees(-1.0), None);
    }

    #[test]
    fn test_dew_point() {
        // Saturated air: dew point equals temperature.
        assert!(close(dew_point(20.0, 100.0), 20.0));
        assert!(close(dew_point(20.0, 50.0), 9.25));
        assert_eq!(dew_point(20.0, 0.0), None);
    }

    #[test]
    fn test_aprs_positions() {
        assert_eq!(aprs_longitude(0.142).as_deref(), Some("00008.52E"));
        assert_eq!(aprs_longitude(-87.6298).as_deref(), Some("08737.79W"));
        assert_eq!(aprs_latitude(45.99999).as_deref(), Some("4600.00N"));
        assert_eq!(aprs_latitude(91.0), None);
        assert_eq!(aprs_longitude(f64::INFINITY), None);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn dew_point_never_exceeds_temperature(t in -40.0f64..50.0, rh in 1.0f64..=100.0) {
            let dp = dew_point(t, rh).unwrap();
            prop_assert!(dp <= t + 1e-6);
        }

        #[test]
        fn aprs_positions_are_fixed_width(lat in -90.0f64..=90.0, lon in -180.0f64..=180.0) {
            prop_assert_eq!(aprs_latitude(lat).unwrap().len(), 8);
            prop_assert_eq!(aprs_longitude(lon).unwrap().len(), 9);
        }
    }
}
