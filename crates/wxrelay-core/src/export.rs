//! Bulk report export.
//!
//! Writes one CSV row per reading in the Met Office WOW bulk upload
//! layout, thinned so no two reports are closer than three minutes.

use std::io::Write;

use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};
use tracing::{debug, info};

use wxrelay_types::{Reading, convert};

use crate::dedupe::DedupeExt;
use crate::engine::AggregationEngine;
use crate::error::ExportError;

/// Minimum spacing between exported reports.
pub const REPORT_INTERVAL: Duration = Duration::minutes(3);

/// Column headers, in output order.
pub const COLUMNS: [&str; 11] = [
    "Report Date / Time",
    "Max. Temp. (last 24hr)",
    "Air Temperature",
    "Dew Point",
    "Rainfall Rate",
    "Rainfall Accumulation",
    "Wind Speed",
    "Wind Gust",
    "Wind Direction",
    "Relative Humidity",
    "Pressure (At Station)",
];

fn two_decimals(value: Option<f64>) -> String {
    value
        .filter(|v| v.is_finite())
        .map(|v| format!("{v:.2}"))
        .unwrap_or_default()
}

fn report_time(at: OffsetDateTime) -> String {
    at.to_offset(UtcOffset::UTC)
        .format(format_description!("[day]/[month]/[year] [hour]:[minute]"))
        .unwrap_or_default()
}

fn report_row(engine: &AggregationEngine, reading: &Reading) -> [String; 11] {
    let derived = engine.derive(reading);
    [
        report_time(reading.timestamp),
        two_decimals(derived.max_temp_24h),
        two_decimals(reading.temp_out),
        two_decimals(derived.dew_point),
        two_decimals(derived.rain_hour),
        two_decimals(derived.rain_day),
        two_decimals(reading.wind_ave),
        two_decimals(reading.wind_gust),
        reading
            .wind_dir
            .and_then(|d| convert::winddir_degrees(f64::from(d)))
            .map(|deg| format!("{}", deg.trunc() as i64))
            .unwrap_or_default(),
        reading.hum_out.map(|h| h.to_string()).unwrap_or_default(),
        two_decimals(reading.abs_pressure),
    ]
}

/// Export readings in `[start, stop)` as CSV to `out`.
///
/// Returns the number of report rows written.
pub fn export_bulk<W: Write>(
    engine: &AggregationEngine,
    start: OffsetDateTime,
    stop: OffsetDateTime,
    out: W,
) -> Result<usize, ExportError> {
    let mut writer = csv::Writer::from_writer(out);
    writer.write_record(COLUMNS)?;

    let readings = engine.store().range(start, stop)?;
    let mut rows = 0;
    for reading in readings.into_iter().dedupe_by_interval(REPORT_INTERVAL) {
        debug!(reading = %reading.timestamp, "Exporting report");
        writer.write_record(report_row(engine, &reading))?;
        rows += 1;
    }
    writer.flush()?;

    info!("Exported {} reports", rows);
    Ok(rows)
}
