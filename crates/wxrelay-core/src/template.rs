//! Declarative field templates.
//!
//! A destination describes its payload as a table of [`FieldSpec`]s. Each
//! spec names a source value, a chain of unit [`Transform`]s, a validity
//! check, an output [`Format`] and a sentinel string. [`FieldTemplate`]
//! interprets the table for one reading at a time.
//!
//! Resolution is total. A field whose value is missing, not a number,
//! fails its validity check or does not fit its format renders its
//! sentinel instead, and the field name is reported in
//! [`Resolved::degraded`].
//!
//! # Example
//!
//! ```
//! use time::OffsetDateTime;
//! use wxrelay_core::{DerivedValues, FieldSpec, FieldTemplate, Format, Selector, TemplateContext, Transform};
//! use wxrelay_types::{Field, Reading};
//!
//! const SPECS: &[FieldSpec] = &[
//!     FieldSpec::new("temp", Selector::Field(Field::TempOut), Format::Padded(3))
//!         .transforms(&[Transform::Fahrenheit])
//!         .sentinel("..."),
//! ];
//!
//! let ctx = TemplateContext::default();
//! let template = FieldTemplate::applicable(SPECS, &ctx);
//! let reading = Reading::new(OffsetDateTime::UNIX_EPOCH).with(Field::TempOut, 20.0);
//! let resolved = template.resolve(&reading, &DerivedValues::default(), &ctx);
//! assert_eq!(resolved.get("temp"), Some("068"));
//! ```

use std::collections::BTreeMap;

use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};
use tracing::debug;

use wxrelay_types::{Field, HardwareClass, Reading, convert};

use crate::engine::{DerivedValues, Metric};

/// A selected value before formatting.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Timestamp renderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeFormat {
    /// UTC day of month, hour and minute: `ddHHMM`.
    DayHourMinute,
    /// Unix seconds.
    Unix,
}

/// Where a field's value comes from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selector {
    /// A raw reading field.
    Field(Field),
    /// A value from the aggregation engine.
    Derived(Metric),
    /// The reading timestamp.
    Time(TimeFormat),
    /// A configuration parameter from the [`TemplateContext`].
    Param(&'static str),
}

/// Unit transform applied to a numeric value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transform {
    Fahrenheit,
    Mph,
    WindDirDegrees,
    /// Millimetres to hundredths of an inch.
    RainHundredthsInch,
    IlluminanceWm2,
    AltitudeFeet,
    /// Multiply by a constant.
    Scale(f64),
    /// Remainder after division.
    Modulo(f64),
    /// Subtract the bound from values at or above it.
    WrapAbove(f64),
}

impl Transform {
    fn apply(&self, x: f64) -> Option<f64> {
        match *self {
            Transform::Fahrenheit => convert::temp_f(x),
            Transform::Mph => convert::wind_mph(x),
            Transform::WindDirDegrees => convert::winddir_degrees(x),
            Transform::RainHundredthsInch => convert::rain_inch(x).map(|inch| inch * 100.0),
            Transform::IlluminanceWm2 => convert::illuminance_wm2(x),
            Transform::AltitudeFeet => convert::altitude_feet(x),
            Transform::Scale(k) => Some(x * k),
            Transform::Modulo(m) => (m != 0.0).then(|| x % m),
            Transform::WrapAbove(bound) => Some(if x < bound { x } else { x - bound }),
        }
    }
}

/// Declared validity check on the transformed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Validity {
    Any,
    NonNegative,
    /// Inclusive range.
    Between(f64, f64),
}

impl Validity {
    fn check(&self, x: f64) -> bool {
        match *self {
            Validity::Any => true,
            Validity::NonNegative => x >= 0.0,
            Validity::Between(lo, hi) => (lo..=hi).contains(&x),
        }
    }
}

/// Output rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Format {
    /// Truncated integer zero-padded to exactly this many characters,
    /// sign included. Values that need more characters are invalid.
    Padded(usize),
    /// Truncated integer, no padding.
    Integer,
    /// Fixed number of decimal places.
    Fixed(usize),
    /// Text as selected.
    Text,
    /// One of two markers depending on which side of `threshold` the value
    /// falls.
    Flag {
        threshold: f64,
        below: &'static str,
        above: &'static str,
    },
}

impl Format {
    fn render(&self, value: &Value) -> Option<String> {
        if let (Format::Text, Value::Text(s)) = (self, value) {
            return Some(s.clone());
        }
        let x = value.as_number()?;
        match *self {
            Format::Padded(width) => {
                let s = format!("{:0width$}", x.trunc() as i64);
                (s.len() == width).then_some(s)
            }
            Format::Integer => Some(format!("{}", x.trunc() as i64)),
            Format::Fixed(decimals) => Some(format!("{x:.decimals$}")),
            Format::Text => Some(x.to_string()),
            Format::Flag {
                threshold,
                below,
                above,
            } => Some(if x < threshold { below } else { above }.to_string()),
        }
    }
}

/// When a field applies to a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Always,
    /// Only for this station hardware class.
    Hardware(HardwareClass),
    /// Only when the named parameter is configured.
    HasParam(&'static str),
}

impl Predicate {
    fn holds(&self, ctx: &TemplateContext) -> bool {
        match self {
            Predicate::Always => true,
            Predicate::Hardware(class) => ctx.hardware == *class,
            Predicate::HasParam(name) => ctx.param(name).is_some(),
        }
    }
}

/// One row of a template table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub selector: Selector,
    pub transforms: &'static [Transform],
    pub validity: Validity,
    pub format: Format,
    pub sentinel: &'static str,
    pub predicate: Predicate,
}

impl FieldSpec {
    pub const fn new(name: &'static str, selector: Selector, format: Format) -> Self {
        Self {
            name,
            selector,
            transforms: &[],
            validity: Validity::Any,
            format,
            sentinel: "",
            predicate: Predicate::Always,
        }
    }

    pub const fn transforms(mut self, transforms: &'static [Transform]) -> Self {
        self.transforms = transforms;
        self
    }

    pub const fn validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    pub const fn sentinel(mut self, sentinel: &'static str) -> Self {
        self.sentinel = sentinel;
        self
    }

    pub const fn when(mut self, predicate: Predicate) -> Self {
        self.predicate = predicate;
        self
    }

    fn select(&self, reading: &Reading, derived: &DerivedValues, ctx: &TemplateContext) -> Option<Value> {
        match self.selector {
            Selector::Field(field) => reading.get(field).map(Value::Number),
            Selector::Derived(metric) => derived.get(metric).map(Value::Number),
            Selector::Time(format) => render_time(reading.timestamp, format),
            Selector::Param(name) => ctx.param(name).map(|s| Value::Text(s.to_string())),
        }
    }

    fn evaluate(&self, reading: &Reading, derived: &DerivedValues, ctx: &TemplateContext) -> Option<String> {
        let mut value = self.select(reading, derived, ctx)?;

        if !self.transforms.is_empty() || !matches!(self.validity, Validity::Any) {
            let mut x = value.as_number()?;
            for transform in self.transforms {
                x = transform.apply(x)?;
            }
            if !x.is_finite() || !self.validity.check(x) {
                return None;
            }
            value = Value::Number(x);
        }

        if let Value::Number(x) = value
            && !x.is_finite()
        {
            return None;
        }

        self.format.render(&value)
    }
}

fn render_time(at: OffsetDateTime, format: TimeFormat) -> Option<Value> {
    match format {
        TimeFormat::Unix => Some(Value::Number(at.unix_timestamp() as f64)),
        TimeFormat::DayHourMinute => at
            .to_offset(UtcOffset::UTC)
            .format(format_description!("[day][hour][minute]"))
            .ok()
            .map(Value::Text),
    }
}

/// Per-destination configuration a template is evaluated against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateContext {
    pub hardware: HardwareClass,
    pub params: BTreeMap<String, String>,
}

impl TemplateContext {
    pub fn new(hardware: HardwareClass) -> Self {
        Self {
            hardware,
            params: BTreeMap::new(),
        }
    }

    /// Set a parameter. Empty values count as unset.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

/// The rendered fields for one reading.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub fields: BTreeMap<String, String>,
    /// Fields that rendered their sentinel.
    pub degraded: Vec<&'static str>,
}

impl Resolved {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn is_degraded(&self, name: &str) -> bool {
        self.degraded.contains(&name)
    }
}

/// A template table filtered to the fields applicable to one destination.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldTemplate {
    specs: Vec<FieldSpec>,
}

impl FieldTemplate {
    /// Keep the specs whose predicate holds under `ctx`.
    ///
    /// Predicates are evaluated here, once; hardware and configuration do
    /// not change while a destination is running.
    pub fn applicable(specs: &[FieldSpec], ctx: &TemplateContext) -> Self {
        Self {
            specs: specs.iter().filter(|s| s.predicate.holds(ctx)).copied().collect(),
        }
    }

    pub fn specs(&self) -> &[FieldSpec] {
        &self.specs
    }

    pub fn contains(&self, name: &str) -> bool {
        self.specs.iter().any(|s| s.name == name)
    }

    /// Render every applicable field for `reading`. Never fails and never
    /// omits a key.
    pub fn resolve(&self, reading: &Reading, derived: &DerivedValues, ctx: &TemplateContext) -> Resolved {
        let mut resolved = Resolved::default();
        for spec in &self.specs {
            let rendered = match spec.evaluate(reading, derived, ctx) {
                Some(s) => s,
                None => {
                    debug!(field = spec.name, reading = %reading.timestamp, "Field degraded to sentinel");
                    resolved.degraded.push(spec.name);
                    spec.sentinel.to_string()
                }
            };
            resolved.fields.insert(spec.name.to_string(), rendered);
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const SPECS: &[FieldSpec] = &[
        FieldSpec::new("idx", Selector::Time(TimeFormat::DayHourMinute), Format::Text),
        FieldSpec::new("temp", Selector::Field(Field::TempOut), Format::Padded(3))
            .transforms(&[Transform::Fahrenheit])
            .sentinel("..."),
        FieldSpec::new("hum", Selector::Field(Field::HumOut), Format::Padded(2))
            .transforms(&[Transform::Modulo(100.0)])
            .sentinel(".."),
        FieldSpec::new("pressure", Selector::Field(Field::RelPressure), Format::Padded(5))
            .transforms(&[Transform::Scale(10.0)])
            .validity(Validity::Between(8000.0, 11000.0))
            .sentinel("....."),
        FieldSpec::new("rain", Selector::Derived(Metric::RainHour), Format::Padded(3))
            .transforms(&[Transform::RainHundredthsInch])
            .validity(Validity::NonNegative)
            .sentinel("..."),
        FieldSpec::new("lum", Selector::Field(Field::Illuminance), Format::Padded(3))
            .transforms(&[Transform::IlluminanceWm2, Transform::WrapAbove(1000.0)])
            .sentinel("...")
            .when(Predicate::Hardware(HardwareClass::Ws3080)),
        FieldSpec::new("alt", Selector::Param("altitude"), Format::Padded(6))
            .transforms(&[Transform::AltitudeFeet])
            .when(Predicate::HasParam("altitude")),
        FieldSpec::new("dew", Selector::Derived(Metric::DewPoint), Format::Fixed(1)),
        FieldSpec::new("dt", Selector::Time(TimeFormat::Unix), Format::Integer),
    ];

    fn reading() -> Reading {
        Reading::new(datetime!(2024-03-05 07:09:30 UTC))
            .with(Field::TempOut, -15.0)
            .with(Field::HumOut, 100.0)
            .with(Field::RelPressure, 1013.27)
            .with(Field::Illuminance, 300_000.0)
    }

    #[test]
    fn test_predicates_evaluated_once() {
        let ctx = TemplateContext::default();
        let template = FieldTemplate::applicable(SPECS, &ctx);
        assert!(!template.contains("lum"));
        assert!(!template.contains("alt"));

        let ctx = TemplateContext::new(HardwareClass::Ws3080).with_param("altitude", "155");
        let template = FieldTemplate::applicable(SPECS, &ctx);
        assert!(template.contains("lum"));
        assert!(template.contains("alt"));
        assert_eq!(template.specs().len(), SPECS.len());
    }

    #[test]
    fn test_empty_param_is_absent() {
        let ctx = TemplateContext::default().with_param("altitude", "");
        assert!(!FieldTemplate::applicable(SPECS, &ctx).contains("alt"));
    }

    #[test]
    fn test_resolve_renders_formats() {
        let ctx = TemplateContext::new(HardwareClass::Ws3080).with_param("altitude", "155");
        let template = FieldTemplate::applicable(SPECS, &ctx);
        let derived = DerivedValues {
            rain_hour: Some(2.54),
            dew_point: Some(4.26),
            ..Default::default()
        };

        let resolved = template.resolve(&reading(), &derived, &ctx);
        assert_eq!(resolved.get("idx"), Some("050709"));
        // -15 °C is 5 °F
        assert_eq!(resolved.get("temp"), Some("005"));
        assert_eq!(resolved.get("hum"), Some("00"));
        assert_eq!(resolved.get("pressure"), Some("10132"));
        assert_eq!(resolved.get("rain"), Some("010"));
        // 1500 W/m² wraps to 500
        assert_eq!(resolved.get("lum"), Some("500"));
        assert_eq!(resolved.get("alt"), Some("000508"));
        assert_eq!(resolved.get("dew"), Some("4.3"));
        assert_eq!(resolved.get("dt"), Some("1709622570"));
        assert!(resolved.degraded.is_empty());
    }

    #[test]
    fn test_negative_temperature_keeps_width() {
        let ctx = TemplateContext::default();
        let template = FieldTemplate::applicable(SPECS, &ctx);
        let cold = reading().with(Field::TempOut, -21.0);

        let resolved = template.resolve(&cold, &DerivedValues::default(), &ctx);
        // -21 °C is -5.8 °F, truncated to -5
        assert_eq!(resolved.get("temp"), Some("-05"));
    }

    #[test]
    fn test_missing_and_invalid_values_degrade() {
        let ctx = TemplateContext::default();
        let template = FieldTemplate::applicable(SPECS, &ctx);
        let sparse = Reading::new(datetime!(2024-03-05 07:09 UTC))
            .with(Field::TempOut, f64::NAN)
            .with(Field::RelPressure, 12_000.0);
        let derived = DerivedValues {
            rain_hour: Some(-1.0),
            ..Default::default()
        };

        let resolved = template.resolve(&sparse, &derived, &ctx);
        assert_eq!(resolved.get("temp"), Some("..."));
        assert_eq!(resolved.get("hum"), Some(".."));
        assert_eq!(resolved.get("pressure"), Some("....."));
        assert_eq!(resolved.get("rain"), Some("..."));
        assert_eq!(resolved.get("dew"), Some(""));
        assert!(resolved.is_degraded("temp"));
        assert!(resolved.is_degraded("pressure"));
        assert!(!resolved.is_degraded("idx"));
        // Every applicable key is present
        assert_eq!(resolved.fields.len(), template.specs().len());
    }

    #[test]
    fn test_out_of_range_value_degrades() {
        let ctx = TemplateContext::default();
        let template = FieldTemplate::applicable(SPECS, &ctx);
        // 700 hPa would fit the width but is outside the declared range
        let low = reading().with(Field::RelPressure, 700.0);

        let resolved = template.resolve(&low, &DerivedValues::default(), &ctx);
        assert_eq!(resolved.get("pressure"), Some("....."));
        assert!(resolved.is_degraded("pressure"));

        let edge = reading().with(Field::RelPressure, 1100.0);
        let resolved = template.resolve(&edge, &DerivedValues::default(), &ctx);
        assert_eq!(resolved.get("pressure"), Some("11000"));
    }
}
