//! Citizen Weather Observer Program over APRS-IS.
//!
//! A session is a TCP connection to an APRS-IS server: read the server
//! banner, send a login line, read the login acknowledgement, send one
//! weather packet and shut the connection down.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use wxrelay_core::{
    FieldSpec, Format, Metric, Predicate, Resolved, Selector, TemplateContext, TimeFormat,
    Transform, Validity,
};
use wxrelay_types::{Field, HardwareClass, convert};

use crate::config::{DestinationConfig, StationConfig};
use crate::error::UploadError;
use crate::upload::Protocol;

/// Server for the unverified passcode `-1`.
pub const UNVERIFIED_SERVER: &str = "cwop.aprs.net:14580";
/// Server rotation for verified passcodes.
pub const VERIFIED_SERVER: &str = "rotate.aprs.net:14580";

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Weather packet fields.
pub const CWOP_TEMPLATE: &[FieldSpec] = &[
    FieldSpec::new("idx", Selector::Time(TimeFormat::DayHourMinute), Format::Text),
    FieldSpec::new("latitude", Selector::Param("latitude"), Format::Text),
    FieldSpec::new("longitude", Selector::Param("longitude"), Format::Text),
    FieldSpec::new("wind_dir", Selector::Field(Field::WindDir), Format::Padded(3))
        .transforms(&[Transform::WindDirDegrees])
        .sentinel("..."),
    FieldSpec::new("wind_ave", Selector::Field(Field::WindAve), Format::Padded(3))
        .transforms(&[Transform::Mph])
        .validity(Validity::NonNegative)
        .sentinel("..."),
    FieldSpec::new("wind_gust", Selector::Field(Field::WindGust), Format::Padded(3))
        .transforms(&[Transform::Mph])
        .validity(Validity::NonNegative)
        .sentinel("..."),
    FieldSpec::new("temp_out", Selector::Field(Field::TempOut), Format::Padded(3))
        .transforms(&[Transform::Fahrenheit])
        .sentinel("..."),
    FieldSpec::new("hum_out", Selector::Field(Field::HumOut), Format::Padded(2))
        .transforms(&[Transform::Modulo(100.0)])
        .sentinel(".."),
    FieldSpec::new("rel_pressure", Selector::Field(Field::RelPressure), Format::Padded(5))
        .transforms(&[Transform::Scale(10.0)])
        .validity(Validity::Between(8000.0, 11000.0))
        .sentinel("....."),
    FieldSpec::new("rain_hour", Selector::Derived(Metric::RainHour), Format::Padded(3))
        .transforms(&[Transform::RainHundredthsInch])
        .validity(Validity::NonNegative)
        .sentinel("..."),
    FieldSpec::new("rain_24h", Selector::Derived(Metric::Rain24h), Format::Padded(3))
        .transforms(&[Transform::RainHundredthsInch])
        .validity(Validity::NonNegative)
        .sentinel("..."),
    FieldSpec::new("rain_day", Selector::Derived(Metric::RainDay), Format::Padded(3))
        .transforms(&[Transform::RainHundredthsInch])
        .validity(Validity::NonNegative)
        .sentinel("..."),
    FieldSpec::new(
        "illuminance_flag",
        Selector::Field(Field::Illuminance),
        Format::Flag {
            threshold: 1000.0,
            below: "L",
            above: "l",
        },
    )
    .transforms(&[Transform::IlluminanceWm2])
    .sentinel("l")
    .when(Predicate::Hardware(HardwareClass::Ws3080)),
    FieldSpec::new("illuminance", Selector::Field(Field::Illuminance), Format::Padded(3))
        .transforms(&[Transform::IlluminanceWm2, Transform::WrapAbove(1000.0)])
        .sentinel("...")
        .when(Predicate::Hardware(HardwareClass::Ws3080)),
    FieldSpec::new("altitude", Selector::Param("altitude"), Format::Padded(6))
        .transforms(&[Transform::AltitudeFeet])
        .sentinel("......")
        .when(Predicate::HasParam("altitude")),
];

/// APRS-IS weather uploads.
#[derive(Debug, Clone)]
pub struct Cwop {
    designator: String,
    passcode: String,
    server: String,
    context: TemplateContext,
}

impl Cwop {
    pub fn new(designator: impl Into<String>, passcode: impl Into<String>, station: &StationConfig) -> Self {
        let passcode = passcode.into();
        let server = Self::default_server(&passcode).to_string();

        let mut context = TemplateContext::new(station.hardware);
        if let Some(lat) = station.latitude.and_then(convert::aprs_latitude) {
            context = context.with_param("latitude", lat);
        }
        if let Some(lon) = station.longitude.and_then(convert::aprs_longitude) {
            context = context.with_param("longitude", lon);
        }
        if let Some(alt) = station.altitude {
            context = context.with_param("altitude", alt.to_string());
        }

        Self {
            designator: designator.into(),
            passcode,
            server,
            context,
        }
    }

    pub fn from_config(config: &DestinationConfig, station: &StationConfig) -> Self {
        let cwop = Self::new(
            config.designator.clone().unwrap_or_default(),
            config.passcode(),
            station,
        );
        match &config.endpoint {
            Some(endpoint) => cwop.with_server(endpoint.clone()),
            None => cwop,
        }
    }

    /// Connect to `server` (`host:port`) instead of the public servers.
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into();
        self
    }

    pub fn default_server(passcode: &str) -> &'static str {
        if passcode == "-1" {
            UNVERIFIED_SERVER
        } else {
            VERIFIED_SERVER
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn login_line(&self) -> String {
        format!(
            "user {} pass {} vers wxrelay {}\n",
            self.designator, self.passcode, VERSION
        )
    }

    /// The APRS weather packet for one rendered reading.
    pub fn packet(&self, fields: &Resolved) -> String {
        let f = |name: &str| fields.get(name).unwrap_or_default();

        let mut packet = format!(
            "{}>APRS,TCPIP*:@{}z{}/{}_{}/{}g{}t{}",
            self.designator,
            f("idx"),
            f("latitude"),
            f("longitude"),
            f("wind_dir"),
            f("wind_ave"),
            f("wind_gust"),
            f("temp_out"),
        );
        // Luminosity takes the hourly rain slot when there was no rain
        if fields.get("illuminance").is_some() && f("rain_hour").parse::<i64>() == Ok(0) {
            packet.push_str(f("illuminance_flag"));
            packet.push_str(f("illuminance"));
        } else {
            packet.push('r');
            packet.push_str(f("rain_hour"));
        }
        packet.push_str(&format!(
            "p{}P{}h{}b{}.wxrelay-{}",
            f("rain_24h"),
            f("rain_day"),
            f("hum_out"),
            f("rel_pressure"),
            VERSION
        ));
        if let Some(altitude) = fields.get("altitude")
            && !fields.is_degraded("altitude")
        {
            packet.push_str(" /A=");
            packet.push_str(altitude);
        }
        packet.push('\n');
        packet
    }
}

/// An open APRS-IS connection.
#[derive(Debug)]
pub struct CwopSession {
    stream: BufReader<TcpStream>,
}

impl CwopSession {
    async fn read_line(&mut self) -> Result<String, UploadError> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(UploadError::Malformed(
                "server closed the connection".to_string(),
            ));
        }
        Ok(line.trim_end().to_string())
    }
}

#[async_trait]
impl Protocol for Cwop {
    type Session = CwopSession;

    fn kind(&self) -> &'static str {
        "cwop"
    }

    fn template(&self) -> &'static [FieldSpec] {
        CWOP_TEMPLATE
    }

    fn context(&self) -> TemplateContext {
        self.context.clone()
    }

    async fn open_session(&self) -> Result<CwopSession, UploadError> {
        let stream = TcpStream::connect(&self.server).await?;
        let mut session = CwopSession {
            stream: BufReader::new(stream),
        };
        let banner = session.read_line().await?;
        debug!(server = %self.server, "Server software: {}", banner);
        Ok(session)
    }

    async fn authenticate(&self, session: &mut CwopSession) -> Result<(), UploadError> {
        let login = self.login_line();
        debug!("Login: {:?}", login);
        session.stream.write_all(login.as_bytes()).await?;
        session.stream.flush().await?;

        let ack = session.read_line().await?;
        debug!("Server login ack: {}", ack);
        if self.passcode != "-1" && ack.contains("unverified") {
            return Err(UploadError::AuthRejected(ack));
        }
        Ok(())
    }

    async fn send(
        &self,
        session: &mut CwopSession,
        fields: &Resolved,
        _identity: Option<&str>,
    ) -> Result<String, UploadError> {
        let packet = self.packet(fields);
        debug!("Packet: {:?}", packet);
        session.stream.write_all(packet.as_bytes()).await?;
        session.stream.flush().await?;
        Ok("OK".to_string())
    }

    async fn close(&self, mut session: CwopSession) {
        if let Err(e) = session.stream.shutdown().await {
            debug!("Shutdown after send failed: {}", e);
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::datetime;
    use wxrelay_core::{DerivedValues, FieldTemplate};
    use wxrelay_types::Reading;

    fn with_some(reading: Reading, field: Field, value: Option<f64>) -> Reading {
        match value {
            Some(v) => reading.with(field, v),
            None => reading,
        }
    }

    fn hardware() -> impl Strategy<Value = HardwareClass> {
        prop_oneof![Just(HardwareClass::Standard), Just(HardwareClass::Ws3080)]
    }

    proptest! {
        #[test]
        fn padded_fields_keep_their_width(
            hardware in hardware(),
            altitude in proptest::option::of(-500.0f64..10_000.0),
            temp in proptest::option::of(-150.0f64..150.0),
            hum in proptest::option::of(0.0f64..=100.0),
            wind in proptest::option::of(-10.0f64..1000.0),
            gust in proptest::option::of(-10.0f64..1000.0),
            dir in proptest::option::of(0.0f64..16.0),
            pressure in proptest::option::of(0.0f64..20_000.0),
            lux in proptest::option::of(0.0f64..1_000_000.0),
            rain_hour in proptest::option::of(-50.0f64..5000.0),
            rain_24h in proptest::option::of(-50.0f64..5000.0),
            rain_day in proptest::option::of(-50.0f64..5000.0),
        ) {
            let station = StationConfig {
                timezone: "UTC".to_string(),
                hardware,
                latitude: Some(51.501),
                longitude: Some(-0.142),
                altitude,
                name: None,
            };
            let cwop = Cwop::new("EW9999", "-1", &station);
            let ctx = cwop.context();
            let template = FieldTemplate::applicable(cwop.template(), &ctx);

            let mut reading = Reading::new(datetime!(2024-03-05 07:09 UTC));
            for (field, value) in [
                (Field::TempOut, temp),
                (Field::HumOut, hum),
                (Field::WindAve, wind),
                (Field::WindGust, gust),
                (Field::WindDir, dir.map(f64::floor)),
                (Field::RelPressure, pressure),
                (Field::Illuminance, lux),
            ] {
                reading = with_some(reading, field, value);
            }
            let derived = DerivedValues {
                rain_hour,
                rain_24h,
                rain_day,
                ..Default::default()
            };

            let resolved = template.resolve(&reading, &derived, &ctx);
            prop_assert_eq!(resolved.fields.len(), template.specs().len());
            for spec in template.specs() {
                if let Format::Padded(width) = spec.format {
                    prop_assert_eq!(spec.sentinel.len(), width, "sentinel of {}", spec.name);
                    let rendered = resolved.get(spec.name).unwrap_or_default();
                    prop_assert_eq!(rendered.len(), width, "{} rendered {:?}", spec.name, rendered);
                }
            }
        }
    }
}
