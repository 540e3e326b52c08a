//! OpenWeatherMap station API.
//!
//! Measurements are posted as a JSON array holding one object. Uploads
//! name the station by the identity obtained from station registration.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Number, Value};
use tracing::debug;

use wxrelay_core::{
    FieldSpec, Format, Metric, Resolved, Selector, TemplateContext, TimeFormat, Transform,
    Validity,
};
use wxrelay_types::Field;

use crate::config::{DestinationConfig, StationConfig};
use crate::error::UploadError;
use crate::upload::Protocol;

pub const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

/// Measurement fields. Missing values are left out of the request.
pub const OWM_TEMPLATE: &[FieldSpec] = &[
    FieldSpec::new("dt", Selector::Time(TimeFormat::Unix), Format::Integer),
    FieldSpec::new("temperature", Selector::Field(Field::TempOut), Format::Fixed(1)),
    FieldSpec::new("wind_speed", Selector::Field(Field::WindAve), Format::Fixed(1)),
    FieldSpec::new("wind_gust", Selector::Field(Field::WindGust), Format::Fixed(1)),
    FieldSpec::new("wind_deg", Selector::Field(Field::WindDir), Format::Fixed(0))
        .transforms(&[Transform::WindDirDegrees]),
    FieldSpec::new("pressure", Selector::Field(Field::RelPressure), Format::Fixed(1))
        .validity(Validity::Between(800.0, 1100.0)),
    FieldSpec::new("humidity", Selector::Field(Field::HumOut), Format::Integer),
    FieldSpec::new("rain_1h", Selector::Derived(Metric::RainHour), Format::Fixed(1)),
    FieldSpec::new("rain_24h", Selector::Derived(Metric::Rain24h), Format::Fixed(1)),
    FieldSpec::new("dew_point", Selector::Derived(Metric::DewPoint), Format::Fixed(1)),
];

/// Station registration payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StationRegistration {
    pub external_id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: f64,
}

/// OpenWeatherMap uploads.
#[derive(Debug, Clone)]
pub struct OpenWeatherMap {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    station: StationRegistration,
}

impl OpenWeatherMap {
    pub fn new(
        api_key: impl Into<String>,
        station: StationRegistration,
        timeout: std::time::Duration,
    ) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("wxrelay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            station,
        })
    }

    pub fn from_config(
        config: &DestinationConfig,
        station: &StationConfig,
    ) -> Result<Self, UploadError> {
        let registration = StationRegistration {
            external_id: config.external_id.clone().unwrap_or_default(),
            name: config.station_name.clone().unwrap_or_default(),
            latitude: station.latitude.unwrap_or_default(),
            longitude: station.longitude.unwrap_or_default(),
            altitude: station.altitude.unwrap_or_default(),
        };
        let owm = Self::new(
            config.api_key.clone().unwrap_or_default(),
            registration,
            config.timeout(),
        )?;
        Ok(match &config.endpoint {
            Some(endpoint) => owm.with_base_url(endpoint),
            None => owm,
        })
    }

    /// Talk to `base_url` instead of the public API.
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// The JSON body for one rendered reading.
    pub fn measurements(fields: &Resolved, station_id: &str) -> Value {
        let mut object = Map::new();
        object.insert("station_id".to_string(), Value::String(station_id.to_string()));
        for (name, rendered) in &fields.fields {
            if rendered.is_empty() {
                continue;
            }
            object.insert(name.clone(), json_number(rendered));
        }
        Value::Array(vec![Value::Object(object)])
    }

    fn stations_url(&self) -> String {
        format!("{}/data/3.0/stations", self.base_url)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, UploadError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(UploadError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

fn json_number(rendered: &str) -> Value {
    if let Ok(n) = rendered.parse::<i64>() {
        return Value::Number(n.into());
    }
    rendered
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(rendered.to_string()))
}

#[async_trait]
impl Protocol for OpenWeatherMap {
    /// Requests are independent; the shared client pools connections.
    type Session = ();

    fn kind(&self) -> &'static str {
        "openweathermap"
    }

    fn template(&self) -> &'static [FieldSpec] {
        OWM_TEMPLATE
    }

    fn context(&self) -> TemplateContext {
        TemplateContext::default()
    }

    fn needs_identity(&self) -> bool {
        true
    }

    async fn open_session(&self) -> Result<(), UploadError> {
        Ok(())
    }

    async fn authenticate(&self, _session: &mut ()) -> Result<(), UploadError> {
        Ok(())
    }

    async fn send(
        &self,
        _session: &mut (),
        fields: &Resolved,
        identity: Option<&str>,
    ) -> Result<String, UploadError> {
        let station_id = identity.ok_or(UploadError::MissingIdentity)?;
        let body = Self::measurements(fields, station_id);
        debug!("Measurements: {}", body);

        let response = self
            .client
            .post(format!("{}/data/3.0/measurements", self.base_url))
            .query(&[("appid", &self.api_key)])
            .json(&body)
            .send()
            .await?;
        let response = Self::check(response).await?;
        Ok(format!("HTTP {}", response.status().as_u16()))
    }

    async fn close(&self, _session: ()) {}

    async fn register(&self, existing: Option<&str>) -> Result<String, UploadError> {
        match existing {
            Some(id) => {
                debug!("Updating station {}", id);
                let response = self
                    .client
                    .put(format!("{}/{}", self.stations_url(), id))
                    .query(&[("appid", &self.api_key)])
                    .json(&self.station)
                    .send()
                    .await?;
                Self::check(response).await?;
                Ok(id.to_string())
            }
            None => {
                debug!("Creating new station");
                let response = self
                    .client
                    .post(self.stations_url())
                    .query(&[("appid", &self.api_key)])
                    .json(&self.station)
                    .send()
                    .await?;
                let body: Value = Self::check(response).await?.json().await?;
                debug!("Registration response: {}", body);
                body.get("ID")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| UploadError::Malformed(format!("no station ID in {}", body)))
            }
        }
    }
}
