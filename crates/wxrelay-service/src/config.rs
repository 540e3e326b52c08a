//! Relay configuration.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use time::Duration;

use wxrelay_types::HardwareClass;
use wxrelay_types::convert;

use crate::upload::Mode;

/// Relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Station description shared by every destination.
    pub station: StationConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// New-reading watcher settings.
    pub live: LiveConfig,
    /// Upload destinations.
    pub destinations: Vec<DestinationConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(default_config_path())
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Errors that make the whole configuration unusable: station,
    /// storage and live settings, and destination id clashes.
    pub fn global_errors(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        errors.extend(self.station.validate());
        errors.extend(self.storage.validate());
        errors.extend(self.live.validate());

        let mut seen = HashSet::new();
        for (i, dest) in self.destinations.iter().enumerate() {
            if !dest.id.is_empty() && !seen.insert(dest.id.as_str()) {
                errors.push(ValidationError {
                    field: format!("destinations[{}].id", i),
                    message: format!("duplicate destination id '{}'", dest.id),
                });
            }
        }
        errors
    }

    /// Validate the configuration and return every error found.
    ///
    /// # Example
    ///
    /// ```
    /// use wxrelay_service::Config;
    ///
    /// let config: Config = toml::from_str(r#"
    ///     [station]
    ///     timezone = "Europe/London"
    /// "#).unwrap();
    /// config.validate().expect("minimal config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = self.global_errors();
        for (i, dest) in self.destinations.iter().enumerate() {
            errors.extend(dest.validate(&format!("destinations[{}]", i), &self.station));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Split destinations into usable ones and the errors of the rest.
    ///
    /// A destination with invalid settings is dropped on its own; the
    /// others still run.
    pub fn usable_destinations(&self) -> (Vec<&DestinationConfig>, Vec<ValidationError>) {
        let mut usable = Vec::new();
        let mut errors = Vec::new();
        for (i, dest) in self.destinations.iter().enumerate() {
            let problems = dest.validate(&format!("destinations[{}]", i), &self.station);
            if problems.is_empty() {
                usable.push(dest);
            } else {
                errors.extend(problems);
            }
        }
        (usable, errors)
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// The station whose readings are relayed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// IANA timezone the station's calendar days follow.
    pub timezone: String,
    /// Hardware class, which decides the optional sensors.
    pub hardware: HardwareClass,
    /// Latitude in decimal degrees, north positive.
    pub latitude: Option<f64>,
    /// Longitude in decimal degrees, east positive.
    pub longitude: Option<f64>,
    /// Altitude in metres.
    pub altitude: Option<f64>,
    /// Human readable station name.
    pub name: Option<String>,
}

impl StationConfig {
    /// The parsed timezone.
    pub fn tz(&self) -> Result<Tz, ValidationError> {
        self.timezone.parse::<Tz>().map_err(|_| ValidationError {
            field: "station.timezone".to_string(),
            message: if self.timezone.is_empty() {
                "timezone is required (IANA name, e.g. 'Europe/London')".to_string()
            } else {
                format!("unknown timezone '{}'", self.timezone)
            },
        })
    }

    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = self.tz() {
            errors.push(e);
        }
        if let Some(lat) = self.latitude
            && !(-90.0..=90.0).contains(&lat)
        {
            errors.push(ValidationError {
                field: "station.latitude".to_string(),
                message: format!("latitude {} is out of range (-90 to 90)", lat),
            });
        }
        if let Some(lon) = self.longitude
            && !(-180.0..=180.0).contains(&lon)
        {
            errors.push(ValidationError {
                field: "station.longitude".to_string(),
                message: format!("longitude {} is out of range (-180 to 180)", lon),
            });
        }

        errors
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Reading store database path.
    pub path: PathBuf,
    /// Upload status database path. Defaults to the reading store.
    pub status_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: wxrelay_store::default_db_path(),
            status_path: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "storage.path".to_string(),
                message: "database path cannot be empty".to_string(),
            });
        }
        if let Some(status) = &self.status_path
            && status.as_os_str().is_empty()
        {
            errors.push(ValidationError {
                field: "storage.status_path".to_string(),
                message: "status path cannot be empty (omit it to share the reading store)"
                    .to_string(),
            });
        }

        errors
    }
}

/// Minimum live poll interval in seconds.
pub const MIN_POLL_INTERVAL: u64 = 1;
/// Maximum live poll interval in seconds (10 minutes).
pub const MAX_POLL_INTERVAL: u64 = 600;

/// New-reading watcher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    /// Seconds between checks for a newer reading.
    pub poll_interval: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self { poll_interval: 10 }
    }
}

impl LiveConfig {
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !(MIN_POLL_INTERVAL..=MAX_POLL_INTERVAL).contains(&self.poll_interval) {
            errors.push(ValidationError {
                field: "live.poll_interval".to_string(),
                message: format!(
                    "poll interval {} is out of range ({} to {} seconds)",
                    self.poll_interval, MIN_POLL_INTERVAL, MAX_POLL_INTERVAL
                ),
            });
        }
        errors
    }
}

/// Destination protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DestinationKind {
    /// Citizen Weather Observer Program over APRS-IS.
    Cwop,
    /// OpenWeatherMap station API.
    OpenWeatherMap,
}

impl DestinationKind {
    /// Minimum seconds between attempts when not configured.
    pub fn default_interval(&self) -> u64 {
        match self {
            DestinationKind::Cwop => 290,
            DestinationKind::OpenWeatherMap => 40,
        }
    }

    /// Catch-up depth when not configured.
    pub fn default_catchup(&self) -> usize {
        match self {
            DestinationKind::Cwop => 0,
            DestinationKind::OpenWeatherMap => 7,
        }
    }

    /// Dispatcher paths when not configured. CWOP has no catch-up depth by
    /// default, so it only runs live.
    pub fn default_modes(&self) -> Vec<Mode> {
        match self {
            DestinationKind::Cwop => vec![Mode::Live],
            DestinationKind::OpenWeatherMap => vec![Mode::Live, Mode::Logged],
        }
    }
}

impl std::fmt::Display for DestinationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DestinationKind::Cwop => write!(f, "cwop"),
            DestinationKind::OpenWeatherMap => write!(f, "openweathermap"),
        }
    }
}

/// Default network timeout in seconds.
pub const DEFAULT_TIMEOUT: u64 = 20;

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT
}

/// One upload destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// Unique identifier, also the key of its upload status.
    pub id: String,
    pub kind: DestinationKind,
    /// Which dispatcher paths drive this destination.
    #[serde(default)]
    pub modes: Option<Vec<Mode>>,
    /// Minimum seconds between attempts.
    #[serde(default)]
    pub interval: Option<u64>,
    /// Most missed readings uploaded after an outage.
    #[serde(default)]
    pub catchup: Option<usize>,
    /// Seconds allowed for each network step.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Override of the server address (`host:port` or base URL).
    #[serde(default)]
    pub endpoint: Option<String>,

    /// CWOP designator or amateur radio callsign.
    #[serde(default)]
    pub designator: Option<String>,
    /// APRS-IS passcode; `-1` for unverified.
    #[serde(default)]
    pub passcode: Option<String>,

    /// OpenWeatherMap API key.
    #[serde(default)]
    pub api_key: Option<String>,
    /// OpenWeatherMap station external id.
    #[serde(default)]
    pub external_id: Option<String>,
    /// OpenWeatherMap station display name.
    #[serde(default)]
    pub station_name: Option<String>,
}

impl DestinationConfig {
    /// A destination of `kind` with every optional field unset.
    pub fn new(id: impl Into<String>, kind: DestinationKind) -> Self {
        Self {
            id: id.into(),
            kind,
            modes: None,
            interval: None,
            catchup: None,
            timeout: DEFAULT_TIMEOUT,
            endpoint: None,
            designator: None,
            passcode: None,
            api_key: None,
            external_id: None,
            station_name: None,
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval.unwrap_or_else(|| self.kind.default_interval()) as i64)
    }

    pub fn catchup(&self) -> usize {
        self.catchup.unwrap_or_else(|| self.kind.default_catchup())
    }

    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout)
    }

    pub fn passcode(&self) -> &str {
        self.passcode.as_deref().unwrap_or("-1")
    }

    pub fn modes(&self) -> Vec<Mode> {
        self.modes
            .clone()
            .unwrap_or_else(|| self.kind.default_modes())
    }

    pub fn has_mode(&self, mode: Mode) -> bool {
        self.modes().contains(&mode)
    }

    /// Validate this destination against the station it reports for.
    pub fn validate(&self, prefix: &str, station: &StationConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        let mut error = |field: &str, message: String| {
            errors.push(ValidationError {
                field: format!("{}.{}", prefix, field),
                message,
            });
        };

        if self.id.trim().is_empty() {
            error("id", "destination id cannot be empty".to_string());
        }
        if self.modes().is_empty() {
            error("modes", "at least one of 'live' or 'logged' is required".to_string());
        }
        if self.has_mode(Mode::Logged) && self.catchup() == 0 {
            error("catchup", "logged mode needs a catchup of at least 1".to_string());
        }
        if self.interval == Some(0) {
            error("interval", "interval must be at least 1 second".to_string());
        }
        if self.timeout == 0 {
            error("timeout", "timeout must be at least 1 second".to_string());
        }
        if let Some(endpoint) = &self.endpoint
            && endpoint.trim().is_empty()
        {
            error("endpoint", "endpoint cannot be empty (omit it for the default)".to_string());
        }

        let missing = |value: &Option<String>| value.as_deref().is_none_or(|v| v.trim().is_empty());

        match self.kind {
            DestinationKind::Cwop => {
                if missing(&self.designator) {
                    error("designator", "CWOP designator is required".to_string());
                }
                if self.passcode().trim().is_empty() {
                    error("passcode", "passcode cannot be empty (use -1)".to_string());
                }
                match station.latitude.and_then(convert::aprs_latitude) {
                    Some(_) => {}
                    None => error(
                        "station.latitude",
                        "CWOP needs a station latitude representable in APRS format".to_string(),
                    ),
                }
                match station.longitude.and_then(convert::aprs_longitude) {
                    Some(_) => {}
                    None => error(
                        "station.longitude",
                        "CWOP needs a station longitude representable in APRS format".to_string(),
                    ),
                }
            }
            DestinationKind::OpenWeatherMap => {
                if missing(&self.api_key) {
                    error("api_key", "OpenWeatherMap API key is required".to_string());
                }
                if missing(&self.external_id) {
                    error("external_id", "OpenWeatherMap external id is required".to_string());
                }
                if missing(&self.station_name) {
                    error("station_name", "OpenWeatherMap station name is required".to_string());
                }
                for (field, value) in [
                    ("station.latitude", station.latitude),
                    ("station.longitude", station.longitude),
                    ("station.altitude", station.altitude),
                ] {
                    if value.is_none() {
                        error(field, "required for OpenWeatherMap registration".to_string());
                    }
                }
            }
        }

        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The field path (e.g., `station.timezone` or `destinations[1].api_key`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("wxrelay")
        .join("wxrelay.toml")
}
