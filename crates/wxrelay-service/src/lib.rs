//! Upload relay for weather station readings.
//!
//! This crate provides a service that:
//! - Watches the reading store for new readings
//! - Uploads each new reading to every live destination, throttled per
//!   destination
//! - Catches up on readings missed during an outage, bounded per
//!   destination
//! - Registers destinations that need a remote station identity
//!
//! # Destinations
//!
//! - `cwop` - Citizen Weather Observer Program, APRS packets over TCP
//! - `openweathermap` - OpenWeatherMap station measurements over HTTPS
//!
//! # Configuration
//!
//! The service reads configuration from `~/.config/wxrelay/wxrelay.toml`:
//!
//! ```toml
//! [station]
//! timezone = "Europe/London"
//! hardware = "ws3080"
//! latitude = 51.501
//! longitude = -0.142
//! altitude = 10.0
//!
//! [storage]
//! path = "~/.local/share/wxrelay/weather.db"
//!
//! [[destinations]]
//! id = "cwop"
//! kind = "cwop"
//! modes = ["live"]
//! designator = "EW9999"
//!
//! [[destinations]]
//! id = "owm"
//! kind = "openweathermap"
//! api_key = "..."
//! external_id = "SW1Aweather"
//! station_name = "Buck House"
//! ```

pub mod clock;
pub mod config;
pub mod destinations;
pub mod dispatcher;
pub mod error;
pub mod feed;
pub mod mock;
pub mod upload;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, ConfigError, DestinationConfig, DestinationKind, ValidationError};
pub use dispatcher::Dispatcher;
pub use error::{FailureKind, UploadError};
pub use feed::LiveFeed;
pub use upload::{
    AttemptState, Mode, Outcome, Protocol, UploadAttempt, UploadService, UploadSettings, Uploader,
};
