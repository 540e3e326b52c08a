//! Destination protocols and their construction from configuration.

pub mod cwop;
pub mod openweathermap;

use std::sync::Arc;

use wxrelay_core::AggregationEngine;
use wxrelay_store::StatusStore;

use crate::clock::Clock;
use crate::config::{DestinationConfig, DestinationKind, StationConfig};
use crate::error::UploadError;
use crate::upload::{UploadService, UploadSettings, Uploader};

pub use cwop::Cwop;
pub use openweathermap::OpenWeatherMap;

/// Shared collaborators every destination is built with.
#[derive(Clone)]
pub struct Shared {
    pub engine: Arc<AggregationEngine>,
    pub status: Arc<dyn StatusStore>,
    pub clock: Arc<dyn Clock>,
}

/// Build the upload service for one validated destination.
pub fn build(
    config: &DestinationConfig,
    station: &StationConfig,
    shared: &Shared,
) -> Result<Arc<dyn Uploader>, UploadError> {
    let settings = UploadSettings::from_config(config);
    let uploader: Arc<dyn Uploader> = match config.kind {
        DestinationKind::Cwop => Arc::new(UploadService::new(
            config.id.clone(),
            Cwop::from_config(config, station),
            shared.engine.clone(),
            shared.status.clone(),
            shared.clock.clone(),
            settings,
        )),
        DestinationKind::OpenWeatherMap => Arc::new(UploadService::new(
            config.id.clone(),
            OpenWeatherMap::from_config(config, station)?,
            shared.engine.clone(),
            shared.status.clone(),
            shared.clock.clone(),
            settings,
        )),
    };
    Ok(uploader)
}
