//! Reading storage and durable upload state for wxrelay.
//!
//! The station logger appends calibrated readings; everything else only
//! reads them through the [`ReadingStore`] trait. Upload services keep their
//! throttle, catch-up watermark and registration identity in a
//! [`StatusStore`].
//!
//! # Backends
//!
//! - [`Store`]: SQLite, shared between the logger and the relay
//! - [`MemoryStore`] / [`MemoryStatusStore`]: in-process, for tests
//!
//! # Example
//!
//! ```no_run
//! use time::{Duration, OffsetDateTime};
//! use wxrelay_store::{ReadingStore, Store};
//!
//! let store = Store::open_default()?;
//! let now = OffsetDateTime::now_utc();
//! let last_hour = store.range(now - Duration::hours(1), now)?;
//! println!("{} readings in the last hour", last_hour.len());
//! # Ok::<(), wxrelay_store::Error>(())
//! ```

mod error;
mod memory;
mod models;
mod schema;
mod store;
mod traits;

pub use error::{Error, Result};
pub use memory::{MemoryStatusStore, MemoryStore};
pub use models::UploadStatus;
pub use store::Store;
pub use traits::{ReadingStore, StatusStore};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/wxrelay/weather.db`
/// - macOS: `~/Library/Application Support/wxrelay/weather.db`
/// - Windows: `C:\Users\<user>\AppData\Local\wxrelay\weather.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("wxrelay")
        .join("weather.db")
}
