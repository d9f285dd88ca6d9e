//! # keeper-settings
//!
//! Configuration with layered sources.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`KeeperSettings::default()`]
//! 2. **User file**: `~/.keeper/settings.json` (deep-merged over defaults)
//! 3. **Environment variables**: `KEEPER_*` overrides (highest priority)
//!
//! There is no global accessor: load once at startup and pass the relevant
//! section to each component's constructor.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
