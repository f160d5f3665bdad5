//! # playfulbot-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults** - [`BotSettings::default()`]
//! 2. **User file** - `~/.playfulbot/settings.json` (deep-merged over defaults)
//! 3. **Environment variables** - `PLAYFULBOT_*` overrides (highest priority)
//!
//! The bearer token is not a setting; callers pass it to the engine directly.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
