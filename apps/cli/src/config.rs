//! CLI configuration loading.

use anyhow::{Context, Result};
use kiln_training::Settings;

/// Load global training settings.
///
/// Precedence:
/// 1. Environment variables (`KILN_*`)
/// 2. Local config file (./.kilnrc)
/// 3. Global config file (~/.kiln/config.toml)
/// 4. Defaults
pub fn load_settings() -> Result<Settings> {
    Settings::discover_and_load().context("Failed to load kiln settings")
}
