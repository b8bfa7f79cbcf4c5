//! Sample settings command handlers.

use anyhow::{Context, Result};
use tokfork_core::config::Config;
use tokfork_core::settings::{self, SampleSettings};

pub fn path(config: &Config) {
    println!("{}", config.settings_path().display());
}

pub fn show(config: &Config) -> Result<()> {
    let loaded = settings::load_from(&config.settings_path())?;
    let value = settings::to_tagged_value(&loaded)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

pub fn init(config: &Config) -> Result<()> {
    let path = config.settings_path();
    if path.exists() {
        anyhow::bail!("Settings file already exists at {}", path.display());
    }
    settings::save_to(&path, &SampleSettings::default())
        .with_context(|| format!("init settings at {}", path.display()))?;
    println!("Created settings at {}", path.display());
    Ok(())
}
