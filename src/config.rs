use crate::errors::ConfigError;
use crate::geometry::{Point, Rotation};
use crate::pvcell::PanelParams;
use crate::resolver::check_topology;
use crate::shadow::parse_timestamp;
use crate::sweep::{SweepSettings, MAX_SWEEP_POINTS, MIN_SWEEP_POINTS};
use crate::weather::AmbientConditions;
use chrono::{NaiveDateTime, TimeDelta};
use serde::Deserialize;
use std::fs;

#[derive(Deserialize)]
pub struct General {
    pub log_path: Option<String>,
    pub log_level: String,
    pub log_to_stdout: bool,
}

#[derive(Deserialize)]
pub struct StringConfig {
    pub panel: String,
    pub num_panels: usize,
    pub anchor: (f64, f64),
    pub rotation: Rotation,
    pub voltage_offset: Option<f64>,
}

impl StringConfig {
    pub fn anchor(&self) -> Point {
        Point::new(self.anchor.0, self.anchor.1)
    }
}

#[derive(Deserialize, Default)]
pub struct CatalogConfig {
    pub primary: Option<String>,
    pub custom: Option<String>,
    /// Panels entered directly in the configuration, treated as custom
    #[serde(default)]
    pub panels: Vec<PanelParams>,
}

/// Fallback conditions used when no weather file is given
#[derive(Deserialize)]
#[serde(default)]
pub struct Conditions {
    pub irradiance: f64,
    pub shaded_irradiance: f64,
    pub temperature: f64,
}

impl Default for Conditions {
    fn default() -> Self {
        Conditions { irradiance: 1000.0, shaded_irradiance: 100.0, temperature: 25.0 }
    }
}

impl Conditions {
    pub fn ambient(&self) -> AmbientConditions {
        AmbientConditions { irradiance: self.irradiance, ambient_temp: self.temperature, shaded_irradiance: Some(self.shaded_irradiance) }
    }
}

#[derive(Deserialize)]
pub struct SeriesConfig {
    pub start: String,
    pub end: String,
    pub step_minutes: i64,
    /// Oldest weather row, relative to the step, that may still be used
    #[serde(default = "default_weather_max_age")]
    pub weather_max_age_minutes: i64,
}

fn default_weather_max_age() -> i64 { 60 }

#[derive(Deserialize)]
pub struct Files {
    pub shadow: String,
    pub weather: Option<String>,
    pub cache_dir: Option<String>,
    pub output: String,
}

#[derive(Deserialize)]
pub struct Config {
    pub general: General,
    pub string: StringConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub conditions: Conditions,
    #[serde(default)]
    pub sweep: SweepSettings,
    pub series: SeriesConfig,
    pub files: Files,
}

impl Config {
    /// Start, end and step of the time series
    pub fn series_bounds(&self) -> Result<(NaiveDateTime, NaiveDateTime, TimeDelta), ConfigError> {
        let start = parse_timestamp(&self.series.start).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        let end = parse_timestamp(&self.series.end).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok((start, end, TimeDelta::minutes(self.series.step_minutes)))
    }
}

/// Loads the configuration file and returns a struct with all configuration items
///
/// # Arguments
///
/// * 'config_path' - path to the configuration file
pub fn load_config(config_path: &str) -> Result<Config, ConfigError> {
    let toml = fs::read_to_string(config_path)?;
    parse_config(&toml)
}

/// Parses and validates configuration text
pub fn parse_config(toml: &str) -> Result<Config, ConfigError> {
    let config: Config = toml::from_str(toml)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<(), ConfigError> {
    if config.string.num_panels == 0 {
        return Err(ConfigError::Invalid("string.num_panels must be at least 1".into()));
    }
    if config.string.voltage_offset.is_some_and(|k| !(k > 0.0)) {
        return Err(ConfigError::Invalid("string.voltage_offset must be positive".into()));
    }
    if !(MIN_SWEEP_POINTS..=MAX_SWEEP_POINTS).contains(&config.sweep.points) {
        return Err(ConfigError::Invalid(format!("sweep.points must be within {}..={}", MIN_SWEEP_POINTS, MAX_SWEEP_POINTS)));
    }
    if config.series.step_minutes <= 0 {
        return Err(ConfigError::Invalid("series.step_minutes must be positive".into()));
    }
    let (start, end, _) = config.series_bounds()?;
    if end < start {
        return Err(ConfigError::Invalid(format!("series ends ({}) before it starts ({})", end, start)));
    }
    if config.series.weather_max_age_minutes <= 0 {
        return Err(ConfigError::Invalid("series.weather_max_age_minutes must be positive".into()));
    }
    for panel in config.catalog.panels.iter() {
        check_topology(panel)?;
    }
    if config.catalog.primary.is_none() && config.catalog.custom.is_none() && config.catalog.panels.is_empty() {
        return Err(ConfigError::Invalid("no panel catalog configured".into()));
    }
    Ok(())
}
