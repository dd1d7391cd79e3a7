use crate::errors::TableError;
use crate::series::{Condition, ShadeConditions};
use crate::shadow::parse_timestamp;
use chrono::{NaiveDateTime, TimeDelta};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

/// Plane-of-array irradiance and air temperature at one instant
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AmbientConditions {
    pub irradiance: f64,
    pub ambient_temp: f64,
    /// Irradiance reaching shaded cells (diffuse only), when known
    pub shaded_irradiance: Option<f64>,
}

/// Cell temperature above ambient from the panel's NOCT rating
///
/// # Arguments
///
/// * 'ambient' - air temperature in °C
/// * 'noct' - nominal operating cell temperature in °C
/// * 'irradiance' - irradiance on the cell in W/m²
pub fn estimate_cell_temp(ambient: f64, noct: f64, irradiance: f64) -> f64 {
    ambient + (noct - 20.0) / 800.0 * irradiance
}

impl AmbientConditions {
    /// Shaded and unshaded cell conditions for this instant
    pub fn shade_conditions(&self, noct: f64, default_shaded_irradiance: f64) -> ShadeConditions {
        let shaded_irr = self.shaded_irradiance.unwrap_or(default_shaded_irradiance).min(self.irradiance);
        ShadeConditions {
            shaded: Condition::new(shaded_irr, estimate_cell_temp(self.ambient_temp, noct, shaded_irr)),
            unshaded: Condition::new(self.irradiance, estimate_cell_temp(self.ambient_temp, noct, self.irradiance)),
        }
    }
}

/// Source of ambient conditions for a time series
pub trait ConditionsSource {
    fn at(&self, t: NaiveDateTime) -> Option<AmbientConditions>;
}

/// Same conditions at every instant
impl ConditionsSource for AmbientConditions {
    fn at(&self, _: NaiveDateTime) -> Option<AmbientConditions> {
        Some(*self)
    }
}

#[derive(Deserialize)]
struct WeatherRecord {
    #[serde(rename = "Timestamp")]
    time: String,
    #[serde(rename = "Irradiance")]
    irradiance: f64,
    #[serde(rename = "Temperature")]
    temperature: f64,
    #[serde(rename = "Shaded Irradiance", default)]
    shaded_irradiance: Option<f64>,
}

/// Time indexed weather rows. A lookup returns the latest row at or before the instant, as long as
/// it is no older than the table's maximum age.
#[derive(Debug, Clone)]
pub struct WeatherTable {
    rows: BTreeMap<NaiveDateTime, AmbientConditions>,
    max_age: TimeDelta,
}

impl Default for WeatherTable {
    fn default() -> Self {
        WeatherTable { rows: BTreeMap::new(), max_age: TimeDelta::hours(1) }
    }
}

impl WeatherTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// builder: let w = WeatherTable::from_path(path)?.with_max_age(TimeDelta::minutes(30));
    pub fn with_max_age(mut self, max_age: TimeDelta) -> Self { self.max_age = max_age; self }

    pub fn max_age(&self) -> TimeDelta {
        self.max_age
    }

    pub fn insert(&mut self, t: NaiveDateTime, conditions: AmbientConditions) {
        self.rows.insert(t, conditions);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Reads rows from CSV with columns `Timestamp`, `Irradiance`, `Temperature` and an optional
    /// `Shaded Irradiance`
    pub fn from_reader<R: Read>(reader: R) -> Result<WeatherTable, TableError> {
        let mut rdr = ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_reader(reader);
        let mut table = WeatherTable::new();
        for result in rdr.deserialize() {
            let record: WeatherRecord = result?;
            table.insert(parse_timestamp(&record.time)?, AmbientConditions {
                irradiance: record.irradiance,
                ambient_temp: record.temperature,
                shaded_irradiance: record.shaded_irradiance,
            });
        }
        Ok(table)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<WeatherTable, TableError> {
        let table = WeatherTable::from_reader(std::fs::File::open(path.as_ref())?)?;
        info!("loaded {} weather rows from {}", table.len(), path.as_ref().display());
        Ok(table)
    }
}

impl ConditionsSource for WeatherTable {
    fn at(&self, t: NaiveDateTime) -> Option<AmbientConditions> {
        let (row_t, conditions) = self.rows.range(..=t).next_back()?;
        if t - *row_t > self.max_age {
            debug!("latest weather row {} is older than {} at {}", row_t, self.max_age, t);
            return None;
        }
        Some(*conditions)
    }
}
