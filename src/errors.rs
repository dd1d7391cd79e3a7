use thiserror::Error;

/// Errors raised by the cell physics layer
///
#[derive(Debug, Error)]
pub enum PhysicsError {
    #[error("panel '{0}' not found in reference or custom catalog")]
    UnknownPanel(String),
    #[error("no real solution for {quantity} at {at:e}")]
    NoRealSolution { quantity: &'static str, at: f64 },
    #[error("resolved parameters are not finite for G={irradiance}, T={temperature}")]
    NonFiniteParams { irradiance: f64, temperature: f64 },
}

/// Errors from the durable keyed store behind the lookup layer
///
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while building or evaluating the circuit hierarchy
///
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("{cells} cells cannot be split into {rows} equal groups")]
    InvalidTopology { cells: usize, rows: usize },
    #[error("physics error: {0}")]
    Physics(#[from] PhysicsError),
    #[error("cache error: {0}")]
    Cache(#[from] StoreError),
    #[error("geometry error: {0}")]
    Geometry(#[from] GeometryError),
    #[error("sweep failed: {0}")]
    Sweep(String),
}

/// Errors raised by the shading geometry
///
#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("rotation {0} is not one of 0, 90, 180, 270")]
    InvalidRotation(u16),
}

/// Errors raised while loading shadow windows or weather rows
///
#[derive(Debug, Error)]
pub enum TableError {
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unparseable timestamp '{0}'")]
    Timestamp(String),
    #[error("shadow window ends before it starts at pixel ({x}, {y})")]
    InvertedWindow { x: i64, y: i64 },
}

/// Errors raised while loading configuration and panel catalogs
///
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Error depicting failures while installing the log subscriber
///
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown log level '{0}'")]
    Level(String),
    #[error("subscriber already installed: {0}")]
    Subscriber(String),
}
