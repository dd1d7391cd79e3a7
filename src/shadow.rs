use crate::errors::TableError;
use crate::geometry::{PixelKey, PixelMap, Point};
use crate::series::PvString;
use chrono::{NaiveDate, NaiveDateTime};
use csv::ReaderBuilder;
use serde::Deserialize;
use std::collections::HashSet;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

const DATE_TIME_FORMATS: [&str; 6] = [
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parses a timestamp, day-first formats before ISO ones
pub fn parse_timestamp(s: &str) -> Result<NaiveDateTime, TableError> {
    let s = s.trim();
    for fmt in DATE_TIME_FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(s, fmt) {
            return Ok(t);
        }
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d/%m/%Y") {
        return d.and_hms_opt(0, 0, 0).ok_or_else(|| TableError::Timestamp(s.to_string()));
    }
    Err(TableError::Timestamp(s.to_string()))
}

#[derive(Deserialize)]
struct ShadowRecord {
    #[serde(rename = "Pixel X")]
    x: f64,
    #[serde(rename = "Pixel Y")]
    y: f64,
    #[serde(rename = "First Shadow Timestamp")]
    first: String,
    #[serde(rename = "Last Shadow Timestamp")]
    last: String,
}

/// A pixel covered by shadow during `[first, last]`, both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadeWindow {
    pub pixel: PixelKey,
    pub first: NaiveDateTime,
    pub last: NaiveDateTime,
}

impl ShadeWindow {
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        self.first <= t && t <= self.last
    }
}

/// All shadow windows of a site, loaded once per run
#[derive(Debug, Clone, Default)]
pub struct ShadowTable {
    windows: Vec<ShadeWindow>,
}

impl ShadowTable {
    pub fn new(mut windows: Vec<ShadeWindow>) -> ShadowTable {
        windows.sort_by_key(|w| w.first);
        ShadowTable { windows }
    }

    /// Reads shadow windows from CSV with columns `Pixel X`, `Pixel Y`, `First Shadow Timestamp`
    /// and `Last Shadow Timestamp`
    pub fn from_reader<R: Read>(reader: R) -> Result<ShadowTable, TableError> {
        let mut rdr = ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_reader(reader);
        let mut windows = Vec::new();
        for result in rdr.deserialize() {
            let record: ShadowRecord = result?;
            let pixel = PixelKey::from(Point::new(record.x, record.y));
            let first = parse_timestamp(&record.first)?;
            let last = parse_timestamp(&record.last)?;
            if last < first {
                return Err(TableError::InvertedWindow { x: pixel.x, y: pixel.y });
            }
            windows.push(ShadeWindow { pixel, first, last });
        }
        Ok(ShadowTable::new(windows))
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<ShadowTable, TableError> {
        let table = ShadowTable::from_reader(std::fs::File::open(path.as_ref())?)?;
        info!("loaded {} shadow windows from {}", table.len(), path.as_ref().display());
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Pixels whose window contains `t`
    pub fn shaded_pixels(&self, t: NaiveDateTime) -> HashSet<PixelKey> {
        // windows are sorted by start, nothing past `t` can be active
        let end = self.windows.partition_point(|w| w.first <= t);
        self.windows[..end].iter().filter(|w| w.last >= t).map(|w| w.pixel).collect()
    }
}

/// Answers "which cells are shaded at T" for one string
pub struct ShadeResolver {
    map: PixelMap,
    table: ShadowTable,
}

impl ShadeResolver {
    pub fn new(map: PixelMap, table: ShadowTable) -> ShadeResolver {
        ShadeResolver { map, table }
    }

    pub fn for_string(string: &PvString, table: ShadowTable) -> ShadeResolver {
        ShadeResolver::new(PixelMap::build(string), table)
    }

    pub fn pixel_map(&self) -> &PixelMap {
        &self.map
    }

    pub fn table(&self) -> &ShadowTable {
        &self.table
    }

    /// Marks every cell under a shadow at `t`. Marks are not cleared; see [`ShadeResolver::apply_at`].
    ///
    /// Returns the number of cells marked.
    pub fn resolve(&self, string: &mut PvString, t: NaiveDateTime) -> usize {
        let mut marked = 0;
        for pixel in self.table.shaded_pixels(t) {
            for cell in self.map.cells_at(&pixel) {
                if string.mark_shaded(*cell) {
                    marked += 1;
                }
            }
        }
        debug!("{} cells shaded at {}", marked, t);
        marked
    }

    /// Resets the string to unshaded, then resolves the shade at `t`
    pub fn apply_at(&self, string: &mut PvString, t: NaiveDateTime) -> usize {
        string.reset_shade();
        self.resolve(string, t)
    }
}
