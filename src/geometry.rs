//! Maps every cell of a string onto the pixel grid of the site image.
//!
//! Panels tile left to right along the string, six cell columns each. Inside a panel the row index
//! keeps counting across modules in module order. The string's rotation decides which image axis
//! the rows and columns grow along.

use crate::errors::GeometryError;
use crate::pvcell::PanelParams;
use crate::series::PvString;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

pub const CELLS_PER_ROW: usize = 6;
/// Share of a panel's outline covered by cells
pub const PACKING_FRACTION: f64 = 0.67;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "u16")]
pub enum Rotation {
    R0,
    R90,
    R180,
    R270,
}

impl TryFrom<u16> for Rotation {
    type Error = GeometryError;

    fn try_from(degrees: u16) -> Result<Self, Self::Error> {
        match degrees {
            0 => Ok(Rotation::R0),
            90 => Ok(Rotation::R90),
            180 => Ok(Rotation::R180),
            270 => Ok(Rotation::R270),
            other => Err(GeometryError::InvalidRotation(other)),
        }
    }
}

impl Rotation {
    pub fn degrees(&self) -> u16 {
        match self {
            Rotation::R0 => 0,
            Rotation::R90 => 90,
            Rotation::R180 => 180,
            Rotation::R270 => 270,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Point {
        Point { x, y }
    }
}

/// Integer pixel coordinate used to match cells against shadow records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixelKey {
    pub x: i64,
    pub y: i64,
}

impl PixelKey {
    pub fn new(x: i64, y: i64) -> PixelKey {
        PixelKey { x, y }
    }
}

impl From<Point> for PixelKey {
    fn from(p: Point) -> Self {
        PixelKey { x: p.x.round_ties_even() as i64, y: p.y.round_ties_even() as i64 }
    }
}

impl fmt::Display for PixelKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)
    }
}

/// Placement of a string on the site image
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StringLayout {
    pub anchor: Point,
    pub rotation: Rotation,
    pub cell_width: f64,
    pub cell_height: f64,
    pub rows_per_panel: usize,
}

impl StringLayout {
    /// Derives the per-cell footprint from the panel outline
    ///
    /// # Arguments
    ///
    /// * 'panel' - panel record providing length, width and cell count
    /// * 'anchor' - top left point of the string in pixels
    /// * 'rotation' - orientation of the string
    pub fn from_panel(panel: &PanelParams, anchor: Point, rotation: Rotation) -> StringLayout {
        let rows_per_panel = (panel.n_s as usize / CELLS_PER_ROW).max(1);
        StringLayout {
            anchor,
            rotation,
            cell_width: panel.width / CELLS_PER_ROW as f64 / PACKING_FRACTION,
            cell_height: panel.length / rows_per_panel as f64 / PACKING_FRACTION,
            rows_per_panel,
        }
    }

    /// Pixel position of the cell at `row`, `col` of the string grid
    pub fn pixel_of(&self, row: usize, col: usize) -> Point {
        let (r, c) = (row as f64 * self.cell_height, col as f64 * self.cell_width);
        let Point { x, y } = self.anchor;
        match self.rotation {
            Rotation::R0 => Point::new(x + c, y - r),
            Rotation::R90 => Point::new(x + r, y + c),
            Rotation::R180 => Point::new(x - c, y + r),
            Rotation::R270 => Point::new(x - r, y - c),
        }
    }

    /// Corner points of a string of `num_panels` panels: top left, top right, bottom right, bottom
    /// left
    pub fn footprint(&self, num_panels: usize) -> [Point; 4] {
        let cols = num_panels * CELLS_PER_ROW;
        let rows = self.rows_per_panel;
        [self.pixel_of(0, 0), self.pixel_of(0, cols), self.pixel_of(rows, cols), self.pixel_of(rows, 0)]
    }
}

/// Position of one cell in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CellRef {
    pub panel: usize,
    pub module: usize,
    pub cell: usize,
}

/// Pixel to cells index. Several cells may land on the same pixel.
#[derive(Debug, Clone, Default)]
pub struct PixelMap {
    cells: HashMap<PixelKey, Vec<CellRef>>,
}

impl PixelMap {
    pub fn build(string: &PvString) -> PixelMap {
        let layout = string.layout();
        let mut cells: HashMap<PixelKey, Vec<CellRef>> = HashMap::new();

        for (p_idx, panel) in string.panels().iter().enumerate() {
            let panel_col_offset = p_idx * CELLS_PER_ROW;
            let mut row_offset = 0;
            for (m_idx, module) in panel.modules().iter().enumerate() {
                for idx in 0..module.len() {
                    let row = row_offset + idx / CELLS_PER_ROW;
                    let col = panel_col_offset + idx % CELLS_PER_ROW;
                    let key = PixelKey::from(layout.pixel_of(row, col));
                    cells.entry(key).or_default().push(CellRef { panel: p_idx, module: m_idx, cell: idx });
                }
                row_offset += module.len().div_ceil(CELLS_PER_ROW);
            }
        }
        PixelMap { cells }
    }

    pub fn cells_at(&self, key: &PixelKey) -> &[CellRef] {
        self.cells.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Number of distinct pixels covered by the string
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn pixels(&self) -> impl Iterator<Item = &PixelKey> {
        self.cells.keys()
    }
}
