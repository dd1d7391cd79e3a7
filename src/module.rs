use crate::bypass::{BypassDiode, BypassOutcome};
use crate::errors::ModelError;
use std::fmt;

/// Electrical condition class of a cell. Every cell is in exactly one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShadeState {
    #[default]
    Unshaded,
    Shaded,
}

/// Handle of a module inside its string: panel index and module index within the panel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId {
    pub panel: usize,
    pub module: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub state: ShadeState,
    pub module: ModuleId,
}

impl Cell {
    pub fn is_shaded(&self) -> bool {
        self.state == ShadeState::Shaded
    }
}

/// Count-weighted voltage of a group of cells in the two-state approximation
pub fn aggregate(shaded_count: usize, unshaded_count: usize, shaded_v: f64, unshaded_v: f64) -> f64 {
    shaded_count as f64 * shaded_v + unshaded_count as f64 * unshaded_v
}

/// Cells protected by one bypass diode
#[derive(Clone)]
pub struct Module {
    id: ModuleId,
    cells: Vec<Cell>,
    rows: usize,
    diode: BypassDiode,
    contains_shade: bool,
    bypass_active: bool,
}

impl Module {
    /// Builds a module of `cell_count` cells laid out in `rows` equal rows.
    ///
    /// Fails with `InvalidTopology` when the cells cannot be split evenly.
    pub fn new(id: ModuleId, cell_count: usize, rows: usize) -> Result<Module, ModelError> {
        if cell_count == 0 || rows == 0 || cell_count % rows != 0 {
            return Err(ModelError::InvalidTopology { cells: cell_count, rows });
        }
        let cells = vec![Cell { state: ShadeState::Unshaded, module: id }; cell_count];
        Ok(Module { id, cells, rows, diode: BypassDiode::default(), contains_shade: false, bypass_active: false })
    }

    /// builder: let m = Module::new(...)?.with_diode(...);
    pub fn with_diode(mut self, diode: BypassDiode) -> Module { self.diode = diode; self }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cells_per_row(&self) -> usize {
        self.cells.len() / self.rows
    }

    pub fn cells(&self) -> &[Cell] {
        &self.cells
    }

    pub fn diode(&self) -> &BypassDiode {
        &self.diode
    }

    /// Sets the state of one cell, returns false when `cell` is out of range
    pub fn set_shade(&mut self, cell: usize, state: ShadeState) -> bool {
        let Some(c) = self.cells.get_mut(cell) else {
            return false;
        };
        c.state = state;
        self.contains_shade = match state {
            ShadeState::Shaded => true,
            ShadeState::Unshaded => self.cells.iter().any(|c| c.is_shaded()),
        };
        true
    }

    pub fn reset_shade(&mut self) {
        for c in self.cells.iter_mut() {
            c.state = ShadeState::Unshaded;
        }
        self.contains_shade = false;
    }

    /// At least one cell is currently shaded
    pub fn contains_shade(&self) -> bool {
        self.contains_shade
    }

    /// Reporting flag: whether the bypass diode conducted at the last evaluated current
    pub fn bypass_active(&self) -> bool {
        self.bypass_active
    }

    pub fn shaded_count(&self) -> usize {
        self.cells.iter().filter(|c| c.is_shaded()).count()
    }

    /// (shaded, unshaded) cell counts
    pub fn counts(&self) -> (usize, usize) {
        let shaded = self.shaded_count();
        (shaded, self.cells.len() - shaded)
    }

    /// Voltage before the bypass diode is considered
    pub fn unclamped_voltage(&self, shaded_v: f64, unshaded_v: f64) -> f64 {
        let (shaded, unshaded) = self.counts();
        aggregate(shaded, unshaded, shaded_v, unshaded_v)
    }

    /// Module voltage after bypass clamping. Records the diode state for reporting.
    pub fn voltage(&mut self, shaded_v: f64, unshaded_v: f64) -> f64 {
        let BypassOutcome { voltage, conducting } = self.diode.clamp(self.unclamped_voltage(shaded_v, unshaded_v));
        self.bypass_active = conducting;
        voltage
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (shaded, unshaded) = self.counts();
        write!(f, "{{{}/{}}}", shaded, shaded + unshaded)
    }
}
