use crate::errors::ModelError;
use crate::geometry::{CellRef, StringLayout};
use crate::lookup::CellCaches;
use crate::module::{Module, ModuleId, ShadeState};
use crate::pvcell::{CellParams, PanelParams, PvCellSolver};
use crate::resolver::{current_with_fallback, voltage_with_fallback, CellPhysics};
use serde::Deserialize;
use std::fmt;
use tracing::{debug, warn};

/// Irradiance (W/m²) and cell temperature (°C) of one condition class
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct Condition {
    pub irradiance: f64,
    pub temperature: f64,
}

impl Condition {
    pub fn new(irradiance: f64, temperature: f64) -> Condition {
        Condition { irradiance, temperature }
    }
}

/// The two lumped conditions every cell of the string is in
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadeConditions {
    pub shaded: Condition,
    pub unshaded: Condition,
}

impl Default for ShadeConditions {
    fn default() -> Self {
        ShadeConditions { shaded: Condition::new(100.0, 25.0), unshaded: Condition::new(1000.0, 25.0) }
    }
}

/// Per-panel operating point at a given string current
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PanelReport {
    pub panel: usize,
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
    pub shaded: bool,
}

#[derive(Clone)]
pub struct Panel {
    modules: Vec<Module>,
}

impl Panel {
    pub fn new(index: usize, num_modules: usize, cells_per_module: usize, rows_per_module: usize) -> Result<Panel, ModelError> {
        let modules = (0..num_modules)
            .map(|m| Module::new(ModuleId { panel: index, module: m }, cells_per_module, rows_per_module))
            .collect::<Result<Vec<Module>, ModelError>>()?;
        Ok(Panel { modules })
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn modules_mut(&mut self) -> &mut [Module] {
        &mut self.modules
    }

    pub fn is_shaded(&self) -> bool {
        self.modules.iter().any(|m| m.contains_shade())
    }

    pub fn voltage(&mut self, shaded_v: f64, unshaded_v: f64) -> f64 {
        self.modules.iter_mut().map(|m| m.voltage(shaded_v, unshaded_v)).sum()
    }
}

impl fmt::Debug for Panel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", &self.modules)
    }
}

/// A string of identical panels in series.
///
/// Cell voltages are resolved for the two condition classes only (shaded and unshaded) and then
/// scaled by the cell counts of each module. Resolved parameters and voltages go through the
/// caller's [`CellCaches`].
#[derive(Clone)]
pub struct PvString {
    panel_id: String,
    panels: Vec<Panel>,
    layout: StringLayout,
    voltage_offset: Option<f64>,
    conditions: ShadeConditions,
    shaded_params: CellParams,
    unshaded_params: CellParams,
    solver: PvCellSolver,
}

impl PvString {
    /// Builds the string and resolves the cell parameters for `conditions`
    ///
    /// # Arguments
    ///
    /// * 'physics' - cell physics resolver
    /// * 'caches' - lookup layer shared by the caller
    /// * 'panel' - panel record (cell count, diode count, dimensions)
    /// * 'num_panels' - panels in the string
    /// * 'layout' - placement of the string on the site image
    /// * 'conditions' - initial shaded and unshaded conditions
    pub fn build<P: CellPhysics + ?Sized>(physics: &P, caches: &mut CellCaches, panel: &PanelParams, num_panels: usize, layout: StringLayout, conditions: ShadeConditions) -> Result<PvString, ModelError> {
        let (cells_per_module, rows) = panel.module_layout()?;
        let panels = (0..num_panels)
            .map(|p| Panel::new(p, panel.num_diodes as usize, cells_per_module, rows))
            .collect::<Result<Vec<Panel>, ModelError>>()?;

        let placeholder = CellParams { iph: f64::NAN, i0: f64::NAN, n_vth: f64::NAN, rs: f64::NAN, rp: f64::NAN };
        let mut string = PvString {
            panel_id: panel.name.clone(),
            panels,
            layout,
            voltage_offset: None,
            conditions,
            shaded_params: placeholder,
            unshaded_params: placeholder,
            solver: PvCellSolver::default(),
        };
        string.set_shade_conditions(physics, caches, conditions)?;
        debug!("built {:?}", &string);
        Ok(string)
    }

    /// builders
    pub fn with_voltage_offset(mut self, offset: Option<f64>) -> Self { self.voltage_offset = offset; self }
    pub fn with_solver(mut self, settings: PvCellSolver) -> Self { self.solver = settings; self }

    pub fn panel_id(&self) -> &str {
        &self.panel_id
    }

    pub fn layout(&self) -> &StringLayout {
        &self.layout
    }

    pub fn panels(&self) -> &[Panel] {
        &self.panels
    }

    pub fn len(&self) -> usize {
        self.panels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.panels.is_empty()
    }

    pub fn modules(&self) -> impl Iterator<Item = &Module> {
        self.panels.iter().flat_map(|p| p.modules().iter())
    }

    pub fn module_mut(&mut self, id: ModuleId) -> Option<&mut Module> {
        self.panels.get_mut(id.panel)?.modules_mut().get_mut(id.module)
    }

    pub fn cell_count(&self) -> usize {
        self.modules().map(|m| m.len()).sum()
    }

    pub fn shaded_cell_count(&self) -> usize {
        self.modules().map(|m| m.shaded_count()).sum()
    }

    pub fn conditions(&self) -> ShadeConditions {
        self.conditions
    }

    pub fn shaded_params(&self) -> &CellParams {
        &self.shaded_params
    }

    pub fn unshaded_params(&self) -> &CellParams {
        &self.unshaded_params
    }

    /// Marks one cell shaded, returns false when the reference is out of range
    pub fn mark_shaded(&mut self, cell: CellRef) -> bool {
        match self.module_mut(ModuleId { panel: cell.panel, module: cell.module }) {
            Some(m) => m.set_shade(cell.cell, ShadeState::Shaded),
            None => false,
        }
    }

    /// Returns every cell to the unshaded state
    pub fn reset_shade(&mut self) {
        for p in self.panels.iter_mut() {
            for m in p.modules_mut() {
                m.reset_shade();
            }
        }
    }

    /// Resolves the canonical shaded and unshaded cell parameters for the next instant
    pub fn set_shade_conditions<P: CellPhysics + ?Sized>(&mut self, physics: &P, caches: &mut CellCaches, conditions: ShadeConditions) -> Result<(), ModelError> {
        self.shaded_params = resolve_params(physics, caches, &self.panel_id, conditions.shaded)?;
        self.unshaded_params = resolve_params(physics, caches, &self.panel_id, conditions.unshaded)?;
        self.conditions = conditions;
        Ok(())
    }

    fn cell_voltage<P: CellPhysics + ?Sized>(&self, physics: &P, caches: &mut CellCaches, params: CellParams, current: f64) -> Result<f64, ModelError> {
        let key = CellCaches::voltage_key(&self.panel_id, current, &params);
        caches.voltages.get_or_try_insert_with(key, || {
            voltage_with_fallback(physics, &params, current, &self.solver).map_err(ModelError::from)
        })
    }

    /// (shaded, unshaded) cell voltages at `current`
    pub fn cell_voltages<P: CellPhysics + ?Sized>(&self, physics: &P, caches: &mut CellCaches, current: f64) -> Result<(f64, f64), ModelError> {
        let shaded_v = if self.shaded_cell_count() > 0 {
            self.cell_voltage(physics, caches, self.shaded_params, current)?
        } else {
            0.0
        };
        let unshaded_v = self.cell_voltage(physics, caches, self.unshaded_params, current)?;
        Ok((shaded_v, unshaded_v))
    }

    fn apply_offset(&self, v: f64) -> f64 {
        match self.voltage_offset {
            Some(k) => v * k,
            None => v,
        }
    }

    /// String voltage at the trial `current`, after bypass clamping and calibration
    pub fn voltage_at<P: CellPhysics + ?Sized>(&mut self, physics: &P, caches: &mut CellCaches, current: f64) -> Result<f64, ModelError> {
        let (shaded_v, unshaded_v) = self.cell_voltages(physics, caches, current)?;
        let v: f64 = self.panels.iter_mut().map(|p| p.voltage(shaded_v, unshaded_v)).sum();
        Ok(self.apply_offset(v))
    }

    /// Upper bound of the current sweep.
    ///
    /// Every module shares the unshaded parameters, so the smallest per-module short-circuit current
    /// is the unshaded cell's. Falls back to the photocurrent when no solution is found.
    pub fn short_circuit_current<P: CellPhysics + ?Sized>(&self, physics: &P) -> f64 {
        match current_with_fallback(physics, &self.unshaded_params, 0.0, &self.solver) {
            Ok(i) if i > 0.0 => i,
            Ok(i) => {
                warn!("non-positive short-circuit current {:e}, using photocurrent", i);
                self.unshaded_params.iph
            }
            Err(e) => {
                warn!("{}, using photocurrent as short-circuit current", e);
                self.unshaded_params.iph
            }
        }
    }

    /// Voltage, power and shade flag of every panel at `current`
    pub fn panel_reports<P: CellPhysics + ?Sized>(&mut self, physics: &P, caches: &mut CellCaches, current: f64) -> Result<Vec<PanelReport>, ModelError> {
        let (shaded_v, unshaded_v) = self.cell_voltages(physics, caches, current)?;
        let offset = self.voltage_offset;
        let reports = self.panels.iter_mut().enumerate().map(|(k, p)| {
            let raw = p.voltage(shaded_v, unshaded_v);
            let voltage = offset.map_or(raw, |o| raw * o);
            PanelReport { panel: k + 1, current, voltage, power: voltage * current, shaded: p.is_shaded() }
        }).collect();
        Ok(reports)
    }

    /// Modules whose bypass diode conducted at the last evaluated current
    pub fn bypass_report(&self) -> Vec<ModuleId> {
        self.modules().filter(|m| m.bypass_active()).map(|m| m.id()).collect()
    }
}

fn resolve_params<P: CellPhysics + ?Sized>(physics: &P, caches: &mut CellCaches, panel_id: &str, c: Condition) -> Result<CellParams, ModelError> {
    let key = CellCaches::params_key(panel_id, c.irradiance, c.temperature);
    caches.params.get_or_try_insert_with(key, || {
        physics.resolve(panel_id, c.irradiance, c.temperature).map_err(ModelError::from)
    })
}

impl fmt::Debug for PvString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PvString {} {:?}", self.panel_id, &self.panels)
    }
}
