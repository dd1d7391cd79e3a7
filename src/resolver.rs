use crate::errors::{ConfigError, PhysicsError};
use crate::pvcell::{CellParams, PanelParams, PvCellSolver};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use tracing::{debug, warn};

/// Maps panel conditions to per-cell single-diode parameters and solves the diode equation.
///
/// Implementations are pure: the same inputs always give the same outputs, which is what allows
/// the lookup layer to memoize them.
pub trait CellPhysics {
    /// Per-cell parameters for `panel_id` at the given irradiance (W/m²) and temperature (°C)
    fn resolve(&self, panel_id: &str, irradiance: f64, temperature: f64) -> Result<CellParams, PhysicsError>;

    /// Voltage of one cell carrying `current`, NaN when there is no real solution
    fn voltage_at(&self, params: &CellParams, current: f64) -> f64;

    /// Current of one cell held at `voltage`, NaN when there is no real solution
    fn current_at(&self, params: &CellParams, voltage: f64) -> f64;
}

#[derive(Deserialize)]
struct CatalogFile {
    #[serde(default)]
    panel: Vec<PanelParams>,
}

/// Loads a TOML panel catalog made of `[[panel]]` tables
///
/// # Arguments
///
/// * 'path' - path to the catalog file
pub fn load_catalog(path: &str) -> Result<Vec<PanelParams>, ConfigError> {
    let toml = fs::read_to_string(path)?;
    let catalog: CatalogFile = toml::from_str(&toml)?;
    for p in catalog.panel.iter() {
        check_topology(p)?;
    }
    Ok(catalog.panel)
}

/// Rejects panels whose cells do not split into rows of six per bypass diode
pub fn check_topology(panel: &PanelParams) -> Result<(), ConfigError> {
    panel.module_layout()
        .map(|_| ())
        .map_err(|e| ConfigError::Invalid(format!("panel '{}' with {} cells and {} diodes: {}", panel.name, panel.n_s, panel.num_diodes, e)))
}

/// Cell physics backed by a reference catalog with a user-entered custom catalog as fallback
///
pub struct CatalogResolver {
    primary: HashMap<String, PanelParams>,
    custom: HashMap<String, PanelParams>,
}

impl CatalogResolver {
    pub fn new(primary: Vec<PanelParams>, custom: Vec<PanelParams>) -> Self {
        CatalogResolver {
            primary: primary.into_iter().map(|p| (p.name.clone(), p)).collect(),
            custom: custom.into_iter().map(|p| (p.name.clone(), p)).collect(),
        }
    }

    /// Adds or replaces a user-defined panel record
    pub fn add_custom(&mut self, panel: PanelParams) {
        self.custom.insert(panel.name.clone(), panel);
    }

    /// Finds the panel record, reference catalog first
    pub fn panel(&self, panel_id: &str) -> Result<&PanelParams, PhysicsError> {
        if let Some(p) = self.primary.get(panel_id) {
            return Ok(p);
        }
        match self.custom.get(panel_id) {
            Some(p) => {
                debug!("panel '{}' resolved from custom catalog", panel_id);
                Ok(p)
            }
            None => Err(PhysicsError::UnknownPanel(panel_id.to_string())),
        }
    }

    pub fn panel_names(&self) -> impl Iterator<Item = &str> {
        self.primary.keys().chain(self.custom.keys()).map(|k| k.as_str())
    }
}

impl CellPhysics for CatalogResolver {
    fn resolve(&self, panel_id: &str, irradiance: f64, temperature: f64) -> Result<CellParams, PhysicsError> {
        let params = self.panel(panel_id)?.compute_state(irradiance, temperature);
        if !params.is_finite() {
            return Err(PhysicsError::NonFiniteParams { irradiance, temperature });
        }
        Ok(params)
    }

    fn voltage_at(&self, params: &CellParams, current: f64) -> f64 {
        params.v_from_i_exact(current)
    }

    fn current_at(&self, params: &CellParams, voltage: f64) -> f64 {
        params.i_from_v_exact(voltage)
    }
}

/// Cell voltage at `current`, falling back to a bounded Newton iteration when the resolver has no
/// real solution.
pub fn voltage_with_fallback<P: CellPhysics + ?Sized>(physics: &P, params: &CellParams, current: f64, solver: &PvCellSolver) -> Result<f64, PhysicsError> {
    let v = physics.voltage_at(params, current);
    if v.is_finite() {
        return Ok(v);
    }
    warn!("no closed form voltage at i={:e}, retrying iteratively", current);
    params.v_from_i(current, solver).ok_or(PhysicsError::NoRealSolution { quantity: "voltage", at: current })
}

/// Cell current at `voltage` with the same fallback as [`voltage_with_fallback`]
pub fn current_with_fallback<P: CellPhysics + ?Sized>(physics: &P, params: &CellParams, voltage: f64, solver: &PvCellSolver) -> Result<f64, PhysicsError> {
    let i = physics.current_at(params, voltage);
    if i.is_finite() {
        return Ok(i);
    }
    warn!("no closed form current at v={:e}, retrying iteratively", voltage);
    params.i_from_v(voltage, solver).ok_or(PhysicsError::NoRealSolution { quantity: "current", at: voltage })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::jinko;
    use std::io::Write;

    struct NoInverse;

    impl CellPhysics for NoInverse {
        fn resolve(&self, _: &str, irradiance: f64, temperature: f64) -> Result<CellParams, PhysicsError> {
            Ok(jinko().compute_state(irradiance, temperature))
        }
        fn voltage_at(&self, _: &CellParams, _: f64) -> f64 { f64::NAN }
        fn current_at(&self, _: &CellParams, _: f64) -> f64 { f64::NAN }
    }

    #[test]
    fn falls_back_to_custom_catalog() {
        let mut custom = jinko();
        custom.name = "my_roof_panel".into();
        let resolver = CatalogResolver::new(vec![jinko()], vec![custom]);

        assert!(resolver.resolve("my_roof_panel", 1000.0, 25.0).is_ok());
        assert!(resolver.resolve("Jinko_Solar_Co___Ltd_JKM410M_72HL_V", 1000.0, 25.0).is_ok());
        assert_eq!(resolver.panel_names().count(), 2);
    }

    #[test]
    fn unknown_panel_when_both_catalogs_miss() {
        let resolver = CatalogResolver::new(vec![jinko()], vec![]);
        match resolver.resolve("nope", 1000.0, 25.0) {
            Err(PhysicsError::UnknownPanel(name)) => assert_eq!(name, "nope"),
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn iterative_fallback_when_inverse_missing() {
        let params = NoInverse.resolve("", 1000.0, 25.0).unwrap();
        let solver = PvCellSolver { max_iter: 200, tol_i: 1e-9, tol_v: 1e-9 };
        let v = voltage_with_fallback(&NoInverse, &params, 5.0, &solver).unwrap();
        assert!((v - params.v_from_i_exact(5.0)).abs() < 1e-6);
        let i = current_with_fallback(&NoInverse, &params, 0.0, &solver).unwrap();
        assert!((i - params.i_from_v_exact(0.0)).abs() < 1e-6);
    }

    #[test]
    fn no_real_solution_when_both_paths_fail() {
        let mut params = jinko().compute_state(1000.0, 25.0);
        params.n_vth = f64::NAN;
        let err = voltage_with_fallback(&NoInverse, &params, 5.0, &PvCellSolver::default()).unwrap_err();
        assert!(matches!(err, PhysicsError::NoRealSolution { quantity: "voltage", .. }));
    }

    #[test]
    fn catalog_loads_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"
[[panel]]
name = "test_panel"
a_ref = 1.8
i_l_ref = 10.4
i_o_ref = 1.4e-11
r_s = 0.2
r_sh_ref = 300.0
alpha_sc = 0.005
n_s = 72
num_diodes = 3
length = 2.0
width = 1.0
"#).unwrap();
        let panels = load_catalog(file.path().to_str().unwrap()).unwrap();
        assert_eq!(panels.len(), 1);
        assert_eq!(panels[0].cells_per_module(), 24);
        assert_eq!(panels[0].noct, 45.0);
    }

    #[test]
    fn catalog_rejects_uneven_diode_split() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"
[[panel]]
name = "odd"
a_ref = 1.8
i_l_ref = 10.4
i_o_ref = 1.4e-11
r_s = 0.2
r_sh_ref = 300.0
alpha_sc = 0.005
n_s = 70
num_diodes = 3
length = 2.0
width = 1.0
"#).unwrap();
        assert!(matches!(load_catalog(file.path().to_str().unwrap()), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn check_topology_rejects_modules_off_the_six_cell_grid() {
        assert!(check_topology(&jinko()).is_ok());

        let no_diodes = PanelParams { num_diodes: 0, ..jinko() };
        assert!(matches!(check_topology(&no_diodes), Err(ConfigError::Invalid(_))));

        // 60 cells over 3 diodes leaves 20 cells per module
        let sixty = PanelParams { n_s: 60, num_diodes: 3, ..jinko() };
        assert!(matches!(check_topology(&sixty), Err(ConfigError::Invalid(_))));
    }
}
