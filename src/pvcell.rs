use crate::errors::ModelError;
use crate::geometry::CELLS_PER_ROW;
use crate::{C_TO_K, MIN_IRRADIANCE, Q_K, S_REF, T_REF};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, warn};

const LAMBERTW_MAX_ITER: usize = 60;
const LAMBERTW_TOL: f64 = 1e-13;
const EXP_LIMIT: f64 = 600.0;

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct PvCellSolver {
    pub max_iter: usize, // max number of iterations
    pub tol_i: f64,      // [A] current tolerance
    pub tol_v: f64,      // [V] voltage tolerance
}

impl Default for PvCellSolver {
    fn default() -> Self {
        return PvCellSolver { max_iter: 100, tol_i: 0.001, tol_v: 0.01 };
    }
}

/// Single-diode parameters of one cell at a given irradiance and temperature.
///
/// `n_vth` is the ideality factor times the thermal voltage of a single cell, `rs` and `rp` the
/// per-cell series and shunt resistances.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CellParams {
    pub iph: f64,
    pub i0: f64,
    pub n_vth: f64,
    pub rs: f64,
    pub rp: f64,
}

/// Reference (STC) parameters of a panel type, as found in a module catalog.
///
/// The electrical parameters describe the whole panel (`n_s` cells in series) and follow the De Soto
/// five parameter model. Physical dimensions are in metres and only feed the shading geometry.
#[derive(Clone, PartialEq, Deserialize)]
pub struct PanelParams {
    pub name: String,
    pub a_ref: f64,
    pub i_l_ref: f64,
    pub i_o_ref: f64,
    pub r_s: f64,
    pub r_sh_ref: f64,
    pub alpha_sc: f64,
    pub n_s: u32,
    #[serde(default = "default_num_diodes")]
    pub num_diodes: u32,
    pub length: f64,
    pub width: f64,
    #[serde(default = "default_noct")]
    pub noct: f64,
    #[serde(default = "default_eg_ref")]
    pub eg_ref: f64, // [eV]  band energy Si: 1.121, CdTe: 1.475
    #[serde(default = "default_degdt")]
    pub degdt: f64, // Si: -0.0002677, CdTe: -0.0003
}

fn default_num_diodes() -> u32 { 3 }
fn default_noct() -> f64 { 45.0 }
fn default_eg_ref() -> f64 { 1.121 }
fn default_degdt() -> f64 { -0.0002677 }

impl PanelParams {
    /// Translates the reference parameters to the given conditions and normalizes them to a single
    /// cell.
    ///
    /// # Arguments
    ///
    /// * 'irrad_ef' - effective irradiance in W/m²
    /// * 'cell_temp' - cell temperature in °C
    pub fn compute_state(&self, irrad_ef: f64, cell_temp: f64) -> CellParams {
        let irrad: f64 = irrad_ef.max(MIN_IRRADIANCE);
        let tj: f64 = cell_temp + C_TO_K;
        let eg: f64 = self.eg_ref * (1. + self.degdt * (tj - T_REF));
        let n_ns_vth: f64 = self.a_ref * tj / T_REF;
        let i0: f64 = self.i_o_ref * (tj / T_REF).powi(3) * (Q_K * (self.eg_ref / T_REF - eg / tj)).exp();
        let il: f64 = (self.i_l_ref + self.alpha_sc * (tj - T_REF)) * irrad / S_REF;
        let rsh: f64 = self.r_sh_ref * S_REF / irrad;

        let ns = self.n_s as f64;
        CellParams { iph: il, i0, n_vth: n_ns_vth / ns, rs: self.r_s / ns, rp: rsh * ns }
    }

    /// Number of cells per bypass diode
    pub fn cells_per_module(&self) -> usize {
        return (self.n_s / self.num_diodes.max(1)) as usize;
    }

    /// (cells per module, rows per module) for a panel whose cells split evenly over its bypass
    /// diodes in rows of six
    pub fn module_layout(&self) -> Result<(usize, usize), ModelError> {
        let (cells, diodes) = (self.n_s as usize, self.num_diodes as usize);
        if cells == 0 || diodes == 0 || cells % diodes != 0 {
            return Err(ModelError::InvalidTopology { cells, rows: diodes });
        }
        let per_module = cells / diodes;
        if per_module % CELLS_PER_ROW != 0 {
            return Err(ModelError::InvalidTopology { cells: per_module, rows: per_module.div_ceil(CELLS_PER_ROW) });
        }
        Ok((per_module, per_module / CELLS_PER_ROW))
    }
}

impl fmt::Debug for PanelParams {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}: {}x{}}}", self.name, self.num_diodes, self.cells_per_module())
    }
}

impl CellParams {
    pub fn is_finite(&self) -> bool {
        self.iph.is_finite() && self.i0.is_finite() && self.n_vth.is_finite() && self.rs.is_finite() && self.rp.is_finite()
    }

    /// Open-circuit voltage estimate ignoring the shunt path
    pub fn open_circuit_estimate(&self) -> f64 {
        return self.n_vth * (self.iph / self.i0 + 1.0).ln();
    }

    /// Closed form voltage for a given current using the Lambert W solution of the single-diode
    /// equation. Returns NaN when no real solution exists.
    pub fn v_from_i_exact(&self, i: f64) -> f64 {
        if !self.is_finite() || self.n_vth <= 0.0 || self.i0 <= 0.0 || self.rp <= 0.0 || !i.is_finite() {
            return f64::NAN;
        }
        let a = self.n_vth;
        let c = (self.iph + self.i0 - i) * self.rp;
        let w = lambertw_exp((self.i0 * self.rp / a).ln() + c / a);
        return c - a * w - i * self.rs;
    }

    /// Closed form current for a given voltage, NaN when no real solution exists
    pub fn i_from_v_exact(&self, v: f64) -> f64 {
        if !self.is_finite() || self.n_vth <= 0.0 || self.i0 <= 0.0 || self.rp <= 0.0 || !v.is_finite() {
            return f64::NAN;
        }
        let a = self.n_vth;
        let g = 1.0 / self.rp;
        if self.rs <= 0.0 {
            return self.iph - self.i0 * ((v / a).min(EXP_LIMIT).exp() - 1.0) - v * g;
        }
        let k = 1.0 + self.rs * g;
        let d = (self.iph + self.i0 - v * g) / k;
        let w = lambertw_exp((self.i0 * self.rs / (a * k)).ln() + (v + d * self.rs) / a);
        return d - a / self.rs * w;
    }

    /// Newton iteration on the diode equation for the current at voltage `v`
    pub fn i_from_v(&self, v: f64, solver: &PvCellSolver) -> Option<f64> {
        let ra = 1.0 / self.n_vth;
        let gsh = 1.0 / self.rp;
        let mut i: f64 = self.iph;

        let mut success: bool = false;
        for _ in 0..solver.max_iter {
            let e = ((v + i * self.rs) * ra).min(EXP_LIMIT).exp();
            let den: f64 = -1.0 - self.i0 * e * self.rs * ra - self.rs * gsh;
            let d: f64 = (self.iph - i - self.i0 * (e - 1.0) - (v + i * self.rs) * gsh) / den;
            i -= d;
            if d.abs() < solver.tol_i {
                success = true;
                break;
            }
        }

        if !success {
            if i.is_normal() {
                warn!("({:p}) CellParams::i_from_v(v={:e}) did not converge (tol={:e}, max_iter={}) -> (i={})",
                    &self, v, solver.tol_i, solver.max_iter, i);
            } else {
                error!("({:p}) CellParams::i_from_v(v={:e}) did not converge (tol={:e}, max_iter={}) -> (i={})",
                    &self, v, solver.tol_i, solver.max_iter, i);
            }
            return None;
        }
        return i.is_finite().then_some(i);
    }

    /// Newton iteration on the diode equation for the voltage at current `i`, seeded with the
    /// open-circuit voltage.
    pub fn v_from_i(&self, i: f64, solver: &PvCellSolver) -> Option<f64> {
        let ra = 1.0 / self.n_vth;
        let gsh = 1.0 / self.rp;
        let mut v: f64 = self.open_circuit_estimate();

        let mut success = false;
        for _ in 0..solver.max_iter {
            let e = ((v + i * self.rs) * ra).min(EXP_LIMIT).exp();
            let den: f64 = -self.i0 * e * ra - gsh;
            let d: f64 = (self.iph - i - self.i0 * (e - 1.) - (v + i * self.rs) * gsh) / den;
            v -= d;
            if d.abs() < solver.tol_v {
                success = true;
                break;
            }
        }

        if !success {
            if v.is_normal() {
                warn!("({:p}) CellParams::v_from_i(i={:e}) did not converge (tol={:e}, max_iter={}) -> (v={})",
                    &self, i, solver.tol_v, solver.max_iter, v);
            } else {
                error!("({:p}) CellParams::v_from_i(i={:e}) did not converge (tol={:e}, max_iter={}) -> (v={})",
                    &self, i, solver.tol_v, solver.max_iter, v);
            }
            return None;
        }
        return v.is_finite().then_some(v);
    }
}

/// Principal branch of the Lambert W function evaluated at `exp(x)`.
///
/// Works on `w + ln(w) = x` so arguments far outside the f64 range of `exp` stay usable.
pub(crate) fn lambertw_exp(x: f64) -> f64 {
    if x.is_nan() {
        return f64::NAN;
    }
    if x == f64::INFINITY {
        return f64::INFINITY;
    }
    if x < -30.0 {
        // W(z) = z - z² + ..., z below 1e-13
        return x.exp();
    }

    let mut w: f64 = if x > 1.0 { x - x.ln() } else { x.exp() };
    for _ in 0..LAMBERTW_MAX_ITER {
        let f = w + w.ln() - x;
        let mut next = w - f * w / (w + 1.0);
        if next <= 0.0 {
            next = w / 10.0;
        }
        let step = (next - w).abs();
        w = next;
        if step <= LAMBERTW_TOL * w.max(1.0) {
            break;
        }
    }
    return w;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::jinko;

    #[test]
    fn lambertw_matches_definition() {
        for x in [-20.0, -1.0, 0.0, 0.5, 1.0, 3.0, 50.0, 1.0e4] {
            let w = lambertw_exp(x);
            assert!((w + w.ln() - x).abs() < 1e-9 * x.abs().max(1.0), "x={x} w={w}");
        }
        assert!((lambertw_exp(1.0) - 1.0).abs() < 1e-12);
        assert!(lambertw_exp(-800.0) >= 0.0);
    }

    #[test]
    fn reference_state_is_per_cell() {
        let p = jinko();
        let c = p.compute_state(1000.0, 25.0);
        assert!((c.iph - 10.43).abs() < 1e-9);
        assert!((c.i0 - 1.4e-11).abs() < 1e-20);
        assert!((c.n_vth - 1.8 / 72.0).abs() < 1e-12);
        assert!((c.rs - 0.21 / 72.0).abs() < 1e-12);
        assert!((c.rp - 310.0 * 72.0).abs() < 1e-6);
    }

    #[test]
    fn lower_irradiance_scales_photocurrent_and_shunt() {
        let p = jinko();
        let c = p.compute_state(100.0, 25.0);
        assert!((c.iph - 1.043).abs() < 1e-9);
        assert!((c.rp - 3100.0 * 72.0).abs() < 1e-6);
    }

    #[test]
    fn exact_and_newton_solutions_agree() {
        let c = jinko().compute_state(800.0, 40.0);
        let solver = PvCellSolver { max_iter: 200, tol_i: 1e-9, tol_v: 1e-9 };
        for i in [0.0, 2.0, 5.0, 8.0] {
            let v_exact = c.v_from_i_exact(i);
            let v_newton = c.v_from_i(i, &solver).unwrap();
            assert!((v_exact - v_newton).abs() < 1e-6, "i={i}: {v_exact} vs {v_newton}");
            let i_back = c.i_from_v_exact(v_exact);
            assert!((i_back - i).abs() < 1e-6, "i={i} -> {i_back}");
        }
    }

    #[test]
    fn overdriven_cell_goes_deeply_negative() {
        let c = jinko().compute_state(100.0, 25.0);
        let v = c.v_from_i_exact(10.0);
        assert!(v.is_finite());
        assert!(v < -1000.0, "v={v}");
    }

    #[test]
    fn invalid_params_have_no_solution() {
        let mut c = jinko().compute_state(1000.0, 25.0);
        c.i0 = f64::NAN;
        assert!(c.v_from_i_exact(1.0).is_nan());
        assert!(c.i_from_v_exact(0.3).is_nan());
    }
}
