pub mod bypass;
pub mod config;
pub mod errors;
pub mod geometry;
pub mod logging;
pub mod lookup;
pub mod module;
pub mod pvcell;
pub mod resolver;
pub mod series;
pub mod shadow;
pub mod sweep;
pub mod weather;

pub const T_REF: f64 = 298.15; // [K] rated temperature
pub const S_REF: f64 = 1000.0; // [W/m^2] rated irradiance
pub const Q_K: f64 = 1.60217663e-19 / 1.38064852e-23; // [K/eV] Boltzmann constant reciprocal
pub const C_TO_K: f64 = 273.15;
pub const MIN_IRRADIANCE: f64 = 1.0; // [W/m^2] floor applied before translating parameters

#[cfg(test)]
pub(crate) mod test_support {
    use crate::pvcell::PanelParams;

    /// 72 cell, 410 W monocrystalline panel with three bypass diodes
    pub fn jinko() -> PanelParams {
        PanelParams {
            name: "Jinko_Solar_Co___Ltd_JKM410M_72HL_V".to_string(),
            a_ref: 1.8,
            i_l_ref: 10.43,
            i_o_ref: 1.4e-11,
            r_s: 0.21,
            r_sh_ref: 310.0,
            alpha_sc: 0.0048,
            n_s: 72,
            num_diodes: 3,
            length: 2.008,
            width: 1.002,
            noct: 45.0,
            eg_ref: 1.121,
            degdt: -0.0002677,
        }
    }
}
