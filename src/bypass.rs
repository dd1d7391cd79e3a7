//! Bypass diode wired anti-parallel to each module.
//!
//! The diode sees the negative of the module voltage. When the module is driven into reverse bias
//! the diode current turns positive and the module voltage is pinned at the forward drop.

const Q: f64 = 1.6e-19; // [C]
const K: f64 = 1.38e-23; // [J/K]
const EXPONENT_LIMIT: f64 = 600.0;

/// Outcome of clamping a module voltage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BypassOutcome {
    pub voltage: f64,
    pub conducting: bool,
}

/// Module-physics constants of the bypass diode, identical for every module
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BypassDiode {
    pub is: f64,              // [A] saturation current
    pub n: f64,               // [-] ideality
    pub temp_k: f64,          // [K] junction temperature
    pub forward_voltage: f64, // [V] drop while conducting
}

impl Default for BypassDiode {
    fn default() -> Self {
        BypassDiode { is: 1.6e-9, n: 1.0, temp_k: 35.0 + 273.15, forward_voltage: 0.7 }
    }
}

impl BypassDiode {
    /// Diode current for a module at `module_voltage`
    ///
    /// - current = Is * (exp(q * Vrev / (n * k * T)) - 1), Vrev = -module_voltage
    /// - the exponent is clamped to ±600
    pub fn current(&self, module_voltage: f64) -> f64 {
        let v_rev = -module_voltage;
        let exponent = (Q * v_rev / (self.n * K * self.temp_k)).clamp(-EXPONENT_LIMIT, EXPONENT_LIMIT);
        self.is * (exponent.exp() - 1.0)
    }

    pub fn conducts(&self, module_voltage: f64) -> bool {
        self.current(module_voltage) > 0.0
    }

    /// Clamped module voltage: the forward drop while conducting, the input otherwise
    pub fn clamp(&self, module_voltage: f64) -> BypassOutcome {
        if self.conducts(module_voltage) {
            BypassOutcome { voltage: self.forward_voltage, conducting: true }
        } else {
            BypassOutcome { voltage: module_voltage, conducting: false }
        }
    }
}
