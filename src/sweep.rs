use crate::errors::{ModelError, TableError};
use crate::lookup::CellCaches;
use crate::module::ModuleId;
use crate::resolver::CellPhysics;
use crate::series::{PanelReport, PvString, ShadeConditions};
use crate::shadow::ShadeResolver;
use crate::weather::ConditionsSource;
use chrono::{NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

pub const MIN_SWEEP_POINTS: usize = 2;
pub const MAX_SWEEP_POINTS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SweepSettings {
    pub points: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        SweepSettings { points: 20 }
    }
}

impl SweepSettings {
    pub fn new(points: usize) -> Result<SweepSettings, ModelError> {
        if !(MIN_SWEEP_POINTS..=MAX_SWEEP_POINTS).contains(&points) {
            return Err(ModelError::Sweep(format!("{} sweep points outside {}..={}", points, MIN_SWEEP_POINTS, MAX_SWEEP_POINTS)));
        }
        Ok(SweepSettings { points })
    }
}

/// `n` evenly spaced values from `start` to `end`, both included
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|k| if k == n - 1 { end } else { start + step * k as f64 }).collect()
        }
    }
}

/// Maximum power point of one sweep
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MppResult {
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
}

/// Sweeps the string current from zero to the short-circuit current and keeps the point of highest
/// power.
///
/// Trial currents whose voltage cannot be resolved are skipped. Fails only when no trial current
/// produced a voltage.
///
/// # Arguments
///
/// * 'string' - string with shade already resolved for the instant
/// * 'physics' - cell physics resolver
/// * 'caches' - lookup layer
/// * 'settings' - number of trial currents
pub fn find_mpp<P: CellPhysics + ?Sized>(string: &mut PvString, physics: &P, caches: &mut CellCaches, settings: &SweepSettings) -> Result<MppResult, ModelError> {
    let max_current = string.short_circuit_current(physics);
    let mut best: Option<MppResult> = None;
    let mut skipped = 0;

    for current in linspace(0.0, max_current, settings.points) {
        let voltage = match string.voltage_at(physics, caches, current) {
            Ok(v) => v,
            Err(e) => {
                warn!("skipping trial current {:.4} A: {}", current, e);
                skipped += 1;
                continue;
            }
        };
        let power = voltage * current;
        if best.is_none_or(|b| power > b.power) {
            best = Some(MppResult { power, voltage, current });
        }
    }

    let mpp = best.ok_or_else(|| ModelError::Sweep(format!("all {} trial currents failed", settings.points)))?;
    debug!("mpp {:.2} W at {:.2} V, {:.3} A ({} points skipped)", mpp.power, mpp.voltage, mpp.current, skipped);
    Ok(mpp)
}

/// Instants from `start` to `end` (inclusive) every `step`
#[derive(Debug, Clone)]
pub struct TimeSeries {
    next: NaiveDateTime,
    end: NaiveDateTime,
    step: TimeDelta,
}

impl TimeSeries {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime, step: TimeDelta) -> Result<TimeSeries, ModelError> {
        if step <= TimeDelta::zero() {
            return Err(ModelError::Sweep(format!("time step must be positive, got {}", step)));
        }
        Ok(TimeSeries { next: start, end, step })
    }

    pub fn step(&self) -> TimeDelta {
        self.step
    }
}

impl Iterator for TimeSeries {
    type Item = NaiveDateTime;

    fn next(&mut self) -> Option<NaiveDateTime> {
        if self.next > self.end {
            return None;
        }
        let t = self.next;
        self.next = t.checked_add_signed(self.step)?;
        Some(t)
    }
}

/// Outcome of one instant of the series
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub time: NaiveDateTime,
    pub irradiance: f64,
    pub shaded_cells: usize,
    pub shaded: MppResult,
    pub unshaded: MppResult,
    pub panels: Vec<PanelReport>,
    pub bypassed: Vec<ModuleId>,
    /// Why the step was recorded as zero power, if it was
    pub failure: Option<String>,
}

impl StepResult {
    fn zero(time: NaiveDateTime, irradiance: f64, failure: Option<String>) -> StepResult {
        StepResult {
            time,
            irradiance,
            shaded_cells: 0,
            shaded: MppResult::default(),
            unshaded: MppResult::default(),
            panels: vec![],
            bypassed: vec![],
            failure,
        }
    }
}

/// Energy totals of a series
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EnergySummary {
    pub shaded_kwh: f64,
    pub unshaded_kwh: f64,
}

impl EnergySummary {
    /// Share of the unshaded energy lost to shade, 0 when nothing was produced
    pub fn shading_loss(&self) -> f64 {
        if self.unshaded_kwh > 0.0 {
            1.0 - self.shaded_kwh / self.unshaded_kwh
        } else {
            0.0
        }
    }
}

/// Integrates step powers held constant over `step`
pub fn energy_kwh(results: &[StepResult], step: TimeDelta) -> EnergySummary {
    let hours = step.num_seconds() as f64 / 3600.0;
    results.iter().fold(EnergySummary::default(), |acc, r| EnergySummary {
        shaded_kwh: acc.shaded_kwh + r.shaded.power * hours / 1000.0,
        unshaded_kwh: acc.unshaded_kwh + r.unshaded.power * hours / 1000.0,
    })
}

/// Runs the shaded and unshaded sweeps of a string over a time series
pub struct SeriesRunner<'a, P: CellPhysics + ?Sized, W: ConditionsSource + ?Sized> {
    physics: &'a P,
    weather: &'a W,
    shade: &'a ShadeResolver,
    settings: SweepSettings,
    noct: f64,
    default_shaded_irradiance: f64,
}

impl<'a, P: CellPhysics + ?Sized, W: ConditionsSource + ?Sized> SeriesRunner<'a, P, W> {
    /// # Arguments
    ///
    /// * 'physics' - cell physics resolver
    /// * 'weather' - ambient conditions per instant
    /// * 'shade' - pixel map and shadow table of the string
    /// * 'noct' - nominal operating cell temperature of the panel in °C
    pub fn new(physics: &'a P, weather: &'a W, shade: &'a ShadeResolver, noct: f64) -> Self {
        SeriesRunner { physics, weather, shade, settings: SweepSettings::default(), noct, default_shaded_irradiance: 100.0 }
    }

    /// builders
    pub fn with_settings(mut self, settings: SweepSettings) -> Self { self.settings = settings; self }
    pub fn with_shaded_irradiance(mut self, irradiance: f64) -> Self { self.default_shaded_irradiance = irradiance; self }

    /// Evaluates one instant. Failures are logged and recorded as a zero-power step.
    pub fn step(&self, string: &mut PvString, caches: &mut CellCaches, t: NaiveDateTime) -> StepResult {
        let Some(ambient) = self.weather.at(t) else {
            warn!("no weather data at {}, recording zero power", t);
            string.reset_shade();
            return StepResult::zero(t, 0.0, Some("no weather data".to_string()));
        };
        if ambient.irradiance <= 0.0 {
            string.reset_shade();
            return StepResult::zero(t, ambient.irradiance, None);
        }

        match self.try_step(string, caches, t, ambient.shade_conditions(self.noct, self.default_shaded_irradiance)) {
            Ok(mut r) => {
                r.irradiance = ambient.irradiance;
                r
            }
            Err(e) => {
                warn!("step {} failed, recording zero power: {}", t, e);
                StepResult::zero(t, ambient.irradiance, Some(e.to_string()))
            }
        }
    }

    fn try_step(&self, string: &mut PvString, caches: &mut CellCaches, t: NaiveDateTime, conditions: ShadeConditions) -> Result<StepResult, ModelError> {
        string.reset_shade();
        string.set_shade_conditions(self.physics, caches, conditions)?;
        let unshaded = find_mpp(string, self.physics, caches, &self.settings)?;

        let shaded_cells = self.shade.resolve(string, t);
        let shaded = if shaded_cells == 0 {
            unshaded
        } else {
            find_mpp(string, self.physics, caches, &self.settings)?
        };

        // evaluated last so the bypass flags reflect the operating point
        let panels = string.panel_reports(self.physics, caches, shaded.current)?;
        let bypassed = string.bypass_report();

        Ok(StepResult { time: t, irradiance: 0.0, shaded_cells, shaded, unshaded, panels, bypassed, failure: None })
    }

    /// Evaluates every instant of `series` in order
    pub fn run(&self, string: &mut PvString, caches: &mut CellCaches, series: TimeSeries) -> Vec<StepResult> {
        let results: Vec<StepResult> = series.map(|t| self.step(string, caches, t)).collect();
        let failed = results.iter().filter(|r| r.failure.is_some()).count();
        info!("series done: {} steps, {} failed", results.len(), failed);
        results
    }
}

#[derive(Serialize)]
struct ResultRow<'a> {
    #[serde(rename = "Timestamp")]
    time: String,
    #[serde(rename = "Irradiance")]
    irradiance: f64,
    #[serde(rename = "Shaded Cells")]
    shaded_cells: usize,
    #[serde(rename = "Power")]
    power: f64,
    #[serde(rename = "Voltage")]
    voltage: f64,
    #[serde(rename = "Current")]
    current: f64,
    #[serde(rename = "Unshaded Power")]
    unshaded_power: f64,
    #[serde(rename = "Bypassed Modules")]
    bypassed: usize,
    #[serde(rename = "Failure")]
    failure: &'a str,
}

/// Writes one CSV row per step
pub fn write_results<W: Write>(writer: W, results: &[StepResult]) -> Result<(), TableError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for r in results {
        wtr.serialize(ResultRow {
            time: r.time.format("%d/%m/%Y %H:%M:%S").to_string(),
            irradiance: r.irradiance,
            shaded_cells: r.shaded_cells,
            power: r.shaded.power,
            voltage: r.shaded.voltage,
            current: r.shaded.current,
            unshaded_power: r.unshaded.power,
            bypassed: r.bypassed.len(),
            failure: r.failure.as_deref().unwrap_or(""),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_results_path<P: AsRef<Path>>(path: P, results: &[StepResult]) -> Result<(), TableError> {
    if let Some(dir) = path.as_ref().parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    write_results(std::fs::File::create(path.as_ref())?, results)?;
    info!("wrote {} steps to {}", results.len(), path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Point, Rotation, StringLayout};
    use crate::pvcell::PvCellSolver;
    use crate::resolver::CatalogResolver;
    use crate::shadow::{parse_timestamp, ShadeWindow, ShadowTable};
    use crate::test_support::jinko;
    use crate::weather::{AmbientConditions, WeatherTable};

    fn setup(num_panels: usize) -> (CatalogResolver, CellCaches, PvString) {
        let resolver = CatalogResolver::new(vec![jinko()], vec![]);
        let mut caches = CellCaches::new();
        let panel = jinko();
        let layout = StringLayout::from_panel(&panel, Point::new(0.0, 0.0), Rotation::R0);
        let s = PvString::build(&resolver, &mut caches, &panel, num_panels, layout, ShadeConditions::default()).unwrap();
        (resolver, caches, s)
    }

    fn ts(s: &str) -> NaiveDateTime {
        parse_timestamp(s).unwrap()
    }

    #[test]
    fn linspace_includes_both_ends() {
        assert_eq!(linspace(0.0, 1.0, 5), vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(linspace(2.0, 3.0, 1), vec![2.0]);
        assert!(linspace(0.0, 1.0, 0).is_empty());
    }

    #[test]
    fn sweep_settings_range() {
        assert!(SweepSettings::new(1).is_err());
        assert!(SweepSettings::new(1001).is_err());
        assert_eq!(SweepSettings::new(50).unwrap().points, 50);
    }

    #[test]
    fn mpp_is_interior_and_positive() {
        let (resolver, mut caches, mut s) = setup(1);
        let settings = SweepSettings::new(50).unwrap();
        let mpp = find_mpp(&mut s, &resolver, &mut caches, &settings).unwrap();
        let isc = s.short_circuit_current(&resolver);
        assert!(mpp.power > 0.0);
        assert!(mpp.current > 0.0 && mpp.current < isc);
        assert!((mpp.power - mpp.voltage * mpp.current).abs() < 1e-9);
        // a 410 W panel at STC
        assert!(mpp.power > 300.0 && mpp.power < 450.0, "{}", mpp.power);
    }

    #[test]
    fn time_series_is_inclusive() {
        let series = TimeSeries::new(ts("17/07/2025 08:00:00"), ts("17/07/2025 09:00:00"), TimeDelta::minutes(30)).unwrap();
        let steps: Vec<NaiveDateTime> = series.collect();
        assert_eq!(steps, vec![ts("17/07/2025 08:00:00"), ts("17/07/2025 08:30:00"), ts("17/07/2025 09:00:00")]);
        assert!(TimeSeries::new(ts("17/07/2025 08:00:00"), ts("17/07/2025 09:00:00"), TimeDelta::zero()).is_err());
    }

    #[test]
    fn shade_lowers_power_and_zero_irradiance_is_zero() {
        let (resolver, mut caches, mut s) = setup(2);
        let start = ts("17/07/2025 10:00:00");
        // shade the corner of the first panel for a quarter hour
        let windows = vec![ShadeWindow { pixel: s.layout().pixel_of(0, 0).into(), first: start, last: ts("17/07/2025 10:15:00") }];
        let shade = ShadeResolver::for_string(&s, ShadowTable::new(windows));

        let mut weather = WeatherTable::new();
        weather.insert(start, AmbientConditions { irradiance: 900.0, ambient_temp: 20.0, shaded_irradiance: None });
        weather.insert(ts("17/07/2025 11:00:00"), AmbientConditions { irradiance: 0.0, ambient_temp: 18.0, shaded_irradiance: None });

        let runner = SeriesRunner::new(&resolver, &weather, &shade, 45.0);
        let step = TimeDelta::minutes(30);
        let results = runner.run(&mut s, &mut caches, TimeSeries::new(start, ts("17/07/2025 11:00:00"), step).unwrap());
        assert_eq!(results.len(), 3);

        let shaded = &results[0];
        assert!(shaded.failure.is_none());
        assert!(shaded.shaded_cells >= 1);
        assert!(shaded.shaded.power < shaded.unshaded.power);
        assert_eq!(shaded.bypassed, vec![ModuleId { panel: 0, module: 0 }]);
        assert_eq!(shaded.panels.len(), 2);

        let clear = &results[1];
        assert_eq!(clear.shaded_cells, 0);
        assert_eq!(clear.shaded, clear.unshaded);
        assert!(clear.bypassed.is_empty());

        let night = &results[2];
        assert_eq!(night.shaded.power, 0.0);
        assert!(night.failure.is_none());

        let energy = energy_kwh(&results, step);
        assert!(energy.shaded_kwh > 0.0 && energy.shaded_kwh < energy.unshaded_kwh);
        assert!(energy.shading_loss() > 0.0);
    }

    /// Closed form voltages up to `limit` amps only, NaN above
    struct VoltageLimit {
        inner: CatalogResolver,
        limit: f64,
    }

    impl CellPhysics for VoltageLimit {
        fn resolve(&self, panel_id: &str, irradiance: f64, temperature: f64) -> Result<crate::pvcell::CellParams, crate::errors::PhysicsError> {
            self.inner.resolve(panel_id, irradiance, temperature)
        }
        fn voltage_at(&self, params: &crate::pvcell::CellParams, current: f64) -> f64 {
            if current <= self.limit { self.inner.voltage_at(params, current) } else { f64::NAN }
        }
        fn current_at(&self, params: &crate::pvcell::CellParams, voltage: f64) -> f64 {
            self.inner.current_at(params, voltage)
        }
    }

    fn no_iterations() -> PvCellSolver {
        PvCellSolver { max_iter: 0, tol_i: 1e-3, tol_v: 1e-2 }
    }

    #[test]
    fn unsolvable_steps_record_zero_power_and_continue() {
        let (resolver, mut caches, s) = setup(1);
        let mut s = s.with_solver(no_iterations());
        let physics = VoltageLimit { inner: resolver, limit: -1.0 };
        let shade = ShadeResolver::for_string(&s, ShadowTable::default());
        let weather = AmbientConditions { irradiance: 800.0, ambient_temp: 25.0, shaded_irradiance: None };
        let runner = SeriesRunner::new(&physics, &weather, &shade, 45.0);
        let series = TimeSeries::new(ts("17/07/2025 10:00:00"), ts("17/07/2025 11:00:00"), TimeDelta::minutes(30)).unwrap();

        let results = runner.run(&mut s, &mut caches, series);
        assert_eq!(results.len(), 3);
        for r in results.iter() {
            assert_eq!(r.shaded.power, 0.0);
            assert_eq!(r.unshaded.power, 0.0);
            assert!(r.failure.as_deref().is_some_and(|f| f.contains("all 20 trial currents failed")), "{:?}", r.failure);
        }
    }

    #[test]
    fn failed_trial_currents_are_left_out_of_the_mpp() {
        let (resolver, mut caches, s) = setup(1);
        let mut s = s.with_solver(no_iterations());
        let physics = VoltageLimit { inner: resolver, limit: 5.0 };
        let settings = SweepSettings::default();

        let mpp = find_mpp(&mut s, &physics, &mut caches, &settings).unwrap();
        let isc = s.short_circuit_current(&physics);
        let last_solvable = linspace(0.0, isc, settings.points).into_iter().filter(|i| *i <= 5.0).fold(0.0, f64::max);
        assert!(mpp.power > 0.0);
        assert_eq!(mpp.current, last_solvable);
    }

    #[test]
    fn missing_weather_is_recorded_as_failure() {
        let (resolver, mut caches, mut s) = setup(1);
        let shade = ShadeResolver::for_string(&s, ShadowTable::default());
        let weather = WeatherTable::new();
        let runner = SeriesRunner::new(&resolver, &weather, &shade, 45.0);
        let r = runner.step(&mut s, &mut caches, ts("17/07/2025 10:00:00"));
        assert_eq!(r.shaded.power, 0.0);
        assert!(r.failure.is_some());
    }

    #[test]
    fn results_csv_has_one_row_per_step() {
        let (resolver, mut caches, mut s) = setup(1);
        let shade = ShadeResolver::for_string(&s, ShadowTable::default());
        let weather = AmbientConditions { irradiance: 800.0, ambient_temp: 25.0, shaded_irradiance: None };
        let runner = SeriesRunner::new(&resolver, &weather, &shade, 45.0).with_settings(SweepSettings::new(10).unwrap());
        let series = TimeSeries::new(ts("17/07/2025 10:00:00"), ts("17/07/2025 10:10:00"), TimeDelta::minutes(5)).unwrap();
        let results = runner.run(&mut s, &mut caches, series);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results.csv");
        write_results_path(&path, &results).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("Timestamp,Irradiance,Shaded Cells,Power"));
        assert!(lines[1].starts_with("17/07/2025 10:00:00,800.0,0,"));
    }
}
