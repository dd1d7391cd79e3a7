use anyhow::{anyhow, Context, Result};
use pv_shade::config::{load_config, Config};
use pv_shade::geometry::StringLayout;
use pv_shade::logging::init_logging;
use pv_shade::lookup::CellCaches;
use pv_shade::resolver::{load_catalog, CatalogResolver};
use pv_shade::series::{PvString, ShadeConditions};
use pv_shade::shadow::{ShadeResolver, ShadowTable};
use pv_shade::sweep::{energy_kwh, write_results_path, SeriesRunner, TimeSeries};
use pv_shade::weather::{ConditionsSource, WeatherTable};
use chrono::TimeDelta;
use std::env;
use tracing::{error, info};

fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let config_path = args.iter()
        .find_map(|p| p.strip_prefix("--config="))
        .ok_or_else(|| anyhow!("usage: pv_shade --config=<path>"))?;

    let config = load_config(config_path).with_context(|| format!("loading {}", config_path))?;
    init_logging(config.general.log_path.as_deref(), &config.general.log_level, config.general.log_to_stdout)?;
    info!("starting pv_shade version: {}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(&config) {
        error!("run failed: {:#}", e);
        return Err(e);
    }
    Ok(())
}

fn build_resolver(config: &Config) -> Result<CatalogResolver> {
    let primary = match &config.catalog.primary {
        Some(path) => load_catalog(path).with_context(|| format!("loading catalog {}", path))?,
        None => vec![],
    };
    let mut custom = match &config.catalog.custom {
        Some(path) => load_catalog(path).with_context(|| format!("loading custom catalog {}", path))?,
        None => vec![],
    };
    custom.extend(config.catalog.panels.iter().cloned());
    info!("catalog: {} reference panels, {} custom panels", primary.len(), custom.len());
    Ok(CatalogResolver::new(primary, custom))
}

fn run(config: &Config) -> Result<()> {
    let resolver = build_resolver(config)?;
    let panel = resolver.panel(&config.string.panel)?.clone();

    let mut caches = match &config.files.cache_dir {
        Some(dir) => CellCaches::persistent(dir).with_context(|| format!("opening cache in {}", dir))?,
        None => CellCaches::new(),
    };

    let layout = StringLayout::from_panel(&panel, config.string.anchor(), config.string.rotation);
    let mut string = PvString::build(&resolver, &mut caches, &panel, config.string.num_panels, layout, ShadeConditions::default())?
        .with_voltage_offset(config.string.voltage_offset);
    info!("string footprint: {:?}", layout.footprint(config.string.num_panels));

    let shadows = ShadowTable::from_path(&config.files.shadow).with_context(|| format!("loading {}", config.files.shadow))?;
    let shade = ShadeResolver::for_string(&string, shadows);
    info!("string covers {} pixels", shade.pixel_map().len());

    let weather: Box<dyn ConditionsSource> = match &config.files.weather {
        Some(path) => Box::new(
            WeatherTable::from_path(path)
                .with_context(|| format!("loading {}", path))?
                .with_max_age(TimeDelta::minutes(config.series.weather_max_age_minutes)),
        ),
        None => Box::new(config.conditions.ambient()),
    };

    let (start, end, step) = config.series_bounds()?;
    let runner = SeriesRunner::new(&resolver, weather.as_ref(), &shade, panel.noct)
        .with_settings(config.sweep)
        .with_shaded_irradiance(config.conditions.shaded_irradiance);
    let results = runner.run(&mut string, &mut caches, TimeSeries::new(start, end, step)?);

    write_results_path(&config.files.output, &results).with_context(|| format!("writing {}", config.files.output))?;

    let energy = energy_kwh(&results, step);
    info!("energy shaded: {:.3} kWh, unshaded: {:.3} kWh, loss: {:.1} %", energy.shaded_kwh, energy.unshaded_kwh, 100.0 * energy.shading_loss());
    info!("cell params cache: {:?}", caches.params.stats());
    info!("cell voltage cache: {:?}", caches.voltages.stats());
    Ok(())
}
