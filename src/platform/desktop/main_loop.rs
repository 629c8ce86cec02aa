use std::{
    path::Path,
    str::FromStr,
    time::{Duration, Instant},
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use log::{info, LevelFilter};
use serde_yaml::{Mapping, Value};

use crate::{
    boundary_handler::place_boundary_particles,
    concurrency::ComputeContext,
    floating_type_mod::FT,
    occupancy_mask::{OccupancyMask, DEFAULT_MASK_THRESHOLD},
    sdf::SignedDistanceField,
    session::SimulationSession,
    simulation_parameters::{DerivedQuantities, SimulationConfig, SimulationParams},
};

use super::vtk_exporter::VtkExporter;

const CARGO_PKG_AUTHORS: &str = env!("CARGO_PKG_AUTHORS");
const CARGO_PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
const CARGO_PKG_DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

const DEFAULT_FRAMES: u64 = 600;

pub fn start() {
    let matches = App::new("River SPH Simulation")
        .version(CARGO_PKG_VERSION)
        .author(CARGO_PKG_AUTHORS)
        .about(CARGO_PKG_DESCRIPTION)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .help("Sets the level of verbosity"),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Run simulation with given config")
                .arg(
                    Arg::with_name("SIMULATION_CONFIG")
                        .help("Sets the simulation paramaters")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("MASK")
                        .long("mask")
                        .short("m")
                        .takes_value(true)
                        .help("PNG occupancy mask (bright = fluid), a procedural channel is used if missing"),
                )
                .arg(
                    Arg::with_name("THRESHOLD")
                        .long("threshold")
                        .short("t")
                        .takes_value(true)
                        .help("Luma threshold in [0, 1] above which a mask pixel is fluid"),
                )
                .arg(
                    Arg::with_name("FRAMES")
                        .long("frames")
                        .short("f")
                        .takes_value(true)
                        .help("Number of frames to simulate"),
                )
                .arg(
                    Arg::with_name("OVERWRITE_CONFIG_FILE")
                        .long("overwrite-config-file")
                        .short("c")
                        .required(false)
                        .takes_value(true)
                        .help("Overwrite config"),
                )
                .arg(
                    Arg::with_name("VTK_DIR")
                        .long("vtk-dir")
                        .takes_value(true)
                        .help("Write one VTK file per frame into this directory"),
                )
                .arg(
                    Arg::with_name("STATISTICS_ENABLED")
                        .help("Track performance of individual steps")
                        .short("p")
                        .long("statistics-enabled")
                        .takes_value(false),
                )
                .arg(
                    Arg::with_name("STATISTICS_PATH")
                        .long("statistics-path")
                        .short("w")
                        .required(false)
                        .takes_value(true)
                        .help("Where to write statistics to"),
                ),
        )
        .subcommand(
            SubCommand::with_name("check-mask")
                .about("Print tiling, SDF and boundary information for a mask image")
                .arg(
                    Arg::with_name("MASK")
                        .help("PNG occupancy mask")
                        .required(true)
                        .index(1),
                )
                .arg(
                    Arg::with_name("THRESHOLD")
                        .long("threshold")
                        .short("t")
                        .takes_value(true)
                        .help("Luma threshold in [0, 1] above which a mask pixel is fluid"),
                )
                .arg(
                    Arg::with_name("WIDTH")
                        .long("width")
                        .takes_value(true)
                        .help("Domain width Lx"),
                )
                .arg(
                    Arg::with_name("COUNT")
                        .long("count")
                        .short("n")
                        .takes_value(true)
                        .help("Particle count used to derive the boundary spacing"),
                ),
        )
        .subcommand(
            SubCommand::with_name("default-config")
                .about("Write the default config (all keys) as YAML")
                .arg(
                    Arg::with_name("OUTPUT_YAML")
                        .help("YAML file to write, stdout if missing")
                        .index(1),
                ),
        )
        .get_matches();

    init_logger(matches.occurrences_of("v"));

    let result = match matches.subcommand() {
        ("run", Some(run_matches)) => run(run_matches),
        ("check-mask", Some(subcmd_matches)) => check_mask(subcmd_matches),
        ("default-config", Some(subcmd_matches)) => default_config(subcmd_matches),
        _ => unreachable!(),
    };

    if let Err(err) = result {
        eprintln!("error: {:#}", err);
        std::process::exit(1);
    }
}

/// `-v` raises the default level one step per occurrence; `RUST_LOG` wins.
fn init_logger(verbosity: u64) {
    let level = match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn parse_arg<T>(matches: &ArgMatches, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    matches
        .value_of(name)
        .map(|s| {
            s.parse::<T>()
                .with_context(|| format!("invalid value {:?} for {}", s, name))
        })
        .transpose()
}

/// Patch `base` with `patch`: mappings are merged key by key, anything else is
/// replaced.
fn merge_yaml(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Mapping(base), Value::Mapping(patch)) => {
            for (k, v) in patch {
                match base.get_mut(&k) {
                    Some(base_value) => merge_yaml(base_value, v),
                    None => {
                        base.insert(k, v);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

fn read_yaml(path: &str) -> Result<Value> {
    let yaml = std::fs::read_to_string(path).with_context(|| format!("failed reading {}", path))?;
    // an empty file means "all defaults"
    if yaml.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    let value: Value = serde_yaml::from_str(&yaml).with_context(|| format!("failed parsing {}", path))?;
    Ok(match value {
        Value::Null => Value::Mapping(Mapping::new()),
        value => value,
    })
}

/// The base config with two top-level keys (`simulation`, `solver`), optionally
/// patched by a file whose top-level keys are sections of `simulation`.
fn load_config(config_path: &str, overwrite_path: Option<&str>) -> Result<SimulationConfig> {
    let mut config_value = read_yaml(config_path)?;
    if !config_value.is_mapping() {
        bail!("{} must contain a mapping", config_path);
    }

    if let Some(overwrite_path) = overwrite_path {
        let overwrite_value = read_yaml(overwrite_path)?;
        if !overwrite_value.is_mapping() {
            bail!("{} must contain a mapping", overwrite_path);
        }
        let mut patch = Mapping::new();
        patch.insert(Value::String("simulation".into()), overwrite_value);
        merge_yaml(&mut config_value, Value::Mapping(patch));
    }

    serde_yaml::from_value(config_value).with_context(|| format!("invalid config in {}", config_path))
}

fn run(run_matches: &ArgMatches) -> Result<()> {
    let parameter_file = run_matches
        .value_of("SIMULATION_CONFIG")
        .ok_or_else(|| anyhow!("missing simulation config"))?;
    let config = load_config(parameter_file, run_matches.value_of("OVERWRITE_CONFIG_FILE"))?;
    info!("{:?}", config);

    let threshold = parse_arg::<FT>(run_matches, "THRESHOLD")?.unwrap_or(DEFAULT_MASK_THRESHOLD);
    let frames = parse_arg::<u64>(run_matches, "FRAMES")?.unwrap_or(DEFAULT_FRAMES);
    let counters_enabled = run_matches.is_present("STATISTICS_ENABLED");

    let mask = OccupancyMask::load_or_default(run_matches.value_of("MASK").map(Path::new), threshold);

    let context = ComputeContext::with_threads_or_global(config.solver.num_threads);
    info!("running on {} worker threads", context.num_threads());

    let mut session = SimulationSession::new(context, config.simulation, config.solver)?;
    session.set_statistics_enabled(counters_enabled);
    session.reset(mask)?;

    let mut vtk_exporter = match run_matches.value_of("VTK_DIR") {
        Some(dir) => {
            let exporter = VtkExporter::new(dir, "river-sph")?;
            if let Some(simulation) = session.simulation() {
                exporter.write_boundary(simulation.boundary().positions(), simulation.boundary().psi())?;
            }
            Some(exporter)
        }
        None => None,
    };

    let mut total_duration: Duration = Duration::from_nanos(0);
    let mut last_frame = Instant::now();

    for frame_number in 0..frames {
        let elapsed_real_time = last_frame.elapsed().as_secs_f64() as FT;
        last_frame = Instant::now();

        let a = Instant::now();
        if !session.step(elapsed_real_time) {
            bail!("simulation is not ready");
        }
        let b = Instant::now();
        total_duration += b - a;

        if let Some(vtk_exporter) = &mut vtk_exporter {
            if let Some(snapshot) = session.snapshot() {
                vtk_exporter.add_snapshot(&snapshot)?;
            }
        }

        info!(
            "{:05}: {} fluid particles {} boundary particles {}msec ({}msec AVG)",
            frame_number,
            session.particle_count(),
            session.boundary_positions().len(),
            (b - a).as_secs_f32() * 1000.,
            (total_duration / (frame_number as u32 + 1)).as_secs_f32() * 1000.
        );
    }

    if counters_enabled {
        if let Some(s) = session.statistics() {
            print!("{}", s);
            if let Some(statistics_path) = run_matches.value_of("STATISTICS_PATH") {
                std::fs::write(statistics_path, s).with_context(|| format!("failed writing {}", statistics_path))?;
            }
        }
    }

    Ok(())
}

fn check_mask(subcmd_matches: &ArgMatches) -> Result<()> {
    let mask_path = subcmd_matches
        .value_of("MASK")
        .ok_or_else(|| anyhow!("missing mask"))?;
    let threshold = parse_arg::<FT>(subcmd_matches, "THRESHOLD")?.unwrap_or(DEFAULT_MASK_THRESHOLD);

    let mut params = SimulationParams::default();
    if let Some(width) = parse_arg::<FT>(subcmd_matches, "WIDTH")? {
        params.domain.width = width;
    }
    if let Some(count) = parse_arg::<usize>(subcmd_matches, "COUNT")? {
        params.particles.count = count;
    }
    params.validate()?;

    let mask = OccupancyMask::from_png(mask_path, threshold)?;
    let sdf = SignedDistanceField::build(&mask, params.domain.width)?;
    let derived = DerivedQuantities::compute(&params, sdf.domain_height(), mask.fluid_fraction());
    let boundary = place_boundary_particles(&mask, derived.domain_width, derived.domain_height, derived.spacing)?;
    let (sdf_min, sdf_max) = sdf.value_range();

    println!("mask: {}x{} pixels", mask.width(), mask.height());
    println!("domain: {} x {}", derived.domain_width, derived.domain_height);
    println!("fluid fraction: {:.4}", mask.fluid_fraction());
    println!("tile mismatch: {:.2}%", mask.tile_mismatch_x() * 100.);
    println!("sdf range: [{}, {}]", sdf_min, sdf_max);
    println!(
        "{} particles: spacing {}, h {}, {} boundary particles",
        params.particles.count,
        derived.spacing,
        derived.h,
        boundary.len()
    );

    Ok(())
}

fn default_config(subcmd_matches: &ArgMatches) -> Result<()> {
    let yaml = serde_yaml::to_string(&SimulationConfig::default())?;
    match subcmd_matches.value_of("OUTPUT_YAML") {
        Some(yaml_path) => {
            std::fs::write(yaml_path, yaml).with_context(|| format!("failed writing {}", yaml_path))?;
            println!("Writing to file `{}`... done", yaml_path);
        }
        None => print!("{}", yaml),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_patches_single_keys() {
        let mut base: Value = serde_yaml::from_str(
            "simulation:\n  sph:\n    viscosity: 0.35\n    gamma: 7.0\n  particles:\n    count: 1000\nsolver:\n  seed: 3\n",
        )
        .unwrap();
        let overwrite: Value = serde_yaml::from_str("sph:\n  viscosity: 0.1\nflow:\n  drag_k: 1.5\n").unwrap();

        let mut patch = Mapping::new();
        patch.insert(Value::String("simulation".into()), overwrite);
        merge_yaml(&mut base, Value::Mapping(patch));

        let config: SimulationConfig = serde_yaml::from_value(base).unwrap();
        assert_eq!(config.simulation.sph.viscosity, 0.1);
        assert_eq!(config.simulation.sph.gamma, 7.);
        assert_eq!(config.simulation.flow.drag_k, 1.5);
        assert_eq!(config.simulation.particles.count, 1000);
        assert_eq!(config.solver.seed, 3);
    }

    #[test]
    fn default_config_round_trips_through_files() {
        let dir = std::env::temp_dir().join(format!("river-sph-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let base_path = dir.join("base.yaml");
        let overwrite_path = dir.join("overwrite.yaml");

        std::fs::write(&base_path, serde_yaml::to_string(&SimulationConfig::default()).unwrap()).unwrap();
        std::fs::write(&overwrite_path, "particles:\n  count: 5000\n").unwrap();

        let config = load_config(base_path.to_str().unwrap(), Some(overwrite_path.to_str().unwrap())).unwrap();
        assert_eq!(config.simulation.particles.count, 5000);
        assert_eq!(config.solver, SimulationConfig::default().solver);

        // an empty file is a valid config
        std::fs::write(&base_path, "").unwrap();
        let config = load_config(base_path.to_str().unwrap(), None).unwrap();
        assert_eq!(config, SimulationConfig::default());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
