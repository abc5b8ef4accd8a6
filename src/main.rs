use sph_engine::simulation::{Settings, Simulation, SphSimulation};
use sph_engine::statistics::SimulationStatistics;

use eyre::WrapErr;
use structopt::StructOpt;
use tracing::info;

#[derive(StructOpt, Debug)]
#[structopt(name = "sph_engine")]
struct Opt {
    /// JSON settings file.
    #[structopt(short, long)]
    input_file: std::path::PathBuf,
    /// Directory the frames are written to. Without it the run only logs statistics.
    #[structopt(short, long)]
    output_dir: Option<std::path::PathBuf>,
    #[structopt(short, long, default_value = "100")]
    frames: usize,
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt::init();
    let opt = Opt::from_args();

    let settings: Settings = std::fs::read(&opt.input_file)
        .wrap_err_with(|| format!("Failed to read JSON settings file: {:?}", &opt.input_file))
        .and_then(|json| {
            serde_json::from_slice(&json).wrap_err("Serde failed to deserialize JSON.")
        })?;

    let mut sim =
        SphSimulation::from_settings(&settings).wrap_err("Failed to set up the simulation")?;

    if let Some(path) = &opt.output_dir {
        std::fs::create_dir_all(path)
            .wrap_err_with(|| format!("Failed to create output directory: {:?}", path))?;
    }

    for frame in 0..opt.frames {
        let data = sim
            .simulate_frame()
            .wrap_err_with(|| format!("Frame {} failed at t = {}", frame, sim.time()))?;

        let momentum = sim.total_linear_momentum();
        info!(
            frame,
            time = data.time,
            particles = data.positions.len(),
            mass = sim.total_mass(),
            momentum = momentum.magnitude(),
            angular_momentum = sim.total_angular_momentum().magnitude(),
            kinetic_energy = sim.total_kinetic_energy(),
            "finished frame"
        );

        if let Some(path) = &opt.output_dir {
            let mut path = path.clone();
            path.push(format!("{:03}.dat", frame));
            let mut writer = std::fs::File::create(&path)?;
            rmp_serde::encode::write(&mut writer, &data)?;
        }
    }

    Ok(())
}
