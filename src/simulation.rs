use crate::config::{Features, Parameters};
use crate::eos::EosKind;
use crate::error::Result;
use crate::external::ExternalKind;
use crate::hydro::Hydro;
use crate::initial_condition::InitialConditionKind;
use crate::part::{ParticleKind, Particles};
use crate::sinks::{Newtonian, SinkParticles};
use crate::step::{Integrator, System};
use crate::{Scalar, Vec3};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

pub trait Simulation {
    /// Advances the simulation to the next output time.
    fn simulate_frame(&mut self) -> Result<Frame>;

    fn add_particle(&mut self, position: Vec3, velocity: Vec3);
}

/// Snapshot written once per frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub time: Scalar,
    /// Positions of the live particles.
    pub positions: Vec<[f32; 3]>,
    pub sinks: Vec<[Scalar; 3]>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SinkSettings {
    pub position: Vec3,
    #[serde(default)]
    pub velocity: Vec3,
    pub mass: Scalar,
    pub radius: Scalar,
}

/// Everything needed to start a run, read from a JSON file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub features: Features,
    pub parameters: Parameters,
    pub eos: EosKind,
    pub initial_condition: InitialConditionKind,
    /// Density of the initial condition; sets the particle mass.
    pub density: Scalar,
    /// Initial specific internal energy.
    pub energy: Scalar,
    pub sinks: Vec<SinkSettings>,
    pub sink_softening: Scalar,
    pub external: Option<ExternalKind>,
    pub frame_interval: Scalar,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            features: Features::default(),
            parameters: Parameters::default(),
            eos: EosKind::default(),
            initial_condition: InitialConditionKind::default(),
            density: 1.,
            energy: 1.,
            sinks: Vec::new(),
            sink_softening: 0.,
            external: None,
            frame_interval: 0.05,
        }
    }
}

/// Gas particles evolved by the hydro forces, plus sinks and an optional external field.
pub struct SphSimulation {
    pub system: System,
    integrator: Integrator,
    hydro: Hydro,
    frame_interval: Scalar,
    h_init: Scalar,
    energy_init: Scalar,
    alpha_init: Scalar,
    initialised: bool,
}

impl SphSimulation {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let params = settings.parameters.clone();
        let eos = settings.eos.build();

        let mut integrator =
            Integrator::new(settings.features.clone(), params.clone(), eos.clone())?
                .with_sink_gravity(Box::new(Newtonian {
                    softening: settings.sink_softening,
                }));
        if let Some(external) = &settings.external {
            integrator = integrator.with_external_force(external.build());
        }
        let hydro = Hydro::new(eos, settings.features.clone(), params.clone());

        let ic = &settings.initial_condition;
        let mass = ic.particle_mass(settings.density);
        let particles = Particles::new([mass, mass, 0.]);

        let mut sinks = SinkParticles::new(params.max_sinks);
        for sink in &settings.sinks {
            sinks.add(sink.position, sink.velocity, sink.mass, sink.radius)?;
        }

        let mut sim = Self {
            system: System::new(particles, sinks),
            integrator,
            hydro,
            frame_interval: settings.frame_interval,
            h_init: params.hfact * ic.spacing(),
            energy_init: settings.energy,
            alpha_init: params.alpha,
            initialised: false,
        };
        ic.add_particles(&mut sim);
        debug!(
            particles = sim.system.particles.len(),
            sinks = sim.system.sinks.len(),
            "set up simulation"
        );
        Ok(sim)
    }

    pub fn time(&self) -> Scalar {
        self.system.time
    }

    fn frame(&self) -> Frame {
        let particles = &self.system.particles;
        Frame {
            time: self.system.time,
            positions: particles
                .live_indices()
                .map(|i| {
                    let x = particles.position[i];
                    [x.x as f32, x.y as f32, x.z as f32]
                })
                .collect(),
            sinks: self.system.sinks.position.iter().map(|x| [x.x, x.y, x.z]).collect(),
        }
    }
}

impl Simulation for SphSimulation {
    fn simulate_frame(&mut self) -> Result<Frame> {
        if !self.initialised {
            self.integrator.initialise(&mut self.system, &mut self.hydro)?;
            self.initialised = true;
        }

        let t_frame = self.system.time + self.frame_interval;
        while self.system.time < t_frame {
            let report = self.integrator.step(&mut self.system, &mut self.hydro)?;
            trace!(
                time = report.time,
                dt = report.dt,
                iterations = report.iterations,
                substeps = report.n_substeps,
                active = report.n_active,
                "step"
            );
        }

        Ok(self.frame())
    }

    fn add_particle(&mut self, position: Vec3, velocity: Vec3) {
        let i = self.system.particles.add_particle(
            ParticleKind::Gas,
            position,
            self.h_init,
            velocity,
            self.alpha_init,
        );
        self.system.particles.energy[i] = self.energy_init;
        // particles added mid-run are picked up at the next step
        self.system.derivs.resize(self.system.particles.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::initial_condition::Block;
    use crate::statistics::SimulationStatistics;

    fn block_settings() -> Settings {
        let mut settings = Settings::default();
        settings.initial_condition = InitialConditionKind::Block(Block {
            size: Vec3::zeros()..Vec3::from_element(1.),
            spacing: 0.125,
            jitter: Vec3::from_element(0.01),
        });
        settings.parameters.periodic = Some(Vec3::zeros()..Vec3::from_element(1.));
        settings.parameters.dtmax = 0.01;
        settings.frame_interval = 0.02;
        settings
    }

    #[test]
    fn settings_parse_from_json() {
        let json = r#"{
            "features": { "individual_timesteps": true },
            "parameters": { "dtmax": 0.5, "hfact": 1.2 },
            "eos": { "type": "adiabatic", "gamma": 1.4 },
            "initial_condition": {
                "type": "sphere",
                "num_particles": 100,
                "center": [0.0, 0.0, 0.0],
                "radius": 1.0
            },
            "sinks": [{ "position": [2.0, 0.0, 0.0], "mass": 1.0, "radius": 0.1 }],
            "external": { "type": "uniform", "g": [0.0, -1.0, 0.0] },
            "frame_interval": 0.1
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(settings.features.individual_timesteps);
        assert_eq!(settings.parameters.dtmax, 0.5);
        assert_eq!(settings.sinks.len(), 1);
        assert_eq!(settings.sinks[0].velocity, Vec3::zeros());
        assert!(matches!(
            settings.initial_condition,
            InitialConditionKind::Sphere(_)
        ));
        assert!(matches!(settings.external, Some(ExternalKind::Uniform(_))));
        assert_eq!(settings.density, 1.);
    }

    #[test]
    fn frames_advance_time_and_conserve_mass() {
        let mut sim = SphSimulation::from_settings(&block_settings()).unwrap();
        assert_eq!(sim.system.particles.len(), 512);
        assert_eq!(sim.system.particles.h[0], 1.2 * 0.125);
        let mass = sim.system.total_mass();

        let frame = sim.simulate_frame().unwrap();
        assert!(frame.time >= 0.02);
        assert_eq!(frame.positions.len(), 512);
        assert!(frame.sinks.is_empty());

        let next = sim.simulate_frame().unwrap();
        assert!(next.time >= frame.time + 0.02);
        assert!((sim.system.total_mass() - mass).abs() < 1e-12);
    }

    #[test]
    fn too_many_sinks_is_an_error() {
        let mut settings = block_settings();
        settings.parameters.max_sinks = 1;
        let sink = SinkSettings {
            position: Vec3::new(0.5, 0.5, 0.5),
            velocity: Vec3::zeros(),
            mass: 1.,
            radius: 0.01,
        };
        settings.sinks = vec![sink.clone(), sink];
        assert!(SphSimulation::from_settings(&settings).is_err());
    }
}
