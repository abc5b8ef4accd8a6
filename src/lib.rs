//! Core of a smoothed-particle-hydrodynamics solver: a cell/linked-list neighbour search and a
//! leapfrog integrator with RESPA substepping of sink and external forces, individual time
//! bins, and an implicit corrector for velocity-dependent forces.

pub mod config;
pub mod eos;
pub mod error;
pub mod external;
pub mod hydro;
pub mod initial_condition;
pub mod kernel;
pub mod linklist;
pub mod part;
pub mod simulation;
pub mod sinks;
pub mod statistics;
pub mod step;
pub mod util;

extern crate nalgebra as na;

pub type Scalar = f64;
pub type Vec3 = na::Vector3<Scalar>;

pub use config::{Features, Parameters};
pub use error::{EngineError, Result};
pub use linklist::{neighbours::NeighbourList, LinkList};
pub use part::{DerivativeArrays, ParticleKind, Particles, Phase};
pub use simulation::{Simulation, SphSimulation};
pub use sinks::SinkParticles;
pub use step::{Derivatives, DerivsInput, DerivsPass, Integrator, StepReport, System};
