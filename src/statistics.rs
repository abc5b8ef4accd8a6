use crate::step::System;
use crate::SphSimulation;
use crate::{Scalar, Vec3};
use itertools::izip;

/// Conserved totals over the live gas particles and the sinks.
pub trait SimulationStatistics {
    fn total_time(&self) -> Scalar;
    fn total_mass(&self) -> Scalar;
    fn total_linear_momentum(&self) -> Vec3;
    fn total_angular_momentum(&self) -> Vec3;
    fn total_kinetic_energy(&self) -> Scalar;
}

impl System {
    /// `(mass, position, velocity)` of every live particle followed by every sink.
    fn bodies(&self) -> impl Iterator<Item = (Scalar, &Vec3, &Vec3)> + '_ {
        let particles = &self.particles;
        let gas = particles
            .live_indices()
            .map(move |i| (particles.mass(i), &particles.position[i], &particles.velocity[i]));
        let sinks = izip!(&self.sinks.mass, &self.sinks.position, &self.sinks.velocity)
            .map(|(&m, x, v)| (m, x, v));
        gas.chain(sinks)
    }
}

impl SimulationStatistics for System {
    fn total_time(&self) -> Scalar {
        self.time
    }

    fn total_mass(&self) -> Scalar {
        self.bodies().map(|(m, _, _)| m).sum()
    }

    fn total_linear_momentum(&self) -> Vec3 {
        self.bodies().map(|(m, _, v)| m * v).sum()
    }

    fn total_angular_momentum(&self) -> Vec3 {
        self.bodies().map(|(m, x, v)| m * x.cross(v)).sum()
    }

    fn total_kinetic_energy(&self) -> Scalar {
        self.bodies().map(|(m, _, v)| 0.5 * m * v.dot(v)).sum()
    }
}

impl SimulationStatistics for SphSimulation {
    fn total_time(&self) -> Scalar {
        self.system.total_time()
    }

    fn total_mass(&self) -> Scalar {
        self.system.total_mass()
    }

    fn total_linear_momentum(&self) -> Vec3 {
        self.system.total_linear_momentum()
    }

    fn total_angular_momentum(&self) -> Vec3 {
        self.system.total_angular_momentum()
    }

    fn total_kinetic_energy(&self) -> Scalar {
        self.system.total_kinetic_energy()
    }
}
