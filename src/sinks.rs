//! Sink (point-mass) particles. They live outside the cell grid: every sink–sink and sink–gas
//! interaction is a direct sum.

use crate::error::{EngineError, Result};
use crate::{Scalar, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SinkParticles {
    pub position: Vec<Vec3>,
    pub velocity: Vec<Vec3>,
    pub mass: Vec<Scalar>,
    /// Accretion radius.
    pub radius: Vec<Scalar>,
    /// Acceleration from other sinks, the gas and external fields.
    pub accel: Vec<Vec3>,
    /// Total mass swallowed so far.
    pub accreted_mass: Vec<Scalar>,
    capacity: usize,
}

impl SinkParticles {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn add(
        &mut self,
        position: Vec3,
        velocity: Vec3,
        mass: Scalar,
        radius: Scalar,
    ) -> Result<usize> {
        if self.len() >= self.capacity {
            return Err(EngineError::SinkCapacity {
                capacity: self.capacity,
            });
        }
        let index = self.len();
        self.position.push(position);
        self.velocity.push(velocity);
        self.mass.push(mass);
        self.radius.push(radius);
        self.accel.push(Vec3::zeros());
        self.accreted_mass.push(0.);
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Folds accreted mass, momentum and mass-weighted position into the sinks.
    pub fn apply_accretion(&mut self, deltas: &AccretionDeltas) {
        for s in 0..self.len() {
            let dm = deltas.mass[s];
            if dm == 0. {
                continue;
            }
            let m_old = self.mass[s];
            let m_new = m_old + dm;
            self.position[s] = (m_old * self.position[s] + deltas.mass_position[s]) / m_new;
            self.velocity[s] = (m_old * self.velocity[s] + deltas.momentum[s]) / m_new;
            self.mass[s] = m_new;
            self.accreted_mass[s] += dm;
        }
    }
}

/// Per-sink totals of swallowed gas, accumulated per thread and merged afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct AccretionDeltas {
    pub mass: Vec<Scalar>,
    pub momentum: Vec<Vec3>,
    pub mass_position: Vec<Vec3>,
    /// Particles removed by sinks or by the external field.
    pub count: usize,
    /// Mass removed by sinks or by the external field.
    pub total_mass: Scalar,
}

impl AccretionDeltas {
    pub fn new(nsinks: usize) -> Self {
        Self {
            mass: vec![0.; nsinks],
            momentum: vec![Vec3::zeros(); nsinks],
            mass_position: vec![Vec3::zeros(); nsinks],
            count: 0,
            total_mass: 0.,
        }
    }

    pub fn add(&mut self, sink: usize, mass: Scalar, x: Vec3, v: Vec3) {
        self.mass[sink] += mass;
        self.momentum[sink] += mass * v;
        self.mass_position[sink] += mass * x;
        self.count += 1;
        self.total_mass += mass;
    }

    pub fn merge(mut self, other: Self) -> Self {
        for s in 0..self.mass.len() {
            self.mass[s] += other.mass[s];
            self.momentum[s] += other.momentum[s];
            self.mass_position[s] += other.mass_position[s];
        }
        self.count += other.count;
        self.total_mass += other.total_mass;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GasSample {
    pub accel: Vec3,
    pub potential: Scalar,
    /// Close-approach time to the nearest sink, before the `c_force` factor.
    pub dt: Scalar,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SinkSinkSample {
    pub potential: Scalar,
    /// Shortest pairwise free-fall time, before the `c_force` factor.
    pub dt: Scalar,
}

/// Gravity and accretion involving sinks.
pub trait SinkGravity: Send + Sync {
    /// Overwrites `accel` with the acceleration each sink feels from the others.
    fn sink_sink(&self, sinks: &SinkParticles, accel: &mut [Vec3]) -> SinkSinkSample;

    /// Acceleration on a gas particle of mass `gas_mass` from all sinks. The acceleration the
    /// particle exerts back on each sink is added to `reaction`.
    fn sink_gas(
        &self,
        x: Vec3,
        h: Scalar,
        gas_mass: Scalar,
        sinks: &SinkParticles,
        reaction: &mut [Vec3],
    ) -> GasSample;

    /// The sink that swallows a gas particle at `x` moving with `v`, if any.
    fn accrete(&self, x: Vec3, v: Vec3, h: Scalar, sinks: &SinkParticles) -> Option<usize>;
}

/// Plummer-softened Newtonian gravity with G = 1. Gas inside a sink's accretion radius that is
/// bound to it is swallowed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Newtonian {
    pub softening: Scalar,
}

impl Newtonian {
    fn pair(&self, dx: Vec3) -> (Scalar, Scalar) {
        let r2 = dx.magnitude_squared() + self.softening * self.softening;
        let r = r2.sqrt();
        (r, r2 * r)
    }
}

impl SinkGravity for Newtonian {
    fn sink_sink(&self, sinks: &SinkParticles, accel: &mut [Vec3]) -> SinkSinkSample {
        accel.iter_mut().for_each(|a| *a = Vec3::zeros());
        let mut potential = 0.;
        let mut dt = Scalar::INFINITY;

        for i in 0..sinks.len() {
            for j in i + 1..sinks.len() {
                let dx = sinks.position[i] - sinks.position[j];
                let (r, r3) = self.pair(dx);
                if r == 0. {
                    continue;
                }
                accel[i] -= sinks.mass[j] / r3 * dx;
                accel[j] += sinks.mass[i] / r3 * dx;
                potential -= sinks.mass[i] * sinks.mass[j] / r;
                dt = dt.min((r3 / (sinks.mass[i] + sinks.mass[j])).sqrt());
            }
        }

        SinkSinkSample { potential, dt }
    }

    fn sink_gas(
        &self,
        x: Vec3,
        _h: Scalar,
        gas_mass: Scalar,
        sinks: &SinkParticles,
        reaction: &mut [Vec3],
    ) -> GasSample {
        let mut accel = Vec3::zeros();
        let mut potential = 0.;
        let mut dt = Scalar::INFINITY;

        for s in 0..sinks.len() {
            let dx = x - sinks.position[s];
            let (r, r3) = self.pair(dx);
            if r == 0. {
                continue;
            }
            accel -= sinks.mass[s] / r3 * dx;
            reaction[s] += gas_mass / r3 * dx;
            potential -= sinks.mass[s] / r;
            dt = dt.min((r3 / sinks.mass[s]).sqrt());
        }

        GasSample {
            accel,
            potential,
            dt,
        }
    }

    fn accrete(&self, x: Vec3, v: Vec3, _h: Scalar, sinks: &SinkParticles) -> Option<usize> {
        (0..sinks.len()).find(|&s| {
            let dx = x - sinks.position[s];
            let r2 = dx.magnitude_squared();
            if r2 >= sinks.radius[s] * sinks.radius[s] {
                return false;
            }
            let dv2 = (v - sinks.velocity[s]).magnitude_squared();
            0.5 * dv2 - sinks.mass[s] / r2.sqrt().max(self.softening) < 0.
        })
    }
}
