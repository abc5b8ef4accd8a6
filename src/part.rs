use crate::{Scalar, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticleKind {
    Gas,
    Dust,
    Boundary,
}

impl ParticleKind {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            ParticleKind::Gas => 0,
            ParticleKind::Dust => 1,
            ParticleKind::Boundary => 2,
        }
    }
}

impl Default for ParticleKind {
    fn default() -> Self {
        ParticleKind::Gas
    }
}

/// Kind of a particle plus whether it is due for a force update this step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Phase {
    pub kind: ParticleKind,
    pub active: bool,
}

/// A particle with a non-positive smoothing length has died or been accreted. It keeps its
/// slot but takes part in nothing.
#[inline]
pub fn is_dead_or_accreted(h: Scalar) -> bool {
    h <= 0.
}

/// Counts recomputed once per step by `Particles::recount`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParticleCounts {
    pub live: usize,
    pub active: usize,
    pub of_kind: [usize; ParticleKind::COUNT],
}

/// Contains all of the per-particle state: position, velocity, energy, etc.
///
/// Every array has one entry per particle. Arrays belonging to a disabled feature are still
/// allocated and simply never evolved.
#[derive(Clone, Debug, Default)]
pub struct Particles {
    pub position: Vec<Vec3>,
    pub h: Vec<Scalar>,
    pub velocity: Vec<Vec3>,
    /// Specific internal energy.
    pub energy: Vec<Scalar>,
    pub b_evol: Vec<Vec3>,
    pub dust_fraction: Vec<Scalar>,
    /// Artificial viscosity coefficient.
    pub alpha: Vec<Scalar>,
    pub phase: Vec<Phase>,
    /// Time bin; the particle's step is `dtmax / 2^bin`.
    pub bin: Vec<u8>,
    /// Time at which the particle was last fully updated.
    pub twas: Vec<Scalar>,
    /// Acceleration from sinks, external fields and damping. Owned by the substepper and kept
    /// between steps.
    pub ext_accel: Vec<Vec3>,
    /// Particle mass of each kind.
    pub mass_of_kind: [Scalar; ParticleKind::COUNT],
    counts: ParticleCounts,
}

impl Particles {
    pub fn new(mass_of_kind: [Scalar; ParticleKind::COUNT]) -> Self {
        Self {
            mass_of_kind,
            ..Default::default()
        }
    }

    /// Adds a new particle. All other data (energy, field, derivatives, etc.) set to zero by
    /// default; `alpha` starts at `alpha`.
    pub fn add_particle(
        &mut self,
        kind: ParticleKind,
        position: Vec3,
        h: Scalar,
        velocity: Vec3,
        alpha: Scalar,
    ) -> usize {
        let index = self.position.len();
        self.position.push(position);
        self.h.push(h);
        self.velocity.push(velocity);
        self.energy.push(0.);
        self.b_evol.push(Vec3::zeros());
        self.dust_fraction.push(0.);
        self.alpha.push(alpha);
        self.phase.push(Phase {
            kind,
            active: true,
        });
        self.bin.push(0);
        self.twas.push(0.);
        self.ext_accel.push(Vec3::zeros());
        index
    }

    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }

    pub fn is_live(&self, i: usize) -> bool {
        !is_dead_or_accreted(self.h[i])
    }

    pub fn is_active(&self, i: usize) -> bool {
        self.is_live(i) && self.phase[i].active
    }

    pub fn mass(&self, i: usize) -> Scalar {
        self.mass_of_kind[self.phase[i].kind.index()]
    }

    pub fn live_indices(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len()).filter(move |&i| self.is_live(i))
    }

    /// Removes the particle from the calculation without freeing its slot.
    pub fn kill(&mut self, i: usize) {
        self.h[i] = 0.;
    }

    /// Marks the particle as swallowed; the magnitude of `h` is kept for diagnostics.
    pub fn mark_accreted(&mut self, i: usize) {
        self.h[i] = -self.h[i].abs();
    }

    /// Largest smoothing length of any live particle, zero if there are none.
    pub fn max_h(&self) -> Scalar {
        self.h
            .iter()
            .copied()
            .filter(|&h| !is_dead_or_accreted(h))
            .fold(0., Scalar::max)
    }

    /// Recomputes the live, active and per-kind counts.
    pub fn recount(&mut self) -> &ParticleCounts {
        let mut counts = ParticleCounts::default();
        for (h, phase) in self.h.iter().zip(&self.phase) {
            if is_dead_or_accreted(*h) {
                continue;
            }
            counts.live += 1;
            counts.of_kind[phase.kind.index()] += 1;
            if phase.active {
                counts.active += 1;
            }
        }
        self.counts = counts;
        &self.counts
    }

    pub fn counts(&self) -> &ParticleCounts {
        &self.counts
    }
}

/// Time derivatives produced by the force evaluator, one entry per particle.
#[derive(Clone, Debug, Default)]
pub struct DerivativeArrays {
    /// Hydrodynamic (slow) acceleration.
    pub accel: Vec<Vec3>,
    pub du_dt: Vec<Scalar>,
    pub d_b: Vec<Vec3>,
    pub d_dust: Vec<Scalar>,
    pub div_v: Vec<Scalar>,
    pub curl_v: Vec<Vec3>,
    pub div_b: Vec<Scalar>,
    pub curl_b: Vec<Vec3>,
    /// Timestep each particle would like; consumed by the timestep policy.
    pub dt_suggest: Vec<Scalar>,
}

impl DerivativeArrays {
    pub fn resize(&mut self, n: usize) {
        self.accel.resize(n, Vec3::zeros());
        self.du_dt.resize(n, 0.);
        self.d_b.resize(n, Vec3::zeros());
        self.d_dust.resize(n, 0.);
        self.div_v.resize(n, 0.);
        self.curl_v.resize(n, Vec3::zeros());
        self.div_b.resize(n, 0.);
        self.curl_b.resize(n, Vec3::zeros());
        self.dt_suggest.resize(n, Scalar::INFINITY);
    }

    pub fn len(&self) -> usize {
        self.accel.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accel.is_empty()
    }
}

/// State predicted to the end of the step and handed to the force evaluator.
#[derive(Clone, Debug, Default)]
pub struct Predicted {
    pub velocity: Vec<Vec3>,
    pub energy: Vec<Scalar>,
    pub b_evol: Vec<Vec3>,
    pub dust_fraction: Vec<Scalar>,
}

impl Predicted {
    /// Sized to `particles` and filled with its current values.
    pub fn from_particles(particles: &Particles) -> Self {
        Self {
            velocity: particles.velocity.clone(),
            energy: particles.energy.clone(),
            b_evol: particles.b_evol.clone(),
            dust_fraction: particles.dust_fraction.clone(),
        }
    }

    pub fn copy_from(&mut self, particles: &Particles) {
        self.velocity.clone_from(&particles.velocity);
        self.energy.clone_from(&particles.energy);
        self.b_evol.clone_from(&particles.b_evol);
        self.dust_fraction.clone_from(&particles.dust_fraction);
    }

    /// Exchanges the evolved arrays with those of `particles`.
    pub fn swap_with(&mut self, particles: &mut Particles) {
        std::mem::swap(&mut self.velocity, &mut particles.velocity);
        std::mem::swap(&mut self.energy, &mut particles.energy);
        std::mem::swap(&mut self.b_evol, &mut particles.b_evol);
        std::mem::swap(&mut self.dust_fraction, &mut particles.dust_fraction);
    }
}
