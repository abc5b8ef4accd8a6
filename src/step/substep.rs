//! Operator-split (RESPA) substepping of the fast forces: sink gravity, external fields and
//! damping. The hydrodynamic forces only enter through the outer kicks.

use crate::error::WarningBudget;
use crate::external::ExternalForce;
use crate::part::{is_dead_or_accreted, Particles};
use crate::sinks::{AccretionDeltas, SinkGravity, SinkParticles};
use crate::{Scalar, Vec3};
use rayon::prelude::*;
use tracing::warn;

/// The fast forces and the knobs that go with them.
#[derive(Clone, Copy)]
pub struct FastForces<'a> {
    pub gravity: &'a dyn SinkGravity,
    pub external: Option<&'a dyn ExternalForce>,
    pub damping: Scalar,
    pub c_force: Scalar,
}

/// Result of one evaluation of the fast forces.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ForceSummary {
    /// Next substep, `c_force` already applied.
    pub dt: Scalar,
    pub potential: Scalar,
}

#[derive(Clone, Debug)]
pub struct SubstepReport {
    pub n_substeps: usize,
    /// Substep to start the next step with.
    pub dt_ext: Scalar,
    pub potential: Scalar,
    pub accreted: AccretionDeltas,
}

/// Per-thread partial sums of the gas loop.
struct GasAccumulator {
    reaction: Vec<Vec3>,
    potential: Scalar,
    dt: Scalar,
}

impl GasAccumulator {
    fn new(nsinks: usize) -> Self {
        Self {
            reaction: vec![Vec3::zeros(); nsinks],
            potential: 0.,
            dt: Scalar::INFINITY,
        }
    }

    fn merge(mut self, other: Self) -> Self {
        self.reaction
            .iter_mut()
            .zip(&other.reaction)
            .for_each(|(a, b)| *a += b);
        self.potential += other.potential;
        self.dt = self.dt.min(other.dt);
        self
    }
}

/// `x += dt v` for every live particle.
pub fn drift(particles: &mut Particles, dt: Scalar) {
    (
        particles.position.par_iter_mut(),
        particles.velocity.par_iter(),
        particles.h.par_iter(),
    )
        .into_par_iter()
        .for_each(|(x, v, h)| {
            if !is_dead_or_accreted(*h) {
                *x += dt * v;
            }
        });
}

fn drift_sinks(sinks: &mut SinkParticles, dt: Scalar) {
    sinks
        .position
        .iter_mut()
        .zip(&sinks.velocity)
        .for_each(|(x, v)| *x += dt * v);
}

fn kick(particles: &mut Particles, sinks: &mut SinkParticles, hdt: Scalar) {
    (
        particles.velocity.par_iter_mut(),
        particles.ext_accel.par_iter(),
        particles.h.par_iter(),
    )
        .into_par_iter()
        .for_each(|(v, a, h)| {
            if !is_dead_or_accreted(*h) {
                *v += hdt * a;
            }
        });
    sinks
        .velocity
        .iter_mut()
        .zip(&sinks.accel)
        .for_each(|(v, a)| *v += hdt * a);
}

impl<'a> FastForces<'a> {
    /// Whether any fast force is present, so the step has to be substepped.
    pub fn is_needed(&self, sinks: &SinkParticles) -> bool {
        !sinks.is_empty() || self.external.is_some() || self.damping > 0.
    }

    /// Recomputes `ext_accel` for every live particle and `accel` for every sink.
    pub fn compute(
        &self,
        particles: &mut Particles,
        sinks: &mut SinkParticles,
        time: Scalar,
    ) -> ForceSummary {
        let nsinks = sinks.len();
        let npart = particles.len();
        let mass_of_kind = particles.mass_of_kind;
        let sinks_ref: &SinkParticles = sinks;

        let gas = (
            particles.position.par_iter(),
            particles.velocity.par_iter(),
            particles.h.par_iter(),
            particles.phase.par_iter(),
            particles.ext_accel.par_iter_mut(),
        )
            .into_par_iter()
            .enumerate()
            .fold(
                || GasAccumulator::new(nsinks),
                |mut acc, (i, (x, v, h, phase, fext))| {
                    if is_dead_or_accreted(*h) {
                        return acc;
                    }
                    let mass = mass_of_kind[phase.kind.index()];
                    let mut a = Vec3::zeros();
                    let mut dt = Scalar::INFINITY;

                    if nsinks > 0 {
                        let sample =
                            self.gravity
                                .sink_gas(*x, *h, mass, sinks_ref, &mut acc.reaction);
                        a += sample.accel;
                        acc.potential += mass * sample.potential;
                        dt = dt.min(sample.dt);
                    }
                    if let Some(external) = self.external {
                        let sample = external.force(*x, *h, time, i);
                        a += sample.accel;
                        acc.potential += mass * sample.potential;
                        dt = dt.min(sample.dt);
                    }
                    if self.damping > 0. {
                        a -= self.damping * v;
                    }

                    let a_mag = a.magnitude();
                    if a_mag > 0. {
                        dt = dt.min((*h / a_mag).sqrt());
                    }
                    *fext = a;
                    acc.dt = acc.dt.min(dt);
                    acc
                },
            )
            .reduce(|| GasAccumulator::new(nsinks), GasAccumulator::merge);

        let mut potential = gas.potential;
        let mut dt = gas.dt;

        if nsinks > 0 {
            let mut accel = vec![Vec3::zeros(); nsinks];
            let pair = self.gravity.sink_sink(sinks, &mut accel);
            potential += pair.potential;
            dt = dt.min(pair.dt);

            for s in 0..nsinks {
                accel[s] += gas.reaction[s];
                if let Some(external) = self.external {
                    let sample = external.force(sinks.position[s], 0., time, npart + s);
                    accel[s] += sample.accel;
                    potential += sinks.mass[s] * sample.potential;
                    dt = dt.min(sample.dt);
                }
            }
            sinks.accel = accel;
        }

        ForceSummary {
            dt: self.c_force * dt,
            potential,
        }
    }

    /// Hands live gas to the sink or field that swallows it. With `active_only`, only
    /// particles flagged active are tested.
    fn accrete(
        &self,
        particles: &mut Particles,
        sinks: &mut SinkParticles,
        time: Scalar,
        active_only: bool,
    ) -> AccretionDeltas {
        let nsinks = sinks.len();
        if nsinks == 0 && self.external.is_none() {
            return AccretionDeltas::new(0);
        }
        let mass_of_kind = particles.mass_of_kind;
        let sinks_ref: &SinkParticles = sinks;

        let deltas = (
            particles.position.par_iter(),
            particles.velocity.par_iter(),
            particles.phase.par_iter(),
            particles.h.par_iter_mut(),
        )
            .into_par_iter()
            .fold(
                || AccretionDeltas::new(nsinks),
                |mut acc, (x, v, phase, h)| {
                    if is_dead_or_accreted(*h) || (active_only && !phase.active) {
                        return acc;
                    }
                    let mass = mass_of_kind[phase.kind.index()];
                    if let Some(s) = self.gravity.accrete(*x, *v, *h, sinks_ref) {
                        acc.add(s, mass, *x, *v);
                        *h = -h.abs();
                    } else if self
                        .external
                        .map_or(false, |external| external.accrete(*x, *h, mass, time))
                    {
                        acc.count += 1;
                        acc.total_mass += mass;
                        *h = -h.abs();
                    }
                    acc
                },
            )
            .reduce(|| AccretionDeltas::new(nsinks), AccretionDeltas::merge);

        sinks.apply_accretion(&deltas);
        deltas
    }

    /// Integrates the fast forces over `dt` starting at `time`, in substeps starting from
    /// `dt_ext`. The substeps add up to exactly `dt`.
    #[allow(clippy::too_many_arguments)]
    pub fn step_extern(
        &self,
        particles: &mut Particles,
        sinks: &mut SinkParticles,
        time: Scalar,
        dt: Scalar,
        mut dt_ext: Scalar,
        active_only: bool,
        max_substeps: usize,
        warnings: &WarningBudget,
    ) -> SubstepReport {
        let mut t = 0.;
        let mut n_substeps = 0;
        let mut accreted = AccretionDeltas::new(sinks.len());
        let mut potential = 0.;

        loop {
            if !(dt_ext > 0.) {
                if warnings.take() {
                    warn!(dt_ext, "non-positive substep, finishing the step in one go");
                }
                dt_ext = dt - t;
            }
            let last = t + dt_ext >= dt;
            let sub = if last { dt - t } else { dt_ext };
            n_substeps += 1;

            kick(particles, sinks, 0.5 * sub);
            drift(particles, sub);
            drift_sinks(sinks, sub);

            let summary = self.compute(particles, sinks, time + t + sub);
            kick(particles, sinks, 0.5 * sub);
            potential = summary.potential;
            dt_ext = summary.dt;

            let deltas = self.accrete(particles, sinks, time + t + sub, active_only);
            accreted = accreted.merge(deltas);

            if last {
                break;
            }
            t += sub;
        }

        if n_substeps > max_substeps && warnings.take() {
            warn!(n_substeps, dt, "step needed many substeps");
        }

        SubstepReport {
            n_substeps,
            dt_ext,
            potential,
            accreted,
        }
    }
}
