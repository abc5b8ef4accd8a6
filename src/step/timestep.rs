//! Timestep policies: one global step for every particle, or power-of-two individual bins.

use crate::part::{DerivativeArrays, Particles};
use crate::Scalar;

/// Finest time bin. Bin `k` has a step of `dtmax / 2^k`.
pub const MAX_BIN: u8 = 30;

const TICKS_PER_DTMAX: u64 = 1 << MAX_BIN;

/// Length of bin `bin` on the integer timeline.
#[inline]
fn ticks(bin: u8) -> u64 {
    1 << (MAX_BIN - bin)
}

/// Coarsest bin whose step boundaries include `tick`.
fn coarsest_aligned_bin(tick: u64) -> u8 {
    if tick % TICKS_PER_DTMAX == 0 {
        0
    } else {
        MAX_BIN - tick.trailing_zeros() as u8
    }
}

/// Smallest bin `k` with `dtmax / 2^k <= dt`, i.e. the longest step not exceeding `dt`.
pub fn bin_for(dt: Scalar, dtmax: Scalar) -> u8 {
    if dt.is_nan() {
        return MAX_BIN;
    }
    let mut bin = 0;
    while bin < MAX_BIN && dtmax / (1u64 << bin) as Scalar > dt {
        bin += 1;
    }
    bin
}

/// What one global step covers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepPlan {
    pub t_end: Scalar,
    pub dt: Scalar,
    pub n_active: usize,
}

/// Decides which particles are due, and the half-step each one gets in each phase of the
/// leapfrog.
pub trait TimestepPolicy: Send + Sync {
    /// Called once, after the first force evaluation. Returns the first step.
    fn initialise(
        &mut self,
        particles: &mut Particles,
        derivs: &mut DerivativeArrays,
        time: Scalar,
        dtnew: Scalar,
    ) -> Scalar;

    /// Flags the particles due this step.
    fn begin_step(&mut self, particles: &mut Particles, time: Scalar, dt: Scalar) -> StepPlan;

    /// Kick applied to particle `i` before the drift.
    fn predictor_half_step(&self, particles: &Particles, i: usize) -> Scalar;

    /// Interval used to extrapolate particle `i` to `t_end` for the force evaluation.
    fn prediction_half_step(&self, particles: &Particles, i: usize, t_end: Scalar) -> Scalar;

    /// Kick applied to particle `i` with the new forces. Zero for particles not due.
    fn corrector_half_step(&self, particles: &Particles, i: usize) -> Scalar;

    /// Closes the step: records `twas`, reassigns bins and returns the next step. `dtnew` is
    /// the evaluator's minimum over active particles and `dterr` the corrector's error limit.
    fn end_step(
        &mut self,
        particles: &mut Particles,
        derivs: &mut DerivativeArrays,
        t_end: Scalar,
        dtnew: Scalar,
        dterr: Scalar,
    ) -> Scalar;

    fn is_individual(&self) -> bool {
        false
    }
}

/// Every live particle takes the same step.
#[derive(Clone, Debug)]
pub struct GlobalTimestep {
    dtmax: Scalar,
    dt: Scalar,
}

impl GlobalTimestep {
    pub fn new(dtmax: Scalar) -> Self {
        Self { dtmax, dt: dtmax }
    }
}

impl TimestepPolicy for GlobalTimestep {
    fn initialise(
        &mut self,
        particles: &mut Particles,
        derivs: &mut DerivativeArrays,
        time: Scalar,
        dtnew: Scalar,
    ) -> Scalar {
        particles.twas.iter_mut().for_each(|t| *t = time);
        derivs.dt_suggest.iter_mut().for_each(|dt| *dt = Scalar::INFINITY);
        self.dt = dtnew.min(self.dtmax);
        self.dt
    }

    fn begin_step(&mut self, particles: &mut Particles, time: Scalar, dt: Scalar) -> StepPlan {
        self.dt = dt.min(self.dtmax);
        let mut n_active = 0;
        for i in 0..particles.len() {
            let live = particles.is_live(i);
            particles.phase[i].active = live;
            n_active += live as usize;
        }
        StepPlan {
            t_end: time + self.dt,
            dt: self.dt,
            n_active,
        }
    }

    fn predictor_half_step(&self, _particles: &Particles, _i: usize) -> Scalar {
        0.5 * self.dt
    }

    fn prediction_half_step(&self, _particles: &Particles, _i: usize, _t_end: Scalar) -> Scalar {
        0.5 * self.dt
    }

    fn corrector_half_step(&self, _particles: &Particles, _i: usize) -> Scalar {
        0.5 * self.dt
    }

    fn end_step(
        &mut self,
        particles: &mut Particles,
        derivs: &mut DerivativeArrays,
        t_end: Scalar,
        dtnew: Scalar,
        dterr: Scalar,
    ) -> Scalar {
        for i in 0..particles.len() {
            if particles.is_live(i) {
                particles.twas[i] = t_end;
            }
        }
        derivs.dt_suggest.iter_mut().for_each(|dt| *dt = Scalar::INFINITY);
        dtnew.min(dterr).min(self.dtmax)
    }
}

/// Power-of-two time bins on an integer timeline with `2^MAX_BIN` ticks per `dtmax`, so every
/// particle's cycle boundaries are exact.
#[derive(Clone, Debug)]
pub struct IndividualTimestep {
    dtmax: Scalar,
    t_start: Scalar,
    tick: u64,
    tick_end: u64,
    /// Start of each particle's current cycle.
    tick_was: Vec<u64>,
}

impl IndividualTimestep {
    pub fn new(dtmax: Scalar) -> Self {
        Self {
            dtmax,
            t_start: 0.,
            tick: 0,
            tick_end: 0,
            tick_was: Vec::new(),
        }
    }

    fn time(&self, tick: u64) -> Scalar {
        self.t_start + self.dtmax * (tick as Scalar / TICKS_PER_DTMAX as Scalar)
    }

    /// Step of bin `bin`.
    pub fn bin_dt(&self, bin: u8) -> Scalar {
        self.dtmax / (1u64 << bin) as Scalar
    }

    /// Particles added since the last step join at the current tick, in a bin aligned to it.
    fn adopt_new_particles(&mut self, particles: &mut Particles) {
        let first_new = self.tick_was.len();
        if first_new >= particles.len() {
            return;
        }
        let aligned = coarsest_aligned_bin(self.tick);
        let now = self.time(self.tick);
        self.tick_was.resize(particles.len(), self.tick);
        for i in first_new..particles.len() {
            particles.bin[i] = particles.bin[i].max(aligned);
            particles.twas[i] = now;
        }
    }

    fn cycle_end(&self, particles: &Particles, i: usize) -> u64 {
        self.tick_was[i] + ticks(particles.bin[i])
    }

    fn next_cycle_end(&self, particles: &Particles) -> Option<u64> {
        particles
            .live_indices()
            .map(|i| self.cycle_end(particles, i))
            .min()
    }
}

impl TimestepPolicy for IndividualTimestep {
    fn initialise(
        &mut self,
        particles: &mut Particles,
        derivs: &mut DerivativeArrays,
        time: Scalar,
        dtnew: Scalar,
    ) -> Scalar {
        self.t_start = time;
        self.tick = 0;
        self.tick_end = 0;
        self.tick_was = vec![0; particles.len()];

        for i in 0..particles.len() {
            particles.twas[i] = time;
            let dt = if derivs.dt_suggest[i].is_finite() {
                derivs.dt_suggest[i]
            } else {
                dtnew
            };
            particles.bin[i] = bin_for(dt, self.dtmax);
            derivs.dt_suggest[i] = Scalar::INFINITY;
        }

        match self.next_cycle_end(particles) {
            Some(end) => self.time(end) - time,
            None => self.dtmax,
        }
    }

    fn begin_step(&mut self, particles: &mut Particles, _time: Scalar, _dt: Scalar) -> StepPlan {
        self.adopt_new_particles(particles);

        self.tick_end = match self.next_cycle_end(particles) {
            Some(end) => end,
            // nothing to integrate: jump to the next dtmax boundary
            None => (self.tick / TICKS_PER_DTMAX + 1) * TICKS_PER_DTMAX,
        };

        let mut n_active = 0;
        for i in 0..particles.len() {
            let due = particles.is_live(i) && self.cycle_end(particles, i) == self.tick_end;
            particles.phase[i].active = due;
            n_active += due as usize;
        }

        StepPlan {
            t_end: self.time(self.tick_end),
            dt: self.time(self.tick_end) - self.time(self.tick),
            n_active,
        }
    }

    fn predictor_half_step(&self, particles: &Particles, i: usize) -> Scalar {
        if self.tick_was[i] == self.tick {
            0.5 * self.bin_dt(particles.bin[i])
        } else {
            0.
        }
    }

    fn prediction_half_step(&self, particles: &Particles, i: usize, t_end: Scalar) -> Scalar {
        t_end - particles.twas[i] - 0.5 * self.bin_dt(particles.bin[i])
    }

    fn corrector_half_step(&self, particles: &Particles, i: usize) -> Scalar {
        if particles.phase[i].active {
            0.5 * self.bin_dt(particles.bin[i])
        } else {
            0.
        }
    }

    fn end_step(
        &mut self,
        particles: &mut Particles,
        derivs: &mut DerivativeArrays,
        _t_end: Scalar,
        _dtnew: Scalar,
        dterr: Scalar,
    ) -> Scalar {
        let tick = self.tick_end;
        let now = self.time(tick);
        let aligned = coarsest_aligned_bin(tick);

        for i in 0..particles.len() {
            if !particles.is_active(i) {
                continue;
            }
            self.tick_was[i] = tick;
            particles.twas[i] = now;
            let wanted = bin_for(derivs.dt_suggest[i].min(dterr), self.dtmax);
            particles.bin[i] = wanted.max(aligned);
            derivs.dt_suggest[i] = Scalar::INFINITY;
        }
        self.tick = tick;

        match self.next_cycle_end(particles) {
            Some(end) => self.time(end) - now,
            None => self.dtmax,
        }
    }

    fn is_individual(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::ParticleKind;
    use crate::Vec3;

    fn particles(n: usize) -> (Particles, DerivativeArrays) {
        let mut particles = Particles::new([1., 0., 0.]);
        for k in 0..n {
            particles.add_particle(
                ParticleKind::Gas,
                Vec3::new(k as Scalar, 0., 0.),
                0.1,
                Vec3::zeros(),
                0.1,
            );
        }
        let mut derivs = DerivativeArrays::default();
        derivs.resize(n);
        (particles, derivs)
    }

    #[test]
    fn bins() {
        assert_eq!(bin_for(Scalar::INFINITY, 1.), 0);
        assert_eq!(bin_for(1., 1.), 0);
        assert_eq!(bin_for(0.5, 1.), 1);
        assert_eq!(bin_for(0.3, 1.), 2);
        assert_eq!(bin_for(0., 1.), MAX_BIN);

        assert_eq!(coarsest_aligned_bin(0), 0);
        assert_eq!(coarsest_aligned_bin(3 * TICKS_PER_DTMAX), 0);
        assert_eq!(coarsest_aligned_bin(TICKS_PER_DTMAX / 2), 1);
        assert_eq!(coarsest_aligned_bin(3 * TICKS_PER_DTMAX / 4), 2);
        assert_eq!(coarsest_aligned_bin(1), MAX_BIN);
    }

    #[test]
    fn global_step_is_capped_by_dtmax() {
        let (mut particles, mut derivs) = particles(3);
        particles.kill(1);
        let mut policy = GlobalTimestep::new(0.1);
        assert_eq!(policy.initialise(&mut particles, &mut derivs, 0., 1.), 0.1);

        let plan = policy.begin_step(&mut particles, 2., 0.05);
        assert_eq!(plan.n_active, 2);
        assert_eq!(plan.dt, 0.05);
        assert!(!particles.phase[1].active);
        assert_eq!(policy.predictor_half_step(&particles, 0), 0.025);

        let next = policy.end_step(&mut particles, &mut derivs, plan.t_end, 0.2, 0.03);
        assert_eq!(next, 0.03);
        assert_eq!(particles.twas[0], plan.t_end);
    }

    #[test]
    fn individual_bins_stay_in_step() {
        let dtmax = 1.;
        let (mut particles, mut derivs) = particles(3);
        let wanted = [1., 0.25, 0.3];
        derivs.dt_suggest.copy_from_slice(&wanted);

        let mut policy = IndividualTimestep::new(dtmax);
        let first = policy.initialise(&mut particles, &mut derivs, 0., 0.25);
        assert_eq!(particles.bin, vec![0, 2, 2]);
        assert_eq!(first, 0.25);

        let mut time = 0.;
        let mut active_per_step = Vec::new();
        for _ in 0..8 {
            let twas_before = particles.twas.clone();
            let plan = policy.begin_step(&mut particles, time, 0.);
            active_per_step.push(plan.n_active);
            for i in 0..3 {
                if particles.phase[i].active {
                    derivs.dt_suggest[i] = wanted[i];
                }
            }
            let bins_before = particles.bin.clone();
            policy.end_step(&mut particles, &mut derivs, plan.t_end, 0., Scalar::INFINITY);
            time = plan.t_end;

            for i in 0..3 {
                if particles.phase[i].active {
                    let advanced = particles.twas[i] - twas_before[i];
                    assert!((advanced - policy.bin_dt(bins_before[i])).abs() < 1e-12);
                }
            }
            if (time / dtmax).fract() == 0. {
                assert!(particles.twas.iter().all(|&t| t == time));
            }
        }
        assert_eq!(active_per_step, vec![2, 2, 2, 3, 2, 2, 2, 3]);
        assert_eq!(time, 2.);
    }

    #[test]
    fn coarsening_waits_for_alignment() {
        let (mut particles, mut derivs) = particles(2);
        derivs.dt_suggest.copy_from_slice(&[0.25, 0.25]);
        let mut policy = IndividualTimestep::new(1.);
        policy.initialise(&mut particles, &mut derivs, 0., 0.25);

        // particle 0 asks to go to bin 0 at t = 0.25, which is only aligned to bin 2
        let plan = policy.begin_step(&mut particles, 0., 0.);
        assert_eq!(plan.t_end, 0.25);
        derivs.dt_suggest.copy_from_slice(&[1., 0.25]);
        policy.end_step(&mut particles, &mut derivs, plan.t_end, 0., Scalar::INFINITY);
        assert_eq!(particles.bin[0], 2);

        // at t = 0.5 it may move up to bin 1
        let plan = policy.begin_step(&mut particles, 0.25, 0.);
        assert_eq!(plan.t_end, 0.5);
        derivs.dt_suggest.copy_from_slice(&[1., 0.25]);
        policy.end_step(&mut particles, &mut derivs, plan.t_end, 0., Scalar::INFINITY);
        assert_eq!(particles.bin, vec![1, 2]);
    }

    #[test]
    fn no_live_particles_jump_to_next_boundary() {
        let (mut particles, mut derivs) = particles(1);
        particles.kill(0);
        let mut policy = IndividualTimestep::new(0.5);
        policy.initialise(&mut particles, &mut derivs, 1., 0.5);
        let plan = policy.begin_step(&mut particles, 1., 0.);
        assert_eq!(plan.n_active, 0);
        assert_eq!(plan.t_end, 1.5);
    }
}
