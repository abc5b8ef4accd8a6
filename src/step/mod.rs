//! Leapfrog (kick-drift-kick) integrator with operator-split fast forces, individual time bins
//! and a corrector iteration for velocity-dependent forces.

pub mod substep;
pub mod timestep;

use crate::config::{Features, Parameters};
use crate::eos::{density_from_h, EquationOfState};
use crate::error::{EngineError, Result, WarningBudget};
use crate::external::ExternalForce;
use crate::part::{is_dead_or_accreted, DerivativeArrays, Particles, Predicted};
use crate::sinks::{Newtonian, SinkGravity, SinkParticles};
use crate::util::RangeExt;
use crate::{Scalar, Vec3};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;
use substep::{drift, FastForces};
use timestep::{GlobalTimestep, IndividualTimestep, TimestepPolicy};
use tracing::{debug, debug_span, warn};

/// Which evaluation of the step this is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DerivsPass {
    /// First evaluation of a step: neighbour search and density included.
    Full,
    /// Corrector retry: forces only, reusing the neighbours and densities of the `Full` pass.
    Retry,
}

pub struct DerivsInput<'a> {
    pub pass: DerivsPass,
    /// Positions are already at the end of the step.
    pub particles: &'a Particles,
    /// Velocities and other evolved quantities extrapolated to the end of the step.
    pub predicted: &'a Predicted,
    pub n_active: usize,
    pub time: Scalar,
    pub dt: Scalar,
}

/// The slow (hydrodynamic) forces.
pub trait Derivatives {
    /// Fills `out` for the active particles and returns the smallest timestep they suggest.
    /// Entries of inactive particles must be left alone, except that `dt_suggest` may be
    /// lowered.
    fn evaluate(&mut self, input: DerivsInput<'_>, out: &mut DerivativeArrays) -> Result<Scalar>;
}

/// Everything that evolves.
#[derive(Clone, Debug, Default)]
pub struct System {
    pub particles: Particles,
    pub derivs: DerivativeArrays,
    pub sinks: SinkParticles,
    pub time: Scalar,
    /// Next step.
    pub dt: Scalar,
    /// Next substep of the fast forces.
    pub dt_ext: Scalar,
    pub nsteps: usize,
}

impl System {
    pub fn new(particles: Particles, sinks: SinkParticles) -> Self {
        Self {
            particles,
            sinks,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct StepReport {
    pub time: Scalar,
    pub dt: Scalar,
    pub dt_next: Scalar,
    /// Corrector attempts; 1 when the first one converged.
    pub iterations: usize,
    pub n_substeps: usize,
    pub n_active: usize,
    pub errmax: Scalar,
    pub accreted_count: usize,
    pub accreted_mass: Scalar,
    /// Potential energy of the fast forces at the end of the step.
    pub potential: Scalar,
}

/// Mutable views of the evolved arrays, either of the particles or of a prediction.
struct Evolved<'a> {
    velocity: &'a mut [Vec3],
    energy: &'a mut [Scalar],
    b_evol: &'a mut [Vec3],
    dust_fraction: &'a mut [Scalar],
}

impl<'a> Evolved<'a> {
    fn of_particles(particles: &'a mut Particles) -> Self {
        Self {
            velocity: &mut particles.velocity,
            energy: &mut particles.energy,
            b_evol: &mut particles.b_evol,
            dust_fraction: &mut particles.dust_fraction,
        }
    }

    fn of_predicted(predicted: &'a mut Predicted) -> Self {
        Self {
            velocity: &mut predicted.velocity,
            energy: &mut predicted.energy,
            b_evol: &mut predicted.b_evol,
            dust_fraction: &mut predicted.dust_fraction,
        }
    }

    /// `q += hdt_i dq/dt` for every quantity the enabled features evolve.
    fn kick(self, features: &Features, derivs: &DerivativeArrays, hdt: &[Scalar]) {
        (self.velocity.par_iter_mut(), derivs.accel.par_iter(), hdt.par_iter())
            .into_par_iter()
            .for_each(|(v, a, &hdt)| *v += hdt * a);

        if !features.isothermal {
            (self.energy.par_iter_mut(), derivs.du_dt.par_iter(), hdt.par_iter())
                .into_par_iter()
                .for_each(|(u, du, &hdt)| *u += hdt * du);
        }
        if features.mhd {
            (self.b_evol.par_iter_mut(), derivs.d_b.par_iter(), hdt.par_iter())
                .into_par_iter()
                .for_each(|(b, db, &hdt)| *b += hdt * db);
        }
        if features.dust {
            (
                self.dust_fraction.par_iter_mut(),
                derivs.d_dust.par_iter(),
                hdt.par_iter(),
            )
                .into_par_iter()
                .for_each(|(eps, deps, &hdt)| *eps = (*eps + hdt * deps).max(0.));
        }
    }
}

/// Half-step of every particle for one phase of the leapfrog; zero for dead ones.
fn half_steps<F>(particles: &Particles, half_step: F) -> Vec<Scalar>
where
    F: Fn(usize) -> Scalar + Sync,
{
    (0..particles.len())
        .into_par_iter()
        .map(|i| if particles.is_live(i) { half_step(i) } else { 0. })
        .collect()
}

/// Maps live gas and the sinks back into the periodic box.
fn wrap_positions(particles: &mut Particles, sinks: &mut SinkParticles, domain: &Range<Vec3>) {
    (particles.position.par_iter_mut(), particles.h.par_iter())
        .into_par_iter()
        .for_each(|(x, &h)| {
            if !is_dead_or_accreted(h) {
                *x = domain.wrap(*x);
            }
        });
    for x in &mut sinks.position {
        *x = domain.wrap(*x);
    }
}

/// `h *= exp(hdt div_v / 3)`, the exact solution of `dh/dt = h div_v / 3` for a constant rate.
/// Dead and accreted particles are left alone.
fn evolve_h(h: &mut [Scalar], div_v: &[Scalar], hdt: &[Scalar]) {
    (h.par_iter_mut(), div_v.par_iter(), hdt.par_iter())
        .into_par_iter()
        .for_each(|(h, &div_v, &hdt)| {
            if !is_dead_or_accreted(*h) && hdt != 0. {
                *h *= (hdt * div_v / 3.).exp();
            }
        });
}

pub struct Integrator {
    features: Features,
    params: Parameters,
    policy: Box<dyn TimestepPolicy>,
    external: Option<Box<dyn ExternalForce>>,
    gravity: Box<dyn SinkGravity>,
    eos: Arc<dyn EquationOfState>,
    predicted: Predicted,
    corrected: Predicted,
    /// Smoothing lengths after the predictor and the fast forces, for the corrector to restart from.
    h_start: Vec<Scalar>,
    warnings: WarningBudget,
}

impl Integrator {
    pub fn new(
        features: Features,
        params: Parameters,
        eos: Arc<dyn EquationOfState>,
    ) -> Result<Self> {
        params.validate()?;
        let policy: Box<dyn TimestepPolicy> = if features.individual_timesteps {
            Box::new(IndividualTimestep::new(params.dtmax))
        } else {
            Box::new(GlobalTimestep::new(params.dtmax))
        };
        Ok(Self {
            features,
            params,
            policy,
            external: None,
            gravity: Box::new(Newtonian::default()),
            eos,
            predicted: Predicted::default(),
            corrected: Predicted::default(),
            h_start: Vec::new(),
            warnings: WarningBudget::default(),
        })
    }

    pub fn with_external_force(mut self, external: Box<dyn ExternalForce>) -> Self {
        self.external = Some(external);
        self
    }

    pub fn with_sink_gravity(mut self, gravity: Box<dyn SinkGravity>) -> Self {
        self.gravity = gravity;
        self
    }

    pub fn features(&self) -> &Features {
        &self.features
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    /// Makes every live particle active, evaluates all forces once and picks the first step.
    pub fn initialise<D>(&mut self, sys: &mut System, eval: &mut D) -> Result<()>
    where
        D: Derivatives + ?Sized,
    {
        let _span = debug_span!("initialise", n = sys.particles.len()).entered();
        let n = sys.particles.len();
        sys.derivs.resize(n);
        for i in 0..n {
            sys.particles.phase[i].active = sys.particles.is_live(i);
        }
        let n_active = sys.particles.recount().active;

        let forces = FastForces {
            gravity: self.gravity.as_ref(),
            external: self.external.as_deref(),
            damping: self.params.damping,
            c_force: self.params.c_force,
        };
        sys.dt_ext = if forces.is_needed(&sys.sinks) {
            forces
                .compute(&mut sys.particles, &mut sys.sinks, sys.time)
                .dt
        } else {
            Scalar::INFINITY
        };

        self.predicted.copy_from(&sys.particles);
        let dtnew = eval.evaluate(
            DerivsInput {
                pass: DerivsPass::Full,
                particles: &sys.particles,
                predicted: &self.predicted,
                n_active,
                time: sys.time,
                dt: 0.,
            },
            &mut sys.derivs,
        )?;

        sys.dt = self
            .policy
            .initialise(&mut sys.particles, &mut sys.derivs, sys.time, dtnew);
        sys.dt_ext = sys.dt_ext.min(sys.dt);
        debug!(dt = sys.dt, dt_ext = sys.dt_ext, "initialised");
        Ok(())
    }

    /// Advances `sys` by one step.
    pub fn step<D>(&mut self, sys: &mut System, eval: &mut D) -> Result<StepReport>
    where
        D: Derivatives + ?Sized,
    {
        let _span = debug_span!("step", step = sys.nsteps, time = sys.time).entered();
        let n = sys.particles.len();
        sys.derivs.resize(n);

        let plan = self
            .policy
            .begin_step(&mut sys.particles, sys.time, sys.dt);
        sys.particles.recount();

        let policy: &dyn TimestepPolicy = self.policy.as_ref();

        // predictor
        let hdt = half_steps(&sys.particles, |i| {
            policy.predictor_half_step(&sys.particles, i)
        });
        Evolved::of_particles(&mut sys.particles).kick(&self.features, &sys.derivs, &hdt);
        evolve_h(&mut sys.particles.h, &sys.derivs.div_v, &hdt);

        let forces = FastForces {
            gravity: self.gravity.as_ref(),
            external: self.external.as_deref(),
            damping: self.params.damping,
            c_force: self.params.c_force,
        };
        let mut n_substeps = 0;
        let mut accreted_count = 0;
        let mut accreted_mass = 0.;
        let mut potential = 0.;
        if forces.is_needed(&sys.sinks) {
            let report = forces.step_extern(
                &mut sys.particles,
                &mut sys.sinks,
                sys.time,
                plan.dt,
                sys.dt_ext,
                policy.is_individual(),
                self.params.max_substeps_warning,
                &self.warnings,
            );
            sys.dt_ext = report.dt_ext;
            n_substeps = report.n_substeps;
            accreted_count = report.accreted.count;
            accreted_mass = report.accreted.total_mass;
            potential = report.potential;
            if accreted_count > 0 {
                debug!(accreted_count, accreted_mass, "accreted");
            }
        } else {
            drift(&mut sys.particles, plan.dt);
        }
        if let Some(domain) = &self.params.periodic {
            wrap_positions(&mut sys.particles, &mut sys.sinks, domain);
        }
        let n_active = sys.particles.recount().active;
        self.h_start.clone_from(&sys.particles.h);

        // extrapolate to the end of the step for the force evaluation
        let hdt_pred = half_steps(&sys.particles, |i| {
            policy.prediction_half_step(&sys.particles, i, plan.t_end)
        });
        self.predicted.copy_from(&sys.particles);
        Evolved::of_predicted(&mut self.predicted).kick(&self.features, &sys.derivs, &hdt_pred);
        // the neighbour search sees h at the end of the step
        evolve_h(&mut sys.particles.h, &sys.derivs.div_v, &hdt_pred);

        let hdt_corr = half_steps(&sys.particles, |i| {
            policy.corrector_half_step(&sys.particles, i)
        });
        if self.features.variable_alpha {
            self.update_viscosity_switch(sys, &hdt_corr);
        }

        let mut dtnew = eval.evaluate(
            DerivsInput {
                pass: DerivsPass::Full,
                particles: &sys.particles,
                predicted: &self.predicted,
                n_active,
                time: plan.t_end,
                dt: plan.dt,
            },
            &mut sys.derivs,
        )?;

        let mut iterations = 0;
        let errmax = loop {
            iterations += 1;
            self.corrected.copy_from(&sys.particles);
            Evolved::of_predicted(&mut self.corrected).kick(
                &self.features,
                &sys.derivs,
                &hdt_corr,
            );

            let errmax = self.velocity_error(&hdt_corr);
            if !self.params.checks_velocity_error() || errmax < self.params.tolv {
                break errmax;
            }
            if iterations >= self.params.max_corrector_iterations {
                return Err(EngineError::NonConvergence {
                    iterations,
                    step: sys.nsteps,
                    time: sys.time,
                    errmax,
                    tolv: self.params.tolv,
                });
            }

            // the corrected values become the prediction; the particles still hold the
            // state from before the corrector
            self.adopt_corrected(&hdt_corr);
            dtnew = eval.evaluate(
                DerivsInput {
                    pass: DerivsPass::Retry,
                    particles: &sys.particles,
                    predicted: &self.predicted,
                    n_active,
                    time: plan.t_end,
                    dt: plan.dt,
                },
                &mut sys.derivs,
            )?;
        };

        if iterations > 1 && self.warnings.take() {
            warn!(
                iterations,
                errmax,
                step = sys.nsteps,
                "corrector needed more than one iteration"
            );
        }
        self.corrected.swap_with(&mut sys.particles);
        sys.particles.h.copy_from_slice(&self.h_start);
        evolve_h(&mut sys.particles.h, &sys.derivs.div_v, &hdt_corr);

        let dterr = if errmax > 0. {
            plan.dt * (self.params.errtol / errmax).sqrt()
        } else {
            Scalar::INFINITY
        };
        let dt_next = self.policy.end_step(
            &mut sys.particles,
            &mut sys.derivs,
            plan.t_end,
            dtnew,
            dterr,
        );

        sys.time = plan.t_end;
        sys.dt = dt_next;
        sys.nsteps += 1;

        Ok(StepReport {
            time: sys.time,
            dt: plan.dt,
            dt_next,
            iterations,
            n_substeps,
            n_active,
            errmax,
            accreted_count,
            accreted_mass,
            potential,
        })
    }

    /// `max |v_corr - v_pred|^2 / mean(v_corr^2)` over the particles corrected this step.
    fn velocity_error(&self, hdt_corr: &[Scalar]) -> Scalar {
        let (max_err, v2_sum, count) = (
            self.corrected.velocity.par_iter(),
            self.predicted.velocity.par_iter(),
            hdt_corr.par_iter(),
        )
            .into_par_iter()
            .filter(|(_, _, hdt)| **hdt > 0.)
            .map(|(v_corr, v_pred, _)| {
                ((v_corr - v_pred).magnitude_squared(), v_corr.magnitude_squared(), 1usize)
            })
            .reduce(
                || (0., 0., 0),
                |a, b| (a.0.max(b.0), a.1 + b.1, a.2 + b.2),
            );

        if count == 0 || v2_sum <= 0. {
            return 0.;
        }
        max_err / (v2_sum / count as Scalar)
    }

    /// Copies the corrected values of the particles corrected this step into the prediction.
    fn adopt_corrected(&mut self, hdt_corr: &[Scalar]) {
        let corrected = &self.corrected;
        let predicted = &mut self.predicted;
        (
            predicted.velocity.par_iter_mut(),
            predicted.energy.par_iter_mut(),
            predicted.b_evol.par_iter_mut(),
            predicted.dust_fraction.par_iter_mut(),
            corrected.velocity.par_iter(),
            corrected.energy.par_iter(),
            corrected.b_evol.par_iter(),
            corrected.dust_fraction.par_iter(),
            hdt_corr.par_iter(),
        )
            .into_par_iter()
            .for_each(|(v, u, b, eps, v_c, u_c, b_c, eps_c, &hdt)| {
                if hdt > 0. {
                    *v = *v_c;
                    *u = *u_c;
                    *b = *b_c;
                    *eps = *eps_c;
                }
            });
    }

    /// Implicit relaxation of the viscosity coefficient towards `alpha` (the floor), driven up
    /// by compression, for the particles completing their step.
    fn update_viscosity_switch(&self, sys: &mut System, hdt_corr: &[Scalar]) {
        let params = &self.params;
        let eos = self.eos.as_ref();
        let mass_of_kind = sys.particles.mass_of_kind;
        (
            sys.particles.alpha.par_iter_mut(),
            sys.particles.h.par_iter(),
            sys.particles.energy.par_iter(),
            sys.particles.phase.par_iter(),
            sys.derivs.div_v.par_iter(),
            hdt_corr.par_iter(),
        )
            .into_par_iter()
            .for_each(|(alpha, &h, &u, phase, &div_v, &hdt)| {
                if hdt <= 0. {
                    return;
                }
                let dt = 2. * hdt;
                let rho = density_from_h(mass_of_kind[phase.kind.index()], h, params.hfact);
                let tau_inv = params.avdecayconst * eos.sound_speed(rho, u) / h;
                let source = (-div_v).max(0.) * (params.alphamax - *alpha);
                *alpha = ((*alpha + dt * (source + params.alpha * tau_inv))
                    / (1. + dt * tau_inv))
                    .min(params.alphamax);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eos::Isothermal;
    use crate::external::UniformField;
    use crate::part::ParticleKind;
    use std::f64::consts::PI;

    fn eos() -> Arc<dyn EquationOfState> {
        Arc::new(Isothermal { cs: 1. })
    }

    fn system(particles: &[(Vec3, Vec3)]) -> System {
        let mut p = Particles::new([1., 0., 0.]);
        for &(x, v) in particles {
            p.add_particle(ParticleKind::Gas, x, 0.1, v, 0.1);
        }
        System::new(p, SinkParticles::new(10))
    }

    /// Same acceleration everywhere.
    struct ConstantForce {
        g: Vec3,
        dt: Scalar,
    }

    impl Derivatives for ConstantForce {
        fn evaluate(&mut self, input: DerivsInput<'_>, out: &mut DerivativeArrays) -> Result<Scalar> {
            for i in input.particles.live_indices() {
                if input.particles.phase[i].active {
                    out.accel[i] = self.g;
                    out.dt_suggest[i] = self.dt;
                }
            }
            Ok(self.dt)
        }
    }

    /// `a = -x`.
    struct Harmonic;

    impl Derivatives for Harmonic {
        fn evaluate(&mut self, input: DerivsInput<'_>, out: &mut DerivativeArrays) -> Result<Scalar> {
            for i in input.particles.live_indices() {
                out.accel[i] = -input.particles.position[i];
            }
            Ok(Scalar::INFINITY)
        }
    }

    /// `a = -k v`, evaluated on the predicted velocity.
    struct Drag {
        k: Scalar,
        calls: Vec<DerivsPass>,
    }

    impl Derivatives for Drag {
        fn evaluate(&mut self, input: DerivsInput<'_>, out: &mut DerivativeArrays) -> Result<Scalar> {
            self.calls.push(input.pass);
            for i in input.particles.live_indices() {
                out.accel[i] = -self.k * input.predicted.velocity[i];
            }
            Ok(Scalar::INFINITY)
        }
    }

    /// No slow forces, but fixed rates for the other evolved quantities.
    struct Rates {
        d_b: Vec3,
        d_dust: Scalar,
        div_v: Scalar,
    }

    impl Derivatives for Rates {
        fn evaluate(&mut self, input: DerivsInput<'_>, out: &mut DerivativeArrays) -> Result<Scalar> {
            for i in input.particles.live_indices() {
                out.accel[i] = Vec3::zeros();
                out.d_b[i] = self.d_b;
                out.d_dust[i] = self.d_dust;
                out.div_v[i] = self.div_v;
            }
            Ok(Scalar::INFINITY)
        }
    }

    /// Constant acceleration with a fixed timestep per particle.
    struct FixedBins {
        g: Vec3,
        dts: Vec<Scalar>,
    }

    impl Derivatives for FixedBins {
        fn evaluate(&mut self, input: DerivsInput<'_>, out: &mut DerivativeArrays) -> Result<Scalar> {
            let mut dtmin = Scalar::INFINITY;
            for i in input.particles.live_indices() {
                if input.particles.phase[i].active {
                    out.accel[i] = self.g;
                    out.dt_suggest[i] = self.dts[i];
                    dtmin = dtmin.min(self.dts[i]);
                }
            }
            Ok(dtmin)
        }
    }

    #[test]
    fn constant_force_is_exact_in_one_iteration() {
        let params = Parameters {
            dtmax: 0.1,
            ..Default::default()
        };
        let mut integrator = Integrator::new(Features::default(), params, eos()).unwrap();
        let v0 = Vec3::new(1., 0., 0.);
        let mut sys = system(&[(Vec3::zeros(), v0)]);
        let g = Vec3::new(0., -1., 0.);
        let mut eval = ConstantForce { g, dt: 1. };

        integrator.initialise(&mut sys, &mut eval).unwrap();
        assert_eq!(sys.dt, 0.1);
        for _ in 0..10 {
            let report = integrator.step(&mut sys, &mut eval).unwrap();
            assert_eq!(report.iterations, 1);
            assert_eq!(report.n_substeps, 0);
            assert_eq!(report.errmax, 0.);
        }

        let t = sys.time;
        assert!((t - 1.).abs() < 1e-12);
        let exact = v0 * t + 0.5 * g * t * t;
        assert!((sys.particles.position[0] - exact).magnitude() < 1e-12);
        assert!((sys.particles.velocity[0] - (v0 + g * t)).magnitude() < 1e-12);
        assert_eq!(sys.particles.twas[0], sys.time);
    }

    #[test]
    fn position_dependent_force_needs_no_retry() {
        let params = Parameters {
            dtmax: 0.01,
            ..Default::default()
        };
        let mut integrator = Integrator::new(Features::default(), params, eos()).unwrap();
        let mut sys = system(&[(Vec3::new(1., 0., 0.), Vec3::zeros())]);
        integrator.initialise(&mut sys, &mut Harmonic).unwrap();

        for _ in 0..100 {
            let report = integrator.step(&mut sys, &mut Harmonic).unwrap();
            assert_eq!(report.iterations, 1);
        }
        let x = sys.particles.position[0];
        let v = sys.particles.velocity[0];
        let energy = 0.5 * (x.magnitude_squared() + v.magnitude_squared());
        assert!((energy - 0.5).abs() < 1e-4);
        assert!((x.x - (1f64).cos()).abs() < 1e-3);
    }

    #[test]
    fn weak_drag_converges() {
        let params = Parameters {
            dtmax: 0.1,
            ..Default::default()
        };
        let mut integrator = Integrator::new(Features::default(), params, eos()).unwrap();
        let mut sys = system(&[(Vec3::zeros(), Vec3::new(1., 0., 0.))]);
        let mut eval = Drag {
            k: 1.,
            calls: Vec::new(),
        };
        integrator.initialise(&mut sys, &mut eval).unwrap();
        eval.calls.clear();

        let report = integrator.step(&mut sys, &mut eval).unwrap();
        assert_eq!(eval.calls.len(), report.iterations);
        assert_eq!(eval.calls[0], DerivsPass::Full);
        assert!(eval.calls[1..].iter().all(|&pass| pass == DerivsPass::Retry));
        assert!(sys.particles.velocity[0].x < 1.);
        assert!(sys.particles.velocity[0].x > 0.85);
    }

    #[test]
    fn stiff_drag_does_not_converge() {
        let params = Parameters {
            dtmax: 1.,
            max_corrector_iterations: 5,
            ..Default::default()
        };
        let mut integrator = Integrator::new(Features::default(), params, eos()).unwrap();
        let mut sys = system(&[(Vec3::zeros(), Vec3::new(1., 0., 0.))]);
        let mut eval = Drag {
            k: 4.,
            calls: Vec::new(),
        };
        integrator.initialise(&mut sys, &mut eval).unwrap();

        let err = integrator.step(&mut sys, &mut eval).unwrap_err();
        assert!(matches!(
            err,
            EngineError::NonConvergence { iterations: 5, step: 0, .. }
        ));
    }

    #[test]
    fn large_tolv_skips_the_check() {
        let params = Parameters {
            dtmax: 1.,
            tolv: 1e3,
            max_corrector_iterations: 1,
            ..Default::default()
        };
        let mut integrator = Integrator::new(Features::default(), params, eos()).unwrap();
        let mut sys = system(&[(Vec3::zeros(), Vec3::new(1., 0., 0.))]);
        let mut eval = Drag {
            k: 4.,
            calls: Vec::new(),
        };
        integrator.initialise(&mut sys, &mut eval).unwrap();
        let report = integrator.step(&mut sys, &mut eval).unwrap();
        assert_eq!(report.iterations, 1);
        assert!(report.errmax > 1.);
        assert!(report.dt_next < 1.);
    }

    #[test]
    fn binary_orbit_returns_after_one_period() {
        let period = 2. * PI / (2f64).sqrt();
        let params = Parameters {
            dtmax: period / 10.,
            c_force: 0.05,
            ..Default::default()
        };
        let mut integrator = Integrator::new(Features::default(), params, eos()).unwrap();
        let mut sys = system(&[]);
        let speed = (2f64).sqrt() / 2.;
        sys.sinks
            .add(Vec3::new(-0.5, 0., 0.), Vec3::new(0., -speed, 0.), 1., 0.)
            .unwrap();
        sys.sinks
            .add(Vec3::new(0.5, 0., 0.), Vec3::new(0., speed, 0.), 1., 0.)
            .unwrap();
        let mut eval = ConstantForce {
            g: Vec3::zeros(),
            dt: Scalar::INFINITY,
        };

        integrator.initialise(&mut sys, &mut eval).unwrap();
        for _ in 0..10 {
            let report = integrator.step(&mut sys, &mut eval).unwrap();
            assert!(report.n_substeps > 1);
        }
        assert!((sys.time - period).abs() < 1e-12);

        let separation = (sys.sinks.position[1] - sys.sinks.position[0]).magnitude();
        assert!((separation - 1.).abs() < 1e-2);
        for s in 0..2 {
            assert!((sys.sinks.velocity[s].magnitude() - speed).abs() < 1e-2);
        }
        let momentum: Vec3 = sys.sinks.velocity.iter().sum();
        assert!(momentum.magnitude() < 1e-12);
        let start = Vec3::new(-0.5, 0., 0.);
        assert!((sys.sinks.position[0] - start).magnitude() < 5e-2);
    }

    #[test]
    fn substeps_cover_the_whole_step() {
        let params = Parameters {
            dtmax: 0.25,
            ..Default::default()
        };
        let field = UniformField {
            g: Vec3::new(0., 0., -1.),
        };
        let mut integrator = Integrator::new(Features::default(), params, eos())
            .unwrap()
            .with_external_force(Box::new(field));
        let v0 = Vec3::new(0.5, 0., 0.);
        let mut sys = system(&[(Vec3::zeros(), v0)]);
        let mut eval = ConstantForce {
            g: Vec3::zeros(),
            dt: Scalar::INFINITY,
        };
        integrator.initialise(&mut sys, &mut eval).unwrap();

        for _ in 0..4 {
            let report = integrator.step(&mut sys, &mut eval).unwrap();
            assert!(report.n_substeps >= 1);
        }
        let t = sys.time;
        assert_eq!(t, 1.);
        let exact = v0 * t + 0.5 * Vec3::new(0., 0., -1.) * t * t;
        assert!((sys.particles.position[0] - exact).magnitude() < 1e-12);
    }

    #[test]
    fn plain_drift_without_fast_forces() {
        let params = Parameters {
            dtmax: 0.5,
            ..Default::default()
        };
        let mut integrator = Integrator::new(Features::default(), params, eos()).unwrap();
        let v = Vec3::new(1., 2., 3.);
        let mut sys = system(&[(Vec3::zeros(), v), (Vec3::new(1., 1., 1.), v)]);
        sys.particles.kill(1);
        let mut eval = ConstantForce {
            g: Vec3::zeros(),
            dt: Scalar::INFINITY,
        };
        integrator.initialise(&mut sys, &mut eval).unwrap();
        let report = integrator.step(&mut sys, &mut eval).unwrap();

        assert_eq!(report.n_substeps, 0);
        assert_eq!(report.n_active, 1);
        assert!((sys.particles.position[0] - 0.5 * v).magnitude() < 1e-15);
        assert_eq!(sys.particles.position[1], Vec3::new(1., 1., 1.));
        assert_eq!(sys.particles.velocity[1], v);
    }

    #[test]
    fn individual_bins_integrate_exactly() {
        let features = Features {
            individual_timesteps: true,
            ..Default::default()
        };
        let params = Parameters {
            dtmax: 1.,
            ..Default::default()
        };
        let mut integrator = Integrator::new(features, params, eos()).unwrap();
        let v0 = Vec3::new(1., 0., 0.);
        let mut sys = system(&[(Vec3::zeros(), v0), (Vec3::zeros(), v0), (Vec3::zeros(), v0)]);
        let g = Vec3::new(0., -1., 0.);
        let mut eval = FixedBins {
            g,
            dts: vec![1., 0.25, 0.5],
        };

        integrator.initialise(&mut sys, &mut eval).unwrap();
        assert_eq!(sys.particles.bin, vec![0, 2, 1]);
        assert_eq!(sys.dt, 0.25);

        let mut active = Vec::new();
        for _ in 0..8 {
            let twas = sys.particles.twas.clone();
            let report = integrator.step(&mut sys, &mut eval).unwrap();
            assert_eq!(report.iterations, 1);
            active.push(report.n_active);
            for i in 0..3 {
                if sys.particles.phase[i].active {
                    assert!((sys.particles.twas[i] - twas[i] - eval.dts[i]).abs() < 1e-12);
                }
            }
            if sys.time.fract() == 0. {
                assert!(sys.particles.twas.iter().all(|&t| t == sys.time));
            }
        }
        assert_eq!(active, vec![1, 2, 1, 3, 1, 2, 1, 3]);
        assert_eq!(sys.time, 2.);

        let exact = v0 * 2. + 0.5 * g * 4.;
        for i in 0..3 {
            assert!((sys.particles.position[i] - exact).magnitude() < 1e-12);
            assert!((sys.particles.velocity[i] - (v0 + 2. * g)).magnitude() < 1e-12);
        }
    }

    #[test]
    fn feature_arrays_follow_their_rates() {
        let features = Features {
            mhd: true,
            dust: true,
            variable_alpha: true,
            ..Default::default()
        };
        let params = Parameters {
            dtmax: 0.25,
            ..Default::default()
        };
        let mut integrator = Integrator::new(features, params.clone(), eos()).unwrap();
        let mut sys = system(&[(Vec3::zeros(), Vec3::zeros())]);
        sys.particles.dust_fraction[0] = 0.3;
        let mut eval = Rates {
            d_b: Vec3::new(1., 0., 0.),
            d_dust: -1.,
            div_v: -4.,
        };

        integrator.initialise(&mut sys, &mut eval).unwrap();
        for _ in 0..4 {
            integrator.step(&mut sys, &mut eval).unwrap();
            // compression keeps the switch above its floor
            assert!(sys.particles.alpha[0] > params.alpha);
            assert!(sys.particles.alpha[0] <= params.alphamax);
            assert!(sys.particles.dust_fraction[0] >= 0.);
        }
        assert!((sys.particles.b_evol[0] - Vec3::new(1., 0., 0.)).magnitude() < 1e-12);
        assert_eq!(sys.particles.dust_fraction[0], 0.);
        assert_eq!(sys.particles.energy[0], 0.);
    }

    #[test]
    fn smoothing_length_follows_divergence() {
        let params = Parameters {
            dtmax: 0.1,
            ..Default::default()
        };
        let mut integrator = Integrator::new(Features::default(), params, eos()).unwrap();
        let mut sys = system(&[(Vec3::zeros(), Vec3::zeros()), (Vec3::zeros(), Vec3::zeros())]);
        sys.particles.kill(1);
        let mut eval = Rates {
            d_b: Vec3::zeros(),
            d_dust: 0.,
            div_v: 3.,
        };

        integrator.initialise(&mut sys, &mut eval).unwrap();
        let mut h = sys.particles.h[0];
        for _ in 0..10 {
            integrator.step(&mut sys, &mut eval).unwrap();
            assert!(sys.particles.h[0] > h);
            h = sys.particles.h[0];
        }
        // dh/dt = h div_v / 3 over t = 1
        assert!((sys.particles.h[0] - 0.1 * std::f64::consts::E).abs() < 1e-12);
        assert_eq!(sys.particles.h[1], 0.);
    }

    #[test]
    fn periodic_drift_stays_in_the_box() {
        let params = Parameters {
            dtmax: 0.5,
            periodic: Some(Vec3::zeros()..Vec3::from_element(1.)),
            ..Default::default()
        };
        let mut integrator = Integrator::new(Features::default(), params, eos()).unwrap();
        let v = Vec3::new(1., -1., 0.);
        let mut sys = system(&[(Vec3::new(0.75, 0.25, 0.5), v), (Vec3::new(0.9, 0.9, 0.9), v)]);
        sys.particles.kill(1);
        let mut eval = ConstantForce {
            g: Vec3::zeros(),
            dt: Scalar::INFINITY,
        };
        integrator.initialise(&mut sys, &mut eval).unwrap();
        integrator.step(&mut sys, &mut eval).unwrap();

        assert!((sys.particles.position[0] - Vec3::new(0.25, 0.75, 0.5)).magnitude() < 1e-12);
        assert_eq!(sys.particles.position[1], Vec3::new(0.9, 0.9, 0.9));
        assert_eq!(sys.particles.velocity[0], v);
    }
}
