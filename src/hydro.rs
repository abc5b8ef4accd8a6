//! Compressible SPH forces: summation density, symmetric pressure gradient and Monaghan
//! artificial viscosity. This is the slow force evaluated once per corrector attempt.

use crate::config::{Features, Parameters};
use crate::eos::EquationOfState;
use crate::error::Result;
use crate::kernel::{CubicSpline, SmoothingKernel, RADKERN};
use crate::linklist::neighbours::NeighbourList;
use crate::linklist::LinkList;
use crate::part::{DerivativeArrays, Particles};
use crate::step::{Derivatives, DerivsInput, DerivsPass};
use crate::{Scalar, Vec3};
use rayon::prelude::*;
use std::sync::Arc;
use tracing::debug_span;

/// An inactive particle may not step more than this many times longer than any active
/// neighbour.
pub const NEIGHBOUR_DT_RATIO: Scalar = 4.;

/// New derivatives of one particle, produced in parallel and scattered afterwards.
enum Update {
    Active {
        i: usize,
        accel: Vec3,
        du_dt: Scalar,
        div_v: Scalar,
        curl_v: Vec3,
        dt: Scalar,
    },
    Limit {
        i: usize,
        dt: Scalar,
    },
}

pub struct Hydro {
    eos: Arc<dyn EquationOfState>,
    features: Features,
    params: Parameters,
    linklist: Option<LinkList>,
    density: Vec<Scalar>,
    builds: usize,
}

impl Hydro {
    pub fn new(eos: Arc<dyn EquationOfState>, features: Features, params: Parameters) -> Self {
        Self {
            eos,
            features,
            params,
            linklist: None,
            density: Vec::new(),
            builds: 0,
        }
    }

    /// Number of neighbour searches done so far.
    pub fn builds(&self) -> usize {
        self.builds
    }

    /// Summation density of the last `Full` pass.
    pub fn density(&self) -> &[Scalar] {
        &self.density
    }

    fn compute_density(list: &LinkList, particles: &Particles) -> Result<Vec<Scalar>> {
        let per_cell = list
            .occupied_cells()
            .par_iter()
            .map_init(
                || NeighbourList::for_linklist(list),
                |neighbours, &cell| -> Result<Vec<(usize, Scalar)>> {
                    list.get_neighbour_list(cell, particles, false, neighbours)?;
                    let neighbours: &NeighbourList = neighbours;
                    Ok(list
                        .members(cell)
                        .map(|i| {
                            let hi = particles.h[i];
                            let rho = particles.mass(i) * CubicSpline::value(Vec3::zeros(), hi)
                                + list
                                    .interacting(i, particles, neighbours)
                                    .map(|nb| {
                                        particles.mass(nb.index) * CubicSpline::value(nb.r_ij, hi)
                                    })
                                    .sum::<Scalar>();
                            (i, rho)
                        })
                        .collect())
                },
            )
            .collect::<Result<Vec<_>>>()?;

        let mut density = vec![0.; particles.len()];
        for (i, rho) in per_cell.into_iter().flatten() {
            density[i] = rho;
        }
        Ok(density)
    }

    fn alpha(&self, particles: &Particles, i: usize) -> Scalar {
        if self.features.variable_alpha {
            particles.alpha[i]
        } else {
            self.params.alpha
        }
    }

    fn force_on(
        &self,
        i: usize,
        input: &DerivsInput<'_>,
        list: &LinkList,
        neighbours: &NeighbourList,
    ) -> Update {
        let particles = input.particles;
        let predicted = input.predicted;
        let eos = self.eos.as_ref();

        let hi = particles.h[i];
        let vi = predicted.velocity[i];
        let rho_i = self.density[i];
        let p_i = eos.pressure(rho_i, predicted.energy[i]);
        let cs_i = eos.sound_speed(rho_i, predicted.energy[i]);
        let alpha_i = self.alpha(particles, i);

        let mut accel = Vec3::zeros();
        let mut du_dt = 0.;
        let mut div_v = 0.;
        let mut curl_v = Vec3::zeros();
        let mut vsig_max: Scalar = 0.;

        for nb in list.interacting(i, particles, neighbours) {
            let j = nb.index;
            let m_j = particles.mass(j);
            let rho_j = self.density[j];
            let p_j = eos.pressure(rho_j, predicted.energy[j]);
            let cs_j = eos.sound_speed(rho_j, predicted.energy[j]);

            let r_ij = nb.r_ij;
            let r = r_ij.magnitude();
            let v_ij = vi - predicted.velocity[j];
            let grad = 0.5 * (CubicSpline::gradient(r_ij, hi) + CubicSpline::gradient(r_ij, nb.h));
            let v_dot_r = v_ij.dot(&r_ij);

            let mut viscosity = 0.;
            if v_dot_r < 0. {
                let h_ij = 0.5 * (hi + nb.h);
                let mu = h_ij * v_dot_r / (r * r + 0.01 * h_ij * h_ij);
                let alpha_ij = 0.5 * (alpha_i + self.alpha(particles, j));
                let cs_ij = 0.5 * (cs_i + cs_j);
                viscosity =
                    (-alpha_ij * cs_ij * mu + self.params.beta * mu * mu) / (0.5 * (rho_i + rho_j));
            }
            let w_ij = if r > 0. { (v_dot_r / r).min(0.) } else { 0. };
            vsig_max = vsig_max.max(cs_i + cs_j - 3. * w_ij);

            accel -= m_j * (p_i / (rho_i * rho_i) + p_j / (rho_j * rho_j) + viscosity) * grad;
            du_dt += m_j * (p_i / (rho_i * rho_i) + 0.5 * viscosity) * v_ij.dot(&grad);
            div_v -= m_j / rho_i * v_ij.dot(&grad);
            curl_v -= m_j / rho_i * v_ij.cross(&grad);
        }

        let mut dt = Scalar::INFINITY;
        if vsig_max > 0. {
            dt = dt.min(self.params.c_cour * hi / vsig_max);
        }
        let a_mag = accel.magnitude();
        if a_mag > 0. {
            dt = dt.min(self.params.c_force * (hi / a_mag).sqrt());
        }

        Update::Active {
            i,
            accel,
            du_dt: if self.features.isothermal { 0. } else { du_dt },
            div_v,
            curl_v,
            dt,
        }
    }

    /// Cap on an inactive particle's step from the active particles around it.
    fn neighbour_limit(
        &self,
        i: usize,
        particles: &Particles,
        list: &LinkList,
        neighbours: &NeighbourList,
    ) -> Option<Update> {
        let dt_active = list
            .interacting(i, particles, neighbours)
            .filter(|nb| list.is_active(nb.index))
            .map(|nb| self.params.dtmax / (1u64 << particles.bin[nb.index]) as Scalar)
            .fold(Scalar::INFINITY, Scalar::min);
        if dt_active.is_finite() {
            Some(Update::Limit {
                i,
                dt: NEIGHBOUR_DT_RATIO * dt_active,
            })
        } else {
            None
        }
    }
}

impl Derivatives for Hydro {
    fn evaluate(&mut self, input: DerivsInput<'_>, out: &mut DerivativeArrays) -> Result<Scalar> {
        let _span = debug_span!("hydro", pass = ?input.pass, n_active = input.n_active).entered();
        let particles = input.particles;
        out.resize(particles.len());

        if input.pass == DerivsPass::Full || self.linklist.is_none() {
            let list = LinkList::build(particles, RADKERN, &self.params)?;
            if cfg!(debug_assertions) {
                list.validate(particles)?;
            }
            self.density = Self::compute_density(&list, particles)?;
            self.linklist = Some(list);
            self.builds += 1;
        }
        let list = match &self.linklist {
            Some(list) => list,
            None => return Ok(Scalar::INFINITY),
        };

        let this: &Hydro = self;
        let individual = this.features.individual_timesteps;
        let updates = list
            .occupied_cells()
            .par_iter()
            .map_init(
                || NeighbourList::for_linklist(list),
                |neighbours, &cell| -> Result<Vec<Update>> {
                    let has_active = list.head(cell).has_active;
                    if !has_active && !individual {
                        return Ok(Vec::new());
                    }
                    // a cell without active members only needs to see the active particles
                    list.get_neighbour_list(cell, particles, !has_active, neighbours)?;
                    let neighbours: &NeighbourList = neighbours;
                    Ok(list
                        .members(cell)
                        .filter_map(|i| {
                            if list.is_active(i) {
                                Some(this.force_on(i, &input, list, neighbours))
                            } else if individual {
                                this.neighbour_limit(i, particles, list, neighbours)
                            } else {
                                None
                            }
                        })
                        .collect())
                },
            )
            .collect::<Result<Vec<_>>>()?;

        let mut dtmin = Scalar::INFINITY;
        for update in updates.into_iter().flatten() {
            match update {
                Update::Active {
                    i,
                    accel,
                    du_dt,
                    div_v,
                    curl_v,
                    dt,
                } => {
                    out.accel[i] = accel;
                    out.du_dt[i] = du_dt;
                    out.d_b[i] = Vec3::zeros();
                    out.d_dust[i] = 0.;
                    out.div_v[i] = div_v;
                    out.curl_v[i] = curl_v;
                    out.div_b[i] = 0.;
                    out.curl_b[i] = Vec3::zeros();
                    out.dt_suggest[i] = dt;
                    dtmin = dtmin.min(dt);
                }
                Update::Limit { i, dt } => {
                    out.dt_suggest[i] = out.dt_suggest[i].min(dt);
                }
            }
        }
        Ok(dtmin)
    }
}
