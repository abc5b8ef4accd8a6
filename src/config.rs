use crate::error::{EngineError, Result};
use crate::util::RangeExt;
use crate::{Scalar, Vec3};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Physics switched on for a run. Chosen once at startup; the integrator only touches the
/// per-particle arrays a feature owns when that feature is enabled.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Features {
    /// Evolve the magnetic field variable `b_evol`.
    pub mhd: bool,
    /// Evolve the dust fraction.
    pub dust: bool,
    /// No energy equation: the internal energy is never predicted or corrected.
    pub isothermal: bool,
    /// Power-of-two per-particle time bins instead of one global step.
    pub individual_timesteps: bool,
    /// Per-particle artificial viscosity coefficient with a decay switch.
    pub variable_alpha: bool,
}

/// A struct containing all of the numerical parameters consumed by the neighbour search and
/// the integrator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Parameters {
    /// Tolerance on the velocity error in the corrector. Values `>= 100` switch the check off.
    pub tolv: Scalar,
    /// Target error used to derive the next timestep from the corrector error.
    pub errtol: Scalar,
    /// Maximum number of corrector attempts before the step is declared unstable.
    pub max_corrector_iterations: usize,
    /// Safety factor on force-limited timesteps.
    pub c_force: Scalar,
    /// Courant number.
    pub c_cour: Scalar,
    /// Largest allowed timestep; time bin 0.
    pub dtmax: Scalar,
    /// Ratio of smoothing length to mean particle spacing.
    pub hfact: Scalar,
    /// Minimum (or fixed, without `variable_alpha`) artificial viscosity coefficient.
    pub alpha: Scalar,
    /// Upper bound of the viscosity switch.
    pub alphamax: Scalar,
    /// Quadratic artificial viscosity coefficient.
    pub beta: Scalar,
    /// Decay constant of the viscosity switch, in units of the sound crossing time of `h`.
    pub avdecayconst: Scalar,
    /// Velocity damping rate applied with the external forces. Zero disables it.
    pub damping: Scalar,
    /// Periodic box. `None` means open boundaries.
    pub periodic: Option<Range<Vec3>>,
    /// Capacity of a single neighbour list.
    pub max_neighbours: usize,
    /// Number of neighbour positions cached per query.
    pub neighbour_cache_size: usize,
    /// Upper limit on the number of cells along each axis.
    pub max_cells_per_dim: usize,
    /// Capacity of the sink particle arrays.
    pub max_sinks: usize,
    /// Substep count above which a step is reported as heavily substepped.
    pub max_substeps_warning: usize,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            tolv: 1e-2,
            errtol: 1e-2,
            max_corrector_iterations: 30,
            c_force: 0.25,
            c_cour: 0.3,
            dtmax: 0.1,
            hfact: 1.2,
            alpha: 0.1,
            alphamax: 1.,
            beta: 2.,
            avdecayconst: 0.1,
            damping: 0.,
            periodic: None,
            max_neighbours: 200_000,
            neighbour_cache_size: 12_000,
            max_cells_per_dim: 64,
            max_sinks: 1000,
            max_substeps_warning: 1000,
        }
    }
}

impl Parameters {
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &str, value: Scalar) -> Result<()> {
            if value > 0. && value.is_finite() {
                Ok(())
            } else {
                Err(EngineError::InvalidParameter(format!(
                    "{} must be positive and finite, got {}",
                    name, value
                )))
            }
        }

        positive("tolv", self.tolv)?;
        positive("errtol", self.errtol)?;
        positive("c_force", self.c_force)?;
        positive("c_cour", self.c_cour)?;
        positive("dtmax", self.dtmax)?;
        positive("hfact", self.hfact)?;
        positive("avdecayconst", self.avdecayconst)?;

        if self.alpha < 0. || self.alphamax < self.alpha {
            return Err(EngineError::InvalidParameter(format!(
                "need 0 <= alpha <= alphamax, got alpha = {}, alphamax = {}",
                self.alpha, self.alphamax
            )));
        }
        if self.damping < 0. {
            return Err(EngineError::InvalidParameter(format!(
                "damping must not be negative, got {}",
                self.damping
            )));
        }
        if self.max_corrector_iterations == 0 || self.max_neighbours == 0 {
            return Err(EngineError::InvalidParameter(
                "max_corrector_iterations and max_neighbours must be at least 1".to_string(),
            ));
        }
        if self.max_cells_per_dim == 0 {
            return Err(EngineError::InvalidParameter(
                "max_cells_per_dim must be at least 1".to_string(),
            ));
        }
        if let Some(domain) = &self.periodic {
            if !domain.size().iter().all(|&l| l > 0.) {
                return Err(EngineError::InvalidParameter(format!(
                    "periodic box has non-positive extent: {:?}",
                    domain
                )));
            }
        }
        Ok(())
    }

    /// Whether the corrector compares predicted and corrected velocities at all.
    pub fn checks_velocity_error(&self) -> bool {
        self.tolv < 1e2
    }
}
