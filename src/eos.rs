use crate::Scalar;
use serde::{Deserialize, Serialize};

/// Closure relation used for pressure and sound speed.
pub trait EquationOfState: Send + Sync {
    fn pressure(&self, density: Scalar, energy: Scalar) -> Scalar;

    fn sound_speed(&self, density: Scalar, energy: Scalar) -> Scalar;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Isothermal {
    pub cs: Scalar,
}

impl EquationOfState for Isothermal {
    fn pressure(&self, density: Scalar, _energy: Scalar) -> Scalar {
        self.cs * self.cs * density
    }

    fn sound_speed(&self, _density: Scalar, _energy: Scalar) -> Scalar {
        self.cs
    }
}

/// Ideal gas, `P = (γ - 1) ρ u`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adiabatic {
    pub gamma: Scalar,
}

impl EquationOfState for Adiabatic {
    fn pressure(&self, density: Scalar, energy: Scalar) -> Scalar {
        (self.gamma - 1.) * density * energy.max(0.)
    }

    fn sound_speed(&self, _density: Scalar, energy: Scalar) -> Scalar {
        (self.gamma * (self.gamma - 1.) * energy.max(0.)).sqrt()
    }
}

/// Equation of state as it appears in a settings file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EosKind {
    Isothermal { cs: Scalar },
    Adiabatic { gamma: Scalar },
}

impl Default for EosKind {
    fn default() -> Self {
        EosKind::Isothermal { cs: 1. }
    }
}

impl EosKind {
    pub fn build(&self) -> std::sync::Arc<dyn EquationOfState> {
        match *self {
            EosKind::Isothermal { cs } => std::sync::Arc::new(Isothermal { cs }),
            EosKind::Adiabatic { gamma } => std::sync::Arc::new(Adiabatic { gamma }),
        }
    }
}

/// Density implied by a smoothing length, `ρ = m (h_fact / h)^3`.
#[inline]
pub fn density_from_h(mass: Scalar, h: Scalar, hfact: Scalar) -> Scalar {
    let x = hfact / h.abs();
    mass * x * x * x
}
