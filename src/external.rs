//! Fixed external force fields, applied on the substeps together with sink gravity.

use crate::{Scalar, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExternalSample {
    pub accel: Vec3,
    pub potential: Scalar,
    /// Stable timestep the field itself imposes, before the `c_force` safety factor.
    pub dt: Scalar,
}

pub trait ExternalForce: Send + Sync {
    /// Acceleration on a particle with id `id` at `x`. Gas particles use their index and sink
    /// `s` uses `particles.len() + s`, so the ids never collide.
    fn force(&self, x: Vec3, h: Scalar, t: Scalar, id: usize) -> ExternalSample;

    /// Whether the field swallows a particle at `x`.
    fn accrete(&self, _x: Vec3, _h: Scalar, _mass: Scalar, _t: Scalar) -> bool {
        false
    }
}

/// A softened point mass fixed at `center`, with G = 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CentralPointMass {
    pub center: Vec3,
    pub mass: Scalar,
    pub accretion_radius: Scalar,
    #[serde(default)]
    pub softening: Scalar,
}

impl ExternalForce for CentralPointMass {
    fn force(&self, x: Vec3, _h: Scalar, _t: Scalar, _id: usize) -> ExternalSample {
        let dx = x - self.center;
        let r2 = dx.magnitude_squared() + self.softening * self.softening;
        let r = r2.sqrt();
        if r == 0. {
            return ExternalSample {
                accel: Vec3::zeros(),
                potential: 0.,
                dt: Scalar::INFINITY,
            };
        }
        ExternalSample {
            accel: -self.mass / (r2 * r) * dx,
            potential: -self.mass / r,
            dt: (r2 * r / self.mass).sqrt(),
        }
    }

    fn accrete(&self, x: Vec3, _h: Scalar, _mass: Scalar, _t: Scalar) -> bool {
        (x - self.center).magnitude_squared() < self.accretion_radius * self.accretion_radius
    }
}

/// Constant acceleration, e.g. gravity near a surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UniformField {
    pub g: Vec3,
}

impl ExternalForce for UniformField {
    fn force(&self, x: Vec3, _h: Scalar, _t: Scalar, _id: usize) -> ExternalSample {
        ExternalSample {
            accel: self.g,
            potential: -self.g.dot(&x),
            dt: Scalar::INFINITY,
        }
    }
}

/// External field as it appears in a settings file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExternalKind {
    CentralPointMass(CentralPointMass),
    Uniform(UniformField),
}

impl ExternalKind {
    pub fn build(&self) -> Box<dyn ExternalForce> {
        match self {
            ExternalKind::CentralPointMass(field) => Box::new(field.clone()),
            ExternalKind::Uniform(field) => Box::new(field.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_mass_is_attractive_and_accretes() {
        let field = CentralPointMass {
            center: Vec3::new(1., 0., 0.),
            mass: 4.,
            accretion_radius: 0.1,
            softening: 0.,
        };
        let sample = field.force(Vec3::new(3., 0., 0.), 0.1, 0., 0);
        assert!((sample.accel - Vec3::new(-1., 0., 0.)).magnitude() < 1e-12);
        assert!((sample.potential + 2.).abs() < 1e-12);
        assert!((sample.dt - (8f64 / 4.).sqrt()).abs() < 1e-12);

        assert!(field.accrete(Vec3::new(1.05, 0., 0.), 0.1, 1., 0.));
        assert!(!field.accrete(Vec3::new(1.5, 0., 0.), 0.1, 1., 0.));
    }

    #[test]
    fn uniform_field_never_limits_the_step() {
        let field = UniformField {
            g: Vec3::new(0., -1., 0.),
        };
        let sample = field.force(Vec3::new(0., 2., 0.), 0.1, 0., 0);
        assert_eq!(sample.accel, Vec3::new(0., -1., 0.));
        assert!(sample.dt.is_infinite());
        assert!(!field.accrete(Vec3::zeros(), 0.1, 1., 0.));
    }
}
