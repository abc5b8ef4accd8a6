use crate::simulation::Simulation;
use crate::util::RangeExt;
use crate::{Scalar, Vec3};
use itertools::iproduct;
use na::Vector3;
use num::ToPrimitive;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::ops::Range;

pub trait InitialCondition {
    fn add_particles<S: Simulation>(&self, s: &mut S);

    /// Mean particle spacing, which sets the initial smoothing length.
    fn spacing(&self) -> Scalar;

    /// Mass per particle for a uniform `density`.
    fn particle_mass(&self, density: Scalar) -> Scalar;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Block {
    pub size: Range<Vec3>,
    pub spacing: Scalar,
    pub jitter: Vec3,
}

impl Default for Block {
    fn default() -> Self {
        Block {
            size: Vec3::zeros()..Vec3::from_element(1.),
            spacing: 1. / 32.,
            jitter: Vec3::zeros(),
        }
    }
}

impl Block {
    fn counts(&self) -> Vector3<usize> {
        (self.size.size() / self.spacing).map(|x| x.ceil().to_usize().unwrap_or(0))
    }
}

impl InitialCondition for Block {
    fn add_particles<S: Simulation>(&self, s: &mut S) {
        let mut rng = StdRng::from_seed([0; 32]);

        let min = self.size.start;
        let counts = self.counts();

        for (i, j, k) in iproduct!(0..counts.x, 0..counts.y, 0..counts.z) {
            let idx = Vector3::new(i, j, k);
            let pos = idx.cast::<Scalar>() * self.spacing + min;

            let rand: Vec3 = rng.gen::<[Scalar; 3]>().into();
            let jitter = rand.component_mul(&self.jitter) - self.jitter / 2.;

            s.add_particle(pos + jitter, Vec3::zeros());
        }
    }

    fn spacing(&self) -> Scalar {
        self.spacing
    }

    fn particle_mass(&self, density: Scalar) -> Scalar {
        density * self.spacing * self.spacing * self.spacing
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Sphere {
    pub num_particles: usize,
    pub center: Vec3,
    pub radius: Scalar,
}

impl Default for Sphere {
    fn default() -> Self {
        Sphere {
            num_particles: 10_000,
            center: Vec3::zeros(),
            radius: 1.,
        }
    }
}

impl Sphere {
    fn volume(&self) -> Scalar {
        4. / 3. * std::f64::consts::PI * self.radius.powi(3)
    }
}

impl InitialCondition for Sphere {
    fn add_particles<S: Simulation>(&self, s: &mut S) {
        let mut rng = StdRng::from_seed([0; 32]);

        for _ in 0..self.num_particles {
            // rejection sampling from the bounding cube
            let pos = loop {
                let rand: Vec3 = rng.gen::<[Scalar; 3]>().into();
                let pos = (rand * 2. - Vec3::from_element(1.)) * self.radius;

                if pos.magnitude_squared() < self.radius * self.radius {
                    break pos + self.center;
                }
            };

            s.add_particle(pos, Vec3::zeros());
        }
    }

    fn spacing(&self) -> Scalar {
        (self.volume() / self.num_particles.max(1) as Scalar).cbrt()
    }

    fn particle_mass(&self, density: Scalar) -> Scalar {
        density * self.volume() / self.num_particles.max(1) as Scalar
    }
}

/// Initial condition as it appears in a settings file.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitialConditionKind {
    Block(Block),
    Sphere(Sphere),
}

impl Default for InitialConditionKind {
    fn default() -> Self {
        InitialConditionKind::Block(Block::default())
    }
}

impl InitialConditionKind {
    pub fn add_particles<S: Simulation>(&self, s: &mut S) {
        match self {
            InitialConditionKind::Block(block) => block.add_particles(s),
            InitialConditionKind::Sphere(sphere) => sphere.add_particles(s),
        }
    }

    pub fn spacing(&self) -> Scalar {
        match self {
            InitialConditionKind::Block(block) => block.spacing(),
            InitialConditionKind::Sphere(sphere) => sphere.spacing(),
        }
    }

    pub fn particle_mass(&self, density: Scalar) -> Scalar {
        match self {
            InitialConditionKind::Block(block) => block.particle_mass(density),
            InitialConditionKind::Sphere(sphere) => sphere.particle_mass(density),
        }
    }
}
