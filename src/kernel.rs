use crate::{Scalar, Vec3};

/// Compact support radius of the kernel used throughout the crate, in units of `h`.
pub const RADKERN: Scalar = CubicSpline::RADIUS;

pub trait SmoothingKernel {
    /// Radius of compact support in units of `h`.
    const RADIUS: Scalar;

    fn value(r: Vec3, h: Scalar) -> Scalar;

    /// dW/d|r|.
    fn gradient_mag(r: Vec3, h: Scalar) -> Scalar;

    fn gradient(r: Vec3, h: Scalar) -> Vec3 {
        let r_mag = r.magnitude();
        if r_mag > 0. {
            r / r_mag * Self::gradient_mag(r, h)
        } else {
            Vec3::zeros()
        }
    }
}

/// The M4 cubic spline in three dimensions.
pub struct CubicSpline;

impl SmoothingKernel for CubicSpline {
    const RADIUS: Scalar = 2.;

    fn value(r: Vec3, h: Scalar) -> Scalar {
        let q = r.magnitude() / h;
        let c = 1. / (std::f64::consts::PI * h * h * h);
        if q < 1. {
            c * (1. - 1.5 * q * q + 0.75 * q * q * q)
        } else if q < 2. {
            let a = 2. - q;
            c * 0.25 * a * a * a
        } else {
            0.
        }
    }

    fn gradient_mag(r: Vec3, h: Scalar) -> Scalar {
        let q = r.magnitude() / h;
        let c = 1. / (std::f64::consts::PI * h * h * h * h);
        if q < 1. {
            c * (-3. * q + 2.25 * q * q)
        } else if q < 2. {
            let a = 2. - q;
            c * -0.75 * a * a
        } else {
            0.
        }
    }
}
