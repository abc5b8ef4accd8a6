use crate::{Scalar, Vec3};
use std::ops::Range;

/// Checks `df` against a central finite difference of `f` at random points in `domain`.
/// Returns the number of samples whose relative error exceeded `100 * eps`.
#[cfg(test)]
pub fn diff_test<F, DF>(f: F, df: DF, domain: Range<Vec3>, eps: Scalar) -> usize
where
    F: Fn(Vec3) -> Scalar,
    DF: Fn(Vec3) -> Vec3,
{
    let mut failures = 0;
    for _ in 0..1000 {
        let x0 = Vec3::new_random().component_mul(&domain.size()) + domain.start;
        let dx = (2. * Vec3::new_random() - Vec3::ones()) * eps;

        let x1 = x0 + dx;

        let a0 = f(x0);
        let a1 = f(x1);

        let d0 = df(x0);
        let d1 = df(x1);

        let u = (a1 - a0) / eps;
        let v = (d0 + d1).dot(&dx) / (2. * eps);

        let err = (u - v).abs();
        let scale = Scalar::max(u.abs(), v.abs());
        if scale == 0. {
            continue;
        }

        if err / scale > 100. * eps && err > 1e-9 {
            eprintln!(
                "Diff Test Failed: {:?} -- {:?} vs {:?} at {:?}",
                err, u, v, x0
            );
            failures += 1;
        }
    }
    failures
}

pub trait RangeExt {
    fn size(&self) -> Vec3;

    fn contains_point(&self, x: &Vec3) -> bool;

    /// Maps `x` back into the box, treating it as periodic.
    fn wrap(&self, x: Vec3) -> Vec3;

    /// Minimum-image version of the separation `dx` in a periodic box.
    fn min_image(&self, dx: Vec3) -> Vec3;
}

impl RangeExt for Range<Vec3> {
    fn size(&self) -> Vec3 {
        self.end - self.start
    }

    fn contains_point(&self, x: &Vec3) -> bool {
        self.start.all_le(x) && self.end.all_gt(x)
    }

    fn wrap(&self, x: Vec3) -> Vec3 {
        let size = self.size();
        let mut wrapped = x;
        for d in 0..3 {
            let offset = x[d] - self.start[d];
            wrapped[d] = self.start[d] + offset - size[d] * (offset / size[d]).floor();
            // `floor` can round a tiny negative offset up to exactly `size`
            if wrapped[d] >= self.end[d] {
                wrapped[d] = self.start[d];
            }
        }
        wrapped
    }

    fn min_image(&self, dx: Vec3) -> Vec3 {
        let size = self.size();
        dx.zip_map(&size, |d, l| d - l * (d / l).round())
    }
}

pub trait VecExt {
    fn all_le(&self, other: &Self) -> bool;

    fn all_gt(&self, other: &Self) -> bool;

    fn component_max(&self, other: &Self) -> Self;

    fn component_min(&self, other: &Self) -> Self;

    fn ones() -> Self;
}

impl VecExt for Vec3 {
    fn all_le(&self, other: &Self) -> bool {
        self.x <= other.x && self.y <= other.y && self.z <= other.z
    }

    fn all_gt(&self, other: &Self) -> bool {
        self.x > other.x && self.y > other.y && self.z > other.z
    }

    fn component_max(&self, other: &Self) -> Self {
        self.zip_map(other, |a, b| a.max(b))
    }

    fn component_min(&self, other: &Self) -> Self {
        self.zip_map(other, |a, b| a.min(b))
    }

    fn ones() -> Self {
        Self::from_element(1.)
    }
}
