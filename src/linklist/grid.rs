use crate::util::RangeExt;
use crate::{Scalar, Vec3};
use itertools::iproduct;
use na::Vector3;
use num::ToPrimitive;
use smallvec::SmallVec;
use std::ops::Range;

/// A 3d Coordinate composed of 3 integers.
pub type Coord = Vector3<usize>;

/// The cells adjacent to a cell, the cell itself included. Never more than 27.
pub type CellNeighbourhood = SmallVec<[usize; 27]>;

/// Round-off margin on the cell width, so two particles exactly one search radius apart can
/// never be two cells apart.
const CELL_WIDTH_MARGIN: Scalar = 1. + 1e-10;

/// Geometry of the uniform grid of cubical-ish cells used for neighbour finding. Every cell is
/// at least one search radius wide along each axis.
#[derive(Clone, Debug)]
pub struct CellGrid {
    pub origin: Vec3,
    pub cell_width: Vec3,
    pub dims: Coord,
    periodic: Option<Range<Vec3>>,
}

fn cells_along(extent: Scalar, search_radius: Scalar, max_cells: usize) -> usize {
    if !(extent > 0.) || !(search_radius > 0.) {
        return 1;
    }
    (extent / (search_radius * CELL_WIDTH_MARGIN))
        .floor()
        .to_usize()
        .unwrap_or(max_cells)
        .clamp(1, max_cells)
}

impl CellGrid {
    /// Grid over `bounds` with open boundaries. An axis with zero extent gets a single cell.
    pub fn open(bounds: Range<Vec3>, search_radius: Scalar, max_cells_per_dim: usize) -> Self {
        Self::new(bounds, search_radius, max_cells_per_dim, None)
    }

    /// Grid exactly covering a periodic box.
    pub fn periodic(domain: Range<Vec3>, search_radius: Scalar, max_cells_per_dim: usize) -> Self {
        Self::new(
            domain.clone(),
            search_radius,
            max_cells_per_dim,
            Some(domain),
        )
    }

    fn new(
        bounds: Range<Vec3>,
        search_radius: Scalar,
        max_cells_per_dim: usize,
        periodic: Option<Range<Vec3>>,
    ) -> Self {
        let extent = bounds.size();
        let dims = Coord::from_fn(|d, _| cells_along(extent[d], search_radius, max_cells_per_dim));
        let cell_width = Vec3::from_fn(|d, _| {
            if extent[d] > 0. {
                extent[d] / dims[d] as Scalar
            } else if search_radius > 0. {
                search_radius
            } else {
                1.
            }
        });

        CellGrid {
            origin: bounds.start,
            cell_width,
            dims,
            periodic,
        }
    }

    pub fn num_cells(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn periodic_domain(&self) -> Option<&Range<Vec3>> {
        self.periodic.as_ref()
    }

    pub fn coord_to_index(&self, i: Coord) -> usize {
        i.x + self.dims.x * i.y + self.dims.x * self.dims.y * i.z
    }

    pub fn index_to_coord(&self, mut i: usize) -> Coord {
        let z = i / (self.dims.x * self.dims.y);
        i -= z * self.dims.x * self.dims.y;
        let y = i / self.dims.x;
        let x = i % self.dims.x;
        Vector3::new(x, y, z)
    }

    /// Truncates a (wrapped, when periodic) position to a cell. Positions outside the grid are
    /// clamped onto its edge cells.
    pub fn position_to_coord(&self, x: Vec3) -> Coord {
        let x = match &self.periodic {
            Some(domain) => domain.wrap(x),
            None => x,
        };
        let rel = (x - self.origin).component_div(&self.cell_width);
        Coord::from_fn(|d, _| {
            rel[d]
                .floor()
                .to_usize()
                .unwrap_or(0)
                .min(self.dims[d] - 1)
        })
    }

    pub fn cell_index(&self, x: Vec3) -> usize {
        self.coord_to_index(self.position_to_coord(x))
    }

    /// The cells touching `cell`, in ascending order and without repeats. Wraps around when
    /// periodic, otherwise stops at the grid boundary.
    pub fn neighbour_cells(&self, cell: usize) -> CellNeighbourhood {
        let coord = self.index_to_coord(cell);

        let mut cells: CellNeighbourhood = if self.periodic.is_some() {
            let wrapped = |c: usize, n: usize| [(c + n - 1) % n, c, (c + 1) % n];
            let xs = wrapped(coord.x, self.dims.x);
            let ys = wrapped(coord.y, self.dims.y);
            let zs = wrapped(coord.z, self.dims.z);
            iproduct!(xs.iter(), ys.iter(), zs.iter())
                .map(|(&x, &y, &z)| self.coord_to_index(Vector3::new(x, y, z)))
                .collect()
        } else {
            iproduct!(
                coord.x.saturating_sub(1)..=(coord.x + 1).min(self.dims.x - 1),
                coord.y.saturating_sub(1)..=(coord.y + 1).min(self.dims.y - 1),
                coord.z.saturating_sub(1)..=(coord.z + 1).min(self.dims.z - 1)
            )
            .map(|(x, y, z)| self.coord_to_index(Vector3::new(x, y, z)))
            .collect()
        };

        cells.sort_unstable();
        cells.dedup();
        cells
    }
}
