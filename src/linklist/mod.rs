//! Cell-based linked list used to find SPH neighbours.
//!
//! Space is cut into a uniform grid of cells at least one search radius (`radkern * hmax`)
//! wide, so every interacting pair sits in the same or adjacent cells. Each cell heads a singly
//! linked chain threading its particles through `next`.

pub mod grid;
pub mod neighbours;

use crate::config::Parameters;
use crate::error::{EngineError, Result};
use crate::part::{is_dead_or_accreted, Particles};
use crate::util::{RangeExt, VecExt};
use crate::{Scalar, Vec3};
use grid::CellGrid;
use rayon::prelude::*;
use std::ops::Range;
use tracing::debug_span;

/// Head of a cell's chain, plus whether any particle in it is active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CellHead {
    pub first_member: Option<usize>,
    pub has_active: bool,
}

#[derive(Debug)]
pub struct LinkList {
    grid: CellGrid,
    head: Vec<CellHead>,
    next: Vec<Option<usize>>,
    cell_of: Vec<Option<usize>>,
    /// Activity of each particle as decided at build time.
    active: Vec<bool>,
    occupied: Vec<usize>,
    radkern: Scalar,
    search_radius: Scalar,
    max_neighbours: usize,
    cache_size: usize,
}

/// Bounding box of the live particles, degenerate at the origin if there are none.
fn live_bounds(particles: &Particles) -> Range<Vec3> {
    particles
        .live_indices()
        .map(|i| particles.position[i])
        .fold(None, |bounds: Option<Range<Vec3>>, x| match bounds {
            None => Some(x..x),
            Some(b) => Some(b.start.component_min(&x)..b.end.component_max(&x)),
        })
        .unwrap_or_else(|| Vec3::zeros()..Vec3::zeros())
}

impl LinkList {
    /// Builds the list, taking activity from the particles' phase flags.
    pub fn build(particles: &Particles, radkern: Scalar, params: &Parameters) -> Result<Self> {
        Self::build_with(particles, radkern, params, |i| particles.phase[i].active)
    }

    /// Builds the list with an explicit activity predicate. Dead and accreted particles are left
    /// out of every chain.
    pub fn build_with<F>(
        particles: &Particles,
        radkern: Scalar,
        params: &Parameters,
        is_active: F,
    ) -> Result<Self>
    where
        F: Fn(usize) -> bool + Sync,
    {
        let n = particles.len();
        let search_radius = radkern * particles.max_h();
        let _span = debug_span!("linklist_build", n, search_radius).entered();

        let grid = match &params.periodic {
            Some(domain) => {
                if domain.size().iter().any(|&l| l < 2. * search_radius) {
                    return Err(EngineError::InvalidParameter(format!(
                        "periodic box {:?} is narrower than twice the search radius {}",
                        domain, search_radius
                    )));
                }
                CellGrid::periodic(domain.clone(), search_radius, params.max_cells_per_dim)
            }
            None => CellGrid::open(live_bounds(particles), search_radius, params.max_cells_per_dim),
        };

        let cell_of: Vec<Option<usize>> = particles
            .position
            .par_iter()
            .zip(particles.h.par_iter())
            .map(|(&x, &h)| {
                if is_dead_or_accreted(h) {
                    None
                } else {
                    Some(grid.cell_index(x))
                }
            })
            .collect();
        let active: Vec<bool> = (0..n)
            .into_par_iter()
            .map(|i| cell_of[i].is_some() && is_active(i))
            .collect();

        let mut head = vec![CellHead::default(); grid.num_cells()];
        let mut next = vec![None; n];
        let mut occupied = Vec::new();

        // prepend in reverse so every chain comes out in ascending particle order
        for i in (0..n).rev() {
            if let Some(c) = cell_of[i] {
                let cell = &mut head[c];
                if cell.first_member.is_none() {
                    occupied.push(c);
                }
                next[i] = cell.first_member;
                cell.first_member = Some(i);
                cell.has_active |= active[i];
            }
        }
        occupied.sort_unstable();

        tracing::debug!(
            ncells = head.len(),
            occupied = occupied.len(),
            "built link list"
        );

        Ok(LinkList {
            grid,
            head,
            next,
            cell_of,
            active,
            occupied,
            radkern,
            search_radius,
            max_neighbours: params.max_neighbours,
            cache_size: params.neighbour_cache_size,
        })
    }

    pub fn grid(&self) -> &CellGrid {
        &self.grid
    }

    /// Total number of cells; always at least one.
    pub fn ncells(&self) -> usize {
        self.head.len()
    }

    pub fn head(&self, cell: usize) -> CellHead {
        self.head[cell]
    }

    /// Cells with at least one member, ascending.
    pub fn occupied_cells(&self) -> &[usize] {
        &self.occupied
    }

    pub fn active_cells(&self) -> impl Iterator<Item = usize> + '_ {
        self.occupied
            .iter()
            .copied()
            .filter(move |&c| self.head[c].has_active)
    }

    /// Particles of `cell` in ascending order.
    pub fn members(&self, cell: usize) -> Members<'_> {
        Members {
            next: &self.next,
            current: self.head[cell].first_member,
        }
    }

    pub fn cell_of(&self, i: usize) -> Option<usize> {
        self.cell_of.get(i).copied().flatten()
    }

    /// Whether particle `i` counted as active when the list was built.
    #[inline]
    pub fn is_active(&self, i: usize) -> bool {
        self.active.get(i).copied().unwrap_or(false)
    }

    pub fn search_radius(&self) -> Scalar {
        self.search_radius
    }

    pub fn radkern(&self) -> Scalar {
        self.radkern
    }

    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// `xi - xj`, taking the nearest periodic image when the box is periodic.
    #[inline]
    pub fn separation(&self, xi: Vec3, xj: Vec3) -> Vec3 {
        match self.grid.periodic_domain() {
            Some(domain) => domain.min_image(xi - xj),
            None => xi - xj,
        }
    }

    /// Checks that every live particle is in exactly one chain, the chain of its own cell, and
    /// that each cell's active flag matches the activity its members were built with.
    pub fn validate(&self, particles: &Particles) -> Result<()> {
        let n = particles.len();
        if self.next.len() != n || self.active.len() != n {
            return Err(EngineError::CorruptLinkList(format!(
                "built for {} particles, have {}",
                self.next.len(),
                n
            )));
        }

        let mut seen = vec![false; n];
        for (c, head) in self.head.iter().enumerate() {
            let mut has_active = false;
            let mut link = head.first_member;
            while let Some(i) = link {
                if i >= n {
                    return Err(EngineError::CorruptLinkList(format!(
                        "cell {} links to particle {} of {}",
                        c, i, n
                    )));
                }
                if seen[i] {
                    return Err(EngineError::CorruptLinkList(format!(
                        "particle {} reached twice (from cell {})",
                        i, c
                    )));
                }
                seen[i] = true;
                if !particles.is_live(i) {
                    return Err(EngineError::CorruptLinkList(format!(
                        "dead particle {} in cell {}",
                        i, c
                    )));
                }
                if self.cell_of[i] != Some(c) {
                    return Err(EngineError::CorruptLinkList(format!(
                        "particle {} is in chain {} but belongs to cell {:?}",
                        i, c, self.cell_of[i]
                    )));
                }
                has_active |= self.active[i];
                link = self.next[i];
            }
            if has_active != head.has_active {
                return Err(EngineError::CorruptLinkList(format!(
                    "active flag of cell {} is {}, members say {}",
                    c, head.has_active, has_active
                )));
            }
        }

        if let Some(i) = (0..n).find(|&i| self.active[i] && !seen[i]) {
            return Err(EngineError::CorruptLinkList(format!(
                "particle {} is flagged active but is in no cell",
                i
            )));
        }

        match particles.live_indices().find(|&i| !seen[i]) {
            Some(i) => Err(EngineError::CorruptLinkList(format!(
                "live particle {} is in no cell",
                i
            ))),
            None => Ok(()),
        }
    }
}

/// Walks one cell's chain.
pub struct Members<'a> {
    next: &'a [Option<usize>],
    current: Option<usize>,
}

impl<'a> Iterator for Members<'a> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let i = self.current?;
        self.current = self.next[i];
        Some(i)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::part::{ParticleKind, Particles};
    use crate::{Scalar, Vec3};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Particles scattered in the unit cube with `h` in `[0.02, 0.08)`. Roughly a tenth are
    /// dead or accreted and a third inactive.
    pub fn scattered_particles(n: usize, seed: u64) -> Particles {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut particles = Particles::new([1. / n.max(1) as Scalar, 0., 0.]);
        for _ in 0..n {
            let x = Vec3::new(rng.gen(), rng.gen(), rng.gen());
            let h = rng.gen_range(0.02..0.08);
            let i = particles.add_particle(ParticleKind::Gas, x, h, Vec3::zeros(), 0.1);
            particles.phase[i].active = rng.gen_bool(2. / 3.);
            match rng.gen_range(0..20) {
                0 => particles.kill(i),
                1 => particles.mark_accreted(i),
                _ => {}
            }
        }
        particles
    }
}

#[cfg(test)]
mod tests {
    use super::testing::scattered_particles;
    use super::*;
    use crate::kernel::RADKERN;
    use crate::part::ParticleKind;
    use proptest::prelude::*;

    fn chained(list: &LinkList) -> Vec<usize> {
        let mut all: Vec<usize> = list
            .occupied_cells()
            .iter()
            .flat_map(|&c| list.members(c))
            .collect();
        all.sort_unstable();
        all
    }

    proptest! {
        #[test]
        fn every_live_particle_is_in_one_chain(seed in 0u64..1000, n in 0usize..300) {
            let particles = scattered_particles(n, seed);
            let list = LinkList::build(&particles, RADKERN, &Parameters::default()).unwrap();

            prop_assert!(list.validate(&particles).is_ok());
            prop_assert_eq!(chained(&list), particles.live_indices().collect::<Vec<_>>());
            for c in list.occupied_cells() {
                let members: Vec<usize> = list.members(*c).collect();
                prop_assert!(members.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    #[test]
    fn active_cells_partition_active_particles() {
        let particles = scattered_particles(400, 3);
        let list = LinkList::build(&particles, RADKERN, &Parameters::default()).unwrap();

        let mut in_active_cells: Vec<usize> = list
            .active_cells()
            .flat_map(|c| list.members(c))
            .filter(|&i| particles.phase[i].active)
            .collect();
        in_active_cells.sort_unstable();
        let active: Vec<usize> = particles
            .live_indices()
            .filter(|&i| particles.phase[i].active)
            .collect();
        assert_eq!(in_active_cells, active);

        for &c in list.occupied_cells() {
            let any_active = list.members(c).any(|i| particles.phase[i].active);
            assert_eq!(list.head(c).has_active, any_active);
        }
    }

    #[test]
    fn explicit_activity_predicate() {
        let particles = scattered_particles(100, 5);
        let list =
            LinkList::build_with(&particles, RADKERN, &Parameters::default(), |_| false).unwrap();
        assert_eq!(list.active_cells().count(), 0);
        assert!(!list.occupied_cells().is_empty());
        assert!((0..particles.len()).all(|i| !list.is_active(i)));
        list.validate(&particles).unwrap();

        // the predicate wins over the phase flags, but never makes a dead particle active
        let list =
            LinkList::build_with(&particles, RADKERN, &Parameters::default(), |_| true).unwrap();
        list.validate(&particles).unwrap();
        for i in 0..particles.len() {
            assert_eq!(list.is_active(i), particles.is_live(i));
        }
        assert_eq!(list.active_cells().count(), list.occupied_cells().len());
    }

    #[test]
    fn collinear_particles() {
        for axis in 0..3 {
            let mut particles = Particles::new([1., 0., 0.]);
            for k in 0..10 {
                let mut x = Vec3::from_element(0.5);
                x[axis] = k as Scalar * 0.1;
                particles.add_particle(ParticleKind::Gas, x, 0.03, Vec3::zeros(), 0.1);
            }
            let list = LinkList::build(&particles, RADKERN, &Parameters::default()).unwrap();
            assert!(list.ncells() > 0);
            list.validate(&particles).unwrap();
            assert_eq!(chained(&list), (0..10).collect::<Vec<_>>());
            for d in 0..3 {
                if d != axis {
                    assert_eq!(list.grid().dims[d], 1);
                }
            }
        }
    }

    #[test]
    fn no_live_particles() {
        let mut particles = Particles::new([1., 0., 0.]);
        particles.add_particle(ParticleKind::Gas, Vec3::zeros(), 0.1, Vec3::zeros(), 0.1);
        particles.kill(0);
        let list = LinkList::build(&particles, RADKERN, &Parameters::default()).unwrap();
        assert_eq!(list.ncells(), 1);
        assert!(list.occupied_cells().is_empty());
        assert_eq!(list.cell_of(0), None);
        list.validate(&particles).unwrap();
    }

    #[test]
    fn periodic_box_must_fit_the_search_radius() {
        let particles = scattered_particles(50, 9);
        let params = Parameters {
            periodic: Some(Vec3::zeros()..Vec3::new(1., 1., 0.1)),
            ..Default::default()
        };
        assert!(matches!(
            LinkList::build(&particles, RADKERN, &params),
            Err(EngineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn corruption_is_detected() {
        let particles = scattered_particles(50, 11);
        let mut list = LinkList::build(&particles, RADKERN, &Parameters::default()).unwrap();
        let c = list.occupied_cells()[0];
        let first = list.head[c].first_member.unwrap();
        // cycle the chain back on itself
        list.next[first] = Some(first);
        assert!(matches!(
            list.validate(&particles),
            Err(EngineError::CorruptLinkList(_))
        ));
    }
}
