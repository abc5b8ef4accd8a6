//! Candidate neighbour lists gathered from the cells around a cell.

use super::LinkList;
use crate::error::{EngineError, Result, WarningBudget};
use crate::part::Particles;
use crate::{Scalar, Vec3};
use tracing::warn;

static DUPLICATE_WARNINGS: WarningBudget = WarningBudget::new(10);

/// Superset of the neighbours of every particle in one cell: all members of the cell and the
/// cells adjacent to it. The first `cache_size` entries also carry a copy of position and `h`.
#[derive(Clone, Debug, Default)]
pub struct NeighbourList {
    indices: Vec<usize>,
    cache: Vec<(Vec3, Scalar)>,
    cache_size: usize,
}

/// A particle actually inside the kernel support of another.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Neighbour {
    pub index: usize,
    /// `x_i - x_j`, minimum image when periodic.
    pub r_ij: Vec3,
    pub h: Scalar,
}

impl NeighbourList {
    pub fn with_cache_size(cache_size: usize) -> Self {
        Self {
            indices: Vec::new(),
            cache: Vec::with_capacity(cache_size),
            cache_size,
        }
    }

    /// A list whose cache is sized the way `linklist` was configured.
    pub fn for_linklist(linklist: &LinkList) -> Self {
        Self::with_cache_size(linklist.cache_size())
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Whether some entries have to be read from the particle arrays.
    pub fn is_cache_truncated(&self) -> bool {
        self.indices.len() > self.cache.len()
    }

    /// Position and smoothing length of the `k`-th entry, from the cache when it is there.
    #[inline]
    pub fn xyzh(&self, k: usize, particles: &Particles) -> (Vec3, Scalar) {
        match self.cache.get(k) {
            Some(&cached) => cached,
            None => {
                let j = self.indices[k];
                (particles.position[j], particles.h[j])
            }
        }
    }

    fn clear(&mut self) {
        self.indices.clear();
        self.cache.clear();
    }
}

impl LinkList {
    /// Fills `list` with every member of `cell` and of its adjacent cells. With `active_only`,
    /// inactive particles are skipped, as are whole cells flagged as having none.
    pub fn get_neighbour_list(
        &self,
        cell: usize,
        particles: &Particles,
        active_only: bool,
        list: &mut NeighbourList,
    ) -> Result<()> {
        list.clear();
        let mut count = 0;

        for c in self.grid().neighbour_cells(cell) {
            if active_only && !self.head(c).has_active {
                continue;
            }
            for j in self.members(c) {
                if active_only && !self.is_active(j) {
                    continue;
                }
                count += 1;
                if count <= self.max_neighbours {
                    list.indices.push(j);
                }
            }
        }

        if count > self.max_neighbours {
            return Err(EngineError::NeighbourOverflow {
                cell,
                count,
                capacity: self.max_neighbours,
            });
        }

        let cached = list.indices.len().min(list.cache_size);
        list.cache.extend(
            list.indices[..cached]
                .iter()
                .map(|&j| (particles.position[j], particles.h[j])),
        );

        if cfg!(debug_assertions) {
            let mut sorted = list.indices.clone();
            sorted.sort_unstable();
            if sorted.windows(2).any(|w| w[0] == w[1]) && DUPLICATE_WARNINGS.take() {
                warn!(cell, "neighbour list contains duplicates");
            }
        }

        Ok(())
    }

    /// The entries of `list` within `radkern * max(h_i, h_j)` of particle `i`, excluding `i`.
    pub fn interacting<'a>(
        &'a self,
        i: usize,
        particles: &'a Particles,
        list: &'a NeighbourList,
    ) -> impl Iterator<Item = Neighbour> + 'a {
        let xi = particles.position[i];
        let hi = particles.h[i];
        list.indices
            .iter()
            .enumerate()
            .filter_map(move |(k, &j)| {
                if j == i {
                    return None;
                }
                let (xj, hj) = list.xyzh(k, particles);
                let r_ij = self.separation(xi, xj);
                let reach = self.radkern() * hi.max(hj);
                if r_ij.magnitude_squared() < reach * reach {
                    Some(Neighbour {
                        index: j,
                        r_ij,
                        h: hj,
                    })
                } else {
                    None
                }
            })
    }
}
