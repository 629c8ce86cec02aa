use std::sync::atomic::{AtomicI32, Ordering};

use enum_dispatch::enum_dispatch;
use rayon::prelude::*;

use crate::{
    concurrency::par_iter_mut1,
    error::{try_vec_from_fn, SimulationError},
    floating_type_mod::FT,
    simulation_parameters::NeighborhoodSearchAlgorithm,
    V2,
};

const EMPTY_CELL: i32 = -1;

/// Shortest displacement `a - b` on a domain that is periodic in x with period
/// `domain_width` and unbounded in y.
#[inline(always)]
pub fn periodic_delta(a: V2, b: V2, domain_width: FT) -> V2 {
    let mut d = a - b;
    d.x -= domain_width * (d.x / domain_width).round();
    d
}

/// Wrap `x` into `[0, domain_width)`.
#[inline(always)]
pub fn wrap_x(x: FT, domain_width: FT) -> FT {
    let w = x.rem_euclid(domain_width);
    // rem_euclid can round up to exactly the period for tiny negative inputs
    if w >= domain_width {
        0.
    } else {
        w
    }
}

/// Cell geometry shared by every grid over one domain.
///
/// Cells are at least `h` wide in both directions, so the 3x3 stencil around a
/// point contains every point closer than `h`. In x the domain width is split
/// into a whole number of cells (the last column must touch the first one); in
/// y cells are exactly `h` high and the top row may stick out of the domain.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridLayout {
    cells_x: usize,
    cells_y: usize,
    cell_width: FT,
    cell_height: FT,
    domain_width: FT,
}

impl GridLayout {
    pub fn new(domain_width: FT, domain_height: FT, h: FT) -> GridLayout {
        let h = h.max(1e-6);
        let cells_x = ((domain_width / h).floor() as usize).max(1);
        let cells_y = ((domain_height / h).ceil() as usize).max(1);

        GridLayout {
            cells_x,
            cells_y,
            cell_width: domain_width / cells_x as FT,
            cell_height: h,
            domain_width,
        }
    }

    pub fn cells_x(&self) -> usize {
        self.cells_x
    }

    pub fn cells_y(&self) -> usize {
        self.cells_y
    }

    pub fn num_cells(&self) -> usize {
        self.cells_x * self.cells_y
    }

    pub fn domain_width(&self) -> FT {
        self.domain_width
    }

    /// Periodic in x, clamped in y.
    #[inline(always)]
    pub fn cell_coord(&self, p: V2) -> (usize, usize) {
        let cx = ((p.x / self.cell_width).floor() as i64).rem_euclid(self.cells_x as i64) as usize;
        let cy = ((p.y / self.cell_height).floor() as i64).clamp(0, self.cells_y as i64 - 1) as usize;
        (cx, cy)
    }

    #[inline(always)]
    pub fn cell_index(&self, p: V2) -> usize {
        let (cx, cy) = self.cell_coord(p);
        cy * self.cells_x + cx
    }

    /// Visit every distinct cell of the 3x3 stencil around `p`.
    #[inline(always)]
    pub fn for_each_stencil_cell(&self, p: V2, mut f: impl FnMut(usize)) {
        let (cx, cy) = self.cell_coord(p);
        let w = self.cells_x;
        let columns = [(cx + w - 1) % w, cx, (cx + 1) % w];
        // with fewer than three columns the wrapped neighbors coincide
        let columns = &columns[..w.min(3)];

        let y_start = cy.saturating_sub(1);
        let y_end = usize::min(cy + 1, self.cells_y - 1);
        for y in y_start..=y_end {
            for &x in columns {
                f(y * w + x);
            }
        }
    }

    #[inline(always)]
    pub fn periodic_delta(&self, a: V2, b: V2) -> V2 {
        periodic_delta(a, b, self.domain_width)
    }
}

#[enum_dispatch]
pub trait SpatialGridTrait {
    fn layout(&self) -> &GridLayout;

    /// Forget all points.
    fn clear(&mut self);

    /// Clear the grid and insert `positions[i]` with index `i` for all `i`.
    fn rebuild(&mut self, positions: &[V2]);

    /// Calls `f` with every index stored in the 3x3 cell stencil around `p`.
    /// Candidates are not filtered by distance.
    fn for_each_neighbor(&self, p: V2, f: impl FnMut(usize));
}

#[enum_dispatch(SpatialGridTrait)]
pub enum SpatialGrid {
    LinkedCellGrid(LinkedCellGrid),
    SortedCellGrid(SortedCellGrid),
}

impl SpatialGrid {
    /// `capacity` is the number of points the grid is sized for up front.
    pub fn new(
        algorithm: NeighborhoodSearchAlgorithm,
        layout: GridLayout,
        capacity: usize,
    ) -> Result<SpatialGrid, SimulationError> {
        Ok(match algorithm {
            NeighborhoodSearchAlgorithm::LinkedList => LinkedCellGrid::new(layout, capacity)?.into(),
            NeighborhoodSearchAlgorithm::CountingSort => SortedCellGrid::new(layout, capacity)?.into(),
        })
    }

    /// Calls `f(j, x_i - x_j, |x_i - x_j|^2)` for every stored point `j` closer
    /// than `radius` to `p` (periodic in x). `positions` are the positions the grid
    /// was built from.
    #[inline(always)]
    pub fn for_each_neighbor_within(
        &self,
        p: V2,
        positions: &[V2],
        radius: FT,
        mut f: impl FnMut(usize, V2, FT),
    ) {
        let layout = *self.layout();
        let radius_sq = radius * radius;
        self.for_each_neighbor(p, |j| {
            let diff = layout.periodic_delta(p, positions[j]);
            let dist_sq = diff.norm_squared();
            if dist_sq < radius_sq {
                f(j, diff, dist_sq);
            }
        });
    }
}

/// Cell heads plus a "next" link per point. Points are prepended to their
/// cell's list with an atomic exchange of the head, so concurrent inserts into
/// the same cell never lose an entry.
pub struct LinkedCellGrid {
    layout: GridLayout,
    head: Vec<AtomicI32>,
    next: Vec<AtomicI32>,
}

impl LinkedCellGrid {
    pub fn new(layout: GridLayout, capacity: usize) -> Result<LinkedCellGrid, SimulationError> {
        Ok(LinkedCellGrid {
            layout,
            head: try_vec_from_fn(layout.num_cells(), "grid cells", |_| AtomicI32::new(EMPTY_CELL))?,
            next: try_vec_from_fn(capacity, "grid links", |_| AtomicI32::new(EMPTY_CELL))?,
        })
    }

    /// Safe to call from many threads at once, as long as every thread uses a
    /// distinct `index` and no thread reads the grid until all inserts are done.
    #[inline(always)]
    pub fn insert(&self, p: V2, index: usize) {
        let cell = self.layout.cell_index(p);
        let previous = self.head[cell].swap(index as i32, Ordering::AcqRel);
        self.next[index].store(previous, Ordering::Relaxed);
    }
}

impl SpatialGridTrait for LinkedCellGrid {
    fn layout(&self) -> &GridLayout {
        &self.layout
    }

    fn clear(&mut self) {
        self.head.par_iter().for_each(|head| head.store(EMPTY_CELL, Ordering::Relaxed));
    }

    fn rebuild(&mut self, positions: &[V2]) {
        if self.next.len() < positions.len() {
            self.next.resize_with(positions.len(), || AtomicI32::new(EMPTY_CELL));
        }
        self.clear();

        let grid = &*self;
        positions
            .par_iter()
            .enumerate()
            .for_each(|(i, &p)| grid.insert(p, i));
    }

    #[inline(always)]
    fn for_each_neighbor(&self, p: V2, mut f: impl FnMut(usize)) {
        self.layout.for_each_stencil_cell(p, |cell| {
            let mut j = self.head[cell].load(Ordering::Relaxed);
            while j != EMPTY_CELL {
                f(j as usize);
                j = self.next[j as usize].load(Ordering::Relaxed);
            }
        });
    }
}

/// Counting-sort grid: the point indices are stored sorted by cell, every cell
/// owns the slice `sorted[cell_start[c]..cell_start[c + 1]]`. Within a cell the
/// indices are ascending, so the iteration order is deterministic.
pub struct SortedCellGrid {
    layout: GridLayout,
    cell_start: Vec<u32>,
    cell_cursor: Vec<u32>,
    cell_of_point: Vec<u32>,
    sorted: Vec<u32>,
}

impl SortedCellGrid {
    pub fn new(layout: GridLayout, capacity: usize) -> Result<SortedCellGrid, SimulationError> {
        let mut cell_of_point = Vec::new();
        cell_of_point
            .try_reserve_exact(capacity)
            .map_err(SimulationError::allocation("grid cell indices"))?;
        let mut sorted = Vec::new();
        sorted
            .try_reserve_exact(capacity)
            .map_err(SimulationError::allocation("grid cell indices"))?;

        Ok(SortedCellGrid {
            layout,
            cell_start: try_vec_from_fn(layout.num_cells() + 1, "grid cells", |_| 0)?,
            cell_cursor: try_vec_from_fn(layout.num_cells(), "grid cells", |_| 0)?,
            cell_of_point,
            sorted,
        })
    }

    pub fn cell_points(&self, cell: usize) -> &[u32] {
        &self.sorted[self.cell_start[cell] as usize..self.cell_start[cell + 1] as usize]
    }
}

impl SpatialGridTrait for SortedCellGrid {
    fn layout(&self) -> &GridLayout {
        &self.layout
    }

    fn clear(&mut self) {
        self.cell_start.iter_mut().for_each(|s| *s = 0);
        self.sorted.clear();
        self.cell_of_point.clear();
    }

    fn rebuild(&mut self, positions: &[V2]) {
        self.clear();
        let n = positions.len();
        let layout = self.layout;

        // cell index per point
        self.cell_of_point.resize(n, 0);
        par_iter_mut1(&mut self.cell_of_point, |i, cell| {
            *cell = layout.cell_index(positions[i]) as u32;
        });

        // count, then exclusive prefix sum
        for &cell in &self.cell_of_point {
            self.cell_start[cell as usize + 1] += 1;
        }
        for c in 0..layout.num_cells() {
            self.cell_start[c + 1] += self.cell_start[c];
        }

        // scatter
        self.cell_cursor.copy_from_slice(&self.cell_start[..layout.num_cells()]);
        self.sorted.resize(n, 0);
        for (i, &cell) in self.cell_of_point.iter().enumerate() {
            let slot = &mut self.cell_cursor[cell as usize];
            self.sorted[*slot as usize] = i as u32;
            *slot += 1;
        }
    }

    #[inline(always)]
    fn for_each_neighbor(&self, p: V2, mut f: impl FnMut(usize)) {
        self.layout.for_each_stencil_cell(p, |cell| {
            for &j in self.cell_points(cell) {
                f(j as usize);
            }
        });
    }
}
