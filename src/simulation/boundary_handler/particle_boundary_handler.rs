use nalgebra::zero;

use crate::{
    concurrency::par_iter_mut1,
    error::SimulationError,
    floating_type_mod::FT,
    neighborhood_search::{GridLayout, SpatialGrid, SpatialGridTrait},
    occupancy_mask::OccupancyMask,
    simulation_parameters::NeighborhoodSearchAlgorithm,
    sph_kernels::SphKernels,
    V2,
};

/// Kernel weight sums below this are treated as "no neighbors".
const MIN_WEIGHT_SUM: FT = 1e-8;

/// Put one static particle on every solid pixel that touches fluid, scanning
/// the mask with a stride of roughly one particle spacing.
pub fn place_boundary_particles(
    mask: &OccupancyMask,
    domain_width: FT,
    domain_height: FT,
    spacing: FT,
) -> Result<Vec<V2>, SimulationError> {
    let w = mask.width();
    let h = mask.height();
    let dx = domain_width / w as FT;
    let dy = domain_height / h as FT;
    let step_x = ((spacing / dx.max(1e-6)).round() as usize).max(1);
    let step_y = ((spacing / dy.max(1e-6)).round() as usize).max(1);

    let candidates = || {
        (0..h)
            .step_by(step_y)
            .flat_map(move |y| (0..w).step_by(step_x).map(move |x| (x, y)))
            .filter(move |&(x, y)| mask.is_interface_solid(x, y))
    };

    let mut positions = Vec::new();
    positions
        .try_reserve_exact(candidates().count())
        .map_err(SimulationError::allocation("boundary particles"))?;
    positions.extend(candidates().map(|(x, y)| V2::new((x as FT + 0.5) * dx, (y as FT + 0.5) * dy)));

    Ok(positions)
}

/// Static boundary particles with their density weights (psi).
///
/// Boundary particles carry no pressure of their own: in the pressure force
/// they mirror the pressure of the fluid particle that sees them, at rest
/// density.
pub struct BoundaryField {
    positions: Vec<V2>,
    // mass-equivalent used in place of the particle mass
    psi: Vec<FT>,
    spacing: FT,
    domain_width: FT,
    domain_height: FT,
    grid: SpatialGrid,

    // psi depends on both
    last_smoothing_length: Option<FT>,
    last_rest_density: Option<FT>,
}

impl BoundaryField {
    pub fn build(
        mask: &OccupancyMask,
        domain_width: FT,
        domain_height: FT,
        spacing: FT,
        h: FT,
        rest_density: FT,
    ) -> Result<BoundaryField, SimulationError> {
        let positions = place_boundary_particles(mask, domain_width, domain_height, spacing)?;
        let num_boundary_particles = positions.len();

        let mut psi = Vec::new();
        psi.try_reserve_exact(num_boundary_particles)
            .map_err(SimulationError::allocation("boundary weights"))?;
        psi.resize(num_boundary_particles, 0.);

        let layout = GridLayout::new(domain_width, domain_height, h);
        let grid = SpatialGrid::new(NeighborhoodSearchAlgorithm::CountingSort, layout, num_boundary_particles)?;

        let mut field = BoundaryField {
            positions,
            psi,
            spacing,
            domain_width,
            domain_height,
            grid,
            last_smoothing_length: None,
            last_rest_density: None,
        };
        field.update(h, rest_density)?;
        Ok(field)
    }

    /// Re-grid and recompute psi if the smoothing length or the rest density
    /// changed since the last call. Positions never move.
    pub fn update(&mut self, h: FT, rest_density: FT) -> Result<(), SimulationError> {
        if self.last_smoothing_length != Some(h) {
            let layout = GridLayout::new(self.domain_width, self.domain_height, h);
            if *self.grid.layout() != layout {
                self.grid = SpatialGrid::new(NeighborhoodSearchAlgorithm::CountingSort, layout, self.positions.len())?;
            }
            self.grid.rebuild(&self.positions);
        }

        if self.last_smoothing_length != Some(h) || self.last_rest_density != Some(rest_density) {
            self.recompute_psi(&SphKernels::new(h), rest_density);
            self.last_smoothing_length = Some(h);
            self.last_rest_density = Some(rest_density);
        }

        Ok(())
    }

    fn recompute_psi(&mut self, kernels: &SphKernels, rest_density: FT) {
        let positions = &self.positions;
        let grid = &self.grid;
        let fallback = rest_density * self.spacing * self.spacing;

        par_iter_mut1(&mut self.psi, |bi, psi| {
            let mut weight_sum: FT = 0.;
            grid.for_each_neighbor_within(positions[bi], positions, kernels.h(), |_bj, _, r_sq| {
                weight_sum += kernels.poly6(r_sq);
            });

            *psi = if weight_sum > MIN_WEIGHT_SUM {
                rest_density / weight_sum
            } else {
                fallback
            };
        });
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn positions(&self) -> &[V2] {
        &self.positions
    }

    pub fn psi(&self) -> &[FT] {
        &self.psi
    }

    /// Density contributed by all boundary particles within h of `x_i`.
    #[inline(always)]
    pub fn density_boundary_term(&self, x_i: V2, kernels: &SphKernels) -> FT {
        let mut boundary_density: FT = 0.;
        self.grid
            .for_each_neighbor_within(x_i, &self.positions, kernels.h(), |b, _, r_sq| {
                boundary_density += self.psi[b] * kernels.poly6(r_sq);
            });
        boundary_density
    }

    /// Symmetric pressure acceleration against the boundary with `p_b = p_i`
    /// and `rho_b = rest_density`.
    #[inline(always)]
    pub fn pressure_accel(&self, x_i: V2, p_i: FT, rho_i: FT, rest_density: FT, kernels: &SphKernels) -> V2 {
        let p_b = p_i;
        let rho_b = rest_density;
        let pressure_term = p_i / (rho_i * rho_i) + p_b / (rho_b * rho_b);

        let mut accel: V2 = zero();
        self.grid
            .for_each_neighbor_within(x_i, &self.positions, kernels.h(), |b, x_ib, r_sq| {
                let weight_grad = kernels.spiky_grad(x_ib, r_sq.sqrt());
                accel += -self.psi[b] * pressure_term * weight_grad;
            });
        accel
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec2f;

    fn channel_field(h: FT) -> (OccupancyMask, BoundaryField) {
        // fluid rows 16..=47 of a 128 x 64 mask, 10 x 5 domain
        let mask = OccupancyMask::straight_channel(128, 64, 16, 47).unwrap();
        let pixel = 10. / 128.;
        let field = BoundaryField::build(&mask, 10., 5., pixel, h, 1000.).unwrap();
        (mask, field)
    }

    #[test]
    fn boundary_particles_sit_on_interface_pixels() {
        let (mask, field) = channel_field(0.2);

        // two walls, one particle per column each
        assert_eq!(field.len(), 2 * 128);

        let pixel = 10. / 128.;
        for p in field.positions() {
            let x = (p.x / pixel).floor() as usize;
            let y = (p.y / pixel).floor() as usize;
            assert!(mask.is_interface_solid(x, y));
            assert!(y == 15 || y == 48);
        }
    }

    #[test]
    fn stride_follows_spacing() {
        let mask = OccupancyMask::straight_channel(128, 64, 16, 47).unwrap();
        let pixel = 10. / 128.;
        let positions = place_boundary_particles(&mask, 10., 5., 4. * pixel).unwrap();
        // the stride skips the lower wall row 15 and keeps row 48
        assert_eq!(positions.len(), 128 / 4);
        assert!(positions.iter().all(|p| (p.y - 48.5 * pixel).abs() < 1e-4));
    }

    #[test]
    fn psi_is_positive_and_finite() {
        let (_, field) = channel_field(0.2);
        assert!(field.psi().iter().all(|&psi| psi.is_finite() && psi > 0.));

        // a straight wall is uniform, so all weights agree
        let first = field.psi()[0];
        for &psi in field.psi() {
            crate::assert_ft_approx_eq(psi, first, first * 1e-3, || "uniform wall psi".into());
        }
    }

    #[test]
    fn psi_follows_smoothing_length() {
        let (_, mut field) = channel_field(0.2);
        let psi_before = field.psi()[0];

        field.update(0.2, 1000.).unwrap();
        assert_eq!(field.psi()[0], psi_before);

        // the kernel weight summed along a straight wall scales like 1/h
        field.update(0.4, 1000.).unwrap();
        assert!(field.psi()[0] > psi_before);

        field.update(0.4, 500.).unwrap();
        assert!(field.psi().iter().all(|&psi| psi > 0.));
    }

    #[test]
    fn isolated_particle_has_self_weight() {
        // a single solid pixel in the middle of fluid: four neighbors are fluid
        let mask = OccupancyMask::from_fn(16, 16, |x, y| !(x == 8 && y == 8)).unwrap();
        let field = BoundaryField::build(&mask, 16., 16., 1., 0.5, 1000.).unwrap();
        assert_eq!(field.len(), 1);

        // only the particle itself is within h: psi = rho0 / W(0)
        let kernels = SphKernels::new(0.5);
        crate::assert_ft_approx_eq(field.psi()[0], 1000. / kernels.poly6(0.), 1e-3, || "self psi".into());
    }

    #[test]
    fn wall_pushes_fluid_away() {
        let (_, field) = channel_field(0.2);
        let kernels = SphKernels::new(0.2);
        let pixel = 10. / 128.;

        // just above the lower wall row
        let x_i = vec2f(3.0, 16.2 * pixel);
        assert!(field.density_boundary_term(x_i, &kernels) > 0.);

        let accel = field.pressure_accel(x_i, 100., 1000., 1000., &kernels);
        assert!(accel.y > 0.);

        // far from the walls there is no contribution
        let x_far = vec2f(3.0, 2.5);
        assert_eq!(field.density_boundary_term(x_far, &kernels), 0.);
        assert_eq!(field.pressure_accel(x_far, 100., 1000., 1000., &kernels), V2::zeros());
    }
}
