use crate::{
    error::{try_vec_from_fn, SimulationError},
    floating_type_mod::FT,
    occupancy_mask::OccupancyMask,
    V2,
};

use super::edt::{edt2d_squared, EDT_INF};

/// Obstacle distance field sampled at the pixel centers of the occupancy mask.
///
/// Values are in world units, **positive on the solid side** and negative inside
/// the fluid. The field is periodic in x: the mask is tiled three times before
/// the distance transform, so features across the seam are seen at their true
/// distance.
#[derive(Clone, Debug)]
pub struct SignedDistanceField {
    width: usize,
    height: usize,
    domain_width: FT,
    domain_height: FT,
    pixel_size: FT,
    values: Vec<FT>,
}

impl SignedDistanceField {
    pub fn build(mask: &OccupancyMask, domain_width: FT) -> Result<SignedDistanceField, SimulationError> {
        let w = mask.width();
        let h = mask.height();
        let w3 = 3 * w;
        let pixel_size = domain_width / w as FT;

        // feature images over the tiled mask
        let tiled_is_fluid = |i: usize| mask.is_fluid(i % w3 % w, i / w3);
        let solid_features = try_vec_from_fn(w3 * h, "signed distance field", |i| {
            if tiled_is_fluid(i) {
                EDT_INF
            } else {
                0.
            }
        })?;
        let fluid_features = try_vec_from_fn(w3 * h, "signed distance field", |i| {
            if tiled_is_fluid(i) {
                0.
            } else {
                EDT_INF
            }
        })?;

        let dist_to_solid_sq = edt2d_squared(w3, h, &solid_features)?;
        let dist_to_fluid_sq = edt2d_squared(w3, h, &fluid_features)?;

        // crop the middle tile
        let values = try_vec_from_fn(w * h, "signed distance field", |i| {
            let (x, y) = (i % w, i / w);
            let i3 = y * w3 + x + w;
            let to_solid = dist_to_solid_sq[i3].max(0.).sqrt();
            let to_fluid = dist_to_fluid_sq[i3].max(0.).sqrt();
            (to_fluid - to_solid) * pixel_size
        })?;

        Ok(SignedDistanceField {
            width: w,
            height: h,
            domain_width,
            domain_height: domain_width * h as FT / w as FT,
            pixel_size,
            values,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn domain_width(&self) -> FT {
        self.domain_width
    }

    /// `Lx * H / W`, the mask aspect ratio is preserved.
    pub fn domain_height(&self) -> FT {
        self.domain_height
    }

    /// World units per mask pixel (identical in x and y).
    pub fn pixel_size(&self) -> FT {
        self.pixel_size
    }

    pub fn values(&self) -> &[FT] {
        &self.values
    }

    pub fn value(&self, x: usize, y: usize) -> FT {
        self.values[y * self.width + x]
    }

    pub fn value_range(&self) -> (FT, FT) {
        self.values
            .iter()
            .fold((FT::INFINITY, FT::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    }

    /// Bilinear lookup, x wraps around the domain and y is clamped to the
    /// outermost pixel centers.
    pub fn probe(&self, p: V2) -> FT {
        let fx = p.x / self.pixel_size - 0.5;
        let fy = (p.y / self.pixel_size - 0.5).max(0.).min((self.height - 1) as FT);

        let x0f = fx.floor();
        let y0f = fy.floor();
        let tx = fx - x0f;
        let ty = fy - y0f;

        let w = self.width as i64;
        let x0 = (x0f as i64).rem_euclid(w) as usize;
        let x1 = (x0 + 1) % self.width;
        let y0 = y0f as usize;
        let y1 = usize::min(y0 + 1, self.height - 1);

        let bottom = self.value(x0, y0) * (1. - tx) + self.value(x1, y0) * tx;
        let top = self.value(x0, y1) * (1. - tx) + self.value(x1, y1) * tx;
        bottom * (1. - ty) + top * ty
    }

    /**
     * Central differences of `probe`. This gradient is NOT normalized; it points
     * towards the solid.
     */
    pub fn finite_diff_gradient(&self, p: V2, eps: FT) -> V2 {
        let inv_2eps = 1. / (2. * eps);

        let iter = (0..2).map(|i| {
            let mut xp = p;
            let mut xn = p;
            xp[i] += eps;
            xn[i] -= eps;
            (self.probe(xp) - self.probe(xn)) * inv_2eps
        });

        V2::from_iterator(iter)
    }
}
