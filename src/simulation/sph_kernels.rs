use crate::{
    floating_type_mod::{FRAC_1_PI, FT},
    V2,
};

/// Below this distance (relative to h) the kernel gradient direction is undefined
/// and the gradient is taken as zero.
const MIN_GRADIENT_Q: FT = 1.0e-5;

/// 2D poly6 density kernel: `4 / (PI h^8) * (h^2 - r^2)^3` for `r < h`.
pub fn poly6_2d(r_sq: FT, h: FT) -> FT {
    let h_sq = h * h;
    if r_sq >= h_sq {
        return 0.;
    }
    let v = h_sq - r_sq;
    4. * FRAC_1_PI / h_sq.powi(4) * v * v * v
}

/// 2D spiky kernel `10 / (PI h^5) * (h - r)^3`. Only its gradient is used by the solver.
pub fn spiky_2d(r: FT, h: FT) -> FT {
    if r >= h {
        return 0.;
    }
    let v = h - r;
    10. * FRAC_1_PI / h.powi(5) * v * v * v
}

/**
 * Calculate the gradient dW/dx of the spiky kernel where x-y=diff.
 */
pub fn spiky_2d_grad(diff: V2, h: FT) -> V2 {
    let r = diff.norm();
    if r >= h || r <= MIN_GRADIENT_Q * h {
        return V2::zeros();
    }
    let v = h - r;
    diff * (-30. * FRAC_1_PI / h.powi(5) * v * v / r)
}

/// Laplacian of the 2D viscosity kernel: `40 / (PI h^5) * (h - r)`.
pub fn viscosity_laplacian_2d(r: FT, h: FT) -> FT {
    if r >= h {
        return 0.;
    }
    40. * FRAC_1_PI / h.powi(5) * (h - r)
}

/// The three kernels with their normalization factors precomputed for one
/// smoothing length. Every kernel has compact support `h`.
#[derive(Clone, Copy, Debug)]
pub struct SphKernels {
    h: FT,
    h_sq: FT,
    poly6_norm: FT,
    spiky_grad_norm: FT,
    viscosity_norm: FT,
}

impl SphKernels {
    pub fn new(h: FT) -> SphKernels {
        SphKernels {
            h,
            h_sq: h * h,
            poly6_norm: 4. * FRAC_1_PI / h.powi(8),
            spiky_grad_norm: -30. * FRAC_1_PI / h.powi(5),
            viscosity_norm: 40. * FRAC_1_PI / h.powi(5),
        }
    }

    #[inline(always)]
    pub fn h(&self) -> FT {
        self.h
    }

    #[inline(always)]
    pub fn h_sq(&self) -> FT {
        self.h_sq
    }

    #[inline(always)]
    pub fn poly6(&self, r_sq: FT) -> FT {
        if r_sq >= self.h_sq {
            return 0.;
        }
        let v = self.h_sq - r_sq;
        self.poly6_norm * v * v * v
    }

    /// `r` is `diff.norm()`, passed in since the caller already has it.
    #[inline(always)]
    pub fn spiky_grad(&self, diff: V2, r: FT) -> V2 {
        if r >= self.h || r <= MIN_GRADIENT_Q * self.h {
            return V2::zeros();
        }
        let v = self.h - r;
        diff * (self.spiky_grad_norm * v * v / r)
    }

    #[inline(always)]
    pub fn viscosity_laplacian(&self, r: FT) -> FT {
        if r >= self.h {
            return 0.;
        }
        self.viscosity_norm * (self.h - r)
    }
}
