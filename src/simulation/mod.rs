pub mod boundary_handler;
pub mod concurrency;
pub mod error;
pub mod neighborhood_search;
pub mod occupancy_mask;
pub mod particle_state;
pub mod sdf;
pub mod session;
pub mod simulation_parameters;
pub mod sph_kernels;
pub mod timestep;
pub mod simulation;

#[cfg(feature = "double-precision")]
pub mod floating_type_mod {
    pub type FT = f64;
    pub use std::f64::consts::{FRAC_1_PI, TAU};
}

#[cfg(not(feature = "double-precision"))]
pub mod floating_type_mod {
    pub type FT = f32;
    pub use std::f32::consts::{FRAC_1_PI, TAU};
}

use floating_type_mod::FT;

use nalgebra::SVector;

pub type V<FT, const D: usize> = SVector<FT, D>;

pub type V2 = V<FT, 2>;

pub fn vec2f(x: FT, y: FT) -> V<FT, 2> {
    [x, y].into()
}

pub use simulation::*;
