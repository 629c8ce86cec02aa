pub use particle_boundary_handler::{place_boundary_particles, BoundaryField};

mod particle_boundary_handler;
