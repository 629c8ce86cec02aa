use nalgebra::zero;
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};

use crate::{
    error::{try_vec_from_fn, SimulationError},
    floating_type_mod::FT,
    neighborhood_search::wrap_x,
    occupancy_mask::OccupancyMask,
    V2,
};

/// Declares a struct of equally long per-particle arrays together with a
/// fallible constructor that fills every array with its default value.
macro_rules! decl_particle_vec {
    (pub struct $struct_name:ident { $(pub $field_name:ident: Vec<$field_type:ty> | $default_value:expr),*$(,)?  }) => {
        pub struct $struct_name {
            $(
                pub $field_name : Vec<$field_type>,
            )*
        }

        impl $struct_name {
            pub fn try_with_len(len: usize) -> Result<Self, SimulationError> {
                Ok($struct_name {
                    $(
                        $field_name: try_vec_from_fn(len, stringify!($field_name), |_| -> $field_type { $default_value })?,
                    )*
                })
            }
        }
    };
}

decl_particle_vec! {
    pub struct ParticleState {
        pub position: Vec<V2> | zero(),
        pub velocity: Vec<V2> | zero(),

        // written by the force pass, swapped in afterwards
        pub position_next: Vec<V2> | zero(),
        pub velocity_next: Vec<V2> | zero(),

        pub density: Vec<FT> | 0.,
        pub pressure: Vec<FT> | 0.,
    }
}

impl ParticleState {
    /// `count` particles at rest inside the fluid region of `mask`.
    pub fn spawn(
        mask: &OccupancyMask,
        domain_width: FT,
        domain_height: FT,
        spacing: FT,
        count: usize,
        jitter: FT,
        seed: u64,
    ) -> Result<ParticleState, SimulationError> {
        let positions = spawn_positions(mask, domain_width, domain_height, spacing, count, jitter, seed)?;
        let mut state = ParticleState::try_with_len(count)?;
        state.position.copy_from_slice(&positions);
        Ok(state)
    }

    pub fn len(&self) -> usize {
        self.position.len()
    }

    pub fn is_empty(&self) -> bool {
        self.position.is_empty()
    }
}

/// Maps world positions onto mask pixels (x wraps, y clamps).
struct FluidLookup<'a> {
    mask: &'a OccupancyMask,
    domain_width: FT,
    domain_height: FT,
}

impl FluidLookup<'_> {
    fn is_fluid(&self, p: V2) -> bool {
        let w = self.mask.width();
        let h = self.mask.height();
        let x = wrap_x(p.x, self.domain_width);
        let y = p.y.max(0.).min(self.domain_height);
        let px = usize::min(w - 1, (x / self.domain_width * w as FT) as usize);
        let py = usize::min(h - 1, (y / self.domain_height * h as FT) as usize);
        self.mask.is_fluid(px, py)
    }
}

/// Random draws per missing particle before rejection sampling gives up and
/// samples fluid pixels directly.
const REJECTION_ATTEMPTS_PER_PARTICLE: usize = 64;

/// Regular lattice of pitch `spacing` restricted to fluid, shuffled and jittered
/// by up to `jitter * spacing` per axis. If the lattice has fewer fluid points
/// than `count`, the rest is filled by rejection sampling.
pub fn spawn_positions(
    mask: &OccupancyMask,
    domain_width: FT,
    domain_height: FT,
    spacing: FT,
    count: usize,
    jitter: FT,
    seed: u64,
) -> Result<Vec<V2>, SimulationError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let lookup = FluidLookup {
        mask,
        domain_width,
        domain_height,
    };
    let spacing = spacing.max(1e-4);
    let jitter = jitter.max(0.) * spacing;

    let nx = (domain_width / spacing).ceil() as usize;
    let ny = (domain_height / spacing).ceil() as usize;
    let mut candidates: Vec<V2> = Vec::new();
    candidates
        .try_reserve(nx * ny)
        .map_err(SimulationError::allocation("spawn lattice"))?;
    for j in 0..ny {
        let y = (j as FT + 0.5) * spacing;
        if y >= domain_height {
            break;
        }
        for i in 0..nx {
            let x = (i as FT + 0.5) * spacing;
            if x >= domain_width {
                break;
            }
            let p = V2::new(x, y);
            if lookup.is_fluid(p) {
                candidates.push(p);
            }
        }
    }

    candidates.shuffle(&mut rng);
    candidates.truncate(count);

    let mut positions = Vec::new();
    positions
        .try_reserve_exact(count)
        .map_err(SimulationError::allocation("particle positions"))?;

    for p in candidates {
        let jittered = if jitter > 0. {
            p + V2::new(rng.gen_range(-jitter..jitter), rng.gen_range(-jitter..jitter))
        } else {
            p
        };
        if lookup.is_fluid(jittered) {
            positions.push(V2::new(
                wrap_x(jittered.x, domain_width),
                jittered.y.max(0.).min(domain_height),
            ));
        } else {
            positions.push(p);
        }
    }

    let mut attempts_left = (count - positions.len()) * REJECTION_ATTEMPTS_PER_PARTICLE;
    while positions.len() < count && attempts_left > 0 {
        let p = V2::new(
            rng.gen_range(0.0..domain_width),
            rng.gen_range(0.0..domain_height),
        );
        if lookup.is_fluid(p) {
            positions.push(p);
        }
        attempts_left -= 1;
    }

    if positions.len() < count {
        // very small fluid fraction: pick fluid pixels, then a point inside them
        let fluid_pixels: Vec<(usize, usize)> = (0..mask.width() * mask.height())
            .map(|i| (i % mask.width(), i / mask.width()))
            .filter(|&(x, y)| mask.is_fluid(x, y))
            .collect();
        let dx = domain_width / mask.width() as FT;
        let dy = domain_height / mask.height() as FT;
        while positions.len() < count {
            // a valid mask has at least one fluid pixel
            let (x, y) = fluid_pixels[rng.gen_range(0..fluid_pixels.len())];
            positions.push(V2::new(
                (x as FT + rng.gen_range(0.1..0.9)) * dx,
                (y as FT + rng.gen_range(0.1..0.9)) * dy,
            ));
        }
    }

    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_all_in_fluid(mask: &OccupancyMask, positions: &[V2], lx: FT, ly: FT) {
        let lookup = FluidLookup {
            mask,
            domain_width: lx,
            domain_height: ly,
        };
        for p in positions {
            assert!(p.x >= 0. && p.x < lx && p.y >= 0. && p.y <= ly, "{:?} outside domain", p);
            assert!(lookup.is_fluid(*p), "{:?} not in fluid", p);
        }
    }

    #[test]
    fn spawn_fills_fluid_region() {
        let mask = OccupancyMask::straight_channel(64, 32, 8, 23).unwrap();
        let (lx, ly) = (8., 4.);
        let spacing = (0.5 * lx * ly / 1000 as FT).sqrt();

        let state = ParticleState::spawn(&mask, lx, ly, spacing, 1000, 0.35, 1).unwrap();
        assert_eq!(state.len(), 1000);
        assert_all_in_fluid(&mask, &state.position, lx, ly);
        assert!(state.velocity.iter().all(|v| *v == V2::zeros()));
        assert_eq!(state.density.len(), 1000);
        assert_eq!(state.velocity_next.len(), 1000);
    }

    #[test]
    fn spawn_is_deterministic_per_seed() {
        let mask = OccupancyMask::default_channel(64, 32);
        let a = spawn_positions(&mask, 8., 4., 0.1, 1000, 0.35, 42).unwrap();
        let b = spawn_positions(&mask, 8., 4., 0.1, 1000, 0.35, 42).unwrap();
        let c = spawn_positions(&mask, 8., 4., 0.1, 1000, 0.35, 43).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn shortfall_is_filled_inside_fluid() {
        // a 2 x 2 pixel pocket of fluid, far too small for the lattice
        let mask = OccupancyMask::from_fn(16, 16, |x, y| (6..8).contains(&x) && (6..8).contains(&y)).unwrap();
        let positions = spawn_positions(&mask, 16., 16., 1., 1000, 0.35, 5).unwrap();
        assert_eq!(positions.len(), 1000);
        assert_all_in_fluid(&mask, &positions, 16., 16.);
    }

    #[test]
    fn zero_jitter_keeps_lattice_points() {
        let mask = OccupancyMask::straight_channel(32, 32, 0, 31).unwrap();
        let positions = spawn_positions(&mask, 4., 4., 0.5, 64, 0., 0).unwrap();
        assert_eq!(positions.len(), 64);
        for p in positions {
            let fx = p.x / 0.5 - 0.5;
            let fy = p.y / 0.5 - 0.5;
            assert!((fx - fx.round()).abs() < 1e-4 && (fy - fy.round()).abs() < 1e-4);
        }
    }
}
