use serde::{Deserialize, Serialize};

use crate::{error::SimulationError, floating_type_mod::FT};

pub const MIN_PARTICLE_COUNT: usize = 1_000;
pub const MAX_PARTICLE_COUNT: usize = 100_000;

/// The physical parameter surface of a session. Every section and field can be
/// omitted from a config file and falls back to its default.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationParams {
    pub domain: DomainParams,
    pub particles: ParticleParams,
    pub sph: SphParams,
    pub flow: FlowParams,
    pub collide: CollisionParams,
    pub time: TimeParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainParams {
    /// Lx, the period of the channel. The height follows from the mask aspect ratio.
    pub width: FT,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleParams {
    pub count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SphParams {
    pub rest_density: FT,
    pub viscosity: FT,
    /// h / spacing
    pub smoothing_factor: FT,
    /// Tait exponent
    pub gamma: FT,
    pub sound_speed: FT,
    pub xsph: FT,
    pub max_speed: FT,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowParams {
    /// constant acceleration along +x
    pub drive_accel: FT,
    /// linear drag coefficient k in `a = -k v`
    pub drag_k: FT,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollisionParams {
    pub particle_radius: FT,
    pub friction: FT,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeParams {
    /// nominal simulated time per frame
    pub fixed_dt: FT,
    /// minimum number of substeps per frame
    pub substeps: u32,
}

impl Default for DomainParams {
    fn default() -> Self {
        DomainParams { width: 20. }
    }
}

impl Default for ParticleParams {
    fn default() -> Self {
        ParticleParams { count: 1000 }
    }
}

impl Default for SphParams {
    fn default() -> Self {
        SphParams {
            rest_density: 1000.,
            viscosity: 0.35,
            smoothing_factor: 2.,
            gamma: 7.,
            sound_speed: 20.,
            xsph: 0.08,
            max_speed: 12.,
        }
    }
}

impl Default for FlowParams {
    fn default() -> Self {
        FlowParams {
            drive_accel: 6.,
            drag_k: 0.8,
        }
    }
}

impl Default for CollisionParams {
    fn default() -> Self {
        CollisionParams {
            particle_radius: 0.02,
            friction: 0.2,
        }
    }
}

impl Default for TimeParams {
    fn default() -> Self {
        TimeParams {
            fixed_dt: 1. / 60.,
            substeps: 4,
        }
    }
}

impl SimulationParams {
    pub fn validate(&self) -> Result<(), SimulationError> {
        let invalid = |msg: String| Err(SimulationError::InvalidParameters(msg));

        if !(MIN_PARTICLE_COUNT..=MAX_PARTICLE_COUNT).contains(&self.particles.count) {
            return invalid(format!(
                "particle count {} outside [{}, {}]",
                self.particles.count, MIN_PARTICLE_COUNT, MAX_PARTICLE_COUNT
            ));
        }

        let positive = [
            ("domain.width", self.domain.width),
            ("sph.rest_density", self.sph.rest_density),
            ("sph.smoothing_factor", self.sph.smoothing_factor),
            ("time.fixed_dt", self.time.fixed_dt),
        ];
        for (name, value) in positive {
            if !value.is_finite() || value <= 0. {
                return invalid(format!("{} must be positive and finite, got {}", name, value));
            }
        }

        let non_negative = [
            ("sph.viscosity", self.sph.viscosity),
            ("sph.sound_speed", self.sph.sound_speed),
            ("sph.xsph", self.sph.xsph),
            ("sph.max_speed", self.sph.max_speed),
            ("flow.drag_k", self.flow.drag_k),
            ("collide.particle_radius", self.collide.particle_radius),
            ("collide.friction", self.collide.friction),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0. {
                return invalid(format!("{} must be non-negative and finite, got {}", name, value));
            }
        }

        if !self.sph.gamma.is_finite() || self.sph.gamma < 1. {
            return invalid(format!("sph.gamma must be at least 1, got {}", self.sph.gamma));
        }

        if !self.flow.drive_accel.is_finite() {
            return invalid(format!("flow.drive_accel must be finite, got {}", self.flow.drive_accel));
        }

        Ok(())
    }

    /// Changes that resize particle arrays or change the domain need a reset;
    /// everything else is applied in place.
    pub fn requires_reset(&self, previous: &SimulationParams) -> bool {
        self.particles.count != previous.particles.count || self.domain.width != previous.domain.width
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NeighborhoodSearchAlgorithm {
    /// count per cell, prefix sum, scatter; deterministic iteration order
    CountingSort,
    /// per-cell linked lists with atomic head exchange
    LinkedList,
}

/// Knobs of the numerical method that are not part of the physical parameter surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub neighborhood_search_algorithm: NeighborhoodSearchAlgorithm,

    /// Initial lattice jitter as a fraction of the particle spacing.
    pub spawn_jitter: FT,
    pub seed: u64,

    /// None: rayon's global pool
    pub num_threads: Option<usize>,

    /// Finite-difference step for the SDF gradient. None: one mask pixel.
    pub sdf_gradient_eps: Option<FT>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            neighborhood_search_algorithm: NeighborhoodSearchAlgorithm::CountingSort,
            spawn_jitter: 0.35,
            seed: 0x1234_5678,
            num_threads: None,
            sdf_gradient_eps: None,
        }
    }
}

/// Layout of a YAML config file.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub simulation: SimulationParams,
    pub solver: SolverConfig,
}

/// Quantities that follow from the parameters and the mask, recomputed on every
/// parameter update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedQuantities {
    pub domain_width: FT,
    pub domain_height: FT,
    pub fluid_area: FT,
    pub spacing: FT,
    /// smoothing length, equal to the kernel support radius
    pub h: FT,
    pub particle_mass: FT,
    pub rest_density: FT,
    /// Tait stiffness B
    pub eos_stiffness: FT,
    pub gamma: FT,
}

impl DerivedQuantities {
    pub fn compute(params: &SimulationParams, domain_height: FT, fluid_fraction: FT) -> DerivedQuantities {
        let domain_width = params.domain.width;
        let fluid_area = FT::max(1e-6, fluid_fraction * domain_width * domain_height);
        let spacing = (fluid_area / params.particles.count.max(1) as FT).sqrt();
        let h = FT::max(1e-4, params.sph.smoothing_factor * spacing);
        let rest_density = params.sph.rest_density;

        let gamma = params.sph.gamma;
        let c0 = params.sph.sound_speed.max(1e-3);

        DerivedQuantities {
            domain_width,
            domain_height,
            fluid_area,
            spacing,
            h,
            particle_mass: rest_density * spacing * spacing,
            rest_density,
            eos_stiffness: rest_density * c0 * c0 / gamma,
            gamma,
        }
    }
}
