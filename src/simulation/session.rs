use std::time::Instant;

use log::{debug, info, warn};

use crate::{
    boundary_handler::BoundaryField,
    concurrency::ComputeContext,
    error::SimulationError,
    floating_type_mod::FT,
    occupancy_mask::{OccupancyMask, TILE_MISMATCH_WARN_FRACTION},
    particle_state::ParticleState,
    sdf::SignedDistanceField,
    simulation::{write_statistics, FluidSimulation, StepParams},
    simulation_parameters::{DerivedQuantities, SimulationParams, SolverConfig},
    timestep::{TimestepController, TimestepSchedule},
    vec2f, V2,
};

/// Owned copy of the particle state after the last completed frame.
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    pub frame: u64,
    /// simulated time, `frame * fixed_dt` as long as `fixed_dt` did not change
    pub time: FT,
    pub positions: Vec<V2>,
    pub velocities: Vec<V2>,
    pub density: Vec<FT>,
    pub pressure: Vec<FT>,
}

/// One running simulation together with everything needed to rebuild it.
///
/// A session is "ready" once `reset` succeeded. Until then (and after a failed
/// reset) `step` is a no-op and all readers return empty data.
pub struct SimulationSession {
    context: ComputeContext,
    params: SimulationParams,
    solver_config: SolverConfig,
    statistics_enabled: bool,

    // kept for resets triggered by parameter changes
    mask: Option<OccupancyMask>,

    derived: Option<DerivedQuantities>,
    schedule: Option<TimestepSchedule>,
    simulation: Option<FluidSimulation>,

    frames_done: u64,
    simulated_time: FT,
}

impl SimulationSession {
    pub fn new(
        context: ComputeContext,
        params: SimulationParams,
        solver_config: SolverConfig,
    ) -> Result<SimulationSession, SimulationError> {
        params.validate()?;
        Ok(SimulationSession {
            context,
            params,
            solver_config,
            statistics_enabled: false,
            mask: None,
            derived: None,
            schedule: None,
            simulation: None,
            frames_done: 0,
            simulated_time: 0.,
        })
    }

    /// Collect per-stage timings and per-frame values from the next reset on.
    pub fn set_statistics_enabled(&mut self, enabled: bool) {
        self.statistics_enabled = enabled;
    }

    /// Throw away the current simulation and build a new one from `mask`.
    ///
    /// On error the session is left not ready; the mask is kept and the next
    /// `update_params` call retries the reset with the new parameters.
    pub fn reset(&mut self, mask: OccupancyMask) -> Result<(), SimulationError> {
        // release the old buffers before allocating new ones
        self.simulation = None;
        self.derived = None;
        self.schedule = None;
        self.frames_done = 0;
        self.simulated_time = 0.;

        let result = self.build(&mask);
        self.mask = Some(mask);

        let (simulation, derived, schedule) = result?;
        info!(
            "reset: {} fluid particles, {} boundary particles, domain {}x{}, spacing {}, h {}, mass {}",
            simulation.num_particles(),
            simulation.boundary().len(),
            derived.domain_width,
            derived.domain_height,
            derived.spacing,
            derived.h,
            derived.particle_mass
        );
        info!(
            "reset: {} substeps of {}s per frame (cfl limit {}s)",
            schedule.substeps, schedule.dt, schedule.dt_cfl
        );

        self.simulation = Some(simulation);
        self.derived = Some(derived);
        self.schedule = Some(schedule);
        Ok(())
    }

    fn build(
        &self,
        mask: &OccupancyMask,
    ) -> Result<(FluidSimulation, DerivedQuantities, TimestepSchedule), SimulationError> {
        let params = &self.params;
        let domain_width = params.domain.width;

        let tile_mismatch = mask.tile_mismatch_x();
        if tile_mismatch > TILE_MISMATCH_WARN_FRACTION {
            warn!(
                "mask does not tile in x: {:.1}% of rows differ between first and last column",
                tile_mismatch * 100.
            );
        }

        let sdf = SignedDistanceField::build(mask, domain_width)?;
        let domain_height = sdf.domain_height();

        let derived = DerivedQuantities::compute(params, domain_height, mask.fluid_fraction());
        let schedule = TimestepController::derive(params, &derived);

        let particles = ParticleState::spawn(
            mask,
            domain_width,
            domain_height,
            derived.spacing,
            params.particles.count,
            self.solver_config.spawn_jitter,
            self.solver_config.seed,
        )?;
        let boundary = BoundaryField::build(
            mask,
            domain_width,
            domain_height,
            derived.spacing,
            derived.h,
            derived.rest_density,
        )?;
        if boundary.is_empty() {
            warn!("mask has no solid/fluid interface, running without boundary particles");
        }

        let step_params = StepParams::new(params, &derived, &schedule, self.sdf_gradient_eps(&sdf));
        let simulation = FluidSimulation::new(
            particles,
            boundary,
            sdf,
            self.solver_config.neighborhood_search_algorithm,
            step_params,
            self.context.clone(),
            self.statistics_enabled,
        )?;

        Ok((simulation, derived, schedule))
    }

    fn sdf_gradient_eps(&self, sdf: &SignedDistanceField) -> FT {
        self.solver_config.sdf_gradient_eps.unwrap_or_else(|| sdf.pixel_size())
    }

    /// Apply new parameters. A new particle count or domain width rebuilds the
    /// whole simulation from the stored mask; anything else only recomputes
    /// derived quantities and the substep schedule.
    pub fn update_params(&mut self, params: SimulationParams) -> Result<(), SimulationError> {
        params.validate()?;
        let previous = std::mem::replace(&mut self.params, params);

        if self.params.requires_reset(&previous) {
            if let Some(mask) = self.mask.take() {
                info!(
                    "particle count {} -> {}, domain width {} -> {}: resetting",
                    previous.particles.count, self.params.particles.count, previous.domain.width, self.params.domain.width
                );
                return self.reset(mask);
            }
            return Ok(());
        }

        // a previous reset failed, try again with the new parameters
        if self.simulation.is_none() {
            if let Some(mask) = self.mask.take() {
                info!("session not ready: retrying reset from the stored mask");
                return self.reset(mask);
            }
            return Ok(());
        }

        let (simulation, mask) = match (self.simulation.as_mut(), self.mask.as_ref()) {
            (Some(simulation), Some(mask)) => (simulation, mask),
            _ => return Ok(()),
        };

        let sdf = simulation.sdf();
        let derived = DerivedQuantities::compute(&self.params, sdf.domain_height(), mask.fluid_fraction());
        let schedule = TimestepController::derive(&self.params, &derived);
        let eps = self.solver_config.sdf_gradient_eps.unwrap_or_else(|| sdf.pixel_size());
        let step_params = StepParams::new(&self.params, &derived, &schedule, eps);

        if let Err(err) = simulation.set_step_params(step_params) {
            self.simulation = None;
            self.derived = None;
            self.schedule = None;
            return Err(err);
        }

        if self.schedule.map(|s| s.substeps) != Some(schedule.substeps) {
            info!("substeps per frame: {} (dt {}s)", schedule.substeps, schedule.dt);
        }
        self.derived = Some(derived);
        self.schedule = Some(schedule);
        Ok(())
    }

    /// Advance by one frame (`time.fixed_dt`, split into the scheduled number
    /// of substeps). `elapsed_real_time` is only used for logging.
    ///
    /// Returns `false` without doing anything if the session is not ready.
    pub fn step(&mut self, elapsed_real_time: FT) -> bool {
        let (simulation, schedule) = match (self.simulation.as_mut(), self.schedule) {
            (Some(simulation), Some(schedule)) => (simulation, schedule),
            _ => return false,
        };

        let start = Instant::now();
        simulation.step(schedule.substeps);

        self.frames_done += 1;
        self.simulated_time += schedule.dt * schedule.substeps as FT;

        debug!(
            "frame {}: {} substeps in {:?} (real time since last frame {}s)",
            self.frames_done,
            schedule.substeps,
            start.elapsed(),
            elapsed_real_time
        );
        true
    }

    pub fn is_ready(&self) -> bool {
        self.simulation.is_some()
    }

    pub fn params(&self) -> &SimulationParams {
        &self.params
    }

    pub fn solver_config(&self) -> &SolverConfig {
        &self.solver_config
    }

    pub fn derived(&self) -> Option<&DerivedQuantities> {
        self.derived.as_ref()
    }

    pub fn schedule(&self) -> Option<TimestepSchedule> {
        self.schedule
    }

    pub fn frames_done(&self) -> u64 {
        self.frames_done
    }

    pub fn simulated_time(&self) -> FT {
        self.simulated_time
    }

    pub fn simulation(&self) -> Option<&FluidSimulation> {
        self.simulation.as_ref()
    }

    pub fn positions(&self) -> &[V2] {
        match &self.simulation {
            Some(simulation) => &simulation.particles.position,
            None => &[],
        }
    }

    pub fn velocities(&self) -> &[V2] {
        match &self.simulation {
            Some(simulation) => &simulation.particles.velocity,
            None => &[],
        }
    }

    pub fn particle_count(&self) -> usize {
        self.simulation.as_ref().map_or(0, |s| s.num_particles())
    }

    /// `(min, max)` corners of the domain, `[0, Lx] x [0, Ly]`.
    pub fn domain_bounds(&self) -> Option<(V2, V2)> {
        self.simulation.as_ref().map(|s| {
            let sdf = s.sdf();
            (vec2f(0., 0.), vec2f(sdf.domain_width(), sdf.domain_height()))
        })
    }

    pub fn sdf(&self) -> Option<&SignedDistanceField> {
        self.simulation.as_ref().map(|s| s.sdf())
    }

    pub fn boundary_positions(&self) -> &[V2] {
        match &self.simulation {
            Some(simulation) => simulation.boundary().positions(),
            None => &[],
        }
    }

    pub fn snapshot(&self) -> Option<FrameSnapshot> {
        self.simulation.as_ref().map(|simulation| {
            let particles = &simulation.particles;
            FrameSnapshot {
                frame: self.frames_done,
                time: self.simulated_time,
                positions: particles.position.clone(),
                velocities: particles.velocity.clone(),
                density: particles.density.clone(),
                pressure: particles.pressure.clone(),
            }
        })
    }

    /// Per-stage timings and per-frame values; empty unless statistics were
    /// enabled before the last reset.
    pub fn statistics(&self) -> Option<String> {
        self.simulation.as_ref().map(write_statistics)
    }
}
