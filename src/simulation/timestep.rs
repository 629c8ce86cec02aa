use crate::{
    floating_type_mod::FT,
    simulation_parameters::{DerivedQuantities, SimulationParams},
};

/// CFL number applied to `h / (c0 + v_target)`.
pub const CFL_FACTOR: FT = 0.25;

/// Upper bound on substeps per frame. Only a degenerate `dt_cfl` (zero or
/// subnormal smoothing length) reaches it; below the cap `dt <= dt_cfl` holds.
pub const MAX_SUBSTEPS: u32 = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimestepSchedule {
    pub substeps: u32,
    /// step size of one substep, `substeps * dt == fixed_dt`
    pub dt: FT,
    pub dt_cfl: FT,
}

pub struct TimestepController;

impl TimestepController {
    /// Split one frame (`time.fixed_dt`) into equally sized substeps that respect
    /// the CFL limit for the current sound speed and the expected drift speed
    /// `drive / drag`.
    pub fn derive(params: &SimulationParams, derived: &DerivedQuantities) -> TimestepSchedule {
        let fixed_dt = params.time.fixed_dt;
        let target_velocity = params.flow.drive_accel / FT::max(params.flow.drag_k, 1e-3);
        let c0 = FT::max(params.sph.sound_speed, 1e-3);
        let dt_cfl = CFL_FACTOR * derived.h / FT::max(c0 + target_velocity, 1e-3);

        let min_substeps = params.time.substeps.max(1);
        let needed_substeps = (fixed_dt / dt_cfl).ceil();
        // 0/0 has no meaningful request, an infinite one saturates at the cap
        let needed_substeps = if needed_substeps.is_nan() {
            1
        } else {
            needed_substeps.clamp(1., MAX_SUBSTEPS as FT) as u32
        };
        let substeps = u32::max(min_substeps, needed_substeps).min(MAX_SUBSTEPS.max(min_substeps));

        TimestepSchedule {
            substeps,
            dt: fixed_dt / substeps as FT,
            dt_cfl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn derived_with_h(h: FT) -> DerivedQuantities {
        let params = SimulationParams::default();
        let mut derived = DerivedQuantities::compute(&params, 10., 0.5);
        derived.h = h;
        derived
    }

    #[test]
    fn cfl_substeps_without_drive() {
        let mut params = SimulationParams::default();
        params.time.fixed_dt = 1. / 60.;
        params.sph.sound_speed = 20.;
        params.flow.drive_accel = 0.;

        let schedule = TimestepController::derive(&params, &derived_with_h(0.02));

        // dt_cfl = 0.25 * 0.02 / 20 = 2.5e-4, 1/60 / 2.5e-4 = 66.67
        assert_eq!(schedule.substeps, 67);
        assert!(schedule.substeps >= params.time.substeps);
        assert!(schedule.dt <= schedule.dt_cfl);
        crate::assert_ft_approx_eq(schedule.dt * schedule.substeps as FT, params.time.fixed_dt, 1e-6, || {
            "dt * substeps".into()
        });
    }

    #[test]
    fn minimum_substeps_win_for_coarse_resolution() {
        let mut params = SimulationParams::default();
        params.time.substeps = 8;
        params.flow.drive_accel = 0.;

        let schedule = TimestepController::derive(&params, &derived_with_h(10.));
        assert_eq!(schedule.substeps, 8);
        crate::assert_ft_approx_eq(schedule.dt, params.time.fixed_dt / 8., 1e-7, || "dt".into());
    }

    #[test]
    fn drive_speed_and_zero_drag_are_guarded() {
        let mut params = SimulationParams::default();
        params.flow.drag_k = 0.;
        params.flow.drive_accel = 6.;

        // target velocity = 6 / 1e-3 = 6000, dt_cfl = 0.005 / 6020 = 8.3e-7
        let schedule = TimestepController::derive(&params, &derived_with_h(0.02));
        assert!(schedule.dt_cfl.is_finite() && schedule.dt_cfl > 0.);
        assert!(schedule.dt_cfl < 1e-6);
        assert!(schedule.substeps < MAX_SUBSTEPS);
        assert!(schedule.substeps > 20_000, "{} substeps", schedule.substeps);
        assert!(schedule.dt <= schedule.dt_cfl, "dt {} > dt_cfl {}", schedule.dt, schedule.dt_cfl);

        let mut params = SimulationParams::default();
        params.time.substeps = 0;
        params.sph.sound_speed = 0.;
        let schedule = TimestepController::derive(&params, &derived_with_h(1.));
        assert!(schedule.substeps >= 1);
        assert!(schedule.dt.is_finite());
    }

    #[test]
    fn degenerate_smoothing_length_hits_the_cap() {
        let params = SimulationParams::default();
        let schedule = TimestepController::derive(&params, &derived_with_h(0.));
        assert_eq!(schedule.dt_cfl, 0.);
        assert_eq!(schedule.substeps, MAX_SUBSTEPS);
        assert!(schedule.dt.is_finite() && schedule.dt > 0.);
    }

    #[test]
    fn substeps_respect_cfl_across_parameter_range() {
        for &h in &[0.005, 0.02, 0.1, 0.5] {
            for &drag_k in &[0., 0.1, 0.8, 5.] {
                for &sound_speed in &[5., 20., 80.] {
                    let mut params = SimulationParams::default();
                    params.flow.drag_k = drag_k;
                    params.sph.sound_speed = sound_speed;
                    let schedule = TimestepController::derive(&params, &derived_with_h(h));

                    assert!(schedule.substeps >= params.time.substeps);
                    assert!(schedule.substeps < MAX_SUBSTEPS);
                    assert!(
                        schedule.dt <= schedule.dt_cfl * (1. + 1e-5),
                        "h {} drag {} c0 {}: dt {} > dt_cfl {}",
                        h,
                        drag_k,
                        sound_speed,
                        schedule.dt,
                        schedule.dt_cfl
                    );
                }
            }
        }
    }
}
