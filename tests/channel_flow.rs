use river_sph::{
    concurrency::ComputeContext,
    floating_type_mod::FT,
    occupancy_mask::OccupancyMask,
    session::SimulationSession,
    simulation_parameters::{NeighborhoodSearchAlgorithm, SimulationParams, SolverConfig},
    V2,
};

const FRAME: FT = 1. / 60.;

fn session_with(params: SimulationParams, solver: SolverConfig, mask: OccupancyMask) -> SimulationSession {
    let mut session = SimulationSession::new(ComputeContext::global(), params, solver).unwrap();
    session.reset(mask).unwrap();
    assert!(session.is_ready());
    session
}

fn assert_inside_domain(positions: &[V2], lx: FT, ly: FT, eps: FT) {
    for (i, p) in positions.iter().enumerate() {
        assert!(p.x.is_finite() && p.y.is_finite(), "particle {} is not finite: {:?}", i, p);
        assert!(p.x >= 0. && p.x < lx, "particle {} left the periodic range: {:?}", i, p);
        assert!(p.y >= -eps && p.y <= ly + eps, "particle {} left the channel: {:?}", i, p);
    }
}

fn average_speed(velocities: &[V2]) -> FT {
    velocities.iter().map(|v| v.norm()).sum::<FT>() / velocities.len() as FT
}

/// 512 x 256 straight channel over the full width, 10k particles, default
/// parameters, 100 frames.
#[test]
fn straight_channel_end_to_end() {
    let mask = OccupancyMask::straight_channel(512, 256, 64, 191).unwrap();
    let mut params = SimulationParams::default();
    params.particles.count = 10_000;

    let mut session = session_with(params, SolverConfig::default(), mask);
    let (_, max) = session.domain_bounds().unwrap();
    let (lx, ly) = (max.x, max.y);
    river_sph::assert_ft_approx_eq(lx, 20., 1e-5, || "Lx".into());
    river_sph::assert_ft_approx_eq(ly, 10., 1e-5, || "Ly".into());

    let rest_density = params.sph.rest_density;
    for frame in 1..=100 {
        assert!(session.step(FRAME));
        assert_eq!(session.particle_count(), 10_000);
        assert_inside_domain(session.positions(), lx, ly, 1e-4);

        if frame >= 50 {
            let avg_density = session.simulation().unwrap().average_density();
            assert!(
                (avg_density - rest_density).abs() <= 0.2 * rest_density,
                "frame {}: average density {} too far from {}",
                frame,
                avg_density,
                rest_density
            );
        }
    }

    // the drive pushes the fluid along +x
    let mean_vx = session.velocities().iter().map(|v| v.x).sum::<FT>() / 10_000.;
    assert!(mean_vx > 0.5, "mean x velocity {}", mean_vx);
    assert!(session.velocities().iter().all(|v| v.norm() <= params.sph.max_speed * 1.001));
}

#[test]
fn fluid_at_rest_stays_at_rest() {
    let mask = OccupancyMask::straight_channel(128, 64, 16, 47).unwrap();
    let mut params = SimulationParams::default();
    params.domain.width = 10.;
    params.particles.count = 2000;
    params.flow.drive_accel = 0.;
    params.flow.drag_k = 0.;

    let mut session = session_with(params, SolverConfig::default(), mask);

    let mut early_peak: FT = 0.;
    for frame in 1..=60 {
        assert!(session.step(FRAME));
        let speed = average_speed(session.velocities());
        if frame <= 10 {
            early_peak = early_peak.max(speed);
        }
    }

    // the jittered lattice relaxes, nothing accelerates the fluid afterwards
    let final_speed = average_speed(session.velocities());
    assert!(final_speed < 0.3, "average speed {} after settling", final_speed);
    assert!(final_speed < early_peak, "{} >= {}", final_speed, early_peak);
}

#[test]
fn particle_count_is_conserved_with_linked_list_grid() {
    let mask = OccupancyMask::default_channel(256, 128);
    let mut params = SimulationParams::default();
    params.particles.count = 3000;
    let solver = SolverConfig {
        neighborhood_search_algorithm: NeighborhoodSearchAlgorithm::LinkedList,
        ..SolverConfig::default()
    };

    let mut session = session_with(params, solver, mask);
    let (_, max) = session.domain_bounds().unwrap();

    for _ in 0..40 {
        assert!(session.step(FRAME));
        assert_eq!(session.positions().len(), 3000);
        assert_eq!(session.velocities().len(), 3000);
        assert_inside_domain(session.positions(), max.x, max.y, 1e-4);
    }

    let snapshot = session.snapshot().unwrap();
    assert_eq!(snapshot.frame, 40);
    assert!(snapshot.density.iter().all(|rho| rho.is_finite() && *rho > 0.));
    assert!(snapshot.pressure.iter().all(|p| p.is_finite() && *p >= 0.));
}

#[test]
fn grid_strategies_agree() {
    let mask = OccupancyMask::straight_channel(128, 64, 16, 47).unwrap();
    let mut params = SimulationParams::default();
    params.domain.width = 10.;
    params.particles.count = 1500;

    let mut sessions = [NeighborhoodSearchAlgorithm::CountingSort, NeighborhoodSearchAlgorithm::LinkedList]
        .iter()
        .map(|&neighborhood_search_algorithm| {
            let solver = SolverConfig {
                neighborhood_search_algorithm,
                ..SolverConfig::default()
            };
            session_with(params, solver, mask.clone())
        })
        .collect::<Vec<_>>();

    assert_eq!(sessions[0].positions(), sessions[1].positions());
    for session in &mut sessions {
        assert!(session.step(FRAME));
    }

    // same neighbors, only the summation order differs
    let mean_deviation = sessions[0]
        .positions()
        .iter()
        .zip(sessions[1].positions())
        .map(|(a, b)| {
            let dx = (a.x - b.x).abs();
            V2::new(dx.min(10. - dx), a.y - b.y).norm()
        })
        .sum::<FT>()
        / 1500.;
    assert!(mean_deviation < 1e-3, "mean deviation {}", mean_deviation);

    let density = |s: &SimulationSession| s.simulation().unwrap().average_density();
    river_sph::assert_ft_approx_eq(density(&sessions[0]), density(&sessions[1]), 1., || {
        "average density".into()
    });
}

#[test]
fn rejected_update_keeps_session_running() {
    let mut params = SimulationParams::default();
    params.domain.width = 10.;
    let mut session = session_with(
        params,
        SolverConfig::default(),
        OccupancyMask::straight_channel(64, 32, 8, 23).unwrap(),
    );
    assert!(session.step(FRAME));

    let mut params = *session.params();
    params.particles.count = 500;
    assert!(session.update_params(params).is_err());
    assert!(session.is_ready());
    assert_eq!(session.particle_count(), 1000);
    assert!(session.step(FRAME));
}

#[test]
fn session_without_reset_never_steps() {
    let context = ComputeContext::with_threads_or_global(Some(2));
    let mut session = SimulationSession::new(context, SimulationParams::default(), SolverConfig::default()).unwrap();
    assert!(!session.step(FRAME));
    assert!(session.sdf().is_none());
    assert!(session.boundary_positions().is_empty());

    // an unusable mask is reported at construction and never reaches a session
    assert!(OccupancyMask::from_fn(64, 32, |_, _| false).is_err());
    assert!(OccupancyMask::straight_channel(3, 32, 0, 31).is_err());
}
