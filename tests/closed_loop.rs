use std::cell::Cell;

use bicycle_mpc::control::{HorizonProblem, Solution};
use bicycle_mpc::path_planning::SpeedProfileConstraints;
use bicycle_mpc::simulation::ControlSource;
use bicycle_mpc::*;

fn speed_limits() -> SpeedProfileConstraints {
    SpeedProfileConstraints { a_min: -0.5, a_max: 0.5, v_min: 0.0, v_max: 1.0, ay_max: 0.5 }
}

fn mpc_config(horizon: usize) -> MpcConfig {
    MpcConfig {
        horizon,
        ts: 0.1,
        v_min: 0.0,
        v_max: 1.2,
        e_y_max: 2.0,
        acc_max: 1.0,
        obstacle_buffer: 0.1,
        ..Default::default()
    }
}

fn straight_path(length: f64) -> ReferencePath {
    let mut path = ReferencePath::new(&[0.0, length], &[0.0, 0.0], 0.1, Smoothing::None, false).unwrap();
    path.compute_speed_profile(&speed_limits()).unwrap();
    path
}

fn square_path(side: f64) -> ReferencePath {
    let mut path = ReferencePath::new(
        &[0.0, side, side, 0.0],
        &[0.0, 0.0, side, side],
        0.1,
        Smoothing::MovingAverage { window: 51 },
        true,
    )
    .unwrap();
    path.compute_speed_profile(&speed_limits()).unwrap();
    path
}

fn offset_loop<S: NlpSolver>(solver: S, y0: f64) -> ControlLoop<S> {
    let controller = MpcController::new(mpc_config(20), VehicleParams::default(), solver).unwrap();
    ControlLoop::new(
        straight_path(40.0),
        controller,
        LoopConfig::default(),
        VehicleState::new(0.0, y0, 0.0, 1.0),
    )
    .unwrap()
}

// fails exactly on call `fail_on`, otherwise delegates
struct FlakySolver {
    inner: AugmentedLagrangianSolver,
    calls: Cell<usize>,
    fail_on: usize,
}

impl NlpSolver for FlakySolver {
    fn solve(&self, problem: &HorizonProblem, guess: &[ControlInput]) -> Result<Solution, SolverError> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        if call == self.fail_on {
            return Err(SolverError::Infeasible { max_violation: 0.1 });
        }
        self.inner.solve(problem, guess)
    }
}

struct BrokenSolver;

impl NlpSolver for BrokenSolver {
    fn solve(&self, _problem: &HorizonProblem, _guess: &[ControlInput]) -> Result<Solution, SolverError> {
        Err(SolverError::SolverFailure("diverged".to_string()))
    }
}

#[test]
fn test_plant_drives_straight_without_input() {
    let model = BicycleModel::new(VehicleParams::default(), 0.1).unwrap();
    let sim = Simulator::new(model);
    let mut state = VehicleState::new(0.0, 0.0, 0.0, 0.8);
    for _ in 0..50 {
        state = sim.step(&state, &ControlInput::zero(), 0.1).unwrap();
    }
    assert!((state.pos_x - 4.0).abs() < 1e-9);
    assert!(state.pos_y.abs() < 1e-12);
}

#[test]
fn test_converges_from_lateral_offset() {
    let y0 = 0.1;
    let mut cl = offset_loop(AugmentedLagrangianSolver::default(), y0);

    let first = cl.tick().unwrap();
    assert_eq!(first.source, ControlSource::Optimal);
    assert!(first.control.delta < 0.0, "first command steers away from the path");

    let mut lateral = vec![first.state.pos_y.abs()];
    for _ in 1..80 {
        let out = cl.tick().unwrap();
        assert_eq!(out.source, ControlSource::Optimal);
        lateral.push(out.state.pos_y.abs());
    }

    let worst = lateral.iter().cloned().fold(0.0, f64::max);
    assert!(worst <= y0 + 1e-3, "lateral error grew to {}", worst);
    assert!(lateral[20] < y0);
    let tail = &lateral[60..];
    assert!(tail.iter().all(|&e| e < 0.02), "residual error {:?}", tail);
    assert!(cl.state().psi.abs() < 0.05);
}

#[test]
fn test_keeps_clear_of_obstacle_on_square() {
    let obstacle = Obstacle::new(10.0, 5.0, 0.3);
    let path = square_path(10.0);
    let controller = MpcController::new(mpc_config(25), VehicleParams::default(), AugmentedLagrangianSolver::default())
        .unwrap()
        .with_obstacles(&[obstacle])
        .unwrap();
    let margin = controller.model().safety_margin();
    let start = *path.get_waypoint(0).unwrap();
    let config = LoopConfig { max_iterations: 320, ..Default::default() };
    let mut cl = ControlLoop::new(path, controller, config, VehicleState::new(start.x, start.y, start.psi, 0.0)).unwrap();

    let termination = cl.run().unwrap();
    assert_eq!(termination, Termination::IterationLimit);

    let records = cl.log().records();
    for record in records {
        let d = obstacle.center_distance(&record.state().position());
        assert!(d >= obstacle.radius + margin, "t={:.1}: {:.3} m from the obstacle center", record.t, d);
    }

    // the obstacle sits about 15 m along the path, halfway up the second side
    assert!(cl.traveled_distance() > 17.0, "stuck after {:.2} m at {:?}", cl.traveled_distance(), cl.state());
    let beyond = records.iter().position(|r| r.y > obstacle.cy + obstacle.radius && (r.x - obstacle.cx).abs() < 2.0);
    assert!(beyond.is_some(), "never got past the obstacle, ended at {:?}", cl.state());
    assert!(records.iter().all(|r| r.vel > -1e-9));
}

#[test]
fn test_single_infeasible_tick_is_absorbed() {
    let solver = FlakySolver { inner: AugmentedLagrangianSolver::default(), calls: Cell::new(0), fail_on: 5 };
    let mut cl = offset_loop(solver, 0.1);

    let mut outcomes = Vec::new();
    for _ in 0..30 {
        outcomes.push(cl.tick().unwrap());
    }

    assert_eq!(outcomes[5].source, ControlSource::HoldLast);
    assert_eq!(outcomes[5].control, outcomes[4].control);
    assert!(outcomes.iter().enumerate().all(|(i, o)| i == 5 || o.source == ControlSource::Optimal));
    assert_eq!(cl.consecutive_failures(), 0);
    assert!(cl.controller().warm_start().is_some());
    assert!(outcomes[29].state.pos_y.abs() < 0.1);
    assert!(outcomes.iter().all(|o| o.state.is_finite()));
}

#[test]
fn test_persistent_failure_stops_the_run() {
    let mut cl = offset_loop(BrokenSolver, 0.0);
    match cl.run().unwrap() {
        Termination::ConsecutiveFailures { failures, last_error } => {
            assert_eq!(failures, 3);
            assert!(last_error.contains("diverged"));
        }
        other => panic!("unexpected termination {:?}", other),
    }

    let records = cl.log().records();
    assert_eq!(records.len(), 3);
    // hold, then brake
    assert_eq!(records[0].acc, 0.0);
    assert!((records[1].acc + 0.5).abs() < 1e-12);
    assert!((records[2].acc + 0.5).abs() < 1e-12);
    assert!(records[2].vel < records[0].vel);
}

#[test]
fn test_run_log_exports_csv() {
    let mut cl = offset_loop(AugmentedLagrangianSolver::default(), 0.05);
    for _ in 0..10 {
        cl.tick().unwrap();
    }
    let mut buf = Vec::new();
    cl.log().write_csv(&mut buf).unwrap();
    let text = String::from_utf8(buf).unwrap();
    assert_eq!(text.lines().count(), 11);
    assert!(text.starts_with("t,x,y,psi,vel,acc,delta"));
}

#[test]
fn test_bundled_scenario_builds_and_runs() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/params/square_obstacles.toml");
    let scenario = config::load(path).unwrap();
    assert_eq!(scenario.obstacles.len(), 2);
    assert_eq!(scenario.control_loop.max_laps, Some(1.0));

    let mut cl = scenario.build().unwrap();
    let first = cl.tick().unwrap();
    assert_eq!(first.source, ControlSource::Optimal);

    assert_eq!(cl.run().unwrap(), Termination::LapsCompleted);
    assert!(cl.traveled_distance() >= cl.path().length());
    let margin = cl.controller().model().safety_margin();
    for record in cl.log().records() {
        for obstacle in &scenario.obstacles {
            let d = obstacle.center_distance(&record.state().position());
            assert!(d >= obstacle.radius + margin, "t={:.1}: {:.3} m from {:?}", record.t, d, obstacle);
        }
    }
}
