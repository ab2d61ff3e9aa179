use crowdflow_core::{
    AgentId, CellKind, CrowdConfig, GridCell, NavigationField, Obstacle, OccupancyGrid, Position,
    Simulation, Velocity,
};

fn obstacle_course() -> Vec<Obstacle> {
    vec![
        Obstacle::new(100.0, 80.0, 60.0, 40.0),
        Obstacle::new(250.0, 220.0, 40.0, 80.0),
        Obstacle::new(320.0, 40.0, 80.0, 30.0),
    ]
}

#[test]
fn navigation_field_terminates_from_every_walkable_cell() {
    let config = CrowdConfig {
        rng_seed: Some(11),
        ..CrowdConfig::default()
    };
    let obstacles = obstacle_course();
    let grid = OccupancyGrid::build(&config, &obstacles).expect("grid");
    let nav = NavigationField::build(&grid).expect("nav");
    assert_eq!((nav.rows(), nav.cols()), (grid.rows(), grid.cols()));
    assert_eq!(nav.steps().len(), grid.rows() * grid.cols());
    let step_budget = grid.rows() * grid.cols();

    for row in 0..grid.rows() {
        for col in 0..grid.cols() {
            let start = GridCell::new(row, col);
            if !grid.is_walkable(start) {
                continue;
            }
            let mut cell = start;
            let mut steps = 0;
            while grid.kind_at(cell) != Some(CellKind::Exit) {
                let step = nav.step_at(cell).expect("cell in range");
                assert!(
                    !step.is_zero(),
                    "walkable non-exit cell {cell:?} must carry a step"
                );
                cell = GridCell::new(
                    (cell.row as isize + step.dr as isize) as usize,
                    (cell.col as isize + step.dc as isize) as usize,
                );
                assert!(grid.is_walkable(cell), "step from {start:?} left the grid");
                steps += 1;
                assert!(steps <= step_budget, "cycle detected from {start:?}");
            }
        }
    }
}

#[test]
fn seeded_simulations_advance_in_lockstep() {
    let config = CrowdConfig {
        agent_count: 40,
        rng_seed: Some(0xDEAD_BEEF),
        ..CrowdConfig::default()
    };
    let obstacles = obstacle_course();
    let mut sim_a = Simulation::new(config.clone(), obstacles.clone()).expect("sim a");
    let mut sim_b = Simulation::new(config, obstacles).expect("sim b");

    assert_eq!(sim_a.snapshot(), sim_b.snapshot());
    for _ in 0..100 {
        assert_eq!(sim_a.step(), sim_b.step());
    }
}

#[test]
fn snapshot_reports_without_advancing() {
    let config = CrowdConfig {
        agent_count: 5,
        rng_seed: Some(21),
        ..CrowdConfig::default()
    };
    let mut sim = Simulation::new(config, Vec::new()).expect("sim");

    let first = sim.snapshot();
    let second = sim.snapshot();
    assert_eq!(first, second);
    assert_eq!(first.tick.0, 0);
    assert!(first.running);
    assert_eq!(first.agents.len(), 5);
    assert!(first.agents.iter().all(|agent| !agent.exited));

    let stepped = sim.step();
    assert_eq!(stepped.tick.0, 1);
}

#[test]
fn step_report_round_trips_through_json() {
    let config = CrowdConfig {
        agent_count: 4,
        rng_seed: Some(13),
        ..CrowdConfig::default()
    };
    let mut sim = Simulation::new(config, obstacle_course()).expect("sim");
    let report = sim.step();

    let encoded = serde_json::to_string(&report).expect("encode");
    let decoded = serde_json::from_str(&encoded).expect("decode");
    assert_eq!(report, decoded);
}

#[test]
fn lone_agent_accelerates_straight_toward_exit_and_leaves() {
    let config = CrowdConfig {
        world_width: 100,
        world_height: 90,
        cell_size: 10,
        exit_row_start: 4,
        exit_row_end: 5,
        agent_count: 1,
        rng_seed: Some(3),
        ..CrowdConfig::default()
    };
    let mut sim = Simulation::new(config, Vec::new()).expect("sim");

    // Park the agent one cell left of the exit, on the vertical center line
    // so the top and bottom wall forces cancel.
    let cell = GridCell::new(4, 8);
    let center = sim.grid().cell_center(cell);
    let id: AgentId = sim.agents().keys().next().expect("one agent");
    {
        let agent = sim.agents_mut().get_mut(id).expect("agent");
        agent.position = center;
        agent.cell = cell;
        agent.velocity = Velocity::default();
    }

    sim.step();
    let agent = sim.agents()[id];
    assert!(
        agent.velocity.vx > 0.0,
        "first step must accelerate toward the exit, got {:?}",
        agent.velocity
    );
    assert!(
        agent.velocity.vy.abs() < 1e-6,
        "wall forces on the center line must cancel, got {:?}",
        agent.velocity
    );

    let mut ticks = 0;
    while sim.is_running() {
        sim.step();
        ticks += 1;
        assert!(ticks < 200, "agent failed to reach the adjacent exit");
    }
    let agent = sim.agents()[id];
    assert!(agent.exited);
    assert_eq!(
        sim.grid().kind_at(agent.cell),
        Some(CellKind::Exit),
        "exited agents rest on the exit cell that absorbed them"
    );
}

#[test]
fn paired_agents_feel_equal_and_opposite_repulsion() {
    let config = CrowdConfig {
        world_width: 2000,
        world_height: 400,
        agent_count: 2,
        rng_seed: Some(17),
        ..CrowdConfig::default()
    };
    let mut sim = Simulation::new(config.clone(), Vec::new()).expect("sim");

    // Two agents 12 units apart, far from every wall and obstacle.
    let pos_a = Position::new(994.0, 205.0);
    let pos_b = Position::new(1006.0, 205.0);
    let cell_a = sim.grid().cell_at(pos_a);
    let cell_b = sim.grid().cell_at(pos_b);
    let ids: Vec<AgentId> = sim.agents().keys().collect();
    {
        let agents = sim.agents_mut();
        let a = agents.get_mut(ids[0]).expect("agent a");
        a.position = pos_a;
        a.cell = cell_a;
        a.velocity = Velocity::default();
        let b = agents.get_mut(ids[1]).expect("agent b");
        b.position = pos_b;
        b.cell = cell_b;
        b.velocity = Velocity::default();
    }

    let dir_a = sim.navigation_field().direction_at(cell_a);
    let dir_b = sim.navigation_field().direction_at(cell_b);
    sim.step();

    // A * exp((d - r_a - r_b) / B) at d = 12.
    let magnitude = config.repulsion_strength
        * ((12.0 - 2.0 * config.agent_radius) / config.repulsion_decay).exp();
    let dt = config.dt;

    let a = sim.agents()[ids[0]];
    let b = sim.agents()[ids[1]];
    let expected_a_vx = (config.desired_speed * dir_a[0] - magnitude) * dt;
    let expected_b_vx = (config.desired_speed * dir_b[0] + magnitude) * dt;
    assert!(
        (a.velocity.vx - expected_a_vx).abs() < 1e-4,
        "left agent vx {} expected {expected_a_vx}",
        a.velocity.vx
    );
    assert!(
        (b.velocity.vx - expected_b_vx).abs() < 1e-4,
        "right agent vx {} expected {expected_b_vx}",
        b.velocity.vx
    );
    assert!((a.velocity.vy - config.desired_speed * dir_a[1] * dt).abs() < 1e-4);
    assert!((b.velocity.vy - config.desired_speed * dir_b[1] * dt).abs() < 1e-4);

    // The mutual push is symmetric: both drives deviate by the same amount,
    // in opposite directions.
    let deviation_a = a.velocity.vx - config.desired_speed * dir_a[0] * dt;
    let deviation_b = b.velocity.vx - config.desired_speed * dir_b[0] * dt;
    assert!(
        (deviation_a + deviation_b).abs() < 1e-5,
        "repulsion must be equal and opposite ({deviation_a} vs {deviation_b})"
    );
}

#[test]
fn runaway_agent_is_clamped_to_the_nearest_cell_center() {
    let config = CrowdConfig {
        world_width: 100,
        world_height: 100,
        cell_size: 10,
        exit_row_start: 4,
        exit_row_end: 6,
        agent_count: 1,
        rng_seed: Some(5),
        ..CrowdConfig::default()
    };
    let mut sim = Simulation::new(config, Vec::new()).expect("sim");
    let id: AgentId = sim.agents().keys().next().expect("one agent");
    {
        let agent = sim.agents_mut().get_mut(id).expect("agent");
        agent.position = Position::new(55.0, 55.0);
        agent.cell = GridCell::new(5, 5);
        agent.velocity = Velocity::new(-50_000.0, -50_000.0);
    }

    sim.step();
    let agent = sim.agents()[id];
    assert_eq!(agent.cell, GridCell::new(0, 0));
    assert_eq!(agent.position, sim.grid().cell_center(GridCell::new(0, 0)));
    assert!(agent.cell.row < sim.grid().rows() && agent.cell.col < sim.grid().cols());

    let report = sim.snapshot();
    let summary = report
        .agents
        .iter()
        .find(|summary| summary.id == id)
        .expect("summary");
    assert_eq!(summary.position, agent.position);
}

#[test]
fn evacuation_completes_and_further_steps_are_noops() {
    let config = CrowdConfig {
        world_width: 300,
        world_height: 200,
        cell_size: 10,
        exit_row_start: 8,
        exit_row_end: 12,
        agent_count: 6,
        rng_seed: Some(42),
        ..CrowdConfig::default()
    };
    let obstacles = vec![Obstacle::new(100.0, 60.0, 40.0, 40.0)];
    let mut sim = Simulation::new(config, obstacles).expect("sim");

    let mut ticks = 0;
    while sim.is_running() {
        let report = sim.step();
        assert_eq!(report.running, sim.is_running());
        ticks += 1;
        assert!(ticks < 3000, "evacuation did not complete");
    }

    let terminal = sim.snapshot();
    assert!(!terminal.running);
    assert!(terminal.agents.iter().all(|agent| agent.exited));

    // Completion is terminal and idempotent: the tick counter freezes and
    // repeated steps return the identical report.
    for _ in 0..3 {
        let repeat = sim.step();
        assert_eq!(repeat, terminal);
    }
}
