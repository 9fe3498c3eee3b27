use super::*;
use approx::assert_abs_diff_eq;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::cell::Cell as Counter;
use std::ops::ControlFlow;

fn decay_model() -> ExpressionModel {
    ExpressionModel::builder("engine.time")
        .pace("engine.pace")
        .diffusion("engine.diffusion")
        .state("cell.x", 1.0, Some("-cell.x + engine.pace"))
        .coupling_state("cell.x")
        .build()
        .unwrap()
}

fn two_state_model() -> ExpressionModel {
    ExpressionModel::builder("engine.time")
        .diffusion("engine.diffusion")
        .state("cell.x", 1.0, Some("-cell.x"))
        .state("cell.y", 0.0, Some("cell.x - cell.y"))
        .variable("cell.v", Some("2 * cell.x"))
        .coupling_state("cell.x")
        .build()
        .unwrap()
}

fn simulation(shape: Shape) -> Simulation<ExpressionModel> {
    Simulation::new(decay_model(), None, shape).unwrap()
}

fn cells(indices: &[usize]) -> Vec<topology::Cell> {
    indices.iter().map(|&idx| topology::Cell::Index(idx)).collect()
}

#[test]
fn linear_neighbors_follow_the_strand() {
    for n in 2..8 {
        let sim = simulation(Shape::Linear(n));
        assert_eq!(sim.neighbors(&[0]).unwrap(), cells(&[1]));
        assert_eq!(sim.neighbors(&[n as i64 - 1]).unwrap(), cells(&[n - 2]));
        for i in 1..n - 1 {
            assert_eq!(sim.neighbors(&[i as i64]).unwrap(), cells(&[i - 1, i + 1]));
        }
    }
}

#[test]
fn grid_neighbors_are_von_neumann() {
    let sim = simulation(Shape::Grid(3, 3));
    let xy = |x, y| topology::Cell::Xy(x, y);
    assert_eq!(sim.neighbors(&[0, 0]).unwrap(), vec![xy(1, 0), xy(0, 1)]);
    assert_eq!(
        sim.neighbors(&[1, 0]).unwrap(),
        vec![xy(0, 0), xy(2, 0), xy(1, 1)]
    );
    assert_eq!(
        sim.neighbors(&[1, 1]).unwrap(),
        vec![xy(1, 0), xy(0, 1), xy(2, 1), xy(1, 2)]
    );
}

#[test]
fn random_grids_have_expected_neighbor_counts() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for _ in 0..20 {
        let nx: usize = rng.random_range(2..=12);
        let ny: usize = rng.random_range(2..=12);
        let topology = Topology::new(Shape::Grid(nx, ny)).unwrap();
        for y in 0..ny {
            for x in 0..nx {
                let on_x_edge = x == 0 || x == nx - 1;
                let on_y_edge = y == 0 || y == ny - 1;
                let expected = match (on_x_edge, on_y_edge) {
                    (true, true) => 2,
                    (true, false) | (false, true) => 3,
                    (false, false) => 4,
                };
                let found = topology.neighbors(&[x as i64, y as i64]).unwrap();
                assert_eq!(found.len(), expected, "cell ({x}, {y}) of {nx}x{ny}");
            }
        }
        let edges = (nx - 1) * ny + nx * (ny - 1);
        assert_eq!(topology.adjacency().relation_count(), 2 * edges);
    }
}

#[test]
fn scalar_has_no_neighbors() {
    let sim = simulation(Shape::Scalar);
    assert!(sim.neighbors(&[0]).unwrap().is_empty());
    assert!(!sim.is_2d());
}

#[test]
fn addresses_are_checked_against_the_shape() {
    let sim = simulation(Shape::Grid(4, 3));
    assert!(sim.is_2d());
    assert!(matches!(
        sim.neighbors(&[1]),
        Err(SimError::DimensionMismatch(_))
    ));
    assert!(matches!(
        sim.neighbors(&[4, 0]),
        Err(SimError::OutOfRange(_))
    ));
    assert!(matches!(
        sim.neighbors(&[0, -1]),
        Err(SimError::OutOfRange(_))
    ));

    let sim = simulation(Shape::Linear(5));
    assert!(matches!(
        sim.state(Some(&[0, 0])),
        Err(SimError::DimensionMismatch(_))
    ));
    assert!(matches!(sim.state(Some(&[5])), Err(SimError::OutOfRange(_))));
}

#[test]
fn empty_shapes_are_rejected() {
    for shape in [Shape::Linear(0), Shape::Graph(0), Shape::Grid(0, 3)] {
        assert!(matches!(
            Topology::new(shape),
            Err(SimError::InvalidArgument(_))
        ));
    }
}

#[test]
fn graph_neighbors_come_from_connections() {
    let mut sim = simulation(Shape::Graph(4));
    assert!(sim.neighbors(&[0]).unwrap().is_empty());
    sim.set_connections(&[(0, 2, 1.0), (3, 0, 0.5)]).unwrap();
    assert_eq!(sim.neighbors(&[0]).unwrap(), cells(&[2, 3]));
    assert_eq!(sim.neighbors(&[3]).unwrap(), cells(&[0]));
    assert!(sim.neighbors(&[1]).unwrap().is_empty());
    assert_eq!(sim.connections().len(), 2);
    assert_eq!(sim.connections()[1].conductance, 0.5);
}

#[test]
fn invalid_connections_are_rejected() {
    let mut sim = simulation(Shape::Graph(3));
    for edges in [
        vec![(0i64, 0, 1.0)],
        vec![(-1, 0, 1.0)],
        vec![(0, 3, 1.0)],
        vec![(0, 1, 0.0)],
        vec![(0, 1, f64::NAN)],
    ] {
        assert!(matches!(
            sim.set_connections(&edges),
            Err(SimError::InvalidConnection(_))
        ));
    }
    for edges in [
        vec![(0i64, 1, 1.0), (0, 1, 1.0)],
        vec![(0, 1, 1.0), (1, 0, 1.0)],
    ] {
        assert!(matches!(
            sim.set_connections(&edges),
            Err(SimError::DuplicateConnection(_))
        ));
    }
}

#[test]
fn failed_set_connections_keeps_previous_set() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let n = 16;
    let mut sim = simulation(Shape::Graph(n));
    let mut edges = Vec::new();
    for a in 0..n as i64 {
        let b = rng.random_range(0..n as i64);
        if a < b {
            edges.push((a, b, rng.random_range(0.1..2.0)));
        }
    }
    sim.set_connections(&edges).unwrap();
    let before = sim.connections().to_vec();
    let neighbors_before = sim.neighbors(&[0]).unwrap();

    let mut broken = edges.clone();
    broken.push((1, n as i64, 1.0));
    assert!(sim.set_connections(&broken).is_err());
    assert_eq!(sim.connections(), before.as_slice());
    assert_eq!(sim.neighbors(&[0]).unwrap(), neighbors_before);
}

#[test]
fn connections_require_a_graph() {
    let mut sim = simulation(Shape::Linear(3));
    assert!(matches!(
        sim.set_connections(&[(0, 1, 1.0)]),
        Err(SimError::InvalidArgument(_))
    ));
}

#[test]
fn initial_state_is_default_everywhere() {
    for shape in [
        Shape::Scalar,
        Shape::Linear(3),
        Shape::Grid(2, 3),
        Shape::Graph(4),
    ] {
        let sim = Simulation::new(two_state_model(), None, shape).unwrap();
        let expected = sim.default_state().repeat(shape.cell_count());
        assert_eq!(sim.state(None).unwrap(), expected);
    }
}

#[test]
fn set_state_broadcasts_or_targets_one_cell() {
    let mut sim = Simulation::new(two_state_model(), None, Shape::Grid(3, 2)).unwrap();
    sim.set_state(&[4.0, 5.0], None).unwrap();
    for y in 0..2 {
        for x in 0..3 {
            assert_eq!(sim.state(Some(&[x, y])).unwrap(), vec![4.0, 5.0]);
        }
    }
    sim.set_state(&[1.0, 2.0], Some(&[2, 1])).unwrap();
    assert_eq!(sim.state(Some(&[2, 1])).unwrap(), vec![1.0, 2.0]);
    assert_eq!(sim.state(Some(&[1, 1])).unwrap(), vec![4.0, 5.0]);

    assert!(matches!(
        sim.set_state(&[1.0], None),
        Err(SimError::ShapeMismatch(_))
    ));
    assert!(matches!(
        sim.set_state_all(&[0.0; 11]),
        Err(SimError::ShapeMismatch(_))
    ));
    assert_eq!(sim.state(Some(&[0, 0])).unwrap(), vec![4.0, 5.0]);

    let all: Vec<f64> = (0..12).map(f64::from).collect();
    sim.set_state_all(&all).unwrap();
    assert_eq!(sim.state(Some(&[1, 0])).unwrap(), vec![2.0, 3.0]);
}

#[test]
fn first_cell_is_paced_by_default() {
    let sim = simulation(Shape::Grid(3, 3));
    assert_eq!(sim.paced_cells(), vec![topology::Cell::Xy(0, 0)]);
}

#[test]
fn paced_cell_list_collapses_duplicates() {
    let mut sim = simulation(Shape::Linear(5));
    sim.set_paced_cell_list([[0i64], [0], [0], [3], [3]]).unwrap();
    assert!(sim.is_paced(&[0]).unwrap());
    assert!(!sim.is_paced(&[1]).unwrap());
    assert!(sim.is_paced(&[3]).unwrap());
    assert_eq!(sim.paced_cells(), cells(&[0, 3]));

    assert!(matches!(
        sim.set_paced_cell_list([[-1i64]]),
        Err(SimError::OutOfRange(_))
    ));
    assert!(matches!(
        sim.set_paced_cell_list([[5i64]]),
        Err(SimError::OutOfRange(_))
    ));
    assert_eq!(sim.paced_cells(), cells(&[0, 3]));
}

#[test]
fn paced_ranges_in_one_dimension() {
    let mut sim = simulation(Shape::Linear(10));
    let cases: [(i64, i64, &[usize]); 7] = [
        (3, 2, &[2, 3, 4]),
        (3, -2, &[8, 9]),
        (-3, 5, &[2, 3, 4]),
        (-3, 0, &[7, 8, 9]),
        (-3, -1, &[6, 7, 8]),
        (4, 8, &[8, 9]),
        (0, 0, &[]),
    ];
    for (count, offset, expected) in cases {
        sim.set_paced_cells(&[count], &[offset]).unwrap();
        assert_eq!(
            sim.paced_cells(),
            cells(expected),
            "count {count}, offset {offset}"
        );
    }
}

#[test]
fn paced_ranges_in_two_dimensions() {
    let mut sim = simulation(Shape::Grid(4, 3));
    sim.set_paced_cells(&[2, 2], &[1, -1]).unwrap();
    assert_eq!(
        sim.paced_cells(),
        vec![topology::Cell::Xy(1, 2), topology::Cell::Xy(2, 2)]
    );
    sim.set_paced_cells(&[-1, 1], &[0, 0]).unwrap();
    assert_eq!(sim.paced_cells(), vec![topology::Cell::Xy(3, 0)]);
    assert!(matches!(
        sim.set_paced_cells(&[1], &[0]),
        Err(SimError::DimensionMismatch(_))
    ));
    assert_eq!(sim.paced_cells(), vec![topology::Cell::Xy(3, 0)]);
}

#[test]
fn paced_ranges_with_negative_counts_in_two_dimensions() {
    let xy = |x, y| topology::Cell::Xy(x, y);
    let mut sim = simulation(Shape::Grid(2, 3));
    sim.set_paced_cells(&[-1, -2], &[1, 2]).unwrap();
    assert_eq!(sim.paced_cells(), vec![xy(0, 0), xy(0, 1)]);
    sim.set_paced_cells(&[1, -1], &[0, -1]).unwrap();
    assert_eq!(sim.paced_cells(), vec![xy(0, 1)]);
    sim.set_paced_cells(&[-1, -1], &[0, 0]).unwrap();
    assert_eq!(sim.paced_cells(), vec![xy(1, 2)]);
}

#[test]
fn extreme_paced_ranges_clip_instead_of_overflowing() {
    let mut sim = simulation(Shape::Linear(5));
    sim.set_paced_cells(&[-10], &[i64::MIN]).unwrap();
    assert!(sim.paced_cells().is_empty());
    sim.set_paced_cells(&[i64::MIN], &[i64::MIN]).unwrap();
    assert!(sim.paced_cells().is_empty());
    sim.set_paced_cells(&[i64::MAX], &[0]).unwrap();
    assert_eq!(sim.paced_cells(), cells(&[0, 1, 2, 3, 4]));
    sim.set_paced_cells(&[i64::MIN], &[i64::MAX]).unwrap();
    assert_eq!(sim.paced_cells(), cells(&[0, 1, 2, 3, 4]));
    sim.set_paced_cells(&[i64::MAX], &[i64::MIN]).unwrap();
    sim.set_paced_cells(&[i64::MAX], &[i64::MAX]).unwrap();
    assert!(sim.paced_cells().is_empty());

    let mut sim = simulation(Shape::Grid(2, 3));
    sim.set_paced_cells(&[i64::MIN, i64::MAX], &[i64::MIN, i64::MAX])
        .unwrap();
    assert!(sim.paced_cells().is_empty());
}

#[test]
fn model_without_rhs_is_rejected() {
    let model = ExpressionModel::builder("engine.time")
        .state("cell.x", 0.0, None)
        .coupling_state("cell.x")
        .build()
        .unwrap();
    assert!(!model.is_valid());
    assert!(matches!(
        Simulation::new(model, None, Shape::Linear(3)),
        Err(SimError::MissingRhs(_))
    ));

    let model = ExpressionModel::builder("engine.time")
        .state("cell.x", 0.0, Some("cell.missing"))
        .coupling_state("cell.x")
        .build()
        .unwrap();
    assert_eq!(model.problems().len(), 1);
    assert!(matches!(
        Simulation::new(model, None, Shape::Scalar),
        Err(SimError::MissingRhs(_))
    ));
}

#[test]
fn cyclic_intermediates_are_invalid() {
    let model = ExpressionModel::builder("engine.time")
        .state("cell.x", 0.0, Some("cell.a"))
        .variable("cell.a", Some("cell.b"))
        .variable("cell.b", Some("cell.a + 1"))
        .coupling_state("cell.x")
        .build()
        .unwrap();
    assert!(!model.is_valid());
}

#[test]
fn interdependent_components_are_rejected() {
    let model = ExpressionModel::builder("engine.time")
        .state("membrane.v", 0.0, Some("ina.i + ik.i"))
        .variable("ina.i", Some("ik.g * membrane.v"))
        .variable("ik.i", Some("ina.i * 2"))
        .variable("ik.g", Some("0.5"))
        .coupling_state("membrane.v")
        .build()
        .unwrap();
    assert!(model.is_valid());
    assert!(model.has_interdependent_components());
    assert!(matches!(
        Simulation::new(model, None, Shape::Linear(2)),
        Err(SimError::CoupledComponents(_))
    ));
}

#[test]
fn one_way_component_references_are_fine() {
    let model = ExpressionModel::builder("engine.time")
        .state("membrane.v", 0.0, Some("-ik.i"))
        .variable("ik.i", Some("ik.g * membrane.v"))
        .variable("ik.g", Some("0.5"))
        .coupling_state("membrane.v")
        .build()
        .unwrap();
    assert!(model.is_valid());
    assert!(!model.has_interdependent_components());
}

#[test]
fn builder_rejects_bad_declarations() {
    let base = || ExpressionModel::builder("engine.time");
    assert!(matches!(
        base().state("x", 0.0, Some("1")).coupling_state("x").build(),
        Err(ModelError::MalformedName(_))
    ));
    assert!(matches!(
        base()
            .state("cell.x", 0.0, Some("1"))
            .variable("cell.x", Some("1"))
            .coupling_state("cell.x")
            .build(),
        Err(ModelError::DuplicateName(_))
    ));
    assert!(matches!(
        base().state("cell.x", 0.0, Some("1")).build(),
        Err(ModelError::MissingCoupling)
    ));
    assert!(matches!(
        base()
            .state("cell.x", 0.0, Some("1"))
            .variable("cell.v", Some("1"))
            .coupling_state("cell.v")
            .build(),
        Err(ModelError::CouplingNotState(_))
    ));
    assert!(matches!(
        base()
            .state("cell.x", 0.0, Some("1 +* 2"))
            .coupling_state("cell.x")
            .build(),
        Err(ModelError::Parse { .. })
    ));
}

#[test]
fn expressions_evaluate_with_functions_and_constants() {
    let model = ExpressionModel::builder("engine.time")
        .pace("engine.pace")
        .state("cell.x", 2.0, Some("exp(0) * cell.x + 1e-1 * engine.pace + cell.v"))
        .variable("cell.v", Some("cos(pi) + engine.time"))
        .coupling_state("cell.x")
        .build()
        .unwrap();
    let inputs = CellInputs {
        time: 3.0,
        pace: 10.0,
        diffusion: 0.0,
    };
    let mut derivatives = [0.0];
    let mut intermediates = [0.0];
    model.evaluate(&inputs, &[2.0], &mut derivatives, &mut intermediates);
    assert_abs_diff_eq!(intermediates[0], 2.0, epsilon = 1e-12);
    assert_abs_diff_eq!(derivatives[0], 5.0, epsilon = 1e-12);
}

#[test]
fn log_has_time_key_then_cells_then_variables() {
    let mut sim = Simulation::new(two_state_model(), None, Shape::Linear(10)).unwrap();
    let log = sim
        .run(0.1, RunOptions::new().log(["cell.x", "cell.y"]))
        .unwrap();
    assert_eq!(log.len(), 21);
    let keys: Vec<&str> = log.keys().take(4).collect();
    assert_eq!(keys, ["engine.time", "0.cell.x", "0.cell.y", "1.cell.x"]);

    let mut sim = Simulation::new(two_state_model(), None, Shape::Grid(8, 8)).unwrap();
    let log = sim
        .run(0.1, RunOptions::new().log(["cell.x", "cell.y"]))
        .unwrap();
    assert_eq!(log.len(), 129);
    assert!(log.contains_key("7.0.cell.y"));
    assert!(log.contains_key("0.7.cell.x"));
}

#[test]
fn logging_skips_duplicates_and_time() {
    let mut sim = Simulation::new(two_state_model(), None, Shape::Linear(2)).unwrap();
    let log = sim
        .run(
            0.1,
            RunOptions::new().log(["cell.x", "engine.time", "cell.x", "cell.v"]),
        )
        .unwrap();
    let keys: Vec<&str> = log.keys().collect();
    assert_eq!(
        keys,
        ["engine.time", "0.cell.x", "0.cell.v", "1.cell.x", "1.cell.v"]
    );
    assert_abs_diff_eq!(log["0.cell.v"][0], 2.0, epsilon = 1e-12);
}

#[test]
fn log_keys_follow_declaration_order() {
    let mut sim = Simulation::new(two_state_model(), None, Shape::Linear(2)).unwrap();
    let log = sim
        .run(
            0.1,
            RunOptions::new().log(["cell.v", "cell.y", "engine.diffusion", "cell.x"]),
        )
        .unwrap();
    let keys: Vec<&str> = log.keys().take(5).collect();
    assert_eq!(
        keys,
        [
            "engine.time",
            "0.engine.diffusion",
            "0.cell.x",
            "0.cell.y",
            "0.cell.v"
        ]
    );
}

#[test]
fn unknown_log_variable_is_an_error() {
    let mut sim = simulation(Shape::Scalar);
    assert!(matches!(
        sim.run(1.0, RunOptions::new().log(["cell.nope"])),
        Err(SimError::UnknownVariable(_))
    ));
    assert_eq!(sim.time(), 0.0);
}

#[test]
fn log_interval_sample_counts() {
    let mut sim = simulation(Shape::Scalar);
    let log = sim
        .run(20.0, RunOptions::new().log(["cell.x"]).log_interval(Some(5.0)))
        .unwrap();
    assert_eq!(log.time().len(), 5);
    for (sample, expected) in log.time().iter().zip([0.0, 5.0, 10.0, 15.0, 20.0]) {
        assert_abs_diff_eq!(*sample, expected, epsilon = 1e-6);
    }
    assert_eq!(log["0.cell.x"].len(), 5);

    let mut sim = simulation(Shape::Scalar);
    let log = sim
        .run(1.0, RunOptions::new().log_interval(Some(5.0)))
        .unwrap();
    assert_eq!(log.time(), &[0.0, 1.0]);
}

#[test]
fn default_log_interval_is_every_step() {
    let mut sim = simulation(Shape::Scalar);
    sim.set_step_size(0.01).unwrap();
    let log = sim.run(1.0, RunOptions::new().log(["cell.x"])).unwrap();
    assert_eq!(log.time().len(), 101);

    for interval in [Some(0.0), Some(-1.0), Some(0.001)] {
        let mut sim = simulation(Shape::Scalar);
        sim.set_step_size(0.01).unwrap();
        let log = sim
            .run(1.0, RunOptions::new().log_interval(interval))
            .unwrap();
        assert_eq!(log.time().len(), 101, "interval {interval:?}");
    }
}

#[test]
fn log_interval_off_the_step_grid() {
    let mut sim = simulation(Shape::Scalar);
    let log = sim
        .run(1.0, RunOptions::new().log_interval(Some(0.3333)))
        .unwrap();
    assert_eq!(log.time().len(), 5);
    for (sample, expected) in log.time().iter().zip([0.0, 0.33, 0.665, 0.995, 1.0]) {
        assert_abs_diff_eq!(*sample, expected, epsilon = 1e-9);
    }

    let mut sim = simulation(Shape::Scalar);
    sim.set_step_size(0.3).unwrap();
    let log = sim
        .run(20.1, RunOptions::new().log_interval(Some(10.0)))
        .unwrap();
    assert_eq!(log.time().len(), 4);
    for (sample, expected) in log.time().iter().zip([0.0, 9.9, 19.8, 20.1]) {
        assert_abs_diff_eq!(*sample, expected, epsilon = 1e-9);
    }
}

#[test]
fn partial_last_step_ends_exactly_at_duration() {
    let mut sim = simulation(Shape::Scalar);
    sim.set_step_size(0.3).unwrap();
    let log = sim.run(1.0, RunOptions::new()).unwrap();
    assert_eq!(log.time().len(), 5);
    assert_eq!(*log.time().last().unwrap(), 1.0);
    assert_eq!(sim.time(), 1.0);
}

#[test]
fn cancel_before_first_step_returns_no_log() {
    let mut sim = simulation(Shape::Linear(3));
    let cancel = || true;
    let result = sim.run(10.0, RunOptions::new().log(["cell.x"]).cancel(&cancel));
    assert!(matches!(result, Err(SimError::Cancelled)));
    assert_eq!(sim.run_state(), RunState::Cancelled);
    assert_eq!(sim.time(), 0.0);
    assert_eq!(sim.state(None).unwrap(), vec![1.0; 3]);
}

#[test]
fn cancel_mid_run_rolls_back() {
    let mut sim = simulation(Shape::Linear(3));
    let calls = Counter::new(0);
    let cancel = || {
        calls.set(calls.get() + 1);
        calls.get() > 10
    };
    let result = sim.run(1.0, RunOptions::new().cancel(&cancel));
    assert!(matches!(result, Err(SimError::Cancelled)));
    assert_eq!(calls.get(), 11);
    assert_eq!(sim.time(), 0.0);
    assert_eq!(sim.state(None).unwrap(), vec![1.0; 3]);
}

#[test]
fn progress_is_reported_and_can_cancel() {
    let mut sim = simulation(Shape::Scalar);
    sim.set_step_size(0.1).unwrap();
    let mut seen = Vec::new();
    let mut reporter = |fraction: f64| -> ControlFlow<()> {
        seen.push(fraction);
        ControlFlow::Continue(())
    };
    sim.run(1.0, RunOptions::new().progress(&mut reporter))
        .unwrap();
    assert_eq!(seen.len(), 10);
    assert_abs_diff_eq!(seen[0], 0.1, epsilon = 1e-12);
    assert_eq!(*seen.last().unwrap(), 1.0);
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));

    let before = sim.state(None).unwrap();
    let mut stop_halfway = |fraction: f64| -> ControlFlow<()> {
        if fraction >= 0.5 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    };
    let result = sim.run(1.0, RunOptions::new().progress(&mut stop_halfway));
    assert!(matches!(result, Err(SimError::Cancelled)));
    assert_eq!(sim.time(), 1.0);
    assert_eq!(sim.state(None).unwrap(), before);

    let mut logged = LogProgress::default();
    sim.run(1.0, RunOptions::new().progress(&mut logged))
        .unwrap();
    assert_eq!(sim.run_state(), RunState::Completed);
}

#[test]
fn divergence_reports_first_bad_cell() {
    let model = ExpressionModel::builder("engine.time")
        .state("cell.x", 1.0, Some("1 / cell.x"))
        .coupling_state("cell.x")
        .build()
        .unwrap();
    let mut sim = Simulation::new(model, None, Shape::Linear(4)).unwrap();
    sim.set_state(&[0.0], Some(&[2])).unwrap();
    let before = sim.state(None).unwrap();
    match sim.run(1.0, RunOptions::new().log(["cell.x"])) {
        Err(SimError::NumericalDivergence { cell, time }) => {
            assert_eq!(cell, topology::Cell::Index(2));
            assert_abs_diff_eq!(time, DEFAULT_STEP_SIZE, epsilon = 1e-12);
        }
        other => panic!("expected divergence, got {other:?}"),
    }
    assert_eq!(sim.run_state(), RunState::Failed);
    assert_eq!(sim.time(), 0.0);
    assert_eq!(sim.state(None).unwrap(), before);
}

#[test]
fn results_do_not_depend_on_thread_count() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let initial: Vec<f64> = (0..64).map(|_| rng.random_range(-1.0..1.0)).collect();
    let mut protocol = Protocol::new();
    protocol.schedule(2.0, 0.0, 0.5, 1.0, 0).unwrap();

    let run = |threads: Option<usize>| {
        let mut sim = Simulation::new(decay_model(), Some(protocol.clone()), Shape::Grid(8, 8))
            .unwrap();
        sim.set_conductance_xy(0.7, 0.3).unwrap();
        sim.set_paced_cells(&[2, 3], &[0, 0]).unwrap();
        sim.set_state_all(&initial).unwrap();
        sim.set_threads(threads).unwrap();
        sim.run(2.0, RunOptions::new().log(["cell.x", "engine.diffusion"]))
            .unwrap()
    };
    let single = run(Some(1));
    let many = run(Some(4));
    let global = run(None);
    assert_eq!(single, many);
    assert_eq!(single, global);
}

#[test]
fn time_persists_across_runs() {
    let mut sim = simulation(Shape::Scalar);
    sim.run(1.0, RunOptions::new()).unwrap();
    assert_abs_diff_eq!(sim.time(), 1.0, epsilon = 1e-12);
    let log = sim.run(0.5, RunOptions::new()).unwrap();
    assert_abs_diff_eq!(log.time()[0], 1.0, epsilon = 1e-12);
    assert_abs_diff_eq!(*log.time().last().unwrap(), 1.5, epsilon = 1e-12);
    assert_abs_diff_eq!(sim.time(), 1.5, epsilon = 1e-12);

    sim.set_time(5.0).unwrap();
    let log = sim.run(0.1, RunOptions::new()).unwrap();
    assert_abs_diff_eq!(log.time()[0], 5.0, epsilon = 1e-12);

    sim.reset();
    assert_eq!(sim.time(), 0.0);
    assert_eq!(sim.state(None).unwrap(), vec![1.0]);
    assert_eq!(sim.run_state(), RunState::Ready);
}

#[test]
fn exponential_decay_is_accurate() {
    let mut sim = simulation(Shape::Scalar);
    sim.set_paced_cell_list(Vec::<[i64; 1]>::new()).unwrap();
    sim.set_step_size(0.001).unwrap();
    sim.run(1.0, RunOptions::new()).unwrap();
    assert_abs_diff_eq!(sim.state(None).unwrap()[0], (-1.0f64).exp(), epsilon = 1e-3);
}

#[test]
fn adaptive_substeps_beat_plain_euler() {
    let exact = (-1.0f64).exp();
    let run = |policy: SubstepPolicy| {
        let mut sim = simulation(Shape::Scalar);
        sim.set_step_size(0.1).unwrap();
        sim.set_substep_policy(policy).unwrap();
        sim.run(1.0, RunOptions::new()).unwrap();
        sim.state(None).unwrap()[0]
    };
    let euler = run(SubstepPolicy::default());
    let adaptive = run(SubstepPolicy::Adaptive {
        max_delta: 0.01,
        max_substeps: 100,
    });
    let fixed = run(SubstepPolicy::Fixed { substeps: 10 });
    assert!((euler - exact).abs() > 0.01);
    assert!((adaptive - exact).abs() < 0.005);
    assert!((fixed - exact).abs() < 0.005);

    let mut sim = simulation(Shape::Scalar);
    assert!(sim
        .set_substep_policy(SubstepPolicy::Fixed { substeps: 0 })
        .is_err());
    assert!(sim
        .set_substep_policy(SubstepPolicy::Adaptive {
            max_delta: -1.0,
            max_substeps: 4
        })
        .is_err());
}

#[test]
fn coupled_pair_relaxes_to_the_mean() {
    let model = ExpressionModel::builder("engine.time")
        .state("cell.x", 0.0, Some("0"))
        .coupling_state("cell.x")
        .build()
        .unwrap();
    let mut sim = Simulation::new(model, None, Shape::Linear(2)).unwrap();
    sim.set_step_size(0.01).unwrap();
    sim.set_state_all(&[3.0, 1.0]).unwrap();
    sim.run(10.0, RunOptions::new()).unwrap();
    let state = sim.state(None).unwrap();
    assert_abs_diff_eq!(state[0], 2.0, epsilon = 1e-6);
    assert_abs_diff_eq!(state[1], 2.0, epsilon = 1e-6);
}

#[test]
fn diffusion_current_is_logged() {
    let mut sim = simulation(Shape::Linear(2));
    sim.set_conductance(2.0).unwrap();
    sim.set_state_all(&[1.0, 0.0]).unwrap();
    let log = sim
        .run(0.1, RunOptions::new().log(["engine.diffusion"]))
        .unwrap();
    assert_abs_diff_eq!(log["0.engine.diffusion"][0], -2.0, epsilon = 1e-12);
    assert_abs_diff_eq!(log["1.engine.diffusion"][0], 2.0, epsilon = 1e-12);
}

#[test]
fn only_paced_cells_feel_the_protocol() {
    let model = ExpressionModel::builder("engine.time")
        .pace("engine.pace")
        .state("cell.x", 0.0, Some("engine.pace"))
        .coupling_state("cell.x")
        .build()
        .unwrap();
    let mut protocol = Protocol::new();
    protocol.schedule(1.0, 0.0, 0.5, 0.0, 0).unwrap();
    let mut sim = Simulation::new(model, Some(protocol), Shape::Linear(3)).unwrap();
    sim.set_conductance(0.0).unwrap();
    sim.set_step_size(0.01).unwrap();
    let log = sim
        .run(1.0, RunOptions::new().log(["engine.pace"]).log_interval(Some(0.25)))
        .unwrap();
    assert_eq!(log["0.engine.pace"], [1.0, 1.0, 0.0, 0.0, 0.0]);
    assert_eq!(log["1.engine.pace"], [0.0; 5]);

    let state = sim.state(None).unwrap();
    assert_abs_diff_eq!(state[0], 0.5, epsilon = 1e-6);
    assert_eq!(state[1], 0.0);
    assert_eq!(state[2], 0.0);

    sim.set_protocol(None);
    sim.run(1.0, RunOptions::new()).unwrap();
    assert_abs_diff_eq!(sim.state(Some(&[0])).unwrap()[0], 0.5, epsilon = 1e-6);
}

#[test]
fn protocol_rejects_overlapping_events() {
    let mut protocol = Protocol::new();
    protocol.schedule(1.0, 10.0, 2.0, 0.0, 0).unwrap();
    assert!(protocol.schedule(1.0, 11.0, 2.0, 0.0, 0).is_err());
    assert!(protocol.schedule(1.0, 9.0, 1.5, 0.0, 0).is_err());
    protocol.schedule(3.0, 12.0, 1.0, 0.0, 0).unwrap();
    protocol.schedule(2.0, 0.0, 1.0, 0.0, 0).unwrap();
    let starts: Vec<f64> = protocol.events().iter().map(|event| event.start).collect();
    assert_eq!(starts, [0.0, 10.0, 12.0]);

    assert!(protocol.schedule(1.0, -1.0, 1.0, 0.0, 0).is_err());
    assert!(protocol.schedule(1.0, 20.0, 0.0, 0.0, 0).is_err());
    assert!(protocol.schedule(1.0, 20.0, 2.0, 1.0, 0).is_err());
    assert!(protocol.schedule(1.0, 20.0, 1.0, 0.0, 3).is_err());
    assert_eq!(protocol.events().len(), 3);
}

#[test]
fn periodic_events_repeat() {
    let mut protocol = Protocol::new();
    protocol.schedule(2.0, 1.0, 0.5, 2.0, 2).unwrap();
    assert_eq!(protocol.level_at(0.5), 0.0);
    assert_eq!(protocol.level_at(1.2), 2.0);
    assert_eq!(protocol.level_at(2.0), 0.0);
    assert_eq!(protocol.level_at(3.2), 2.0);
    assert_eq!(protocol.level_at(5.2), 0.0);

    let mut forever = Protocol::new();
    forever.schedule(1.0, 0.0, 0.5, 1.0, 0).unwrap();
    assert_eq!(forever.level_at(1000.25), 1.0);
    assert_eq!(forever.level_at(1000.75), 0.0);
}

#[test]
fn protocol_deserializes_through_validation() {
    let protocol: Protocol = serde_json::from_str(
        r#"[{"level": 1.0, "start": 5.0, "duration": 1.0},
            {"level": 0.5, "start": 0.0, "duration": 2.0, "period": 10.0}]"#,
    )
    .unwrap();
    assert_eq!(protocol.events()[0].start, 0.0);
    assert_eq!(protocol.level_at(5.5), 1.0);
    assert_eq!(protocol.level_at(10.5), 0.5);

    let overlapping = serde_json::from_str::<Protocol>(
        r#"[{"level": 1.0, "start": 0.0, "duration": 1.0},
            {"level": 1.0, "start": 0.5, "duration": 1.0}]"#,
    );
    assert!(overlapping.is_err());
}

#[test]
fn run_config_deserializes_with_defaults() {
    let config: RunConfig = serde_json::from_str(
        r#"{"duration": 20.0, "log_interval": 5.0, "log": ["cell.x"],
            "substeps": {"kind": "adaptive", "max_delta": 0.1, "max_substeps": 8}}"#,
    )
    .unwrap();
    assert_eq!(config.step_size, DEFAULT_STEP_SIZE);
    assert_eq!(config.threads, None);
    assert_eq!(
        config.substeps,
        SubstepPolicy::Adaptive {
            max_delta: 0.1,
            max_substeps: 8
        }
    );

    let mut sim = simulation(Shape::Linear(2));
    let log = sim.run_config(&config).unwrap();
    assert_eq!(log.time().len(), 5);
    assert_eq!(log.len(), 3);

    let shape: Shape = serde_json::from_str(r#"{"grid": [3, 2]}"#).unwrap();
    assert_eq!(shape, Shape::Grid(3, 2));
}

#[test]
fn invalid_run_settings_are_rejected() {
    let mut sim = simulation(Shape::Scalar);
    assert!(matches!(
        sim.set_step_size(0.0),
        Err(SimError::InvalidArgument(_))
    ));
    assert!(matches!(
        sim.set_threads(Some(0)),
        Err(SimError::InvalidArgument(_))
    ));
    assert!(matches!(
        sim.run(-1.0, RunOptions::new()),
        Err(SimError::InvalidArgument(_))
    ));
    assert!(matches!(
        sim.set_conductance(-1.0),
        Err(SimError::InvalidArgument(_))
    ));
    assert_eq!(sim.step_size(), DEFAULT_STEP_SIZE);
    assert_eq!(sim.conductance(), (1.0, 1.0));
}

#[cfg(feature = "python")]
#[test]
fn python_errors_raised_during_a_run_win_over_cancellation() {
    use pyo3::exceptions::{PyKeyboardInterrupt, PyRuntimeError};
    use pyo3::Python;

    Python::initialize();
    Python::attach(|py| {
        let err = crate::python::raise_pending::<()>(
            Err(SimError::Cancelled),
            Some(PyKeyboardInterrupt::new_err("interrupted")),
        )
        .unwrap_err();
        assert!(err.is_instance_of::<PyKeyboardInterrupt>(py));

        let err = crate::python::raise_pending::<()>(Err(SimError::Cancelled), None).unwrap_err();
        assert!(err.is_instance_of::<PyRuntimeError>(py));
        assert_eq!(crate::python::raise_pending(Ok(3), None).unwrap(), 3);
    });
}
