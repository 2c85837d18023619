use crate::control::commander::{Command, RecordingCommander};
use crate::control::messages::Message;
use crate::control::rail_system::components::{
    Address, BlockCategory, BlockShape, Direction, Node, SensorLevel, Socket, Speed, TurnoutKind,
    TurnoutShape, TurnoutState,
};
use crate::control::rail_system::path_finder::{
    find_path, NoConstraints, SearchOrder, SearchSettings,
};
use crate::control::rail_system::rail_graph::GraphPathElement;
use crate::control::rail_system::railroad::{Builder, Railroad};
use crate::control::rail_system::resolver::{resolve, UnresolvedRange, Waypoint};
use crate::control::rail_system::shortest_path::shortest_path;
use crate::control::rail_system::RailError;
use crate::control::scheduler::Scheduler;
use crate::control::train::{
    Destination, Route, RouteMode, RouteStep, ScheduleMode, Train, TrainState,
};
use petgraph::graph::NodeIndex;
use std::sync::Arc;
use std::time::Duration;

fn block(address: u16, category: BlockCategory, sensors: &[u16]) -> Node {
    Node::Block(BlockShape::new(
        Address::new(address),
        category,
        10,
        sensors.iter().map(|&s| Address::new(s)).collect(),
    ))
}

fn long_block(address: u16, length: usize, sensors: &[u16]) -> Node {
    Node::Block(BlockShape::new(
        Address::new(address),
        BlockCategory::Free,
        length,
        sensors.iter().map(|&s| Address::new(s)).collect(),
    ))
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Three blocks in a ring, two of them stations:
/// b1 -> b2 -> b3 -> b1, linked next-to-previous throughout.
/// Sensors 10/11, 20/21, 30/31.
struct Loop {
    railroad: Railroad,
    b1: NodeIndex,
    b2: NodeIndex,
    b3: NodeIndex,
}

fn loop_layout() -> Loop {
    init_logging();
    let mut builder = Builder::new();
    let b1 = builder.add_node(block(1, BlockCategory::Station, &[10, 11]));
    let b2 = builder.add_node(block(2, BlockCategory::Free, &[20, 21]));
    let b3 = builder.add_node(block(3, BlockCategory::Station, &[30, 31]));
    builder.connect(b1, Socket::NEXT, b2, Socket::PREVIOUS).unwrap();
    builder.connect(b2, Socket::NEXT, b3, Socket::PREVIOUS).unwrap();
    builder.connect(b3, Socket::NEXT, b1, Socket::PREVIOUS).unwrap();
    Loop {
        railroad: builder.build().unwrap(),
        b1,
        b2,
        b3,
    }
}

/// A diamond: b1 feeds turnout t1, whose straight leg runs through the
/// long block b2 and whose branch runs through the short block b3; both
/// meet again at turnout t2 in front of b4.
struct Diamond {
    railroad: Railroad,
    b1: NodeIndex,
    b2: NodeIndex,
    b3: NodeIndex,
    b4: NodeIndex,
    t1: NodeIndex,
}

fn diamond_layout() -> Diamond {
    init_logging();
    let mut builder = Builder::new();
    let b1 = builder.add_node(block(1, BlockCategory::Station, &[10, 11]));
    let b2 = builder.add_node(long_block(2, 50, &[20, 21]));
    let b3 = builder.add_node(long_block(3, 5, &[30, 31]));
    let b4 = builder.add_node(block(4, BlockCategory::Station, &[40, 41]));
    let t1 = builder.add_node(Node::Turnout(TurnoutShape::new(
        Address::new(101),
        TurnoutKind::SingleLeft,
        2,
    )));
    let t2 = builder.add_node(Node::Turnout(TurnoutShape::new(
        Address::new(102),
        TurnoutKind::SingleLeft,
        2,
    )));
    builder.connect(b1, Socket::NEXT, t1, Socket::new(0)).unwrap();
    builder.connect(t1, Socket::new(1), b2, Socket::PREVIOUS).unwrap();
    builder.connect(t1, Socket::new(2), b3, Socket::PREVIOUS).unwrap();
    builder.connect(b2, Socket::NEXT, t2, Socket::new(1)).unwrap();
    builder.connect(b3, Socket::NEXT, t2, Socket::new(2)).unwrap();
    builder.connect(t2, Socket::new(0), b4, Socket::PREVIOUS).unwrap();
    Diamond {
        railroad: builder.build().unwrap(),
        b1,
        b2,
        b3,
        b4,
        t1,
    }
}

async fn scheduler_with(
    railroad: Railroad,
) -> (Scheduler<RecordingCommander>, Arc<RecordingCommander>) {
    let commander = Arc::new(RecordingCommander::new());
    let (scheduler, _sender) = Scheduler::new(Arc::new(railroad), commander.clone());
    (scheduler, commander)
}

async fn fire(scheduler: &mut Scheduler<RecordingCommander>, sensor: u16) {
    scheduler
        .handle(Message::UpdateSensor(Address::new(sensor), SensorLevel::High))
        .await;
    scheduler
        .handle(Message::UpdateSensor(Address::new(sensor), SensorLevel::Low))
        .await;
}

async fn train_speed(scheduler: &Scheduler<RecordingCommander>, address: u16) -> Speed {
    let mutex = scheduler
        .railroad()
        .get_train(&Address::new(address))
        .unwrap();
    let train = mutex.lock().await;
    train.speed()
}

#[test]
fn builder_rejects_second_link_on_a_socket() {
    let mut builder = Builder::new();
    let b1 = builder.add_node(block(1, BlockCategory::Free, &[10]));
    let b2 = builder.add_node(block(2, BlockCategory::Free, &[20]));
    let b3 = builder.add_node(block(3, BlockCategory::Free, &[30]));
    builder.connect(b1, Socket::NEXT, b2, Socket::PREVIOUS).unwrap();
    assert_eq!(
        builder.connect(b1, Socket::NEXT, b3, Socket::PREVIOUS),
        Err(RailError::AmbiguousLink(b1, Socket::NEXT))
    );
    assert_eq!(
        builder.connect(b1, Socket::new(7), b3, Socket::PREVIOUS),
        Err(RailError::SocketNotFound(b1, Socket::new(7)))
    );
}

#[test]
fn links_resolve_from_both_endpoints() {
    let mut builder = Builder::new();
    let b1 = builder.add_node(block(1, BlockCategory::Free, &[10]));
    let b2 = builder.add_node(block(2, BlockCategory::Free, &[20]));
    let b3 = builder.add_node(block(3, BlockCategory::Free, &[30]));
    builder.connect(b1, Socket::NEXT, b2, Socket::PREVIOUS).unwrap();
    // b2 sits on the target side of the first edge; its NEXT socket is
    // still free and this connect must go through.
    builder.connect(b2, Socket::NEXT, b3, Socket::PREVIOUS).unwrap();
    let railroad = builder.build().unwrap();
    let graph = railroad.graph();
    assert_eq!(graph.link(b1, Socket::NEXT), Some((b2, Socket::PREVIOUS)));
    assert_eq!(graph.link(b2, Socket::PREVIOUS), Some((b1, Socket::NEXT)));
    assert_eq!(graph.link(b2, Socket::NEXT), Some((b3, Socket::PREVIOUS)));
    assert_eq!(graph.link(b3, Socket::PREVIOUS), Some((b2, Socket::NEXT)));
    assert_eq!(graph.link(b1, Socket::PREVIOUS), None);
}

#[test]
fn builder_rejects_duplicate_sensors() {
    let mut builder = Builder::new();
    builder.add_node(block(1, BlockCategory::Free, &[10]));
    builder.add_node(block(2, BlockCategory::Free, &[10]));
    assert_eq!(
        builder.build().err(),
        Some(RailError::DuplicateSensor(Address::new(10)))
    );
}

#[test]
fn path_finder_walks_the_loop() {
    let layout = loop_layout();
    let graph = layout.railroad.graph();
    let path = find_path(
        graph,
        GraphPathElement::starting(layout.b1, Socket::NEXT),
        Some(GraphPathElement::ending(layout.b3, Socket::PREVIOUS)),
        &SearchSettings::default(),
        &NoConstraints,
    )
    .unwrap();
    let nodes: Vec<NodeIndex> = path.elements.iter().map(|e| e.node).collect();
    assert_eq!(nodes, vec![layout.b1, layout.b2, layout.b3]);
}

#[test]
fn path_finder_terminates_on_unreachable_destination() {
    let layout = loop_layout();
    // Travelling forward around the ring, b3 can only ever be entered
    // from its previous side.
    let path = find_path(
        layout.railroad.graph(),
        GraphPathElement::starting(layout.b1, Socket::NEXT),
        Some(GraphPathElement::ending(layout.b3, Socket::NEXT)),
        &SearchSettings::default(),
        &NoConstraints,
    );
    assert!(path.is_none());
}

#[test]
fn shuffled_search_is_reproducible_per_seed() {
    let layout = diamond_layout();
    let settings = SearchSettings {
        order: SearchOrder::Shuffled { seed: 42 },
        ..SearchSettings::default()
    };
    let run = || {
        find_path(
            layout.railroad.graph(),
            GraphPathElement::starting(layout.b1, Socket::NEXT),
            Some(GraphPathElement::ending(layout.b4, Socket::PREVIOUS)),
            &settings,
            &NoConstraints,
        )
        .unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn turnout_override_forces_a_branch() {
    let layout = diamond_layout();
    let t1 = layout.t1;
    let settings = SearchSettings {
        turnout_exit_override: Some(Box::new(move |node, entry| {
            (node == t1 && entry == Socket::new(0)).then(|| Socket::new(2))
        })),
        ..SearchSettings::default()
    };
    let path = find_path(
        layout.railroad.graph(),
        GraphPathElement::starting(layout.b1, Socket::NEXT),
        Some(GraphPathElement::ending(layout.b4, Socket::PREVIOUS)),
        &settings,
        &NoConstraints,
    )
    .unwrap();
    let nodes: Vec<NodeIndex> = path.elements.iter().map(|e| e.node).collect();
    assert!(nodes.contains(&layout.b3));
    assert!(!nodes.contains(&layout.b2));
}

#[test]
fn shortest_path_takes_the_lighter_branch() {
    let layout = diamond_layout();
    let path = shortest_path(
        layout.railroad.graph(),
        GraphPathElement::starting(layout.b1, Socket::NEXT),
        GraphPathElement::ending(layout.b4, Socket::PREVIOUS),
        &NoConstraints,
    )
    .unwrap();
    let nodes: Vec<NodeIndex> = path.elements.iter().map(|e| e.node).collect();
    assert!(nodes.contains(&layout.b3), "expected the short branch: {path}");
    assert!(!nodes.contains(&layout.b2));
}

#[test]
fn shortest_path_is_stable_across_runs() {
    let layout = diamond_layout();
    let run = || {
        shortest_path(
            layout.railroad.graph(),
            GraphPathElement::starting(layout.b1, Socket::NEXT),
            GraphPathElement::ending(layout.b4, Socket::PREVIOUS),
            &NoConstraints,
        )
        .unwrap()
    };
    assert_eq!(run(), run());
}

#[test]
fn resolver_stitches_sparse_waypoints() {
    let layout = diamond_layout();
    let path = resolve(
        layout.railroad.graph(),
        &[Waypoint::Block(layout.b1), Waypoint::AnyStation],
        &SearchSettings::default(),
        &NoConstraints,
    )
    .unwrap();
    assert_eq!(path.first().unwrap().node, layout.b1);
    assert_eq!(path.last().unwrap().node, layout.b4);
}

#[test]
fn resolver_reports_the_failing_range() {
    let mut builder = Builder::new();
    let b1 = builder.add_node(block(1, BlockCategory::Free, &[10]));
    let b2 = builder.add_node(block(2, BlockCategory::Free, &[20]));
    let b9 = builder.add_node(block(9, BlockCategory::Free, &[90]));
    builder.connect(b1, Socket::NEXT, b2, Socket::PREVIOUS).unwrap();
    let railroad = builder.build().unwrap();
    let result = resolve(
        railroad.graph(),
        &[
            Waypoint::Block(b1),
            Waypoint::Block(b2),
            Waypoint::Block(b9),
        ],
        &SearchSettings::default(),
        &NoConstraints,
    );
    assert_eq!(result.err(), Some(UnresolvedRange { from: 1, to: 2 }));
}

#[tokio::test]
async fn reservation_is_all_or_nothing() {
    let layout = diamond_layout();
    let one = Address::new(91);
    let two = Address::new(92);
    let over_branch = [
        GraphPathElement::between(layout.t1, Socket::new(0), Socket::new(2)),
        GraphPathElement::between(layout.b3, Socket::PREVIOUS, Socket::NEXT),
    ];
    let commands = layout.railroad.reserve(one, &over_branch).await.unwrap();
    assert_eq!(commands, vec![(Address::new(101), TurnoutState::BranchLeft)]);

    // The turnout is claimed, so the competing run must leave b2
    // untouched as well.
    let over_straight = [
        GraphPathElement::between(layout.t1, Socket::new(0), Socket::new(1)),
        GraphPathElement::between(layout.b2, Socket::PREVIOUS, Socket::NEXT),
    ];
    assert!(layout.railroad.reserve(two, &over_straight).await.is_none());
    let record = layout.railroad.get_block_mutex(layout.b2).unwrap();
    assert!(record.lock().await.reservation().is_none());

    // A socket pair no state can connect fails the claim outright.
    let unswitchable = [GraphPathElement::between(
        layout.t1,
        Socket::new(1),
        Socket::new(2),
    )];
    assert!(layout.railroad.reserve(one, &unswitchable).await.is_none());
}

#[tokio::test]
async fn train_runs_to_its_destination() {
    let layout = loop_layout();
    let mut railroad = layout.railroad;
    railroad
        .add_train(Train::new(Address::new(7), layout.b1, Direction::Next))
        .await
        .unwrap();
    let (mut scheduler, commander) = scheduler_with(railroad).await;

    assert!(scheduler
        .start_train(Address::new(7), Destination::Once {
            block: layout.b3,
            direction: Direction::Next,
        })
        .await
        .unwrap());
    assert_eq!(train_speed(&scheduler, 7).await, Speed::cruising());
    assert!(scheduler
        .railroad()
        .is_reserved_for(layout.b2, Address::new(7))
        .await);

    fire(&mut scheduler, 20).await;
    fire(&mut scheduler, 21).await;
    assert!(scheduler
        .railroad()
        .is_reserved_for(layout.b3, Address::new(7))
        .await);
    fire(&mut scheduler, 30).await;
    fire(&mut scheduler, 31).await;

    let mutex = scheduler.railroad().get_train(&Address::new(7)).unwrap();
    let train = mutex.lock().await;
    assert_eq!(train.block(), layout.b3);
    assert_eq!(train.state(), TrainState::Stopped);
    assert_eq!(train.mode(), ScheduleMode::Unmanaged);
    assert!(train.route().is_none());
    drop(train);

    // Trailing blocks cleared as the train moved on.
    let b1_record = scheduler.railroad().get_block_mutex(layout.b1).unwrap();
    assert!(b1_record.lock().await.occupancy().is_none());
    let b2_record = scheduler.railroad().get_block_mutex(layout.b2).unwrap();
    assert!(b2_record.lock().await.occupancy().is_none());

    let commands = commander.commands().await;
    assert_eq!(
        commands,
        vec![
            Command::Speed(Address::new(7), Speed::cruising()),
            Command::Speed(Address::new(7), Speed::cruising().braked()),
            Command::Speed(Address::new(7), Speed::Stop),
        ]
    );
}

#[tokio::test]
async fn blocked_train_waits_and_counts_attempts() {
    let layout = loop_layout();
    let mut railroad = layout.railroad;
    railroad
        .add_train(Train::new(Address::new(7), layout.b1, Direction::Next))
        .await
        .unwrap();
    railroad
        .add_train(Train::new(Address::new(8), layout.b2, Direction::Next))
        .await
        .unwrap();
    let (mut scheduler, commander) = scheduler_with(railroad).await;

    // The only way out of b1 runs through the occupied b2; the train
    // must not start and must not claim anything.
    assert!(!scheduler
        .start_train(Address::new(7), Destination::Once {
            block: layout.b3,
            direction: Direction::Next,
        })
        .await
        .unwrap());
    assert_eq!(train_speed(&scheduler, 7).await, Speed::Stop);
    assert!(!scheduler
        .railroad()
        .is_reserved_for(layout.b3, Address::new(7))
        .await);
    assert!(commander.commands().await.is_empty());

    // With a stale route assigned, every cycle is one counted attempt
    // to find a way around.
    {
        let mutex = scheduler.railroad().get_train(&Address::new(7)).unwrap();
        let mut train = mutex.lock().await;
        train.set_route(Route::new(
            RouteMode::Automatic(Destination::Once {
                block: layout.b3,
                direction: Direction::Next,
            }),
            vec![
                RouteStep::Block {
                    node: layout.b1,
                    direction: Direction::Next,
                    wait: None,
                },
                RouteStep::Block {
                    node: layout.b2,
                    direction: Direction::Next,
                    wait: None,
                },
                RouteStep::Block {
                    node: layout.b3,
                    direction: Direction::Next,
                    wait: None,
                },
            ],
        ));
    }
    scheduler.handle(Message::Tick(Duration::from_secs(1))).await;
    let mutex = scheduler.railroad().get_train(&Address::new(7)).unwrap();
    let train = mutex.lock().await;
    assert!(train.regenerations() >= 1);
    assert_eq!(train.state(), TrainState::Stopped);
}

#[tokio::test]
async fn ghost_sensor_halts_the_layout() {
    let layout = loop_layout();
    let mut railroad = layout.railroad;
    railroad
        .add_train(Train::new(Address::new(7), layout.b1, Direction::Next))
        .await
        .unwrap();
    let (mut scheduler, commander) = scheduler_with(railroad).await;

    // Nothing is near b3; its sensor going high is a ghost.
    scheduler
        .handle(Message::UpdateSensor(Address::new(30), SensorLevel::High))
        .await;
    assert!(scheduler.halted());
    assert_eq!(train_speed(&scheduler, 7).await, Speed::EmergencyStop);
    assert!(commander
        .commands()
        .await
        .contains(&Command::EmergencyStopAll));

    // Reservations dropped, occupancies kept.
    let record = scheduler.railroad().get_block_mutex(layout.b1).unwrap();
    assert!(record.lock().await.reservation().is_none());
    assert!(record.lock().await.occupancy().is_some());

    // Everything but power-on is dropped while halted.
    scheduler
        .handle(Message::TrainSpeed(Address::new(7), Speed::cruising()))
        .await;
    assert_eq!(train_speed(&scheduler, 7).await, Speed::EmergencyStop);
    scheduler.handle(Message::RailOn).await;
    assert!(!scheduler.halted());
}

#[tokio::test]
async fn endless_train_holds_in_stations_and_continues() {
    let layout = loop_layout();
    let mut railroad = layout.railroad;
    railroad
        .add_train(Train::new(Address::new(7), layout.b1, Direction::Next))
        .await
        .unwrap();
    let (mut scheduler, _commander) = scheduler_with(railroad).await;

    assert!(scheduler
        .start_train(Address::new(7), Destination::Endless)
        .await
        .unwrap());
    fire(&mut scheduler, 20).await;
    fire(&mut scheduler, 21).await;
    fire(&mut scheduler, 30).await;
    fire(&mut scheduler, 31).await;

    // Standing in the station b3, already rerouted onwards.
    {
        let mutex = scheduler.railroad().get_train(&Address::new(7)).unwrap();
        let train = mutex.lock().await;
        assert_eq!(train.block(), layout.b3);
        assert_eq!(train.state(), TrainState::Stopped);
        assert_eq!(train.mode(), ScheduleMode::Managed);
        let route = train.route().unwrap();
        assert_eq!(route.steps.last().unwrap().node(), layout.b1);
    }

    // The hold keeps it standing until the wait has passed.
    scheduler.handle(Message::Tick(Duration::from_secs(5))).await;
    assert_eq!(train_speed(&scheduler, 7).await, Speed::Stop);
    scheduler.handle(Message::Tick(Duration::from_secs(6))).await;
    assert_eq!(train_speed(&scheduler, 7).await, Speed::cruising());
    assert!(scheduler
        .railroad()
        .is_reserved_for(layout.b1, Address::new(7))
        .await);
}

#[tokio::test]
async fn train_on_a_wrong_branch_halts_the_layout() {
    let layout = diamond_layout();
    let mut railroad = layout.railroad;
    railroad
        .add_train(Train::new(Address::new(7), layout.b1, Direction::Next))
        .await
        .unwrap();
    let (mut scheduler, _commander) = scheduler_with(railroad).await;

    // A fixed route over the straight leg into b2, with b3 claimed for
    // the same train as well.
    scheduler
        .drive_route(
            Address::new(7),
            Route::new(
                RouteMode::Manual,
                vec![
                    RouteStep::Block {
                        node: layout.b1,
                        direction: Direction::Next,
                        wait: None,
                    },
                    RouteStep::Turnout {
                        node: layout.t1,
                        entry: Socket::new(0),
                        exit: Socket::new(1),
                    },
                    RouteStep::Block {
                        node: layout.b2,
                        direction: Direction::Next,
                        wait: None,
                    },
                ],
            ),
        )
        .await
        .unwrap();
    assert_eq!(train_speed(&scheduler, 7).await, Speed::cruising());
    scheduler
        .railroad()
        .reserve(
            Address::new(7),
            &[GraphPathElement::between(
                layout.b3,
                Socket::PREVIOUS,
                Socket::NEXT,
            )],
        )
        .await
        .unwrap();

    // The turnout physically sits on the branch, so the train rolls
    // towards b3 while its route expects b2.
    let record = scheduler.railroad().get_turnout_mutex(layout.t1).unwrap();
    record.lock().await.set_state(TurnoutState::BranchLeft);

    scheduler
        .handle(Message::UpdateSensor(Address::new(30), SensorLevel::High))
        .await;
    assert!(scheduler.halted());
}

#[tokio::test]
async fn expected_sensors_cover_the_block_ahead() {
    let layout = loop_layout();
    let mut railroad = layout.railroad;
    railroad
        .add_train(Train::new(Address::new(7), layout.b1, Direction::Next))
        .await
        .unwrap();

    let standing = railroad.expected_sensors().await;
    assert!(standing.contains(&Address::new(10)));
    assert!(standing.contains(&Address::new(11)));
    assert!(!standing.contains(&Address::new(20)));

    let mutex = railroad.get_train(&Address::new(7)).unwrap();
    mutex.lock().await.set_manual_speed(Speed::cruising());
    let moving = railroad.expected_sensors().await;
    assert!(moving.contains(&Address::new(20)));
    assert!(!moving.contains(&Address::new(30)));
}

#[tokio::test]
async fn hand_driven_train_is_followed_across_blocks() {
    let layout = loop_layout();
    let mut railroad = layout.railroad;
    railroad
        .add_train(Train::new(Address::new(7), layout.b1, Direction::Next))
        .await
        .unwrap();
    let (mut scheduler, _commander) = scheduler_with(railroad).await;

    scheduler
        .handle(Message::TrainSpeed(Address::new(7), Speed::cruising()))
        .await;
    // A normal manual drive across the block boundary: entry sensor of
    // b2, then the following one. Neither may trip the ghost detection.
    fire(&mut scheduler, 20).await;
    fire(&mut scheduler, 21).await;
    assert!(!scheduler.halted());

    {
        let mutex = scheduler.railroad().get_train(&Address::new(7)).unwrap();
        let train = mutex.lock().await;
        assert_eq!(train.block(), layout.b2);
        assert_eq!(train.position(), 2);
    }
    let b2_record = scheduler.railroad().get_block_mutex(layout.b2).unwrap();
    assert!(b2_record.lock().await.occupancy().is_some());
    let b1_record = scheduler.railroad().get_block_mutex(layout.b1).unwrap();
    assert!(b1_record.lock().await.occupancy().is_none());
}

#[tokio::test]
async fn requested_stop_holds_until_restarted() {
    let layout = loop_layout();
    let mut railroad = layout.railroad;
    railroad
        .add_train(Train::new(Address::new(7), layout.b1, Direction::Next))
        .await
        .unwrap();
    let (mut scheduler, commander) = scheduler_with(railroad).await;

    assert!(scheduler
        .start_train(Address::new(7), Destination::Endless)
        .await
        .unwrap());
    fire(&mut scheduler, 20).await;
    scheduler.stop_train(Address::new(7), false).await.unwrap();
    fire(&mut scheduler, 21).await;

    {
        let mutex = scheduler.railroad().get_train(&Address::new(7)).unwrap();
        let train = mutex.lock().await;
        assert_eq!(train.block(), layout.b2);
        assert_eq!(train.state(), TrainState::Stopped);
        assert_eq!(
            train.mode(),
            ScheduleMode::StopRequested { completely: false }
        );
        assert!(train.route().is_some());
    }

    // No countdown works this stop off; the train waits for the
    // operator however long the clock runs.
    scheduler
        .handle(Message::Tick(Duration::from_secs(60)))
        .await;
    assert_eq!(train_speed(&scheduler, 7).await, Speed::Stop);
    let commands = commander.commands().await;
    assert_eq!(
        commands.last(),
        Some(&Command::Speed(Address::new(7), Speed::Stop))
    );
}

#[tokio::test]
async fn train_stops_short_of_a_foreign_claim() {
    let layout = loop_layout();
    let mut railroad = layout.railroad;
    railroad
        .add_train(Train::new(Address::new(7), layout.b1, Direction::Next))
        .await
        .unwrap();
    let (mut scheduler, commander) = scheduler_with(railroad).await;

    // b3 belongs to someone else before the run begins; with b2 in
    // between, routing through is allowed, entering is not.
    scheduler
        .railroad()
        .reserve(
            Address::new(9),
            &[GraphPathElement::between(
                layout.b3,
                Socket::PREVIOUS,
                Socket::NEXT,
            )],
        )
        .await
        .unwrap();
    assert!(scheduler
        .start_train(Address::new(7), Destination::Once {
            block: layout.b3,
            direction: Direction::Next,
        })
        .await
        .unwrap());

    fire(&mut scheduler, 20).await;
    // The claim one block ahead failed, so the stop is armed and the
    // foreign reservation stands untouched.
    assert!(scheduler
        .railroad()
        .is_reserved_for(layout.b3, Address::new(9))
        .await);
    assert!(!scheduler
        .railroad()
        .is_reserved_for(layout.b3, Address::new(7))
        .await);

    fire(&mut scheduler, 21).await;
    assert!(!scheduler.halted());
    {
        let mutex = scheduler.railroad().get_train(&Address::new(7)).unwrap();
        let train = mutex.lock().await;
        assert_eq!(train.block(), layout.b2);
        assert_eq!(train.state(), TrainState::Stopped);
    }
    let b3_record = scheduler.railroad().get_block_mutex(layout.b3).unwrap();
    assert!(b3_record.lock().await.occupancy().is_none());
    assert_eq!(
        commander.commands().await,
        vec![
            Command::Speed(Address::new(7), Speed::cruising()),
            Command::Speed(Address::new(7), Speed::cruising().braked()),
            Command::Speed(Address::new(7), Speed::Stop),
        ]
    );
}
