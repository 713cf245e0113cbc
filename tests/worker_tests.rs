//! SimulationWorker tests (driven synchronously, no thread)

#[cfg(test)]
mod tests {
    use physics_offload::{
        buffers::TransformBuffers,
        protocol::{
            Attribute, AttributeValue, Envelope, FrameReport, HostMessage, ProtocolError,
            WorkerMessage,
        },
        types::{BodyProps, BodyType, Broadphase, PhysicsConfig, ShapeKind, Vec3},
        worker::{SimulationWorker, WorkerState, NOMINAL_FIRST_TICK},
    };
    use bytes::Bytes;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn send(worker: &mut SimulationWorker, message: WorkerMessage) -> Vec<HostMessage> {
        assert_ok!(worker.handle(message.into()))
    }

    fn ready_worker() -> SimulationWorker {
        let mut worker = SimulationWorker::new();
        let replies = send(&mut worker, WorkerMessage::Init(PhysicsConfig::default()));
        assert!(matches!(replies.as_slice(), [HostMessage::Ready]));
        worker
    }

    fn add(worker: &mut SimulationWorker, shape: ShapeKind, bodies: &[(&str, BodyProps)]) {
        send(
            worker,
            WorkerMessage::AddBodies {
                shape,
                uuids: bodies.iter().map(|(uuid, _)| uuid.to_string()).collect(),
                props: bodies.iter().map(|(_, props)| props.clone()).collect(),
            },
        );
    }

    fn fixed_at(x: f32) -> BodyProps {
        BodyProps {
            body_type: BodyType::Static,
            position: Vec3::new(x, 0.0, 0.0),
            ..Default::default()
        }
    }

    fn frame_of(replies: Vec<HostMessage>) -> FrameReport {
        replies
            .into_iter()
            .find_map(|m| match m {
                HostMessage::Frame(frame) => Some(frame),
                _ => None,
            })
            .expect("step produces a frame")
    }

    fn step(worker: &mut SimulationWorker, buffers: TransformBuffers) -> FrameReport {
        frame_of(send(worker, WorkerMessage::Step { buffers }))
    }

    // -----------------------------------------------------------------------
    // Initialisation
    // -----------------------------------------------------------------------

    #[test]
    fn messages_before_init_are_replayed_in_order() {
        let mut worker = SimulationWorker::new();
        add(&mut worker, ShapeKind::Box, &[("a", fixed_at(0.0))]);
        send(
            &mut worker,
            WorkerMessage::RemoveBodies {
                uuids: vec!["a".into()],
            },
        );
        add(&mut worker, ShapeKind::Box, &[("b", fixed_at(1.0))]);
        assert_eq!(worker.state(), WorkerState::Uninitialized);
        assert_eq!(worker.pending(), 3);

        let replies = send(&mut worker, WorkerMessage::Init(PhysicsConfig::default()));
        assert!(matches!(replies.as_slice(), [HostMessage::Ready]));
        assert_eq!(worker.state(), WorkerState::Ready);
        assert_eq!(worker.pending(), 0);

        let world = worker.world().expect("world after ready");
        assert_eq!(world.uuids(), vec!["b".to_string()]);
    }

    #[test]
    fn step_before_init_is_answered_after_ready() {
        let mut worker = SimulationWorker::new();
        let replies = send(
            &mut worker,
            WorkerMessage::Step {
                buffers: TransformBuffers::new(),
            },
        );
        assert!(replies.is_empty());

        let replies = send(&mut worker, WorkerMessage::Init(PhysicsConfig::default()));
        assert!(matches!(replies.first(), Some(HostMessage::Ready)));
        let frame = frame_of(replies);
        assert_eq!(frame.tick, 1);
        assert!(!frame.active);
    }

    #[test]
    fn second_init_is_ignored() {
        let mut worker = ready_worker();
        add(&mut worker, ShapeKind::Sphere, &[("a", BodyProps::default())]);

        let replies = send(&mut worker, WorkerMessage::Init(PhysicsConfig::default()));
        assert!(replies.is_empty());
        assert_eq!(worker.world().map(|w| w.len()), Some(1));
    }

    #[test]
    fn missing_backend_fails_init() {
        let mut worker = SimulationWorker::new();
        add(&mut worker, ShapeKind::Sphere, &[("a", BodyProps::default())]);

        let config = PhysicsConfig {
            backend_path: Some("/nonexistent/physics-backend.wasm".into()),
            ..Default::default()
        };
        let replies = send(&mut worker, WorkerMessage::Init(config));
        assert!(matches!(replies.as_slice(), [HostMessage::InitFailed { .. }]));
        assert_eq!(worker.state(), WorkerState::Failed);
        assert!(worker.world().is_none());

        // Nothing is ever answered once failed.
        let replies = send(
            &mut worker,
            WorkerMessage::Step {
                buffers: TransformBuffers::new(),
            },
        );
        assert!(replies.is_empty());
    }

    #[test]
    fn empty_broadphase_bounds_fail_init() {
        let mut worker = SimulationWorker::new();
        let config = PhysicsConfig {
            broadphase: Broadphase::SweepAndPrune {
                aabb_min: Vec3::splat(10.0),
                aabb_max: Vec3::splat(-10.0),
            },
            ..Default::default()
        };
        let replies = send(&mut worker, WorkerMessage::Init(config));
        assert!(matches!(replies.as_slice(), [HostMessage::InitFailed { .. }]));
    }

    // -----------------------------------------------------------------------
    // Stepping
    // -----------------------------------------------------------------------

    #[test]
    fn sphere_falls_straight_down() {
        let mut worker = ready_worker();
        add(
            &mut worker,
            ShapeKind::Sphere,
            &[(
                "ball",
                BodyProps {
                    position: Vec3::new(0.0, 5.0, 0.0),
                    ..Default::default()
                },
            )],
        );
        send(
            &mut worker,
            WorkerMessage::Subscribe {
                id: 0,
                uuid: "ball".into(),
                attribute: Attribute::Position,
            },
        );

        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(frame.observations.len(), 1);
        let AttributeValue::Position(p) = frame.observations[0].value else {
            panic!("expected a position observation");
        };
        assert!(p.y < 5.0, "y = {}", p.y);
        assert!(p.x.abs() < 1e-6 && p.z.abs() < 1e-6, "drifted to {p}");

        // Under gravity alone for one nominal tick, the drop is at most g·dt².
        let max_drop = 9.81 * NOMINAL_FIRST_TICK * NOMINAL_FIRST_TICK;
        assert!(5.0 - p.y <= max_drop + 1e-4);
        assert_eq!(frame.buffers.position(0), Some(p));
    }

    #[test]
    fn frame_buffers_match_live_count() {
        let mut worker = ready_worker();
        add(
            &mut worker,
            ShapeKind::Box,
            &[("a", fixed_at(0.0)), ("b", fixed_at(1.0)), ("c", fixed_at(2.0))],
        );

        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(frame.buffers.positions().len(), 9);
        assert_eq!(frame.buffers.quaternions().len(), 12);
        assert!(frame.active);

        send(
            &mut worker,
            WorkerMessage::RemoveBodies {
                uuids: vec!["b".into()],
            },
        );
        let frame = step(&mut worker, frame.buffers);
        assert_eq!(frame.buffers.positions().len(), 6);
        assert_eq!(frame.buffers.quaternions().len(), 8);
    }

    #[test]
    fn removal_reindexes_slots() {
        let mut worker = ready_worker();
        add(
            &mut worker,
            ShapeKind::Box,
            &[("a", fixed_at(0.0)), ("b", fixed_at(1.0)), ("c", fixed_at(2.0))],
        );
        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(
            frame.bodies,
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );

        send(
            &mut worker,
            WorkerMessage::RemoveBodies {
                uuids: vec!["b".into()],
            },
        );
        let frame = step(&mut worker, frame.buffers);
        assert_eq!(frame.bodies, Some(vec!["a".to_string(), "c".to_string()]));
        assert_eq!(frame.buffers.position(0), Some(Vec3::new(0.0, 0.0, 0.0)));
        assert_eq!(frame.buffers.position(1), Some(Vec3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn bodies_list_is_reported_once_per_change() {
        let mut worker = ready_worker();
        add(&mut worker, ShapeKind::Box, &[("a", fixed_at(0.0))]);

        let frame = step(&mut worker, TransformBuffers::new());
        assert!(frame.bodies.is_some());
        let frame = step(&mut worker, frame.buffers);
        assert!(frame.bodies.is_none());

        // Removing an unknown body changes nothing.
        send(
            &mut worker,
            WorkerMessage::RemoveBodies {
                uuids: vec!["ghost".into()],
            },
        );
        let frame = step(&mut worker, frame.buffers);
        assert!(frame.bodies.is_none());
        assert_eq!(frame.tick, 3);
    }

    #[test]
    fn slots_are_stable_across_additions() {
        let mut worker = ready_worker();
        add(
            &mut worker,
            ShapeKind::Box,
            &[("a", fixed_at(0.0)), ("b", fixed_at(1.0))],
        );
        let frame = step(&mut worker, TransformBuffers::new());

        add(&mut worker, ShapeKind::Box, &[("c", fixed_at(2.0))]);
        let frame = step(&mut worker, frame.buffers);
        assert_eq!(
            frame.bodies,
            Some(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
        assert_eq!(frame.buffers.position(0), Some(Vec3::new(0.0, 0.0, 0.0)));
        assert_eq!(frame.buffers.position(1), Some(Vec3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn static_and_kinematic_bodies_ignore_gravity() {
        let mut worker = ready_worker();
        let raised = |body_type| BodyProps {
            body_type,
            position: Vec3::new(0.0, 3.0, 0.0),
            ..Default::default()
        };
        add(
            &mut worker,
            ShapeKind::Sphere,
            &[
                ("static", raised(BodyType::Static)),
                ("kinematic", raised(BodyType::Kinematic)),
            ],
        );

        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(frame.buffers.position(0), Some(Vec3::new(0.0, 3.0, 0.0)));
        assert_eq!(frame.buffers.position(1), Some(Vec3::new(0.0, 3.0, 0.0)));
    }

    #[test]
    fn zero_linear_factor_locks_an_axis() {
        let mut worker = ready_worker();
        add(
            &mut worker,
            ShapeKind::Sphere,
            &[(
                "ball",
                BodyProps {
                    position: Vec3::new(0.0, 5.0, 0.0),
                    linear_factor: Vec3::new(1.0, 0.0, 1.0),
                    ..Default::default()
                },
            )],
        );

        let frame = step(&mut worker, TransformBuffers::new());
        let p = frame.buffers.position(0).expect("slot 0");
        assert!((p.y - 5.0).abs() < 1e-4, "y = {}", p.y);
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    #[test]
    fn set_values_are_observed() {
        let mut worker = ready_worker();
        add(&mut worker, ShapeKind::Box, &[("a", BodyProps::default())]);

        for value in [
            AttributeValue::Friction(0.3),
            AttributeValue::Restitution(0.8),
            AttributeValue::LinearDamping(0.5),
            AttributeValue::AngularDamping(0.25),
        ] {
            send(
                &mut worker,
                WorkerMessage::Set {
                    uuid: "a".into(),
                    value,
                },
            );
        }
        for (id, attribute) in [
            Attribute::Friction,
            Attribute::Restitution,
            Attribute::LinearDamping,
            Attribute::AngularDamping,
        ]
        .into_iter()
        .enumerate()
        {
            send(
                &mut worker,
                WorkerMessage::Subscribe {
                    id: id as u64,
                    uuid: "a".into(),
                    attribute,
                },
            );
        }

        let frame = step(&mut worker, TransformBuffers::new());
        let values: Vec<_> = frame.observations.iter().map(|o| o.value).collect();
        assert_eq!(
            values,
            vec![
                AttributeValue::Friction(0.3),
                AttributeValue::Restitution(0.8),
                AttributeValue::LinearDamping(0.5),
                AttributeValue::AngularDamping(0.25),
            ]
        );
    }

    #[test]
    fn set_position_teleports_body() {
        let mut worker = ready_worker();
        add(&mut worker, ShapeKind::Box, &[("a", fixed_at(0.0))]);
        send(
            &mut worker,
            WorkerMessage::Set {
                uuid: "a".into(),
                value: AttributeValue::Position(Vec3::new(4.0, 4.0, 4.0)),
            },
        );
        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(frame.buffers.position(0), Some(Vec3::new(4.0, 4.0, 4.0)));
    }

    #[test]
    fn stale_uuid_is_ignored() {
        let mut worker = ready_worker();
        add(
            &mut worker,
            ShapeKind::Box,
            &[("a", fixed_at(0.0)), ("b", fixed_at(1.0))],
        );
        send(
            &mut worker,
            WorkerMessage::RemoveBodies {
                uuids: vec!["a".into()],
            },
        );

        let replies = send(
            &mut worker,
            WorkerMessage::Set {
                uuid: "a".into(),
                value: AttributeValue::Position(Vec3::splat(9.0)),
            },
        );
        assert!(replies.is_empty());
        send(
            &mut worker,
            WorkerMessage::Apply {
                uuid: "a".into(),
                kind: physics_offload::protocol::ForceKind::Impulse,
                vector: Vec3::splat(9.0),
                world_point: Vec3::zero(),
            },
        );

        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(frame.bodies, Some(vec!["b".to_string()]));
        assert_eq!(frame.buffers.position(0), Some(Vec3::new(1.0, 0.0, 0.0)));
    }

    #[test]
    fn subscriptions_to_unknown_bodies_are_dropped() {
        let mut worker = ready_worker();
        send(
            &mut worker,
            WorkerMessage::Subscribe {
                id: 1,
                uuid: "ghost".into(),
                attribute: Attribute::Mass,
            },
        );
        assert_eq!(worker.subscription_count(), 0);

        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(frame.dropped, vec![1]);
        let frame = step(&mut worker, frame.buffers);
        assert!(frame.dropped.is_empty());
    }

    #[test]
    fn unsubscribe_stops_observations() {
        let mut worker = ready_worker();
        add(&mut worker, ShapeKind::Box, &[("a", fixed_at(0.0))]);
        send(
            &mut worker,
            WorkerMessage::Subscribe {
                id: 4,
                uuid: "a".into(),
                attribute: Attribute::Position,
            },
        );
        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(frame.observations.len(), 1);
        assert_eq!(frame.observations[0].id, 4);

        send(&mut worker, WorkerMessage::Unsubscribe { id: 4 });
        send(&mut worker, WorkerMessage::Unsubscribe { id: 4 });
        let frame = step(&mut worker, frame.buffers);
        assert!(frame.observations.is_empty());
    }

    #[test]
    fn removing_a_body_drops_its_subscriptions() {
        let mut worker = ready_worker();
        add(&mut worker, ShapeKind::Box, &[("a", fixed_at(0.0))]);
        send(
            &mut worker,
            WorkerMessage::Subscribe {
                id: 0,
                uuid: "a".into(),
                attribute: Attribute::Rotation,
            },
        );
        send(
            &mut worker,
            WorkerMessage::RemoveBodies {
                uuids: vec!["a".into()],
            },
        );
        assert_eq!(worker.subscription_count(), 0);

        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(frame.dropped, vec![0]);
    }

    // -----------------------------------------------------------------------
    // Creation failures
    // -----------------------------------------------------------------------

    #[test]
    fn invalid_args_abort_only_that_body() {
        let mut worker = ready_worker();
        let bad = BodyProps {
            args: Some(vec![1.0]),
            ..fixed_at(1.0)
        };
        add(
            &mut worker,
            ShapeKind::Box,
            &[("a", fixed_at(0.0)), ("b", bad), ("c", fixed_at(2.0))],
        );
        let world = worker.world().expect("ready");
        assert_eq!(world.uuids(), vec!["a".to_string(), "c".to_string()]);

        let frame = step(&mut worker, TransformBuffers::new());
        assert_eq!(frame.bodies, Some(vec!["a".to_string(), "c".to_string()]));
    }

    #[test]
    fn unsupported_shape_keeps_worker_running() {
        let mut worker = ready_worker();
        add(&mut worker, ShapeKind::Unsupported, &[("a", BodyProps::default())]);
        assert_eq!(worker.state(), WorkerState::Ready);

        let frame = step(&mut worker, TransformBuffers::new());
        assert!(!frame.active);
        assert!(frame.buffers.is_empty());
        // The rejected uuid must not linger in the host registry.
        assert_eq!(frame.bodies, Some(Vec::new()));
    }

    // -----------------------------------------------------------------------
    // Wire input
    // -----------------------------------------------------------------------

    #[test]
    fn encoded_messages_are_decoded() {
        let mut worker = ready_worker();
        let message = WorkerMessage::AddBodies {
            shape: ShapeKind::Sphere,
            uuids: vec!["a".into()],
            props: vec![BodyProps::default()],
        };
        let bytes = assert_ok!(message.encode());
        assert_ok!(worker.handle(Envelope::Encoded(bytes)));
        assert_eq!(worker.world().map(|w| w.len()), Some(1));
    }

    #[test]
    fn unknown_encoded_kind_is_an_error() {
        let mut worker = ready_worker();
        let err = assert_err!(worker.handle(Envelope::Encoded(Bytes::from_static(
            br#"{"type":"warp","props":{}}"#
        ))));
        assert!(matches!(err, ProtocolError::UnknownKind(_)));
    }

    // -----------------------------------------------------------------------
    // Collisions
    // -----------------------------------------------------------------------

    fn drop_onto_ground(ball: BodyProps) -> Vec<HostMessage> {
        let mut worker = ready_worker();
        add(
            &mut worker,
            ShapeKind::Box,
            &[(
                "ground",
                BodyProps {
                    body_type: BodyType::Static,
                    ..Default::default()
                },
            )],
        );
        add(&mut worker, ShapeKind::Sphere, &[("ball", ball)]);

        let mut collisions = Vec::new();
        let mut buffers = TransformBuffers::new();
        for _ in 0..30 {
            let replies = send(&mut worker, WorkerMessage::Step { buffers });
            let mut frame = None;
            for reply in replies {
                match reply {
                    HostMessage::Frame(f) => frame = Some(f),
                    other => collisions.push(other),
                }
            }
            buffers = frame.expect("frame").buffers;
            if !collisions.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        collisions
    }

    fn falling_ball() -> BodyProps {
        BodyProps {
            args: Some(vec![0.5]),
            position: Vec3::new(0.0, 1.6, 0.0),
            linear_velocity: Vec3::new(0.0, -5.0, 0.0),
            on_collide: true,
            ..Default::default()
        }
    }

    #[test]
    fn collision_is_reported_to_the_registered_body() {
        let collisions = drop_onto_ground(falling_ball());
        let Some(HostMessage::Collision(report)) = collisions.first() else {
            panic!("no collision reported");
        };
        assert_eq!(report.target, "ball");
        assert_eq!(report.body, "ground");
        // Measured before the contact is resolved: roughly the 5 m/s drop.
        assert!(
            report.contact.impact_velocity > 4.0,
            "{}",
            report.contact.impact_velocity
        );
        assert_eq!(report.filters.target_filter_group, 1);
        assert_eq!(report.filters.body_filter_group, 1);
        // The ground did not ask for collision events.
        assert!(collisions
            .iter()
            .all(|m| !matches!(m, HostMessage::Collision(r) if r.target == "ground")));
    }

    #[test]
    fn collision_filter_mask_suppresses_reports() {
        let collisions = drop_onto_ground(BodyProps {
            collision_filter_mask: 2,
            ..falling_ball()
        });
        assert!(collisions.is_empty());
    }
}
