//! Body handle tests

#[cfg(test)]
mod tests {
    use physics_offload::{
        body::{member_uuid, quat_from_euler},
        types::{BodyProps, BodyType, PhysicsConfig, Quat, ShapeKind, Vec3},
        Body, Coordinator, CoordinatorConfig,
    };
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::time::Duration;
    use tokio_test::assert_ok;

    const WAIT: Duration = Duration::from_secs(5);

    fn coordinator_with_gravity(gravity: Vec3) -> Coordinator {
        let physics = PhysicsConfig {
            gravity,
            ..Default::default()
        };
        assert_ok!(Coordinator::new(physics, CoordinatorConfig::default()))
    }

    fn coordinator() -> Coordinator {
        coordinator_with_gravity(PhysicsConfig::default().gravity)
    }

    fn static_at(x: f32) -> BodyProps {
        BodyProps {
            body_type: BodyType::Static,
            position: Vec3::new(x, 0.0, 0.0),
            ..Default::default()
        }
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    #[test]
    fn drop_removes_the_body() {
        let c = coordinator();
        {
            let body = assert_ok!(Body::create(&c, ShapeKind::Box, || static_at(0.0)));
            assert_eq!(c.stats().registered_bodies, 1);
            assert!(c.slot(body.uuid()).is_some());
        }
        assert_eq!(c.stats().registered_bodies, 0);

        assert_ok!(c.wait_for_frame(WAIT));
        assert_eq!(c.stats().registered_bodies, 0);
    }

    #[test]
    fn destroy_is_idempotent() {
        let c = coordinator();
        let body = assert_ok!(Body::create(&c, ShapeKind::Box, || static_at(0.0)));
        assert_ok!(body.destroy());
        assert_ok!(body.destroy());
        drop(body);
        assert_ok!(c.wait_for_frame(WAIT));
    }

    #[test]
    fn uuids_are_unique() {
        let c = coordinator();
        let a = assert_ok!(Body::create(&c, ShapeKind::Box, || static_at(0.0)));
        let b = assert_ok!(Body::create(&c, ShapeKind::Box, || static_at(1.0)));
        assert_ne!(a.uuid(), b.uuid());
    }

    // -----------------------------------------------------------------------
    // Instanced groups
    // -----------------------------------------------------------------------

    #[test]
    fn instanced_members_are_cached_and_independent() {
        let c = coordinator();
        let group = assert_ok!(Body::instanced(&c, ShapeKind::Box, 5, |i| static_at(
            i as f32
        )));
        assert_eq!(group.count(), 5);
        assert!(group.is_instanced());
        assert_eq!(group.members()[3], member_uuid(group.uuid(), 3));

        let third = group.at(3).expect("member 3");
        let again = group.at(3).expect("member 3");
        assert!(Rc::ptr_eq(&third, &again));
        assert!(group.at(5).is_none());

        assert_ok!(third.position.set_xyz(10.0, 10.0, 10.0));
        assert_ok!(c.wait_for_frame(WAIT));

        let mut sink: Vec<(Vec3, Quat)> = Vec::new();
        assert_eq!(group.apply_transforms(&mut sink), 5);
        assert_eq!(sink[3].0, Vec3::new(10.0, 10.0, 10.0));
        assert_eq!(sink[2].0, Vec3::new(2.0, 0.0, 0.0));
        assert_eq!(
            group.at(2).and_then(|api| api.transform()).map(|(p, _)| p),
            Some(Vec3::new(2.0, 0.0, 0.0))
        );
    }

    #[test]
    fn single_body_api_is_member_zero() {
        let c = coordinator();
        let body = assert_ok!(Body::create(&c, ShapeKind::Sphere, BodyProps::default));
        assert!(!body.is_instanced());
        let api = body.api();
        assert!(Rc::ptr_eq(&api, &body.at(0).expect("member 0")));
        assert_eq!(api.uuid(), body.uuid());
    }

    // -----------------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------------

    #[test]
    fn subscription_guard_unsubscribes_on_drop() {
        let c = coordinator();
        let body = assert_ok!(Body::create(&c, ShapeKind::Box, || static_at(0.0)));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let sub = assert_ok!(body.api().position.subscribe(move |p| sink.borrow_mut().push(p)));
        assert_eq!(c.stats().live_subscriptions, 1);

        assert_ok!(c.wait_for_frame(WAIT));
        assert_eq!(seen.borrow().as_slice(), &[Vec3::zero()]);

        assert_ok!(sub.unsubscribe());
        assert_ok!(sub.unsubscribe());
        drop(sub);
        assert_eq!(c.stats().live_subscriptions, 0);

        assert_ok!(c.wait_for_frame(WAIT));
        assert_eq!(seen.borrow().len(), 1);
    }

    #[test]
    fn get_fires_once() {
        let c = coordinator();
        let body = assert_ok!(Body::create(&c, ShapeKind::Box, || static_at(0.0)));
        assert_ok!(body.api().friction.set(0.3));

        let calls = Rc::new(RefCell::new(Vec::new()));
        let sink = calls.clone();
        assert_ok!(body.api().friction.get(move |f| sink.borrow_mut().push(f)));

        assert_ok!(c.wait_for_frame(WAIT));
        assert_ok!(c.wait_for_frame(WAIT));
        assert_eq!(calls.borrow().as_slice(), &[0.3]);
        assert_eq!(c.stats().live_subscriptions, 0);
    }

    #[test]
    fn vector_and_rotation_helpers() {
        let c = coordinator();
        let body = assert_ok!(Body::create(&c, ShapeKind::Box, || static_at(0.0)));
        let api = body.api();

        assert_ok!(api.position.copy([1.0, 2.0, 3.0]));
        assert_ok!(api.rotation.set_euler(0.0, std::f32::consts::FRAC_PI_2, 0.0));
        assert_ok!(c.wait_for_frame(WAIT));

        let (position, rotation) = api.transform().expect("transform");
        assert_eq!(position, Vec3::new(1.0, 2.0, 3.0));
        let half = std::f32::consts::FRAC_1_SQRT_2;
        assert!(close(rotation.y, half) && close(rotation.w, half), "{rotation}");
        assert!(close(rotation.x, 0.0) && close(rotation.z, 0.0));
    }

    #[test]
    fn euler_order_is_xyz() {
        // Rx(90°) * Ry(90°)
        let q = quat_from_euler(std::f32::consts::FRAC_PI_2, std::f32::consts::FRAC_PI_2, 0.0);
        assert!(close(q.x, 0.5) && close(q.y, 0.5) && close(q.z, 0.5) && close(q.w, 0.5), "{q}");
    }

    // -----------------------------------------------------------------------
    // Forces and collisions
    // -----------------------------------------------------------------------

    #[test]
    fn central_impulse_moves_body() {
        let c = coordinator_with_gravity(Vec3::zero());
        let body = assert_ok!(Body::create(&c, ShapeKind::Sphere, BodyProps::default));
        assert_ok!(c.wait_for_frame(WAIT));
        assert_ok!(body.api().apply_central_impulse(Vec3::new(1.0, 0.0, 0.0)));

        let velocity = Rc::new(Cell::new(Vec3::zero()));
        let sink = velocity.clone();
        let _sub = assert_ok!(body.api().velocity.subscribe(move |v| sink.set(v)));
        assert_ok!(c.wait_for_frame(WAIT));

        let (position, _) = body.api().transform().expect("transform");
        assert!(position.x > 0.0);
        assert!(close(position.y, 0.0));
        // Unit mass, no damping.
        assert!((velocity.get().x - 1.0).abs() < 1e-3, "{}", velocity.get());
    }

    #[test]
    fn body_collision_callback() {
        let c = coordinator();
        let _ground = assert_ok!(Body::create(&c, ShapeKind::Box, || BodyProps {
            body_type: BodyType::Static,
            ..Default::default()
        }));
        let hits = Rc::new(Cell::new(0));
        let counter = hits.clone();
        // `on_collide` is left unset in the props; the handler turns it on.
        let ball = assert_ok!(Body::create_with_collide(
            &c,
            ShapeKind::Sphere,
            || BodyProps {
                args: Some(vec![0.5]),
                position: Vec3::new(0.0, 1.6, 0.0),
                linear_velocity: Vec3::new(0.0, -5.0, 0.0),
                ..Default::default()
            },
            move |event| {
                assert!(event.target.starts_with("body-"));
                counter.set(counter.get() + 1)
            },
        ));

        for _ in 0..30 {
            assert_ok!(c.wait_for_frame(WAIT));
            if hits.get() > 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(hits.get() > 0);
        drop(ball);
    }

    #[test]
    fn instanced_collide_handler_covers_every_member() {
        let c = coordinator();
        let _ground = assert_ok!(Body::create(&c, ShapeKind::Box, || BodyProps {
            body_type: BodyType::Static,
            args: Some(vec![10.0, 1.0, 10.0]),
            ..Default::default()
        }));
        let targets = Rc::new(RefCell::new(Vec::new()));
        let sink = targets.clone();
        let group = assert_ok!(Body::instanced_with_collide(
            &c,
            ShapeKind::Sphere,
            2,
            |i| BodyProps {
                args: Some(vec![0.5]),
                position: Vec3::new(i as f32 * 3.0, 1.6, 0.0),
                linear_velocity: Vec3::new(0.0, -5.0, 0.0),
                ..Default::default()
            },
            move |event| sink.borrow_mut().push(event.target.clone()),
        ));

        for _ in 0..30 {
            assert_ok!(c.wait_for_frame(WAIT));
            if targets.borrow().len() >= 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let targets = targets.borrow();
        assert!(targets.contains(&group.members()[0]), "{:?}", targets);
        assert!(targets.contains(&group.members()[1]), "{:?}", targets);
    }

    #[test]
    fn get_on_destroyed_body_is_released() {
        let c = coordinator();
        let body = assert_ok!(Body::create(&c, ShapeKind::Box, || static_at(0.0)));
        assert_ok!(body.destroy());

        let calls = Rc::new(Cell::new(0));
        let counter = calls.clone();
        assert_ok!(body.api().mass.get(move |_| counter.set(counter.get() + 1)));
        assert_eq!(c.stats().live_subscriptions, 1);

        assert_ok!(c.wait_for_frame(WAIT));
        assert_eq!(calls.get(), 0);
        assert_eq!(c.stats().live_subscriptions, 0);
    }
}
