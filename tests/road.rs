//! Tests that involve several lanes of one road.

use lanesim::{ModelKind, NoopObserver, Road, SectionType, Side, TrajectoryLog, VehicleClass};

#[test]
fn warm_up_is_not_recorded() {
    let mut road = Road::new(1000.0, 5);
    road.add_lanes(2, true, 1.0).unwrap();
    for i in 0..2 {
        let lane = road.lane_mut(i).unwrap();
        lane.add_class(VehicleClass::new(10, 5.0, ModelKind::Kk)).unwrap();
        lane.load().unwrap();
    }

    let mut log = TrajectoryLog::new();
    road.run_with_warm_up(50, 20, &mut log);
    assert_eq!(road.step_count(), 70);
    assert_eq!(log.rows().len(), 2 * 10 * 20);
    assert!(log.rows().iter().all(|row| (51..=70).contains(&row.step)));
    for lane in road.lanes() {
        for vehicle in lane.vehicles() {
            assert_eq!(vehicle.trajectory().len(), 20);
        }
    }
    assert_eq!(road.issued_ids(), 20);
}

/// A merging vehicle beside a queue slows down, a vehicle on an ordinary
/// lane does not.
#[test]
fn on_ramp_synchronises_with_left_lane() {
    let ramp_speed = |on_ramp: bool| {
        let mut road = Road::new(5000.0, 11);
        road.add_lanes(2, false, 1.0).unwrap();
        road.lane_mut(0).unwrap().set_block(600.0).unwrap();
        let lane = road.lane_mut(1).unwrap();
        if on_ramp {
            lane.set_section_type(SectionType::OnRamp, 0.0, Some(1000.0));
        }
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        let id = lane.insert(&car, 100.0, 20.0).unwrap();
        lane.insert(&car, 4000.0, 20.0).unwrap();

        road.run(20, &mut NoopObserver);
        road.find_vehicle(id).unwrap().1.speed()
    };
    let merging = ramp_speed(true);
    let free = ramp_speed(false);
    assert!(merging < free, "merging {merging} m/s, free {free} m/s");
    assert!(merging < 20.0);
}

#[test]
fn lane_change_then_follow() {
    let mut road = Road::new(2000.0, 3);
    road.add_lanes(2, false, 1.0).unwrap();
    let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
    let id = road.lane_mut(1).unwrap().insert(&car, 100.0, 15.0).unwrap();
    let leader = road.lane_mut(0).unwrap().insert(&car, 150.0, 15.0).unwrap();
    road.lane_mut(0).unwrap().insert(&car, 1900.0, 15.0).unwrap();

    road.change_lane(1, id, Side::Left).unwrap();
    let lane = road.lane(0).unwrap();
    let vehicle = lane.vehicle(id).unwrap();
    assert_eq!(lane.leader_of(vehicle).map(|v| v.id()), Some(leader));
    assert_eq!(vehicle.gap(), 45.0);

    road.run(10, &mut NoopObserver);
    let (lane, vehicle) = road.find_vehicle(id).unwrap();
    assert_eq!(lane, 0);
    assert!(vehicle.gap() > 0.0);
    assert!(road.change_lane(0, id, Side::Left).is_err());
}
