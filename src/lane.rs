use std::cell::{Cell, RefCell};

use log::{debug, warn};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use self::arrival::ArrivalProcess;
use self::cache::SafeSpeedCache;
pub use arrival::Headway;
use crate::record::{SimObserver, TrajectoryPoint};
use crate::section::{SectionTypes, Sections};
use crate::util::{mix_seed, Interval};
use crate::vehicle::{SafeSpeedFormula, UpdateMethod};
use crate::{
    Error, Result, Road, SectionType, Vehicle, VehicleClass, VehicleId, VehicleIds, VehicleKey,
    VehicleSet,
};

mod arrival;
mod cache;

/// The speed limit of a lane without speed limit zones, in m/s.
const DEFAULT_SPEED_LIMIT: f64 = 30.0;

/// A lane of traffic, either circular or open at both ends.
#[derive(Clone, Debug)]
pub struct Lane {
    /// The lane's index on its road; 0 is the left-most lane.
    index: usize,
    /// The length of the lane in m.
    length: f64,
    /// Whether vehicles leaving the downstream end re-enter upstream.
    circular: bool,
    /// The time step in s.
    dt: f64,
    /// The number of completed steps.
    step: u64,
    /// Speed limit outside of speed limit zones, in m/s.
    speed_limit: f64,
    /// How positions are integrated.
    update_method: UpdateMethod,
    /// The vehicles on the lane.
    vehicles: VehicleSet,
    /// The vehicles on the lane in order of ascending position.
    order: Vec<VehicleKey>,
    /// Section types and speed limit zones.
    sections: Sections,
    /// The vehicle classes used for loading and arrivals.
    classes: Vec<VehicleClass>,
    /// The arrival process of an open lane.
    arrivals: Option<ArrivalProcess>,
    /// The root seed vehicle random streams are derived from.
    seed: u64,
    /// The lane's own random stream.
    rng: SmallRng,
    /// Source of vehicle IDs.
    ids: VehicleIds,
    /// Per-step safe speeds shared by all vehicles on the lane.
    cache: RefCell<Option<SafeSpeedCache>>,
    /// How many times the safe speeds have been computed.
    cache_builds: Cell<u64>,
    /// Whether vehicle trajectories are recorded.
    recording: bool,
    /// Vehicles that left the lane with recorded data.
    exited: Vec<Vehicle>,
    /// The number of archived vehicles that exited in the last update.
    exited_last: usize,
    /// The number of vehicles that ever left the lane.
    exit_count: usize,
}

/// The attributes of a lane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LaneAttributes {
    /// The length in m.
    pub length: f64,
    /// Whether the lane is a closed loop.
    pub circular: bool,
    /// The simulation time step in s.
    pub dt: f64,
}

impl LaneAttributes {
    /// A closed loop of the given length.
    pub fn circular(length: f64, dt: f64) -> Self {
        Self {
            length,
            circular: true,
            dt,
        }
    }

    /// A lane vehicles enter upstream and leave downstream.
    pub fn open(length: f64, dt: f64) -> Self {
        Self {
            length,
            circular: false,
            dt,
        }
    }
}

impl Lane {
    /// Creates a standalone lane.
    pub fn new(attribs: &LaneAttributes, seed: u64) -> Result<Self> {
        Self::with_ids(0, attribs, seed, VehicleIds::new())
    }

    /// Creates a lane whose vehicles draw IDs from `ids`.
    pub(crate) fn with_ids(
        index: usize,
        attribs: &LaneAttributes,
        seed: u64,
        ids: VehicleIds,
    ) -> Result<Self> {
        if !(attribs.length > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "lane length {} m must be positive",
                attribs.length
            )));
        }
        if !(attribs.dt > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "time step {} s must be positive",
                attribs.dt
            )));
        }
        Ok(Self {
            index,
            length: attribs.length,
            circular: attribs.circular,
            dt: attribs.dt,
            step: 0,
            speed_limit: DEFAULT_SPEED_LIMIT,
            update_method: UpdateMethod::default(),
            vehicles: VehicleSet::with_key(),
            order: vec![],
            sections: Sections::default(),
            classes: vec![],
            arrivals: None,
            seed,
            rng: SmallRng::seed_from_u64(seed),
            ids,
            cache: RefCell::new(None),
            cache_builds: Cell::new(0),
            recording: false,
            exited: vec![],
            exited_last: 0,
            exit_count: 0,
        })
    }

    /// The lane's index on its road.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The length of the lane in m.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Whether the lane is a closed loop.
    pub fn is_circular(&self) -> bool {
        self.circular
    }

    /// The time step in s.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// The number of completed steps.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// The current simulation time in s.
    pub fn time(&self) -> f64 {
        self.step as f64 * self.dt
    }

    /// The number of vehicles on the lane, obstacles included.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the lane is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The vehicles on the lane, from the rear-most to the head.
    pub fn vehicles(&self) -> impl Iterator<Item = &Vehicle> + '_ {
        self.order.iter().map(|key| &self.vehicles[*key])
    }

    /// Gets a vehicle on this lane by ID.
    pub fn vehicle(&self, id: VehicleId) -> Option<&Vehicle> {
        self.key_of(id).map(|key| &self.vehicles[key])
    }

    /// The vehicle ahead of the given one.
    pub fn leader_of(&self, vehicle: &Vehicle) -> Option<&Vehicle> {
        vehicle.leader.and_then(|key| self.vehicles.get(key))
    }

    /// The vehicle behind the given one.
    pub fn follower_of(&self, vehicle: &Vehicle) -> Option<&Vehicle> {
        vehicle.follower.and_then(|key| self.vehicles.get(key))
    }

    /// Vehicles that left the lane with recorded data.
    pub fn exited(&self) -> &[Vehicle] {
        &self.exited
    }

    /// The archived vehicles that left in the last update.
    pub fn exited_last(&self) -> &[Vehicle] {
        &self.exited[self.exited.len() - self.exited_last..]
    }

    /// The number of vehicles that ever left the lane.
    pub fn exited_count(&self) -> usize {
        self.exit_count
    }

    /// The number of vehicle IDs issued by this lane's ID source.
    pub fn issued_ids(&self) -> u64 {
        self.ids.issued()
    }

    pub(crate) fn set_ids(&mut self, ids: VehicleIds) {
        self.ids = ids;
    }

    pub(crate) fn slot(&self, key: VehicleKey) -> &Vehicle {
        &self.vehicles[key]
    }

    fn key_of(&self, id: VehicleId) -> Option<VehicleKey> {
        self.order
            .iter()
            .copied()
            .find(|key| self.vehicles[*key].id() == id)
    }

    /// Sets how positions are integrated.
    pub fn set_update_method(&mut self, method: UpdateMethod) {
        self.update_method = method;
    }

    /// Enables or disables recording of vehicle trajectories.
    pub fn set_recording(&mut self, recording: bool) {
        self.recording = recording;
    }

    /// Whether vehicle trajectories are recorded.
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// Sets the speed limit outside of speed limit zones.
    pub fn set_default_speed_limit(&mut self, limit: f64) {
        self.speed_limit = limit;
    }

    /// Installs a speed limit between `start` and `end` (the end of the lane
    /// if `None`).
    pub fn set_speed_limit(&mut self, limit: f64, start: f64, end: Option<f64>) {
        let span = self.span(start, end);
        self.sections.add_speed_limit(span, limit);
    }

    /// The speed limit at `pos` in m/s.
    pub fn speed_limit(&self, pos: f64) -> f64 {
        self.sections.speed_limit(pos).unwrap_or(self.speed_limit)
    }

    /// Installs a section between `start` and `end` (the end of the lane if
    /// `None`).
    pub fn set_section_type(&mut self, kind: SectionType, start: f64, end: Option<f64>) {
        let span = self.span(start, end);
        self.sections.add(kind, span);
    }

    /// All section types active at `pos`.
    pub fn section_types(&self, pos: f64) -> SectionTypes {
        self.sections.types_at(pos)
    }

    /// Whether a section of the given kind is active at `pos`.
    pub fn has_section(&self, kind: SectionType, pos: f64) -> bool {
        self.sections.has(kind, pos)
    }

    /// The extents of every section of the given kind.
    pub fn sections(&self, kind: SectionType) -> impl Iterator<Item = Interval<f64>> + '_ {
        self.sections.spans(kind)
    }

    fn span(&self, start: f64, end: Option<f64>) -> Interval<f64> {
        Interval::new(start, end.unwrap_or(self.length))
    }

    /// Closes the lane at `pos` with a stationary obstacle.
    pub fn set_block(&mut self, pos: f64) -> Result<VehicleId> {
        if !(0.0..=self.length).contains(&pos) {
            return Err(Error::InvalidParameter(format!(
                "block position {pos} m is outside the lane"
            )));
        }
        let id = self.ids.next();
        self.add_vehicle(Vehicle::obstacle(id, pos));
        self.set_section_type(SectionType::Block, pos, None);
        Ok(id)
    }

    /// Adds a vehicle class used by [Self::load] and the arrival process.
    pub fn add_class(&mut self, class: VehicleClass) -> Result<()> {
        if !(class.length > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "vehicle length {} m must be positive",
                class.length
            )));
        }
        class.model.validate(&class.params, self.dt)?;
        self.classes.push(class);
        Ok(())
    }

    /// The configured vehicle classes.
    pub fn classes(&self) -> &[VehicleClass] {
        &self.classes
    }

    /// Starts spawning vehicles of the configured classes at the upstream end
    /// with a total flow of `flow_rate` veh/h.
    pub fn set_arrivals(&mut self, flow_rate: f64, headway: Headway) -> Result<()> {
        if self.circular {
            return Err(Error::InvalidParameter(
                "circular lanes have no upstream end".to_owned(),
            ));
        }
        self.arrivals = Some(ArrivalProcess::new(flow_rate, headway, &self.classes)?);
        Ok(())
    }

    /// Places every configured vehicle on the lane, evenly spaced.
    ///
    /// Fails if the vehicles would overlap, before anything is placed.
    pub fn load(&mut self) -> Result<()> {
        let total: usize = self.classes.iter().map(|c| c.count).sum();
        if total == 0 {
            return Err(Error::InvalidParameter("no vehicles to load".to_owned()));
        }
        if self.vehicles().any(|v| !v.is_obstacle()) {
            return Err(Error::InvalidParameter("lane is already loaded".to_owned()));
        }
        let longest = self
            .classes
            .iter()
            .filter(|c| c.count > 0)
            .map(|c| c.length)
            .fold(0.0, f64::max);
        let dhw = self.length / total as f64;
        if dhw < longest {
            return Err(Error::Overcrowded {
                count: total,
                length: longest,
                lane_length: self.length,
                max: (self.length / longest).floor() as usize,
            });
        }

        let mut slots: Vec<usize> = self
            .classes
            .iter()
            .enumerate()
            .flat_map(|(i, class)| std::iter::repeat(i).take(class.count))
            .collect();
        slots.shuffle(&mut self.rng);

        for (i, class_idx) in slots.into_iter().enumerate() {
            let vehicle = self.create(class_idx, i as f64 * dhw)?;
            let key = self.vehicles.insert(vehicle);
            self.order.push(key);
        }
        let vehicles = &self.vehicles;
        self.order
            .sort_by(|a, b| vehicles[*a].pos().total_cmp(&vehicles[*b].pos()));
        self.restructure();
        debug!("lane {}: loaded {} vehicles, dhw {:.2} m", self.index, total, dhw);
        Ok(())
    }

    /// Places a single vehicle of the given class at `pos`.
    pub fn insert(&mut self, class: &VehicleClass, pos: f64, speed: f64) -> Result<VehicleId> {
        let id = self.ids.next();
        let vehicle = Vehicle::new(id, class, pos, speed, mix_seed(self.seed, id.0), self.dt)?;
        self.add_vehicle(vehicle);
        Ok(id)
    }

    /// Forces the acceleration of a vehicle for the next step.
    pub fn take_over(&mut self, id: VehicleId, acc: f64) -> Result<()> {
        let key = self.key_of(id).ok_or(Error::VehicleNotFound(id))?;
        self.vehicles[key].force_acc(acc);
        Ok(())
    }

    /// The vehicle at or behind `pos` and the vehicle strictly ahead of it.
    /// On circular lanes the search wraps around.
    pub fn relative_vehicles(&self, pos: f64) -> (Option<&Vehicle>, Option<&Vehicle>) {
        let ahead = self
            .order
            .iter()
            .position(|key| self.vehicles[*key].pos() > pos)
            .unwrap_or(self.order.len());
        let follower = match ahead {
            0 if self.circular => self.order.last(),
            0 => None,
            i => self.order.get(i - 1),
        };
        let leader = match self.order.get(ahead) {
            None if self.circular => self.order.first(),
            key => key,
        };
        (
            follower.map(|key| &self.vehicles[*key]),
            leader.map(|key| &self.vehicles[*key]),
        )
    }

    /// The distance travelled from `from` downstream to `to`; wraps on
    /// circular lanes.
    pub fn distance(&self, from: f64, to: f64) -> f64 {
        let dist = to - from;
        if self.circular && dist < 0.0 {
            dist + self.length
        } else {
            dist
        }
    }

    /// Runs the arrival process, then computes this step's accelerations.
    pub fn step(&mut self) {
        self.summon();
        self.apply_accelerations(None);
    }

    /// Integrates every vehicle's acceleration, removes or wraps vehicles
    /// that passed the end of the lane and advances the clock.
    pub fn update_state(&mut self) {
        let start: Vec<(f64, f64)> = self.vehicles().map(|v| (v.pos(), v.speed())).collect();
        for key in &self.order {
            self.vehicles[*key].apply_kinematics(self.dt, self.update_method);
        }
        self.keep_clear(&start);

        if self.circular {
            self.wrap_positions();
        } else {
            self.remove_exited();
        }
        self.step += 1;
        self.restructure();

        if self.recording {
            self.record();
        }
    }

    /// Runs `steps` steps of a standalone lane.
    pub fn run(&mut self, steps: u64, observer: &mut impl SimObserver) {
        for _ in 0..steps {
            self.step();
            self.update_state();
            for vehicle in self.exited_last() {
                observer.on_exit(self, vehicle);
            }
            observer.on_step(self);
        }
        observer.on_finish(self.step);
    }

    /// Spawns a vehicle at the upstream end if one is due and there is room.
    pub(crate) fn summon(&mut self) {
        let Some(arrivals) = &self.arrivals else {
            return;
        };
        if !arrivals.due(self.time()) {
            return;
        }
        if let Some(rear) = self.order.first().map(|key| &self.vehicles[*key]) {
            if rear.pos_rear() < 0.0 {
                return;
            }
        }

        let class_idx = arrivals.pick_class(&mut self.rng);
        match self.create(class_idx, 0.0) {
            Ok(vehicle) => {
                debug!(
                    "lane {}: vehicle {} arrived at t = {:.1} s",
                    self.index,
                    vehicle.id(),
                    self.time()
                );
                self.add_vehicle(vehicle);
            }
            Err(e) => warn!("lane {}: arrival skipped: {e}", self.index),
        }
        if let Some(arrivals) = self.arrivals.as_mut() {
            arrivals.schedule_next(&mut self.rng);
        }
    }

    /// Computes the acceleration of every vehicle from the current state.
    pub(crate) fn apply_accelerations(&self, road: Option<&Road>) {
        for (index, key) in self.order.iter().enumerate() {
            self.vehicles[*key].step(index, self, road);
        }
    }

    /// The safe speed of the vehicle at `index` in lane order and the
    /// achievable speed of its leader, computed at most once per step.
    pub(crate) fn safe_speeds(&self, index: usize, formula: SafeSpeedFormula) -> (f64, f64) {
        let mut cache = self.cache.borrow_mut();
        if cache.as_ref().map_or(false, |c| c.computed_at != self.step) {
            *cache = None;
        }
        cache
            .get_or_insert_with(|| {
                self.cache_builds.set(self.cache_builds.get() + 1);
                SafeSpeedCache::compute(self, formula)
            })
            .lookup(index)
    }

    /// Creates a vehicle of the given class. Does not add it to the lane.
    fn create(&mut self, class_idx: usize, pos: f64) -> Result<Vehicle> {
        let class = &self.classes[class_idx];
        let speed = if class.random_speed {
            let low = f64::max(class.initial_speed - 0.5, 0.0);
            self.rng.gen_range(low..=class.initial_speed + 0.5)
        } else {
            class.initial_speed
        };
        let id = self.ids.next();
        Vehicle::new(id, class, pos, speed, mix_seed(self.seed, id.0), self.dt)
    }

    /// Inserts a vehicle at its position in lane order.
    pub(crate) fn add_vehicle(&mut self, vehicle: Vehicle) {
        let pos = vehicle.pos();
        let idx = self
            .order
            .iter()
            .position(|key| self.vehicles[*key].pos() > pos)
            .unwrap_or(self.order.len());
        let key = self.vehicles.insert(vehicle);
        self.order.insert(idx, key);
        self.restructure();
    }

    /// Takes a vehicle off the lane.
    pub(crate) fn remove_vehicle(&mut self, id: VehicleId) -> Result<Vehicle> {
        let key = self.key_of(id).ok_or(Error::VehicleNotFound(id))?;
        self.order.retain(|k| *k != key);
        let vehicle = self
            .vehicles
            .remove(key)
            .ok_or(Error::VehicleNotFound(id))?;
        self.restructure();
        Ok(vehicle)
    }

    /// Removes vehicles past the downstream end, archiving those with data.
    fn remove_exited(&mut self) {
        let length = self.length;
        let vehicles = &self.vehicles;
        let (gone, staying): (Vec<VehicleKey>, Vec<VehicleKey>) = self
            .order
            .iter()
            .copied()
            .partition(|key| vehicles[*key].pos() > length);
        self.order = staying;

        self.exited_last = 0;
        for key in gone {
            if let Some(vehicle) = self.vehicles.remove(key) {
                debug!(
                    "lane {}: vehicle {} left at t = {:.1} s",
                    self.index,
                    vehicle.id(),
                    self.time()
                );
                self.exit_count += 1;
                if vehicle.has_data() {
                    self.exited.push(vehicle);
                    self.exited_last += 1;
                }
            }
        }
    }

    /// Shortens the movement of any vehicle that would end this update past
    /// the rear of its leader. `start` holds the position and speed of every
    /// vehicle before the update, in lane order.
    fn keep_clear(&mut self, start: &[(f64, f64)]) {
        let n = self.order.len();
        let mut advance: Vec<f64> = self
            .order
            .iter()
            .zip(start)
            .map(|(key, (pos, _))| self.vehicles[*key].pos() - pos)
            .collect();
        let room: Vec<Option<f64>> = self
            .order
            .iter()
            .map(|key| {
                let vehicle = &self.vehicles[*key];
                match vehicle.leader {
                    Some(leader) if leader != *key => Some(vehicle.gap()),
                    _ => None,
                }
            })
            .collect();

        let mut held = vec![false; n];
        // On a ring the tail bounds the head, so a bound can travel all the way round
        for _ in 0..=n {
            let mut changed = false;
            for i in (0..n).rev() {
                let Some(gap) = room[i] else {
                    continue;
                };
                let bound = f64::max(0.0, gap + advance[(i + 1) % n]);
                if advance[i] > bound {
                    advance[i] = bound;
                    held[i] = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for (i, key) in self.order.iter().enumerate() {
            if held[i] {
                let vehicle = &mut self.vehicles[*key];
                vehicle.hold_back(start[i], advance[i], self.dt, self.update_method);
                debug!(
                    "lane {}: vehicle {} held back at {:.2} m",
                    self.index,
                    vehicle.id(),
                    vehicle.pos()
                );
            }
        }
    }

    /// Wraps positions past the end of a circular lane back to its start.
    fn wrap_positions(&mut self) {
        let length = self.length;
        let mut wrapped = false;
        for vehicle in self.vehicles.values_mut() {
            if vehicle.pos() >= length {
                vehicle.set_pos(vehicle.pos().rem_euclid(length));
                wrapped = true;
            }
        }
        if wrapped {
            let vehicles = &self.vehicles;
            self.order
                .sort_by(|a, b| vehicles[*a].pos().total_cmp(&vehicles[*b].pos()));
        }
    }

    /// Relinks leaders and followers, refreshes headways and drops the
    /// safe speed cache after the vehicle order changed.
    fn restructure(&mut self) {
        let n = self.order.len();
        for (i, key) in self.order.iter().enumerate() {
            let leader = match self.order.get(i + 1) {
                Some(key) => Some(*key),
                None if self.circular => self.order.first().copied(),
                None => None,
            };
            let follower = match i {
                0 if self.circular => self.order.last().copied(),
                0 => None,
                _ => Some(self.order[i - 1]),
            };
            let vehicle = &mut self.vehicles[*key];
            vehicle.leader = leader;
            vehicle.follower = follower;
        }
        debug_assert_eq!(n, self.vehicles.len());

        for key in &self.order {
            let vehicle = &self.vehicles[*key];
            let (dhw, gap) = match vehicle.leader {
                Some(leader_key) if leader_key == *key => (self.length, self.length - vehicle.length()),
                Some(leader_key) => {
                    let leader = &self.vehicles[leader_key];
                    let dhw = self.distance(vehicle.pos(), leader.pos());
                    (dhw, dhw - leader.length())
                }
                None => (f64::INFINITY, f64::INFINITY),
            };
            self.vehicles[*key].set_headway(dhw, gap);
        }

        *self.cache.get_mut() = None;
    }

    /// Appends the current state of every vehicle to its trajectory.
    fn record(&mut self) {
        let step = self.step;
        let time = self.time();
        for key in &self.order {
            let vehicle = &mut self.vehicles[*key];
            if vehicle.is_obstacle() {
                continue;
            }
            let point = TrajectoryPoint {
                step,
                time,
                pos: vehicle.pos(),
                speed: vehicle.speed(),
                acc: vehicle.acc(),
                gap: vehicle.gap(),
                dhw: vehicle.dhw(),
            };
            vehicle.record(point);
        }
    }

    #[cfg(test)]
    pub(crate) fn cache_builds(&self) -> u64 {
        self.cache_builds.get()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ModelKind;
    use assert_approx_eq::assert_approx_eq;

    fn ring(count: usize, speed: f64) -> Lane {
        let mut lane = Lane::new(&LaneAttributes::circular(1000.0, 1.0), 42).unwrap();
        lane.add_class(VehicleClass::new(count, 5.0, ModelKind::Kk).with_speed(speed, false))
            .unwrap();
        lane.load().unwrap();
        lane
    }

    #[test]
    fn load_spaces_vehicles_evenly() {
        let lane = ring(10, 0.0);
        let positions: Vec<f64> = lane.vehicles().map(Vehicle::pos).collect();
        for (i, pos) in positions.iter().enumerate() {
            assert_approx_eq!(*pos, 100.0 * i as f64);
        }
        for vehicle in lane.vehicles() {
            assert_approx_eq!(vehicle.dhw(), 100.0);
            assert_approx_eq!(vehicle.gap(), 95.0);
        }
    }

    #[test]
    fn circular_head_follows_tail() {
        let lane = ring(4, 0.0);
        let head = lane.vehicles().last().unwrap();
        let tail = lane.vehicles().next().unwrap();
        assert_eq!(lane.leader_of(head).unwrap().id(), tail.id());
        assert_eq!(lane.follower_of(tail).unwrap().id(), head.id());
    }

    #[test]
    fn single_vehicle_follows_itself() {
        let lane = ring(1, 0.0);
        let only = lane.vehicles().next().unwrap();
        assert_eq!(lane.leader_of(only).unwrap().id(), only.id());
        assert_approx_eq!(only.gap(), 995.0);
    }

    #[test]
    fn overcrowded_lane_is_rejected() {
        let mut lane = Lane::new(&LaneAttributes::circular(50.0, 1.0), 0).unwrap();
        lane.add_class(VehicleClass::new(10, 10.0, ModelKind::Kk)).unwrap();
        let err = lane.load().unwrap_err();
        assert_eq!(
            err,
            Error::Overcrowded {
                count: 10,
                length: 10.0,
                lane_length: 50.0,
                max: 5
            }
        );
        assert!(lane.is_empty());
        assert_eq!(lane.step_count(), 0);
    }

    #[test]
    fn safe_speeds_computed_once_per_step() {
        let mut lane = ring(10, 10.0);
        lane.step();
        assert_eq!(lane.cache_builds(), 1);

        // Further queries within the same step reuse the cache
        for i in 0..10 {
            lane.safe_speeds(i, SafeSpeedFormula::Discrete);
        }
        assert_eq!(lane.cache_builds(), 1);
        let before = lane.cache.borrow().as_ref().unwrap().v_safe.clone();

        // Make sure at least one input changes
        let id = lane.vehicles().nth(3).unwrap().id();
        lane.update_state();
        lane.take_over(id, -2.0).unwrap();
        lane.step();
        lane.update_state();
        lane.step();
        assert_eq!(lane.cache_builds(), 3);
        let after = lane.cache.borrow().as_ref().unwrap().v_safe.clone();
        assert_ne!(before, after);
    }

    #[test]
    fn cache_is_keyed_by_step() {
        let lane = ring(5, 10.0);
        lane.safe_speeds(0, SafeSpeedFormula::Discrete);
        lane.safe_speeds(4, SafeSpeedFormula::Discrete);
        lane.safe_speeds(2, SafeSpeedFormula::Discrete);
        assert_eq!(lane.cache_builds(), 1);
        assert_eq!(lane.cache.borrow().as_ref().unwrap().computed_at, 0);
    }

    #[test]
    fn circular_positions_wrap() {
        let mut lane = ring(10, 10.0);
        let head = lane.vehicles().last().unwrap().id();
        let mut wrapped = false;
        for _ in 0..60 {
            let before = lane.vehicle(head).unwrap().pos();
            lane.step();
            lane.update_state();
            wrapped |= lane.vehicle(head).unwrap().pos() < before;

            let positions: Vec<f64> = lane.vehicles().map(Vehicle::pos).collect();
            assert!(positions.iter().all(|pos| (0.0..1000.0).contains(pos)));
            assert!(positions.windows(2).all(|w| w[0] <= w[1]));
        }
        assert!(wrapped);
        assert_eq!(lane.len(), 10);
        assert_eq!(lane.exited_count(), 0);
    }

    #[test]
    fn open_lane_removes_vehicles_past_the_end() {
        let mut lane = Lane::new(&LaneAttributes::open(100.0, 1.0), 0).unwrap();
        lane.set_recording(true);
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        let first = lane.insert(&car, 95.0, 10.0).unwrap();
        let second = lane.insert(&car, 50.0, 10.0).unwrap();

        lane.step();
        lane.update_state();
        assert_eq!(lane.len(), 1);
        assert_eq!(lane.exited_count(), 1);
        assert!(lane.vehicle(first).is_none());
        // The remaining vehicle is the new head
        let head = lane.vehicle(second).unwrap();
        assert!(!head.has_leader());
        assert_eq!(head.gap(), f64::INFINITY);
    }

    #[test]
    fn exited_vehicles_keep_their_trajectory() {
        let mut lane = Lane::new(&LaneAttributes::open(100.0, 1.0), 0).unwrap();
        lane.set_recording(true);
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        let id = lane.insert(&car, 60.0, 15.0).unwrap();
        for _ in 0..5 {
            lane.step();
            lane.update_state();
        }
        assert_eq!(lane.exited().len(), 1);
        let vehicle = &lane.exited()[0];
        assert_eq!(vehicle.id(), id);
        assert_eq!(vehicle.trajectory().len(), 2);
        assert_approx_eq!(vehicle.trajectory().points()[1].pos, 90.0);
    }

    #[test]
    fn relative_vehicles_around_position() {
        let mut lane = Lane::new(&LaneAttributes::open(500.0, 1.0), 0).unwrap();
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        let a = lane.insert(&car, 100.0, 0.0).unwrap();
        let b = lane.insert(&car, 200.0, 0.0).unwrap();

        let (behind, ahead) = lane.relative_vehicles(150.0);
        assert_eq!(behind.map(Vehicle::id), Some(a));
        assert_eq!(ahead.map(Vehicle::id), Some(b));

        let (behind, ahead) = lane.relative_vehicles(100.0);
        assert_eq!(behind.map(Vehicle::id), Some(a));
        assert_eq!(ahead.map(Vehicle::id), Some(b));

        let (behind, ahead) = lane.relative_vehicles(250.0);
        assert_eq!(behind.map(Vehicle::id), Some(b));
        assert!(ahead.is_none());

        let (behind, _) = lane.relative_vehicles(50.0);
        assert!(behind.is_none());
    }

    #[test]
    fn relative_vehicles_wrap_on_circular_lane() {
        let lane = ring(2, 0.0);
        let ids: Vec<_> = lane.vehicles().map(Vehicle::id).collect();
        let (behind, ahead) = lane.relative_vehicles(800.0);
        assert_eq!(behind.map(Vehicle::id), Some(ids[1]));
        assert_eq!(ahead.map(Vehicle::id), Some(ids[0]));
        assert_approx_eq!(lane.distance(800.0, 0.0), 200.0);
    }

    #[test]
    fn block_stops_traffic() {
        let mut lane = Lane::new(&LaneAttributes::open(1000.0, 1.0), 8).unwrap();
        lane.set_block(500.0).unwrap();
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        let id = lane.insert(&car, 0.0, 15.0).unwrap();
        assert!(lane.has_section(SectionType::Block, 700.0));
        assert!(!lane.has_section(SectionType::Block, 499.0));

        for _ in 0..300 {
            lane.step();
            lane.update_state();
            let vehicle = lane.vehicle(id).unwrap();
            assert!(vehicle.pos() <= 500.0 + 1e-9);
            assert!(vehicle.gap() >= -1e-9);
        }
        let vehicle = lane.vehicle(id).unwrap();
        assert!(vehicle.pos() > 100.0);
        assert_eq!(lane.exited_count(), 0);
    }

    #[test]
    fn step_ends_at_leader_rear() {
        let mut lane = Lane::new(&LaneAttributes::open(1000.0, 1.0), 0).unwrap();
        lane.set_block(50.0).unwrap();
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        let id = lane.insert(&car, 40.0, 20.0).unwrap();

        // Without braking the car would drive 20 m, through the block
        lane.take_over(id, 0.0).unwrap();
        lane.step();
        lane.update_state();
        let vehicle = lane.vehicle(id).unwrap();
        assert_approx_eq!(vehicle.pos(), 50.0);
        assert_eq!(vehicle.speed(), 0.0);
        assert_approx_eq!(vehicle.acc(), -20.0);
        assert_approx_eq!(vehicle.gap(), 0.0);
    }

    #[test]
    fn held_back_follower_matches_euler_step() {
        let mut lane = Lane::new(&LaneAttributes::open(1000.0, 1.0), 0).unwrap();
        lane.set_update_method(UpdateMethod::Euler);
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        let follower = lane.insert(&car, 100.0, 10.0).unwrap();
        let leader = lane.insert(&car, 110.0, 4.0).unwrap();
        lane.take_over(follower, 0.0).unwrap();
        lane.take_over(leader, 0.0).unwrap();
        lane.step();
        lane.update_state();
        // 5 m of room plus the 4 m the leader moved
        let vehicle = lane.vehicle(follower).unwrap();
        assert_approx_eq!(vehicle.pos(), 109.0);
        assert_approx_eq!(vehicle.speed(), 9.0);
        assert_approx_eq!(vehicle.gap(), 0.0);
    }

    #[test]
    fn cloned_lane_has_its_own_ids() {
        let mut lane = ring(3, 0.0);
        let mut copy = lane.clone();
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        assert_eq!(lane.insert(&car, 150.0, 0.0).unwrap(), VehicleId(3));
        assert_eq!(copy.insert(&car, 150.0, 0.0).unwrap(), VehicleId(3));
        assert_eq!(lane.issued_ids(), 4);
        assert_eq!(copy.issued_ids(), 4);
        assert_eq!(copy.issued_ids(), copy.len() as u64);
    }

    #[test]
    fn speed_limit_zones() {
        let mut lane = Lane::new(&LaneAttributes::open(1000.0, 1.0), 0).unwrap();
        assert_eq!(lane.speed_limit(10.0), DEFAULT_SPEED_LIMIT);
        lane.set_speed_limit(20.0, 400.0, Some(600.0));
        lane.set_default_speed_limit(25.0);
        assert_eq!(lane.speed_limit(500.0), 20.0);
        assert_eq!(lane.speed_limit(700.0), 25.0);
    }

    #[test]
    fn section_types_until_lane_end() {
        let mut lane = Lane::new(&LaneAttributes::open(10000.0, 1.0), 0).unwrap();
        lane.set_section_type(SectionType::OnRamp, 5000.0, None);
        lane.set_section_type(SectionType::NoLeft, 0.0, Some(5000.0));
        assert_eq!(lane.section_types(6000.0).as_slice(), &[SectionType::OnRamp]);
        assert_eq!(lane.section_types(1000.0).as_slice(), &[SectionType::NoLeft]);
        assert!(lane.section_types(-1.0).is_empty());
    }

    #[test]
    fn arrivals_need_an_open_lane() {
        let mut lane = ring(3, 0.0);
        assert!(lane.set_arrivals(1000.0, Headway::Uniform).is_err());
    }

    #[test]
    fn uniform_arrivals() {
        let mut lane = Lane::new(&LaneAttributes::open(5000.0, 1.0), 1).unwrap();
        lane.add_class(VehicleClass::new(1, 5.0, ModelKind::Kk).with_speed(15.0, false))
            .unwrap();
        lane.set_arrivals(1200.0, Headway::Uniform).unwrap();
        for _ in 0..60 {
            lane.step();
            lane.update_state();
        }
        // One vehicle every 3 s, starting at t = 0
        assert_eq!(lane.issued_ids(), 20);
        assert_eq!(lane.len(), 20);
        let rear = lane.vehicles().next().unwrap();
        assert!(rear.pos() >= 0.0);
    }

    #[test]
    fn random_initial_speeds_stay_in_range() {
        let mut lane = Lane::new(&LaneAttributes::circular(1000.0, 1.0), 3).unwrap();
        lane.add_class(VehicleClass::new(20, 5.0, ModelKind::Kk).with_speed(0.2, true))
            .unwrap();
        lane.load().unwrap();
        for vehicle in lane.vehicles() {
            assert!((0.0..=0.7).contains(&vehicle.speed()));
        }
    }

    #[test]
    fn mismatched_time_step_is_rejected_early() {
        let mut lane = Lane::new(&LaneAttributes::circular(1000.0, 0.5), 0).unwrap();
        let err = lane
            .add_class(VehicleClass::new(1, 5.0, ModelKind::Kk))
            .unwrap_err();
        assert_eq!(err, Error::TimeStepMismatch { tau: 1.0, dt: 0.5 });
    }
}
