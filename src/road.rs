use std::ops::Range;

use log::{debug, info};

use crate::record::SimObserver;
use crate::util::mix_seed;
use crate::{Error, Lane, LaneAttributes, Result, SectionType, Vehicle, VehicleId, VehicleIds};

/// A side of a lane, as seen in the direction of travel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Side {
    Left,
    Right,
}

/// A set of parallel lanes of equal length. Lane 0 is the left-most lane.
///
/// All lanes draw vehicle IDs from one sequence and are stepped together, so
/// that vehicles on one lane can look at their neighbours on another.
#[derive(Debug)]
pub struct Road {
    length: f64,
    seed: u64,
    lanes: Vec<Lane>,
    ids: VehicleIds,
}

impl Clone for Road {
    /// Copies the road with its own ID sequence, shared by the copied lanes.
    fn clone(&self) -> Self {
        let ids = self.ids.clone();
        let lanes = self
            .lanes
            .iter()
            .map(|lane| {
                let mut lane = lane.clone();
                lane.set_ids(ids.share());
                lane
            })
            .collect();
        Self {
            length: self.length,
            seed: self.seed,
            lanes,
            ids,
        }
    }
}

impl Road {
    /// Creates a road without lanes.
    pub fn new(length: f64, seed: u64) -> Self {
        Self {
            length,
            seed,
            lanes: vec![],
            ids: VehicleIds::new(),
        }
    }

    /// The length of the road in m.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// Adds `count` lanes on the right of the existing ones and returns their
    /// indices.
    pub fn add_lanes(&mut self, count: usize, circular: bool, dt: f64) -> Result<Range<usize>> {
        let attribs = LaneAttributes {
            length: self.length,
            circular,
            dt,
        };
        if let Some(first) = self.lanes.first() {
            if first.dt() != dt {
                return Err(Error::InvalidParameter(format!(
                    "lanes of one road must share a time step ({} s != {} s)",
                    first.dt(),
                    dt
                )));
            }
        }
        let start = self.lanes.len();
        for index in start..start + count {
            let seed = mix_seed(self.seed, index as u64);
            self.lanes
                .push(Lane::with_ids(index, &attribs, seed, self.ids.share())?);
        }
        Ok(start..start + count)
    }

    /// Adds a single lane on the right and returns its index.
    pub fn add_lane(&mut self, circular: bool, dt: f64) -> Result<usize> {
        self.add_lanes(1, circular, dt).map(|range| range.start)
    }

    /// Gets a lane by index.
    pub fn lane(&self, index: usize) -> Option<&Lane> {
        self.lanes.get(index)
    }

    /// Gets a lane by index.
    pub fn lane_mut(&mut self, index: usize) -> Option<&mut Lane> {
        self.lanes.get_mut(index)
    }

    /// The lanes, from left to right.
    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }

    /// The lanes to the left and right of lane `index` at `pos`.
    ///
    /// A side is `None` if there is no lane there or if the lane `index`
    /// forbids changing to that side at `pos`.
    pub fn adjacent_lanes(&self, index: usize, pos: f64) -> (Option<&Lane>, Option<&Lane>) {
        let Some(lane) = self.lanes.get(index) else {
            return (None, None);
        };
        let left = match index.checked_sub(1) {
            Some(left) if !lane.has_section(SectionType::NoLeft, pos) => self.lanes.get(left),
            _ => None,
        };
        let right = if lane.has_section(SectionType::NoRight, pos) {
            None
        } else {
            self.lanes.get(index + 1)
        };
        (left, right)
    }

    /// Moves a vehicle to the neighbouring lane on the given side, keeping its
    /// position and speed.
    pub fn change_lane(&mut self, lane: usize, id: VehicleId, side: Side) -> Result<()> {
        let source = self.lanes.get(lane).ok_or(Error::LaneIndex(lane))?;
        let pos = source.vehicle(id).ok_or(Error::VehicleNotFound(id))?.pos();
        let restriction = match side {
            Side::Left => SectionType::NoLeft,
            Side::Right => SectionType::NoRight,
        };
        if source.has_section(restriction, pos) {
            return Err(Error::LaneChangeRestricted { pos });
        }
        let target = match side {
            Side::Left => lane.checked_sub(1),
            Side::Right => Some(lane + 1),
        }
        .filter(|target| *target < self.lanes.len())
        .ok_or(Error::NoAdjacentLane)?;

        let vehicle = self.lanes[lane].remove_vehicle(id)?;
        self.lanes[target].add_vehicle(vehicle);
        debug!("vehicle {id} changed from lane {lane} to lane {target} at {pos:.1} m");
        Ok(())
    }

    /// Finds a vehicle on any lane, returning the lane index with it.
    pub fn find_vehicle(&self, id: VehicleId) -> Option<(usize, &Vehicle)> {
        self.lanes
            .iter()
            .enumerate()
            .find_map(|(index, lane)| lane.vehicle(id).map(|v| (index, v)))
    }

    /// Forces the acceleration of a vehicle for the next step.
    pub fn take_over(&mut self, id: VehicleId, acc: f64) -> Result<()> {
        let (index, _) = self.find_vehicle(id).ok_or(Error::VehicleNotFound(id))?;
        self.lanes[index].take_over(id, acc)
    }

    /// Enables or disables trajectory recording on every lane.
    pub fn set_recording(&mut self, recording: bool) {
        for lane in &mut self.lanes {
            lane.set_recording(recording);
        }
    }

    /// The number of vehicle IDs issued on this road.
    pub fn issued_ids(&self) -> u64 {
        self.ids.issued()
    }

    /// The number of vehicles currently on the road, obstacles included.
    pub fn vehicle_count(&self) -> usize {
        self.lanes.iter().map(Lane::len).sum()
    }

    /// The number of vehicles that left the road.
    pub fn exited_count(&self) -> usize {
        self.lanes.iter().map(Lane::exited_count).sum()
    }

    /// The number of completed steps.
    pub fn step_count(&self) -> u64 {
        self.lanes.first().map_or(0, Lane::step_count)
    }

    /// Runs the arrival processes, then computes every vehicle's
    /// acceleration. No vehicle moves until [Self::update_state].
    pub fn step(&mut self) {
        for lane in &mut self.lanes {
            lane.summon();
        }
        let road = &*self;
        for lane in &road.lanes {
            lane.apply_accelerations(Some(road));
        }
    }

    /// Moves every vehicle on every lane.
    pub fn update_state(&mut self) {
        for lane in &mut self.lanes {
            lane.update_state();
        }
    }

    /// Runs `steps` steps.
    pub fn run(&mut self, steps: u64, observer: &mut impl SimObserver) {
        for _ in 0..steps {
            self.tick(observer);
        }
        observer.on_finish(self.step_count());
    }

    /// Runs `warm_up` steps without recording, then `steps` recorded steps.
    pub fn run_with_warm_up(
        &mut self,
        warm_up: u64,
        steps: u64,
        observer: &mut impl SimObserver,
    ) {
        self.set_recording(false);
        for _ in 0..warm_up {
            self.step();
            self.update_state();
        }
        info!(
            "warm-up finished after {} steps with {} vehicles",
            warm_up,
            self.vehicle_count()
        );
        self.set_recording(true);
        self.run(steps, observer);
    }

    fn tick(&mut self, observer: &mut impl SimObserver) {
        self.step();
        self.update_state();
        for lane in &self.lanes {
            for vehicle in lane.exited_last() {
                observer.on_exit(lane, vehicle);
            }
            observer.on_step(lane);
        }
    }
}
