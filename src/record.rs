//! Trajectory recording and simulation observers.

use crate::{Lane, Vehicle, VehicleId};

/// Added to the speed in time headways so that stopped vehicles get a large
/// finite value.
const THW_EPSILON: f64 = f32::EPSILON as f64;

/// The recorded state of a vehicle at the end of a step.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrajectoryPoint {
    /// The number of completed steps.
    pub step: u64,
    /// The simulation time in s.
    pub time: f64,
    pub pos: f64,
    pub speed: f64,
    pub acc: f64,
    pub gap: f64,
    pub dhw: f64,
}

/// The recorded states of one vehicle, in step order.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Trajectory {
    points: Vec<TrajectoryPoint>,
}

impl Trajectory {
    pub(crate) fn push(&mut self, point: TrajectoryPoint) {
        self.points.push(point);
    }

    pub fn points(&self) -> &[TrajectoryPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// The most recent state.
    pub fn last(&self) -> Option<&TrajectoryPoint> {
        self.points.last()
    }
}

/// A quantity that can be extracted from a [TrajectoryRow].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Metric {
    Position,
    Speed,
    Acceleration,
    Gap,
    Headway,
    /// Distance headway divided by speed. Stopped vehicles get a large but
    /// finite value.
    TimeHeadway,
    /// Leader speed minus own speed.
    SpeedDifference,
}

impl Metric {
    /// A human readable column label with unit.
    pub fn name(self) -> &'static str {
        match self {
            Metric::Position => "Position [m]",
            Metric::Speed => "Speed [m/s]",
            Metric::Acceleration => "Acceleration [m/s^2]",
            Metric::Gap => "Gap [m]",
            Metric::Headway => "Distance headway [m]",
            Metric::TimeHeadway => "Time headway [s]",
            Metric::SpeedDifference => "Speed difference [m/s]",
        }
    }
}

/// One vehicle at one step, flattened for output.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TrajectoryRow {
    pub step: u64,
    pub time: f64,
    pub lane: usize,
    pub id: VehicleId,
    pub pos: f64,
    pub speed: f64,
    pub acc: f64,
    pub gap: f64,
    pub dhw: f64,
    pub thw: f64,
    pub dv: f64,
}

impl TrajectoryRow {
    /// Captures the current state of `vehicle`, which must be on `lane`.
    pub fn new(lane: &Lane, vehicle: &Vehicle) -> Self {
        let dv = lane
            .leader_of(vehicle)
            .map_or(f64::NAN, |leader| leader.speed() - vehicle.speed());
        Self {
            step: lane.step_count(),
            time: lane.time(),
            lane: lane.index(),
            id: vehicle.id(),
            pos: vehicle.pos(),
            speed: vehicle.speed(),
            acc: vehicle.acc(),
            gap: vehicle.gap(),
            dhw: vehicle.dhw(),
            thw: vehicle.dhw() / (vehicle.speed() + THW_EPSILON),
            dv,
        }
    }

    pub fn get(&self, metric: Metric) -> f64 {
        match metric {
            Metric::Position => self.pos,
            Metric::Speed => self.speed,
            Metric::Acceleration => self.acc,
            Metric::Gap => self.gap,
            Metric::Headway => self.dhw,
            Metric::TimeHeadway => self.thw,
            Metric::SpeedDifference => self.dv,
        }
    }
}

/// Receives simulation events. All methods default to doing nothing.
pub trait SimObserver {
    /// Called after every completed step, once per lane.
    fn on_step(&mut self, _lane: &Lane) {}

    /// Called for every vehicle with recorded data that left `lane`.
    fn on_exit(&mut self, _lane: &Lane, _vehicle: &Vehicle) {}

    /// Called once when a run ends.
    fn on_finish(&mut self, _step: u64) {}
}

/// An observer that ignores every event.
pub struct NoopObserver;

impl SimObserver for NoopObserver {}

/// Collects one [TrajectoryRow] per vehicle and step.
#[derive(Clone, Debug, Default)]
pub struct TrajectoryLog {
    rows: Vec<TrajectoryRow>,
    /// Whether stationary obstacles are logged too.
    pub include_obstacles: bool,
}

impl TrajectoryLog {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn rows(&self) -> &[TrajectoryRow] {
        &self.rows
    }

    /// The values of one metric across all rows.
    pub fn column(&self, metric: Metric) -> Vec<f64> {
        self.rows.iter().map(|row| row.get(metric)).collect()
    }

    /// The rows of one vehicle, in step order.
    pub fn vehicle(&self, id: VehicleId) -> impl Iterator<Item = &TrajectoryRow> + '_ {
        self.rows.iter().filter(move |row| row.id == id)
    }
}

impl SimObserver for TrajectoryLog {
    fn on_step(&mut self, lane: &Lane) {
        let include_obstacles = self.include_obstacles;
        self.rows.extend(
            lane.vehicles()
                .filter(|v| include_obstacles || !v.is_obstacle())
                .map(|v| TrajectoryRow::new(lane, v)),
        );
    }
}
