use std::cell::Cell;

use log::warn;

pub use self::dynamics::UpdateMethod;
pub use self::idm::{IdmModel, IdmParams};
pub use self::kk::{
    achievable_speed, safe_speed, sync_gap, DrivingStatus, KkModel, KkParams, SafeSpeedFormula,
};
pub(crate) use self::model::FollowContext;
pub use self::model::{CarFollowingModel, ModelKind};
use crate::record::{Trajectory, TrajectoryPoint};
use crate::{Lane, ParamMap, Result, Road, VehicleId, VehicleKey};

mod dynamics;
mod idm;
mod kk;
mod model;

/// The category of a vehicle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VehicleType {
    Passenger,
    Truck,
    /// A stationary obstacle closing the lane, see [Lane::set_block].
    Obstacle,
}

/// A class of vehicles that a lane can load or spawn.
#[derive(Clone, Debug)]
pub struct VehicleClass {
    /// Number of vehicles placed by [Lane::load], and the relative arrival
    /// weight of this class on open lanes.
    pub count: usize,
    /// The vehicle length in m.
    pub length: f64,
    /// The vehicle category.
    pub vehicle_type: VehicleType,
    /// The initial speed in m/s.
    pub initial_speed: f64,
    /// Whether the initial speed is jittered by up to ±0.5 m/s.
    pub random_speed: bool,
    /// The car-following model driving vehicles of this class.
    pub model: ModelKind,
    /// Coefficients for the car-following model.
    pub params: ParamMap,
}

impl VehicleClass {
    /// Creates a class of stationary-start passenger cars.
    pub fn new(count: usize, length: f64, model: ModelKind) -> Self {
        Self {
            count,
            length,
            vehicle_type: VehicleType::Passenger,
            initial_speed: 0.0,
            random_speed: false,
            model,
            params: ParamMap::new(),
        }
    }

    /// Sets the vehicle category.
    pub fn with_type(mut self, vehicle_type: VehicleType) -> Self {
        self.vehicle_type = vehicle_type;
        self
    }

    /// Sets the initial speed, optionally jittered.
    pub fn with_speed(mut self, initial_speed: f64, random_speed: bool) -> Self {
        self.initial_speed = initial_speed;
        self.random_speed = random_speed;
        self
    }

    /// Sets the model coefficients.
    pub fn with_params(mut self, params: ParamMap) -> Self {
        self.params = params;
        self
    }
}

/// A simulated vehicle.
#[derive(Clone, Debug)]
pub struct Vehicle {
    /// The vehicle's ID
    id: VehicleId,
    /// The vehicle's category.
    vehicle_type: VehicleType,
    /// The vehicle's length in m.
    length: f64,
    /// The longitudinal position of the front of the vehicle, in m.
    pos: f64,
    /// The velocity in m/s.
    speed: f64,
    /// The acceleration applied in the last update, in m/s^2.
    acc: f64,
    /// The car-following model.
    model: CarFollowingModel,
    /// The vehicle ahead on the same lane.
    pub(crate) leader: Option<VehicleKey>,
    /// The vehicle behind on the same lane.
    pub(crate) follower: Option<VehicleKey>,
    /// Distance between this vehicle's front and the leader's front, in m.
    dhw: f64,
    /// Clear distance to the leader's rear, in m.
    gap: f64,
    /// The acceleration computed in the current step, not yet applied.
    pending_acc: Cell<f64>,
    /// An acceleration that overrides the model for the next step.
    forced_acc: Option<f64>,
    /// The recorded states.
    trajectory: Trajectory,
}

impl Vehicle {
    /// Creates a new vehicle of the given class.
    pub(crate) fn new(
        id: VehicleId,
        class: &VehicleClass,
        pos: f64,
        speed: f64,
        seed: u64,
        dt: f64,
    ) -> Result<Self> {
        class.model.validate(&class.params, dt)?;
        let model = CarFollowingModel::new(class.model, &class.params, seed);
        Ok(Self::with_model(
            id,
            class.vehicle_type,
            class.length,
            pos,
            speed,
            model,
        ))
    }

    /// Creates a stationary obstacle with no length.
    pub(crate) fn obstacle(id: VehicleId, pos: f64) -> Self {
        Self::with_model(
            id,
            VehicleType::Obstacle,
            0.0,
            pos,
            0.0,
            CarFollowingModel::Stationary,
        )
    }

    fn with_model(
        id: VehicleId,
        vehicle_type: VehicleType,
        length: f64,
        pos: f64,
        speed: f64,
        model: CarFollowingModel,
    ) -> Self {
        Self {
            id,
            vehicle_type,
            length,
            pos,
            speed,
            acc: 0.0,
            model,
            leader: None,
            follower: None,
            dhw: f64::INFINITY,
            gap: f64::INFINITY,
            pending_acc: Cell::new(0.0),
            forced_acc: None,
            trajectory: Trajectory::default(),
        }
    }

    /// Gets the vehicle's ID.
    pub fn id(&self) -> VehicleId {
        self.id
    }

    /// The vehicle's category.
    pub fn vehicle_type(&self) -> VehicleType {
        self.vehicle_type
    }

    /// Whether the vehicle is a stationary obstacle.
    pub fn is_obstacle(&self) -> bool {
        self.vehicle_type == VehicleType::Obstacle
    }

    /// The vehicle's length in m.
    pub fn length(&self) -> f64 {
        self.length
    }

    /// The longitudinal position of the front of the vehicle in m.
    pub fn pos(&self) -> f64 {
        self.pos
    }

    /// The longitudinal position of the rear of the vehicle in m.
    pub fn pos_rear(&self) -> f64 {
        self.pos - self.length
    }

    /// The vehicle's velocity in m/s.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// The acceleration applied in the last update, in m/s^2.
    pub fn acc(&self) -> f64 {
        self.acc
    }

    /// The distance headway to the leader in m, or infinity without one.
    pub fn dhw(&self) -> f64 {
        self.dhw
    }

    /// The clear gap to the leader in m, or infinity without one.
    pub fn gap(&self) -> f64 {
        self.gap
    }

    /// Whether the vehicle has a leader.
    pub fn has_leader(&self) -> bool {
        self.leader.is_some()
    }

    /// The car-following model.
    pub fn model(&self) -> &CarFollowingModel {
        &self.model
    }

    /// The states recorded for this vehicle.
    pub fn trajectory(&self) -> &Trajectory {
        &self.trajectory
    }

    /// Whether any state has been recorded for this vehicle.
    pub fn has_data(&self) -> bool {
        !self.trajectory.is_empty()
    }

    /// Forces the acceleration used in the next step, bypassing the model.
    pub(crate) fn force_acc(&mut self, acc: f64) {
        self.forced_acc = Some(acc);
    }

    pub(crate) fn set_headway(&mut self, dhw: f64, gap: f64) {
        self.dhw = dhw;
        self.gap = gap;
    }

    pub(crate) fn set_pos(&mut self, pos: f64) {
        self.pos = pos;
    }

    pub(crate) fn record(&mut self, point: TrajectoryPoint) {
        self.trajectory.push(point);
    }

    /// Computes this step's acceleration from the current, not yet updated,
    /// state of the lane. `index` is the vehicle's place in lane order.
    pub(crate) fn step(&self, index: usize, lane: &Lane, road: Option<&Road>) {
        let acc = match (self.forced_acc, self.leader) {
            (Some(acc), _) => acc,
            (None, None) => 0.0,
            (None, Some(leader)) => self.model.acceleration(&FollowContext {
                index,
                lane,
                road,
                vehicle: self,
                leader: lane.slot(leader),
            }),
        };
        self.pending_acc.set(acc);
    }

    /// Shortens this update's movement to `advance` metres from `start`
    /// (position and speed before the update), slowing down to match.
    pub(crate) fn hold_back(
        &mut self,
        start: (f64, f64),
        advance: f64,
        dt: f64,
        method: UpdateMethod,
    ) {
        let (pos, speed) = start;
        self.pos = pos + advance;
        self.speed = dynamics::speed_for_advance(speed, advance, dt, method);
        self.acc = (self.speed - speed) / dt;
    }

    /// Applies the acceleration computed by [Self::step].
    /// Returns `true` if the speed had to be clamped to zero.
    pub(crate) fn apply_kinematics(&mut self, dt: f64, method: UpdateMethod) -> bool {
        let acc = self.pending_acc.replace(0.0);
        self.forced_acc = None;
        let state = dynamics::integrate(self.pos, self.speed, acc, dt, method);
        if state.clamped {
            warn!(
                "vehicle {} reached a negative speed ({:.3} m/s), clamped to zero",
                self.id,
                self.speed + acc * dt
            );
        }
        self.pos = state.pos;
        self.speed = state.speed;
        self.acc = acc;
        state.clamped
    }
}
