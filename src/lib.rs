//! A lane-level microscopic traffic simulator.
//!
//! Vehicles travel along circular or open [Lane]s and are driven by a
//! car-following model, most notably the three-phase (Kerner-Klenov) model.
//! Each simulation step is split into two phases: every vehicle first computes
//! its acceleration from a consistent snapshot ([Lane::step]), then the lane
//! integrates all of them at once ([Lane::update_state]). A [Road] groups
//! parallel lanes and answers the adjacency queries used for ramp merging.

use slotmap::{new_key_type, SlotMap};
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

pub use error::{Error, Result};
pub use lane::{Headway, Lane, LaneAttributes};
pub use params::ParamMap;
pub use record::{
    Metric, NoopObserver, SimObserver, Trajectory, TrajectoryLog, TrajectoryPoint, TrajectoryRow,
};
pub use road::{Road, Side};
pub use section::{SectionType, SectionTypes};
pub use util::Interval;
pub use vehicle::{
    achievable_speed, safe_speed, sync_gap, CarFollowingModel, DrivingStatus, IdmModel, IdmParams,
    KkModel, KkParams, ModelKind, SafeSpeedFormula, UpdateMethod, Vehicle, VehicleClass,
    VehicleType,
};

mod error;
mod lane;
mod params;
mod record;
mod road;
mod section;
mod util;
mod vehicle;

new_key_type! {
    /// Slot of a [Vehicle] within the arena of the lane it is travelling on.
    pub struct VehicleKey;
}

type VehicleSet = SlotMap<VehicleKey, Vehicle>;

/// Unique ID of a [Vehicle].
///
/// IDs are handed out in creation order and are never reused, not even after
/// the vehicle has left the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VehicleId(pub u64);

impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out [VehicleId]s.
///
/// Lanes of one road hold shared handles to a single sequence. A clone starts
/// an independent sequence at the current count.
#[derive(Debug, Default)]
pub struct VehicleIds(Rc<Cell<u64>>);

impl Clone for VehicleIds {
    fn clone(&self) -> Self {
        Self(Rc::new(Cell::new(self.0.get())))
    }
}

impl VehicleIds {
    /// Creates a fresh sequence starting at zero.
    pub fn new() -> Self {
        Default::default()
    }

    /// Another handle to the same sequence.
    pub(crate) fn share(&self) -> Self {
        Self(Rc::clone(&self.0))
    }

    /// Claims the next ID.
    pub(crate) fn next(&self) -> VehicleId {
        let id = self.0.get();
        self.0.set(id + 1);
        VehicleId(id)
    }

    /// The number of IDs issued so far.
    pub fn issued(&self) -> u64 {
        self.0.get()
    }
}
