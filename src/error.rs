//! Setup and query errors.
//!
//! Numeric degeneracies inside a running simulation (negative gaps, speeds
//! clamped to zero) are not errors; they are logged as warnings and the
//! simulation carries on.

use thiserror::Error;

use crate::VehicleId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error(
        "{count} vehicles of length {length} m overlap on a {lane_length} m lane; \
         at most {max} vehicles fit"
    )]
    Overcrowded {
        count: usize,
        length: f64,
        lane_length: f64,
        max: usize,
    },

    #[error("model reaction time tau = {tau} s must equal the lane time step dt = {dt} s")]
    TimeStepMismatch { tau: f64, dt: f64 },

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("lane index {0} is out of range")]
    LaneIndex(usize),

    #[error("vehicle {0} not found")]
    VehicleNotFound(VehicleId),

    #[error("there is no lane on that side")]
    NoAdjacentLane,

    #[error("lane changes in that direction are not allowed at {pos} m")]
    LaneChangeRestricted { pos: f64 },
}

pub type Result<T> = std::result::Result<T, Error>;
