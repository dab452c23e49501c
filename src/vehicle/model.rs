use super::idm::IdmModel;
use super::kk::KkModel;
use crate::{Error, Lane, ParamMap, Result, Road, Vehicle};

/// Expected deceleration reported by stationary obstacles, in m/s^2.
const OBSTACLE_DEC: f64 = 1.0;

/// The car-following models a vehicle can be driven by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ModelKind {
    /// Kerner-Klenov three-phase traffic theory model.
    Kk,
    /// Intelligent driver model.
    Idm,
    /// Never moves; used for obstacles.
    Stationary,
}

impl ModelKind {
    /// Checks that a model built from `params` can run at time step `dt`.
    pub fn validate(self, params: &ParamMap, dt: f64) -> Result<()> {
        if !(dt > 0.0) {
            return Err(Error::InvalidParameter(format!("time step {dt} must be positive")));
        }
        match self {
            ModelKind::Kk => {
                let tau = params.get("tau", super::kk::DEFAULT_TAU);
                if (tau - dt).abs() > 1e-9 {
                    return Err(Error::TimeStepMismatch { tau, dt });
                }
                Ok(())
            }
            ModelKind::Idm | ModelKind::Stationary => Ok(()),
        }
    }
}

/// A vehicle's car-following model and its per-vehicle state.
#[derive(Clone, Debug)]
pub enum CarFollowingModel {
    Kk(KkModel),
    Idm(IdmModel),
    Stationary,
}

/// Everything a model may look at while computing an acceleration.
pub(crate) struct FollowContext<'a> {
    /// The vehicle's index in lane order.
    pub index: usize,
    /// The lane the vehicle is on.
    pub lane: &'a Lane,
    /// The road the lane belongs to, if any.
    pub road: Option<&'a Road>,
    /// The vehicle being simulated.
    pub vehicle: &'a Vehicle,
    /// The vehicle ahead.
    pub leader: &'a Vehicle,
}

impl CarFollowingModel {
    /// Builds a model of the given kind. `seed` seeds any random stream the
    /// model owns, unless the parameters carry their own `"seed"`.
    pub fn new(kind: ModelKind, params: &ParamMap, seed: u64) -> Self {
        match kind {
            ModelKind::Kk => {
                let seed = params.get_opt("seed").map_or(seed, |s| s as u64);
                CarFollowingModel::Kk(KkModel::new(params, seed))
            }
            ModelKind::Idm => CarFollowingModel::Idm(IdmModel::new(params)),
            ModelKind::Stationary => CarFollowingModel::Stationary,
        }
    }

    /// The kind of this model.
    pub fn kind(&self) -> ModelKind {
        match self {
            CarFollowingModel::Kk(_) => ModelKind::Kk,
            CarFollowingModel::Idm(_) => ModelKind::Idm,
            CarFollowingModel::Stationary => ModelKind::Stationary,
        }
    }

    /// The maximum acceleration the driver expects to use, in m/s^2.
    pub fn expected_acc(&self) -> f64 {
        match self {
            CarFollowingModel::Kk(m) => m.params().a,
            CarFollowingModel::Idm(m) => m.params().omega,
            CarFollowingModel::Stationary => 0.0,
        }
    }

    /// The deceleration the driver expects to brake with, in m/s^2.
    pub fn expected_dec(&self) -> f64 {
        match self {
            CarFollowingModel::Kk(m) => m.params().b,
            CarFollowingModel::Idm(m) => m.params().d,
            CarFollowingModel::Stationary => OBSTACLE_DEC,
        }
    }

    /// Computes the acceleration of a vehicle that has a leader.
    pub(crate) fn acceleration(&self, ctx: &FollowContext) -> f64 {
        match self {
            CarFollowingModel::Kk(m) => m.acceleration(ctx),
            CarFollowingModel::Idm(m) => m.acceleration(ctx),
            CarFollowingModel::Stationary => 0.0,
        }
    }
}
