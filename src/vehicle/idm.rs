use super::model::FollowContext;
use crate::ParamMap;

/// The maximum deceleration of IDM vehicles that are clear of their leader,
/// in m/s<sup>2</sup>.
const MAX_DECEL: f64 = -6.0; // m/s^2

/// Deceleration of a vehicle overlapping its leader, as a multiple of omega.
const EMERGENCY_FACTOR: f64 = -10.0;

/// The coefficients of the intelligent driver model.
#[derive(Clone, Debug, PartialEq)]
pub struct IdmParams {
    /// The jam distance in m.
    pub s0: f64,
    /// The speed-dependent jam distance in m.
    pub s1: f64,
    /// The desired speed in m/s.
    pub v0: f64,
    /// The desired time headway in s.
    pub time_headway: f64,
    /// The maximum acceleration in m/s<sup>2</sup>.
    pub omega: f64,
    /// The comfortable deceleration in m/s<sup>2</sup>.
    pub d: f64,
    /// The acceleration exponent.
    pub delta: f64,
}

impl IdmParams {
    /// Reads the coefficients from a parameter map, using defaults for
    /// missing keys.
    pub fn from_params(params: &ParamMap) -> Self {
        Self {
            s0: params.get("s0", 2.0),
            s1: params.get("s1", 0.0),
            v0: params.get("v0", 33.3),
            time_headway: params.get("T", 1.6),
            omega: params.get("omega", 0.73),
            d: params.get("d", 1.67),
            delta: params.get("delta", 4.0),
        }
    }
}

impl Default for IdmParams {
    fn default() -> Self {
        Self::from_params(&ParamMap::new())
    }
}

/// The intelligent driver model.
#[derive(Clone, Debug)]
pub struct IdmModel {
    params: IdmParams,
}

impl IdmModel {
    /// Creates a new acceleration model.
    pub fn new(params: &ParamMap) -> Self {
        Self {
            params: IdmParams::from_params(params),
        }
    }

    pub fn params(&self) -> &IdmParams {
        &self.params
    }

    pub(crate) fn acceleration(&self, ctx: &FollowContext) -> f64 {
        let gap = ctx.vehicle.gap();
        if gap <= 0.0 {
            return EMERGENCY_FACTOR * self.params.omega;
        }
        let v0 = f64::min(self.params.v0, ctx.lane.speed_limit(ctx.vehicle.pos()));
        let acc = self.idm(gap, ctx.vehicle.speed(), ctx.leader.speed(), v0);
        f64::max(acc, MAX_DECEL)
    }

    /// Computes an acceleration using the intelligent driver model.
    ///
    /// # Arguments
    /// * `net_dist` - The distance between this vehicle and the vehicle ahead in metres.
    /// * `my_vel` - The velocity of the simulated vehicle (m/s).
    /// * `their_vel` - The vehicle ahead's velocity (m/s).
    /// * `v0` - The desired velocity (m/s).
    fn idm(&self, net_dist: f64, my_vel: f64, their_vel: f64, v0: f64) -> f64 {
        let p = &self.params;
        if net_dist <= 0.0 {
            return EMERGENCY_FACTOR * p.omega;
        }

        let appr = my_vel - their_vel;
        let factor = 1. / (2. * (p.omega * p.d).sqrt());
        let ss = p.s0
            + p.s1 * (my_vel / v0).sqrt()
            + (my_vel * p.time_headway)
            + (my_vel * appr * factor);
        let ss = f64::max(ss, p.s0);
        let term = ss / net_dist;
        p.omega * (1. - (my_vel / v0).powf(p.delta) - (term * term))
    }
}
