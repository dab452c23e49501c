//! The Kerner-Klenov model of three-phase traffic theory.
//!
//! Reference: *Physics of automated driving in framework of three-phase
//! traffic theory* (2018). Speeds are computed on a discrete time grid whose
//! step equals the driver's reaction time `tau`.

use std::cell::{Cell, RefCell};

use log::warn;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::model::FollowContext;
use crate::util::step_fn;
use crate::{ParamMap, SectionType, Vehicle};

pub(crate) const DEFAULT_TAU: f64 = 1.0;

/// Upper bound on the speed of the virtual leader used in merging zones, in m/s.
const RAMP_LEADER_MAX_SPEED: f64 = 30.0;

/// How the safe speed is derived from the stopping distances.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SafeSpeedFormula {
    /// Braking on the simulation's discrete time grid.
    Discrete,
    /// Continuous-time braking with a reaction delay of one step.
    Continuous,
}

/// The driving state remembered from the previous step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DrivingStatus {
    Decelerating = -1,
    #[default]
    Steady = 0,
    Accelerating = 1,
}

/// The coefficients of the KK model.
#[derive(Clone, Debug, PartialEq)]
pub struct KkParams {
    /// Minimum stopping spacing in m.
    pub d: f64,
    /// Reaction time in s; must equal the lane time step.
    pub tau: f64,
    /// Synchronisation range factor.
    pub k: f64,
    /// Expected deceleration in m/s^2.
    pub b: f64,
    /// Maximum acceleration in m/s^2.
    pub a: f64,
    /// Amplitude of the standstill noise.
    pub a_0: f64,
    /// Amplitude of the acceleration noise.
    pub a_a: f64,
    /// Amplitude of the deceleration noise.
    pub a_b: f64,
    pub p_a: f64,
    pub p_b: f64,
    pub p_0: f64,
    pub p_1: f64,
    pub v_01: f64,
    pub v_21: f64,
    pub formula: SafeSpeedFormula,
    /// Speed offset of the virtual leader in merging zones, in m/s.
    pub delta_vr_2: f64,
}

impl KkParams {
    /// Reads the coefficients from a parameter map, using defaults for
    /// missing keys.
    pub fn from_params(params: &ParamMap) -> Self {
        let a = params.get("a", 0.5);
        Self {
            d: params.get("d", 7.5),
            tau: params.get("tau", DEFAULT_TAU),
            k: params.get("k", 3.0),
            b: params.get("b", 1.0),
            a,
            a_0: 0.2 * a,
            a_a: a,
            a_b: a,
            p_a: params.get("p_a", 0.17),
            p_b: params.get("p_b", 0.1),
            p_0: params.get("p_0", 0.005),
            p_1: params.get("p_1", 0.3),
            v_01: params.get("v_01", 10.0),
            v_21: params.get("v_21", 15.0),
            formula: if params.flag("v_safe_dispersed", true) {
                SafeSpeedFormula::Discrete
            } else {
                SafeSpeedFormula::Continuous
            },
            delta_vr_2: params.get("delta_vr_2", 5.0),
        }
    }
}

impl Default for KkParams {
    fn default() -> Self {
        Self::from_params(&ParamMap::new())
    }
}

/// A vehicle's KK model: its coefficients, last driving status and
/// private random stream.
#[derive(Clone, Debug)]
pub struct KkModel {
    params: KkParams,
    status: Cell<DrivingStatus>,
    rng: RefCell<SmallRng>,
}

impl KkModel {
    pub fn new(params: &ParamMap, seed: u64) -> Self {
        Self {
            params: KkParams::from_params(params),
            status: Cell::new(DrivingStatus::Steady),
            rng: RefCell::new(SmallRng::seed_from_u64(seed)),
        }
    }

    pub fn params(&self) -> &KkParams {
        &self.params
    }

    /// The driving status chosen in the last step.
    pub fn status(&self) -> DrivingStatus {
        self.status.get()
    }

    fn draw(&self) -> f64 {
        self.rng.borrow_mut().gen::<f64>()
    }

    pub(crate) fn acceleration(&self, ctx: &FollowContext) -> f64 {
        let p = &self.params;
        let lane = ctx.lane;
        let dt = lane.dt();

        let v_free = lane.speed_limit(ctx.vehicle.pos());
        let v = ctx.vehicle.speed();
        let gap = ctx.vehicle.gap();
        let (v_safe, leader_v_a) = lane.safe_speeds(ctx.index, p.formula);

        let (a_n, b_n) = self.random_acc(v);

        let v_c = match self.ramp_leader(ctx) {
            Some((ramp_v, ramp_gap)) => self.sync_speed(v, ramp_v, ramp_gap, a_n, b_n),
            None => self.sync_speed(v, ctx.leader.speed(), gap, a_n, b_n),
        };
        let v_s = f64::min(v_safe, gap / dt + leader_v_a);
        let v_hat = v_free.min(v_s).min(v_c);

        let (xi, status) = self.perturbation(v_hat, v, dt);
        self.status.set(status);

        let speed = v_free
            .min(v_hat + xi)
            .min(v + p.a * dt)
            .min(v_s)
            .max(0.0);
        (speed - v) / dt
    }

    /// Draws the stochastic acceleration `a_n` and deceleration `b_n`.
    fn random_acc(&self, v: f64) -> (f64, f64) {
        let p = &self.params;
        let r = self.draw();
        let p_0 = match self.status.get() {
            DrivingStatus::Accelerating => 1.0,
            _ => 0.575 + 0.125 * f64::min(1.0, v / p.v_01),
        };
        let p_1 = match self.status.get() {
            DrivingStatus::Decelerating => 0.48 + 0.32 * step_fn(v - p.v_21),
            _ => p.p_1,
        };
        (p.a * step_fn(p_0 - r), p.a * step_fn(p_1 - r))
    }

    /// The speed that synchronises with a leader driving at `leader_speed`.
    fn sync_speed(&self, v: f64, leader_speed: f64, gap: f64, a_n: f64, b_n: f64) -> f64 {
        let p = &self.params;
        let g = sync_gap(p.k, p.tau, p.a, v, leader_speed);
        if gap <= g {
            v + f64::max(-b_n * p.tau, f64::min(a_n * p.tau, leader_speed - v))
        } else {
            v + a_n * p.tau
        }
    }

    /// Inside a merging zone, the speed and gap of the virtual leader taken
    /// from the lane to the left.
    fn ramp_leader(&self, ctx: &FollowContext) -> Option<(f64, f64)> {
        let pos = ctx.vehicle.pos();
        if !ctx.lane.has_section(SectionType::OnRamp, pos) {
            return None;
        }
        let (left, _) = ctx.road?.adjacent_lanes(ctx.lane.index(), pos);
        let left = left?;
        let (_, leader) = left.relative_vehicles(pos);
        let base = leader.map_or_else(|| left.speed_limit(pos), Vehicle::speed);
        let speed = (base + self.params.delta_vr_2).min(RAMP_LEADER_MAX_SPEED).max(0.0);
        let gap = leader.map_or(f64::INFINITY, |l| left.distance(pos, l.pos()) - l.length());
        Some((speed, gap))
    }

    /// Applies the random speed perturbation to `v_hat` and picks the new
    /// driving status.
    fn perturbation(&self, v_hat: f64, v: f64, dt: f64) -> (f64, DrivingStatus) {
        let p = &self.params;
        let r = self.draw();
        if v_hat < v {
            (-p.a_b * dt * step_fn(p.p_b - r), DrivingStatus::Decelerating)
        } else if v_hat > v {
            (p.a_a * dt * step_fn(p.p_a - r), DrivingStatus::Accelerating)
        } else {
            let noise = if r < p.p_0 {
                -1.0
            } else if r < 2.0 * p.p_0 && v > 0.0 {
                1.0
            } else {
                0.0
            };
            (p.a_0 * dt * noise, DrivingStatus::Steady)
        }
    }
}

/// The synchronisation gap `G`: below it the driver adapts to the leader's
/// speed instead of accelerating freely.
pub fn sync_gap(k: f64, tau: f64, a: f64, v: f64, leader_speed: f64) -> f64 {
    f64::max(0.0, k * tau * v + v * (v - leader_speed) / a)
}

/// The highest speed from which a vehicle braking at `dec` still stops
/// behind its leader, given that the leader brakes at `leader_dec` from
/// `leader_speed`.
///
/// A negative gap is unsafe and yields zero.
pub fn safe_speed(
    formula: SafeSpeedFormula,
    dt: f64,
    leader_speed: f64,
    gap: f64,
    dec: f64,
    leader_dec: f64,
) -> f64 {
    if gap < 0.0 {
        warn!("negative gap {gap:.3} m in safe speed calculation, treated as unsafe");
        return 0.0;
    }
    match formula {
        SafeSpeedFormula::Discrete => {
            // Truncate toward zero, never round
            let steps_l = leader_speed / (leader_dec * dt);
            let alpha_l = steps_l.trunc();
            let beta_l = steps_l - alpha_l;
            let stop_l = leader_dec * dt * dt * (alpha_l * beta_l + 0.5 * alpha_l * (alpha_l - 1.0));

            let room = stop_l + gap;
            let alpha = ((2.0 * room / (dec * dt * dt) + 0.25).sqrt() - 0.5).trunc();
            let beta = room / ((alpha + 1.0) * dec * dt * dt) - alpha / 2.0;
            dec * dt * (alpha + beta)
        }
        SafeSpeedFormula::Continuous => {
            let stop_l = leader_speed * leader_speed / (2.0 * leader_dec);
            let a = 1.0 / (2.0 * dec);
            (-dt + (dt * dt + 4.0 * a * (stop_l + gap)).sqrt()) / (2.0 * a)
        }
    }
}

/// The speed a vehicle is sure to reach in the next step, assuming it
/// decelerates by at most its expected acceleration.
pub fn achievable_speed(dt: f64, gap: f64, v_safe: f64, v: f64, acc: f64) -> f64 {
    f64::max(0.0, v_safe.min(v).min(gap / dt) - acc * dt)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{ModelKind, Road, Side, VehicleClass};
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn discrete_safe_speed_at_integer_boundary() {
        // sqrt(20.25) - 0.5 is exactly 4; the stop 4 + 3 + 2 + 1 fills the gap
        let v = safe_speed(SafeSpeedFormula::Discrete, 1.0, 0.0, 10.0, 1.0, 3.0);
        assert_eq!(v, 4.0);
    }

    #[test]
    fn discrete_safe_speed_with_moving_leader() {
        // Leader stops over 2 + 1 = 3 m, leaving 13 m of room
        let v = safe_speed(SafeSpeedFormula::Discrete, 1.0, 3.0, 10.0, 1.0, 1.0);
        assert_approx_eq!(v, 4.6);

        let v = safe_speed(SafeSpeedFormula::Discrete, 1.0, 0.0, 0.01, 1.0, 1.0);
        assert_approx_eq!(v, 0.01);
    }

    #[test]
    fn continuous_safe_speed() {
        let v = safe_speed(SafeSpeedFormula::Continuous, 1.0, 0.0, 10.0, 1.0, 3.0);
        assert_approx_eq!(v, 21f64.sqrt() - 1.0);
    }

    #[test]
    fn negative_gap_is_unsafe() {
        for formula in [SafeSpeedFormula::Discrete, SafeSpeedFormula::Continuous] {
            assert_eq!(safe_speed(formula, 1.0, 10.0, -0.5, 1.0, 1.0), 0.0);
        }
    }

    #[test]
    fn synchronisation_gap() {
        assert_approx_eq!(sync_gap(3.0, 1.0, 0.5, 10.0, 10.0), 30.0);
        assert_approx_eq!(sync_gap(3.0, 1.0, 0.5, 10.0, 5.0), 130.0);
        // Fast leaders cannot make the gap negative
        assert_eq!(sync_gap(3.0, 1.0, 0.5, 1.0, 20.0), 0.0);
    }

    #[test]
    fn achievable_speed_is_bounded_by_gap() {
        assert_approx_eq!(achievable_speed(1.0, 3.0, 10.0, 8.0, 0.5), 2.5);
        assert_approx_eq!(achievable_speed(1.0, 50.0, 10.0, 8.0, 0.5), 7.5);
        assert_eq!(achievable_speed(1.0, 0.2, 10.0, 8.0, 0.5), 0.0);
    }

    #[test]
    fn default_params() {
        let p = KkParams::default();
        assert_eq!(p.tau, 1.0);
        assert_eq!(p.k, 3.0);
        assert_approx_eq!(p.a_0, 0.1);
        assert_eq!(p.formula, SafeSpeedFormula::Discrete);
        let p = KkParams::from_params(&ParamMap::new().with("v_safe_dispersed", 0.0));
        assert_eq!(p.formula, SafeSpeedFormula::Continuous);
    }

    #[test]
    fn perturbation_sets_status() {
        let model = KkModel::new(&ParamMap::new(), 9);
        let (xi, status) = model.perturbation(9.0, 10.0, 1.0);
        assert_eq!(status, DrivingStatus::Decelerating);
        assert!(xi == 0.0 || xi == -0.5);

        let (xi, status) = model.perturbation(11.0, 10.0, 1.0);
        assert_eq!(status, DrivingStatus::Accelerating);
        assert!(xi == 0.0 || xi == 0.5);

        let (xi, status) = model.perturbation(0.0, 0.0, 1.0);
        assert_eq!(status, DrivingStatus::Steady);
        // Standstill noise never pushes a stopped vehicle forward
        assert!(xi <= 0.0);
    }

    #[test]
    fn accelerating_drivers_keep_accelerating() {
        let model = KkModel::new(&ParamMap::new(), 4);
        model.status.set(DrivingStatus::Accelerating);
        for _ in 0..50 {
            let (a_n, _) = model.random_acc(12.0);
            assert_eq!(a_n, 0.5);
        }
    }

    /// Two lanes; the right one is a merging zone along its whole length.
    fn ramp_road() -> Road {
        let mut road = Road::new(1000.0, 3);
        road.add_lanes(2, false, 1.0).unwrap();
        road.lane_mut(1)
            .unwrap()
            .set_section_type(SectionType::OnRamp, 0.0, None);
        road
    }

    #[test]
    fn ramp_leader_comes_from_left_lane() {
        let mut road = ramp_road();
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        road.lane_mut(0).unwrap().insert(&car, 120.0, 2.0).unwrap();
        road.lane_mut(1).unwrap().insert(&car, 100.0, 20.0).unwrap();
        road.lane_mut(1).unwrap().insert(&car, 600.0, 20.0).unwrap();

        let lane = road.lane(1).unwrap();
        let (index, vehicle) = lane.vehicles().enumerate().next().unwrap();
        let leader = lane.leader_of(vehicle).unwrap();
        let ctx = FollowContext {
            index,
            lane,
            road: Some(&road),
            vehicle,
            leader,
        };
        let model = kk_of(vehicle);
        let (speed, gap) = model.ramp_leader(&ctx).unwrap();
        assert_approx_eq!(speed, 7.0);
        assert_approx_eq!(gap, 15.0);

        // Without a road there is nothing to merge into
        let ctx = FollowContext { road: None, ..ctx };
        assert!(model.ramp_leader(&ctx).is_none());
    }

    #[test]
    fn ramp_leader_defaults_to_speed_limit() {
        let mut road = ramp_road();
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        road.lane_mut(1).unwrap().insert(&car, 100.0, 20.0).unwrap();
        road.lane_mut(1).unwrap().insert(&car, 600.0, 20.0).unwrap();

        let lane = road.lane(1).unwrap();
        let vehicle = lane.vehicles().next().unwrap();
        let ctx = FollowContext {
            index: 0,
            lane,
            road: Some(&road),
            vehicle,
            leader: lane.leader_of(vehicle).unwrap(),
        };
        let model = kk_of(vehicle);
        let (speed, gap) = model.ramp_leader(&ctx).unwrap();
        // 30 m/s speed limit + 5 m/s, capped
        assert_eq!(speed, RAMP_LEADER_MAX_SPEED);
        assert_eq!(gap, f64::INFINITY);
    }

    #[test]
    fn no_left_zone_disables_merging() {
        let mut road = ramp_road();
        road.lane_mut(1)
            .unwrap()
            .set_section_type(SectionType::NoLeft, 0.0, Some(500.0));
        let car = VehicleClass::new(1, 5.0, ModelKind::Kk);
        road.lane_mut(0).unwrap().insert(&car, 120.0, 2.0).unwrap();
        road.lane_mut(1).unwrap().insert(&car, 100.0, 20.0).unwrap();
        road.lane_mut(1).unwrap().insert(&car, 600.0, 20.0).unwrap();
        assert!(road.change_lane(1, crate::VehicleId(1), Side::Left).is_err());

        let lane = road.lane(1).unwrap();
        let vehicle = lane.vehicles().next().unwrap();
        let ctx = FollowContext {
            index: 0,
            lane,
            road: Some(&road),
            vehicle,
            leader: lane.leader_of(vehicle).unwrap(),
        };
        let model = kk_of(vehicle);
        assert!(model.ramp_leader(&ctx).is_none());
    }

    fn kk_of(vehicle: &Vehicle) -> &KkModel {
        match vehicle.model() {
            crate::CarFollowingModel::Kk(model) => model,
            _ => panic!("not a KK vehicle"),
        }
    }
}
