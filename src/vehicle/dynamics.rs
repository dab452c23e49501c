/// How a lane advances positions from the old and new speeds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum UpdateMethod {
    /// `x' = x + (v + v') / 2 * dt`
    ///
    /// A braking vehicle covers more ground than `v' * dt` under this rule;
    /// the lane shortens any step that would end past the leader's rear.
    #[default]
    Trapezoid,
    /// `x' = x + v' * dt`
    Euler,
}

/// The kinematic state after one integration step.
pub(crate) struct Integrated {
    pub pos: f64,
    pub speed: f64,
    /// The raw speed was negative and has been set to zero.
    pub clamped: bool,
}

pub(crate) fn integrate(pos: f64, speed: f64, acc: f64, dt: f64, method: UpdateMethod) -> Integrated {
    let raw = speed + acc * dt;
    let new_speed = f64::max(raw, 0.0);
    let pos = match method {
        UpdateMethod::Trapezoid => pos + 0.5 * (speed + new_speed) * dt,
        UpdateMethod::Euler => pos + new_speed * dt,
    };
    Integrated {
        pos,
        speed: new_speed,
        clamped: raw < 0.0,
    }
}

/// The new speed that covers exactly `advance` metres from `speed` in one
/// step, floored at zero.
pub(crate) fn speed_for_advance(speed: f64, advance: f64, dt: f64, method: UpdateMethod) -> f64 {
    let new_speed = match method {
        UpdateMethod::Trapezoid => 2.0 * advance / dt - speed,
        UpdateMethod::Euler => advance / dt,
    };
    f64::max(new_speed, 0.0)
}
