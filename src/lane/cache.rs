use log::trace;

use crate::vehicle::{achievable_speed, safe_speed, SafeSpeedFormula};
use crate::Lane;

/// Safe and achievable speeds of every vehicle on a lane, in lane order.
///
/// Only valid for the step it was computed in.
#[derive(Clone, Debug)]
pub(crate) struct SafeSpeedCache {
    pub computed_at: u64,
    pub v_safe: Vec<f64>,
    pub v_a: Vec<f64>,
}

impl SafeSpeedCache {
    pub fn compute(lane: &Lane, formula: SafeSpeedFormula) -> Self {
        let dt = lane.dt();
        let count = lane.len();
        let mut v_safe = Vec::with_capacity(count);
        let mut v_a = Vec::with_capacity(count);

        for vehicle in lane.vehicles() {
            match lane.leader_of(vehicle) {
                Some(leader) => {
                    let safe = safe_speed(
                        formula,
                        dt,
                        leader.speed(),
                        vehicle.gap(),
                        vehicle.model().expected_dec(),
                        leader.model().expected_dec(),
                    );
                    v_safe.push(safe);
                    v_a.push(achievable_speed(
                        dt,
                        vehicle.gap(),
                        safe,
                        vehicle.speed(),
                        vehicle.model().expected_acc(),
                    ));
                }
                None => {
                    // The head of an open lane is unconstrained
                    v_safe.push(f64::INFINITY);
                    v_a.push(vehicle.speed());
                }
            }
        }

        trace!(
            "lane {}: safe speeds for {} vehicles at step {}",
            lane.index(),
            count,
            lane.step_count()
        );
        Self {
            computed_at: lane.step_count(),
            v_safe,
            v_a,
        }
    }

    /// The safe speed of the vehicle at `index` and the achievable speed of
    /// the vehicle ahead of it.
    pub fn lookup(&self, index: usize) -> (f64, f64) {
        let leader = (index + 1) % self.v_a.len();
        (self.v_safe[index], self.v_a[leader])
    }
}
