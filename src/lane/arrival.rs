use rand::distributions::WeightedIndex;
use rand::rngs::SmallRng;
use rand_distr::{Distribution, Exp};

use crate::{Error, Result, VehicleClass};

/// The distribution of time headways between arriving vehicles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Headway {
    /// Vehicles arrive at a constant interval.
    #[default]
    Uniform,
    /// Vehicles arrive as a Poisson process.
    Exponential,
}

/// Schedules vehicle arrivals at the upstream end of an open lane.
#[derive(Clone, Debug)]
pub(crate) struct ArrivalProcess {
    /// The arrival rate in veh/s.
    rate: f64,
    headway: Headway,
    exp: Exp<f64>,
    /// Picks the class of each arriving vehicle, weighted by class count.
    classes: WeightedIndex<f64>,
    /// The simulation time of the next arrival in s.
    next_time: f64,
}

impl ArrivalProcess {
    /// Creates an arrival process for a flow of `flow_rate` veh/h.
    pub fn new(flow_rate: f64, headway: Headway, classes: &[VehicleClass]) -> Result<Self> {
        if !(flow_rate > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "flow rate {flow_rate} veh/h must be positive"
            )));
        }
        let rate = flow_rate / 3600.0;
        let exp = Exp::new(rate).map_err(|e| Error::InvalidParameter(e.to_string()))?;
        let classes = WeightedIndex::new(classes.iter().map(|c| c.count as f64))
            .map_err(|e| Error::InvalidParameter(format!("vehicle class weights: {e}")))?;
        Ok(Self {
            rate,
            headway,
            exp,
            classes,
            next_time: 0.0,
        })
    }

    /// Whether a vehicle is due to arrive at `time`.
    pub fn due(&self, time: f64) -> bool {
        self.next_time <= time
    }

    /// The time of the next scheduled arrival in s.
    #[cfg(test)]
    pub fn next_time(&self) -> f64 {
        self.next_time
    }

    /// Draws the class index of the arriving vehicle.
    pub fn pick_class(&self, rng: &mut SmallRng) -> usize {
        self.classes.sample(rng)
    }

    /// Schedules the arrival after the current one.
    pub fn schedule_next(&mut self, rng: &mut SmallRng) {
        let headway = match self.headway {
            Headway::Uniform => 1.0 / self.rate,
            Headway::Exponential => self.exp.sample(rng),
        };
        self.next_time += headway;
    }
}
