//! Longitudinal zones of a lane that modify the driving rules.

use itertools::Itertools;
use smallvec::SmallVec;

use crate::util::Interval;

/// The kind of a lane section.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SectionType {
    /// An ordinary stretch of road.
    Base,
    /// A merging zone; vehicles synchronise with the lane to their left.
    OnRamp,
    /// Changing to the left lane is not allowed.
    NoLeft,
    /// Changing to the right lane is not allowed.
    NoRight,
    /// The lane is closed from here on.
    Block,
}

/// The set of section types active at one position.
pub type SectionTypes = SmallVec<[SectionType; 4]>;

#[derive(Clone, Copy, Debug)]
struct Section {
    span: Interval<f64>,
    kind: SectionType,
}

/// The sections and speed limit zones of a lane.
#[derive(Clone, Debug, Default)]
pub(crate) struct Sections {
    sections: Vec<Section>,
    speed_limits: Vec<(Interval<f64>, f64)>,
}

impl Sections {
    /// Installs a section.
    pub fn add(&mut self, kind: SectionType, span: Interval<f64>) {
        self.sections.push(Section { span, kind });
    }

    /// All section types covering `pos`, in installation order.
    pub fn types_at(&self, pos: f64) -> SectionTypes {
        self.sections
            .iter()
            .filter(|s| s.span.contains(pos))
            .map(|s| s.kind)
            .unique()
            .collect()
    }

    /// Whether a section of the given kind covers `pos`.
    pub fn has(&self, kind: SectionType, pos: f64) -> bool {
        self.sections
            .iter()
            .any(|s| s.kind == kind && s.span.contains(pos))
    }

    /// The spans of every section of the given kind.
    pub fn spans(&self, kind: SectionType) -> impl Iterator<Item = Interval<f64>> + '_ {
        self.sections
            .iter()
            .filter(move |s| s.kind == kind)
            .map(|s| s.span)
    }

    /// Installs a speed limit zone. Later zones take precedence.
    pub fn add_speed_limit(&mut self, span: Interval<f64>, limit: f64) {
        self.speed_limits.push((span, limit));
    }

    /// The speed limit of the most recently installed zone covering `pos`.
    pub fn speed_limit(&self, pos: f64) -> Option<f64> {
        self.speed_limits
            .iter()
            .rev()
            .find(|(span, _)| span.contains(pos))
            .map(|(_, limit)| *limit)
    }
}
