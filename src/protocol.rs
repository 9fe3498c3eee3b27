use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::TIME_EPSILON;

/// A stimulus segment: `level` from `start` for `duration`, optionally
/// repeated every `period` for `multiplier` times (`0` repeats forever).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PacingEvent {
    pub level: f64,
    pub start: f64,
    pub duration: f64,
    #[serde(default)]
    pub period: f64,
    #[serde(default)]
    pub multiplier: u32,
}

impl PacingEvent {
    fn validate(&self) -> Result<(), SimError> {
        if !self.level.is_finite() {
            return Err(SimError::InvalidArgument(
                "pacing level must be finite".into(),
            ));
        }
        if !(self.start >= 0.0) || !self.start.is_finite() {
            return Err(SimError::InvalidArgument(
                "pacing events must start at a non-negative time".into(),
            ));
        }
        if !(self.duration > 0.0) || !self.duration.is_finite() {
            return Err(SimError::InvalidArgument(
                "pacing event duration must be positive".into(),
            ));
        }
        if !(self.period >= 0.0) || !self.period.is_finite() {
            return Err(SimError::InvalidArgument(
                "pacing event period must be non-negative".into(),
            ));
        }
        if self.period == 0.0 && self.multiplier != 0 {
            return Err(SimError::InvalidArgument(
                "a multiplier requires a non-zero period".into(),
            ));
        }
        if self.period > 0.0 && self.duration > self.period + TIME_EPSILON {
            return Err(SimError::InvalidArgument(
                "pacing event duration cannot exceed its period".into(),
            ));
        }
        Ok(())
    }

    fn is_periodic(&self) -> bool {
        self.period > 0.0
    }

    pub fn is_active(&self, time: f64) -> bool {
        if time + TIME_EPSILON < self.start {
            return false;
        }
        let mut local = time - self.start;
        if self.is_periodic() {
            let cycle = (local / self.period).floor().max(0.0);
            if self.multiplier > 0 && cycle >= f64::from(self.multiplier) {
                return false;
            }
            local -= cycle * self.period;
        }
        local + TIME_EPSILON < self.duration
    }

    fn overlaps(&self, other: &PacingEvent) -> bool {
        let end = self.start + self.duration;
        let other_end = other.start + other.duration;
        self.start + TIME_EPSILON < other_end && other.start + TIME_EPSILON < end
    }
}

/// Pacing protocol: the stimulus level over time. Events are kept sorted by
/// start time and one-off events may not overlap.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PacingEvent>", into = "Vec<PacingEvent>")]
pub struct Protocol {
    events: Vec<PacingEvent>,
}

impl Protocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(
        &mut self,
        level: f64,
        start: f64,
        duration: f64,
        period: f64,
        multiplier: u32,
    ) -> Result<(), SimError> {
        self.add(PacingEvent {
            level,
            start,
            duration,
            period,
            multiplier,
        })
    }

    pub fn add(&mut self, event: PacingEvent) -> Result<(), SimError> {
        event.validate()?;
        if !event.is_periodic() {
            let clash = self
                .events
                .iter()
                .filter(|other| !other.is_periodic())
                .any(|other| other.overlaps(&event));
            if clash {
                return Err(SimError::InvalidArgument(format!(
                    "pacing event at t = {} overlaps an existing event",
                    event.start
                )));
            }
        }
        let pos = self
            .events
            .partition_point(|other| other.start <= event.start);
        self.events.insert(pos, event);
        Ok(())
    }

    pub fn events(&self) -> &[PacingEvent] {
        &self.events
    }

    /// Level of the first active event at `time`, or zero.
    pub fn level_at(&self, time: f64) -> f64 {
        self.events
            .iter()
            .find(|event| event.is_active(time))
            .map_or(0.0, |event| event.level)
    }
}

impl TryFrom<Vec<PacingEvent>> for Protocol {
    type Error = SimError;

    fn try_from(events: Vec<PacingEvent>) -> Result<Self, Self::Error> {
        let mut protocol = Protocol::new();
        for event in events {
            protocol.add(event)?;
        }
        Ok(protocol)
    }
}

impl From<Protocol> for Vec<PacingEvent> {
    fn from(protocol: Protocol) -> Self {
        protocol.events
    }
}
