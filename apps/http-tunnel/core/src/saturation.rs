use crate::config::WaterMarks;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaturationStateChange {
    NoChange,
    Saturated,
    Desaturated,
}

/// Tracks bytes queued for sending and reports watermark crossings.
///
/// The queue becomes saturated once it grows past the high mark and stays
/// saturated until it drains down to the low mark, so writability does not
/// flap while the queue hovers between the two.
#[derive(Debug)]
pub struct SaturationManager {
    water_marks: WaterMarks,
    queued: i64,
    saturated: bool,
}

impl SaturationManager {
    pub fn new(water_marks: WaterMarks) -> Self {
        Self {
            water_marks,
            queued: 0,
            saturated: false,
        }
    }

    /// Marks only affect future evaluations; the current state is kept.
    pub fn update_thresholds(&mut self, water_marks: WaterMarks) {
        self.water_marks = water_marks;
    }

    pub fn queue_size_changed(&mut self, delta: i64) -> SaturationStateChange {
        self.queued += delta;
        if !self.saturated && self.queued > self.water_marks.high() as i64 {
            self.saturated = true;
            SaturationStateChange::Saturated
        } else if self.saturated && self.queued <= self.water_marks.low() as i64 {
            self.saturated = false;
            SaturationStateChange::Desaturated
        } else {
            SaturationStateChange::NoChange
        }
    }

    pub fn queued(&self) -> i64 {
        self.queued
    }

    pub fn is_saturated(&self) -> bool {
        self.saturated
    }
}

impl Default for SaturationManager {
    fn default() -> Self {
        Self::new(WaterMarks::default())
    }
}
