//! Timestamp to frame index conversion
//!
//! Report times are doubles accumulated by a simulator, so a timestamp that
//! should sit exactly on frame `k` can land a hair below it. Quotients within
//! `f32::EPSILON` (scaled by the index) of an integer snap to that integer;
//! everything else rounds down.

use std::ops::Range;

use crate::error::{ReportError, Result};

/// The integer `quotient` is meant to be, if it is within tolerance of one.
fn nearest_integer(quotient: f64) -> Option<f64> {
    let rounded = quotient.round();
    let tolerance = f64::from(f32::EPSILON) * rounded.abs().max(1.0);
    ((quotient - rounded).abs() <= tolerance).then_some(rounded)
}

fn snap(quotient: f64) -> f64 {
    nearest_integer(quotient).unwrap_or_else(|| quotient.floor())
}

/// Time axis of a report: `[start, end]` sampled every `step`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeAxis {
    start: f64,
    end: f64,
    step: f64,
    frame_count: usize,
}

impl TimeAxis {
    /// Axis with the frame count derived from the times.
    pub fn new(start: f64, end: f64, step: f64) -> Self {
        Self {
            start,
            end,
            step,
            frame_count: Self::frame_count_for(start, end, step),
        }
    }

    /// `floor((end - start) / step) + 1`, or 0 for an empty or invalid axis.
    pub fn frame_count_for(start: f64, end: f64, step: f64) -> usize {
        if !(end > start) || !(step > 0.0) {
            return 0;
        }
        snap((end - start) / step) as usize + 1
    }

    /// Cap the frame count at what is physically stored.
    pub fn with_stored_frames(mut self, stored: usize) -> Self {
        self.frame_count = self.frame_count.min(stored);
        self
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn step(&self) -> f64 {
        self.step
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Time of frame `index`.
    pub fn timestamp(&self, index: usize) -> f64 {
        self.start + index as f64 * self.step
    }

    /// Frame containing `t`, clamped to the axis.
    pub fn frame_index(&self, t: f64) -> usize {
        if self.frame_count == 0 || !(t > self.start) {
            return 0;
        }
        let index = snap((t - self.start) / self.step) as usize;
        index.min(self.frame_count - 1)
    }

    /// True if `t` lies inside `[start, end]`.
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t <= self.end
    }

    /// Frame index for a single-frame load; out-of-range times are errors.
    pub fn checked_frame_index(&self, t: f64) -> Result<usize> {
        if !self.contains(t) || self.frame_count == 0 {
            return Err(ReportError::TimestampOutOfRange {
                timestamp: t,
                start: self.start,
                end: self.end,
            });
        }
        Ok(self.frame_index(t))
    }

    /// Frames overlapping the window `[start, end)`.
    ///
    /// A reversed or empty window is an error; a window that misses the
    /// report entirely yields an empty range.
    pub fn frames(&self, start: f64, end: f64) -> Result<Range<usize>> {
        if !(end > start) {
            return Err(ReportError::InvalidInterval { start, end });
        }
        if end <= self.start || start > self.end || self.frame_count == 0 {
            return Ok(0..0);
        }

        let first = self.frame_index(start.max(self.start));
        let last = if end >= self.end {
            self.frame_count
        } else {
            self.frames_before(end)
        };
        Ok(first..last.max(first))
    }

    /// Number of frames whose timestamp is strictly below `t`.
    fn frames_before(&self, t: f64) -> usize {
        let quotient = (t - self.start) / self.step;
        let count = match nearest_integer(quotient) {
            Some(exact) => exact as usize,
            None => quotient.floor() as usize + 1,
        };
        count.min(self.frame_count)
    }

    /// Frame indices sampled every `step` over `[start, end)`.
    ///
    /// Each sample sits at the midpoint of its native frame, so the walk is
    /// immune to accumulated rounding. With `step == time step` the result is
    /// exactly [`TimeAxis::frames`].
    pub fn samples(&self, start: f64, end: f64, step: f64) -> Result<Vec<usize>> {
        if !(step >= self.step * (1.0 - f64::from(f32::EPSILON))) || !is_multiple(step, self.step) {
            return Err(ReportError::InvalidStep { step, time_step: self.step });
        }
        let range = self.frames(start, end)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }

        let mut indices = Vec::new();
        let mut sample = self.start + (range.start as f64 + 0.5) * self.step;
        let mut index = range.start;
        while index < range.end {
            indices.push(index);
            sample += step;
            let next = self.frame_index(sample);
            // frame_index clamps at the last frame
            if next <= index || sample > self.end + self.step {
                break;
            }
            index = next;
        }
        Ok(indices)
    }
}

/// True if `a` is a positive integer multiple of `b`, within float tolerance.
pub fn is_multiple(a: f64, b: f64) -> bool {
    if !(a > 0.0) || !(b > 0.0) {
        return false;
    }
    matches!(nearest_integer(a / b), Some(multiple) if multiple >= 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn axis() -> TimeAxis {
        TimeAxis::new(0.0, 10.0, 0.1)
    }

    #[test]
    fn test_frame_count() {
        assert_eq!(axis().frame_count(), 101);
        assert_eq!(TimeAxis::new(5.0, 5.0, 0.1).frame_count(), 0);
        assert_eq!(TimeAxis::new(0.0, 1.0, 0.0).frame_count(), 0);
        assert_eq!(axis().with_stored_frames(100).frame_count(), 100);
    }

    #[test]
    fn test_frame_index_snaps() {
        let axis = axis();
        assert_eq!(axis.frame_index(4.5), 45);
        assert_eq!(axis.frame_index(0.3), 3);
        assert_eq!(axis.frame_index(0.349), 3);
        assert_eq!(axis.frame_index(-1.0), 0);
        assert_eq!(axis.frame_index(10.0), 100);
        assert_eq!(axis.frame_index(50.0), 100);
    }

    #[test]
    fn test_checked_frame_index() {
        let axis = axis();
        assert_eq!(axis.checked_frame_index(4.5).unwrap(), 45);
        assert!(matches!(
            axis.checked_frame_index(10.1),
            Err(ReportError::TimestampOutOfRange { .. })
        ));
        assert!(axis.checked_frame_index(f64::NAN).is_err());
    }

    #[test]
    fn test_frames_window() {
        let axis = axis();
        assert_eq!(axis.frames(0.0, 10.0).unwrap(), 0..101);
        assert_eq!(axis.frames(1.0, 2.0).unwrap(), 10..20);
        assert_eq!(axis.frames(1.05, 1.25).unwrap(), 10..13);
        assert_eq!(axis.frames(-5.0, 0.25).unwrap(), 0..3);
    }

    #[test]
    fn test_frames_outside_is_empty() {
        let axis = axis();
        assert!(axis.frames(20.0, 30.0).unwrap().is_empty());
        assert!(axis.frames(-3.0, -1.0).unwrap().is_empty());
    }

    #[test]
    fn test_frames_reversed_fails() {
        assert!(matches!(axis().frames(2.0, 1.0), Err(ReportError::InvalidInterval { .. })));
        assert!(matches!(axis().frames(2.0, 2.0), Err(ReportError::InvalidInterval { .. })));
    }

    #[test]
    fn test_is_multiple() {
        assert!(is_multiple(0.3, 0.1));
        assert!(is_multiple(0.1, 0.1));
        assert!(is_multiple(2.5, 0.025));
        assert!(!is_multiple(0.15, 0.1));
        assert!(!is_multiple(0.05, 0.1));
        assert!(!is_multiple(0.0, 0.1));
    }

    #[test]
    fn test_samples() {
        let axis = axis();
        assert_eq!(axis.samples(0.0, 1.0, 0.3).unwrap(), vec![0, 3, 6, 9]);
        assert_eq!(axis.samples(1.0, 2.0, 0.1).unwrap(), (10..20).collect::<Vec<_>>());
        assert_eq!(axis.samples(0.0, 10.0, 5.0).unwrap(), vec![0, 50, 100]);
        assert!(matches!(axis.samples(0.0, 1.0, 0.15), Err(ReportError::InvalidStep { .. })));
        assert!(matches!(axis.samples(0.0, 1.0, 0.05), Err(ReportError::InvalidStep { .. })));
    }
}
