use crate::vision::Point;

/// Tracks how still a face is held across consecutive frames.
///
/// Movement beyond the threshold costs a fixed penalty instead of a full reset,
/// so a single jittery detection does not throw away accumulated progress.
#[derive(Debug, Clone)]
pub struct StabilityTracker {
    threshold_px: f32,
    required_frames: u32,
    penalty: u32,
    previous_center: Option<Point>,
    stable_count: u32,
}

impl StabilityTracker {
    pub fn new(threshold_px: f32, required_frames: u32, penalty: u32) -> Self {
        Self {
            threshold_px,
            required_frames,
            penalty,
            previous_center: None,
            stable_count: 0,
        }
    }

    /// Feed the next face center. The first call after a reset seeds the
    /// tracker and always reports true; later calls report whether the
    /// required number of stable frames has been reached.
    pub fn update(&mut self, center: Point) -> bool {
        let Some(previous) = self.previous_center.replace(center) else {
            self.stable_count = 1;
            return true;
        };

        if previous.distance(&center) < self.threshold_px {
            self.stable_count += 1;
        } else {
            self.stable_count = self.stable_count.saturating_sub(self.penalty);
            log::trace!(
                "Face moved {:.1}px, stability dropped to {}",
                previous.distance(&center),
                self.stable_count
            );
        }

        self.is_stable()
    }

    pub fn is_stable(&self) -> bool {
        self.stable_count >= self.required_frames
    }

    pub fn stable_count(&self) -> u32 {
        self.stable_count
    }

    pub fn required_frames(&self) -> u32 {
        self.required_frames
    }

    pub fn reset(&mut self) {
        self.previous_center = None;
        self.stable_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StabilityTracker {
        StabilityTracker::new(50.0, 10, 2)
    }

    #[test]
    fn test_first_update_seeds_and_reports_true() {
        let mut t = tracker();
        assert!(t.update(Point::new(100.0, 100.0)));
        assert_eq!(t.stable_count(), 1);
        assert!(!t.is_stable());
    }

    #[test]
    fn test_reaches_threshold_after_required_frames() {
        let mut t = tracker();
        let mut last = 0;
        for i in 0..10 {
            let reached = t.update(Point::new(100.0 + (i % 3) as f32, 100.0));
            assert!(t.stable_count() >= last);
            last = t.stable_count();
            if i < 9 {
                assert!(!t.is_stable(), "stable too early at observation {}", i + 1);
            } else {
                assert!(reached);
            }
        }
        assert_eq!(t.stable_count(), 10);
    }

    #[test]
    fn test_single_outlier_costs_penalty_and_recovers() {
        let mut t = tracker();
        for _ in 0..6 {
            t.update(Point::new(100.0, 100.0));
        }
        assert_eq!(t.stable_count(), 6);

        t.update(Point::new(300.0, 100.0));
        assert_eq!(t.stable_count(), 4);

        // Coming back is another jump from the outlier position
        t.update(Point::new(100.0, 100.0));
        assert_eq!(t.stable_count(), 2);

        for _ in 0..8 {
            t.update(Point::new(100.0, 100.0));
        }
        assert_eq!(t.stable_count(), 10);
        assert!(t.is_stable());
    }

    #[test]
    fn test_counter_floors_at_zero() {
        let mut t = tracker();
        t.update(Point::new(0.0, 0.0));
        t.update(Point::new(200.0, 0.0));
        t.update(Point::new(400.0, 0.0));
        assert_eq!(t.stable_count(), 0);
    }

    #[test]
    fn test_movement_exactly_at_threshold_is_unstable() {
        let mut t = tracker();
        t.update(Point::new(0.0, 0.0));
        t.update(Point::new(30.0, 40.0));
        assert_eq!(t.stable_count(), 0);
    }

    #[test]
    fn test_reset_reseeds() {
        let mut t = tracker();
        for _ in 0..5 {
            t.update(Point::new(10.0, 10.0));
        }
        t.reset();
        assert_eq!(t.stable_count(), 0);
        assert!(t.update(Point::new(500.0, 500.0)));
        assert_eq!(t.stable_count(), 1);
    }
}
