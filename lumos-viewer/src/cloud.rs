//! Rolling buffer of projected scan points.

use std::collections::VecDeque;
use std::f32::consts::PI;

/// The most recent samples of a scan, projected to display coordinates.
///
/// Holds one revolution (`360 / resolution` samples); older samples are
/// evicted first. Distances arrive in millimetres and are scaled by
/// `pixels_per_meter / 1000`.
#[derive(Debug, Clone)]
pub struct PointCloud {
    points: VecDeque<(f32, f32)>,
    capacity: usize,
    resolution_deg: f32,
    scale: f32,
}

impl PointCloud {
    pub fn new(resolution_deg: f32, pixels_per_meter: f32) -> Self {
        let capacity = if resolution_deg > 0.0 {
            (360.0 / resolution_deg).round().max(1.0) as usize
        } else {
            1
        };
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
            resolution_deg,
            scale: pixels_per_meter / 1000.0,
        }
    }

    /// Project one `(angle, distance)` sample and append it.
    ///
    /// Non-finite samples are dropped; returns whether the sample was kept.
    pub fn append_sample(&mut self, angle_deg: f32, distance: f32) -> bool {
        if !angle_deg.is_finite() || !distance.is_finite() {
            return false;
        }
        let radian = angle_deg * PI / 180.0;
        let d = distance * self.scale;
        self.points.push_back((d * radian.cos(), d * radian.sin()));
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
        true
    }

    /// Snapshot of the buffered points, oldest first.
    pub fn current_points(&self) -> Vec<(f32, f32)> {
        self.points.iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Replace the buffer with one synthetic revolution, alternating
    /// between a ring and a ridged ring on each call.
    pub fn fill_demo(&mut self, ridged: bool) {
        self.points.clear();
        let mut angle = 270.0_f32;
        for i in 0..self.capacity {
            angle = (angle + self.resolution_deg) % 360.0;
            let distance = if ridged {
                2500.0 + (i % 50) as f32
            } else {
                3000.0
            };
            self.append_sample(angle, distance);
        }
    }
}

impl Default for PointCloud {
    fn default() -> Self {
        Self::new(0.3, 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32)) -> bool {
        (a.0 - b.0).abs() < 1e-3 && (a.1 - b.1).abs() < 1e-3
    }

    #[test]
    fn default_holds_one_revolution() {
        assert_eq!(PointCloud::default().capacity(), 1200);
        assert_eq!(PointCloud::new(1.0, 100.0).capacity(), 360);
    }

    #[test]
    fn projects_and_scales() {
        let mut cloud = PointCloud::default();
        cloud.append_sample(0.0, 1000.0);
        cloud.append_sample(90.0, 2000.0);
        let pts = cloud.current_points();
        assert!(close(pts[0], (100.0, 0.0)));
        assert!(close(pts[1], (0.0, 200.0)));
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let mut cloud = PointCloud::new(90.0, 1000.0);
        assert_eq!(cloud.capacity(), 4);
        for d in 1..=6 {
            cloud.append_sample(0.0, d as f32);
        }
        assert_eq!(cloud.len(), 4);
        let xs: Vec<f32> = cloud.current_points().iter().map(|p| p.0).collect();
        assert_eq!(xs, vec![3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn rejects_non_finite() {
        let mut cloud = PointCloud::default();
        assert!(!cloud.append_sample(f32::NAN, 10.0));
        assert!(!cloud.append_sample(10.0, f32::INFINITY));
        assert!(cloud.is_empty());
    }

    #[test]
    fn demo_fills_exactly_once() {
        let mut cloud = PointCloud::default();
        cloud.fill_demo(false);
        assert_eq!(cloud.len(), 1200);
        cloud.fill_demo(true);
        assert_eq!(cloud.len(), 1200);
        cloud.clear();
        assert!(cloud.is_empty());
    }
}
