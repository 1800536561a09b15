//! Laser scan payload exchanged between the ROS node and the device bridge.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::directory::TopicDirectory;
use crate::errors::Result;
use crate::topic::{Topic, TopicQos};

pub static LASER_SCAN_TOPIC: &str = "sensors/laser_scan";

/// Points a single scan can carry.
pub const LASER_SCAN_CAPACITY: usize = 4096;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct LaserPoint {
    /// Radians in `[0, 2π)`.
    pub angle: f32,
    /// Metres.
    pub distance: f32,
    pub valid: u8,
    pub quality: u8,
    _reserved: [u8; 2],
}

impl LaserPoint {
    pub fn new(angle: f32, distance: f32, valid: bool) -> LaserPoint {
        LaserPoint {
            angle,
            distance,
            valid: valid as u8,
            quality: 0,
            _reserved: [0; 2],
        }
    }

    pub fn with_quality(mut self, quality: u8) -> LaserPoint {
        self.quality = quality;
        self
    }

    pub fn is_valid(&self) -> bool {
        self.valid != 0
    }
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct LaserScan {
    count: u32,
    points: [LaserPoint; LASER_SCAN_CAPACITY],
}

impl LaserScan {
    pub fn new() -> LaserScan {
        LaserScan::zeroed()
    }

    /// Appends a point; `false` once the scan is full.
    pub fn push(&mut self, point: LaserPoint) -> bool {
        let len = self.len();
        if len >= LASER_SCAN_CAPACITY {
            return false;
        }
        self.points[len] = point;
        self.count += 1;
        true
    }

    pub fn points(&self) -> &[LaserPoint] {
        &self.points[..self.len()]
    }

    pub fn len(&self) -> usize {
        (self.count as usize).min(LASER_SCAN_CAPACITY)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    /// The well-known scan topic; only the latest scan is kept.
    pub fn topic(directory: &TopicDirectory) -> Result<Topic<LaserScan>> {
        directory.get_or_create_topic::<LaserScan>(LASER_SCAN_TOPIC, TopicQos::Singleton)
    }
}

impl Default for LaserScan {
    fn default() -> Self {
        LaserScan::new()
    }
}

impl PartialEq for LaserScan {
    fn eq(&self, other: &Self) -> bool {
        self.points() == other.points()
    }
}

impl fmt::Debug for LaserScan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaserScan")
            .field("count", &self.count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem;

    #[test]
    fn layout_is_packed() {
        assert_eq!(mem::size_of::<LaserPoint>(), 12);
        assert_eq!(
            mem::size_of::<LaserScan>(),
            4 + LASER_SCAN_CAPACITY * mem::size_of::<LaserPoint>()
        );
    }

    #[test]
    fn push_until_full() {
        let mut scan = Box::new(LaserScan::new());
        assert!(scan.is_empty());
        for i in 0..LASER_SCAN_CAPACITY {
            assert!(scan.push(LaserPoint::new(i as f32 * 0.001, 1.5, true)));
        }
        assert!(!scan.push(LaserPoint::new(0.0, 0.0, false)));
        assert_eq!(scan.len(), LASER_SCAN_CAPACITY);
        assert!(scan.points()[10].is_valid());
        scan.clear();
        assert!(scan.points().is_empty());
    }
}
