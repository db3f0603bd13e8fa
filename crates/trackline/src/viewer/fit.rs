//! Viewport auto-fit.
//!
//! Routine updates request a debounced fit; new devices and visibility toggles
//! fit immediately and cancel any pending request.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::trail::Position;

/// Zoom level used when a single device is in view.
pub const SINGLE_DEVICE_ZOOM: u8 = 16;

/// Fraction of the span added on each side of a multi-device bounds.
pub const BOUNDS_PADDING: f64 = 0.1;

/// Where the map should look.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ViewportTarget {
    /// Center on one point.
    Single {
        /// Center of the view.
        center: Position,
        /// Zoom level.
        zoom: u8,
    },
    /// Show a padded bounding box.
    Bounds {
        /// South-west corner.
        south_west: Position,
        /// North-east corner.
        north_east: Position,
    },
}

impl ViewportTarget {
    /// Compute the target for a set of positions; `None` when empty.
    #[must_use]
    pub fn covering(positions: &[Position]) -> Option<Self> {
        match positions {
            [] => None,
            [only] => Some(Self::Single {
                center: *only,
                zoom: SINGLE_DEVICE_ZOOM,
            }),
            [first, rest @ ..] => {
                let (mut south, mut north) = (first.latitude, first.latitude);
                let (mut west, mut east) = (first.longitude, first.longitude);
                for p in rest {
                    south = south.min(p.latitude);
                    north = north.max(p.latitude);
                    west = west.min(p.longitude);
                    east = east.max(p.longitude);
                }
                let pad_lat = (north - south) * BOUNDS_PADDING;
                let pad_lon = (east - west) * BOUNDS_PADDING;
                Some(Self::Bounds {
                    south_west: Position {
                        latitude: south - pad_lat,
                        longitude: west - pad_lon,
                    },
                    north_east: Position {
                        latitude: north + pad_lat,
                        longitude: east + pad_lon,
                    },
                })
            }
        }
    }
}

/// Debounce timer for routine fits.
#[derive(Debug, Clone)]
pub struct FitScheduler {
    debounce: Duration,
    deadline: Option<DateTime<Utc>>,
}

impl FitScheduler {
    /// Create a scheduler with the given debounce.
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            deadline: None,
        }
    }

    /// Request a fit; restarts the debounce window.
    pub fn request(&mut self, now: DateTime<Utc>) {
        let debounce = chrono::Duration::from_std(self.debounce).unwrap_or(chrono::Duration::MAX);
        self.deadline = Some(now.checked_add_signed(debounce).unwrap_or(DateTime::<Utc>::MAX_UTC));
    }

    /// Drop any pending request.
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// When the pending fit is due.
    #[must_use]
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.deadline
    }

    /// Whether a pending fit is due; consumes it if so.
    pub fn poll(&mut self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn pos(latitude: f64, longitude: f64) -> Position {
        Position {
            latitude,
            longitude,
        }
    }

    #[test]
    fn test_no_target_for_empty() {
        assert!(ViewportTarget::covering(&[]).is_none());
    }

    #[test]
    fn test_single_device_zoom() {
        let target = ViewportTarget::covering(&[pos(10.0, 106.0)]).unwrap();
        assert_eq!(
            target,
            ViewportTarget::Single {
                center: pos(10.0, 106.0),
                zoom: 16
            }
        );
    }

    #[test]
    fn test_bounds_are_padded() {
        let target = ViewportTarget::covering(&[pos(10.0, 100.0), pos(20.0, 110.0)]).unwrap();
        match target {
            ViewportTarget::Bounds {
                south_west,
                north_east,
            } => {
                assert!((south_west.latitude - 9.0).abs() < 1e-9);
                assert!((south_west.longitude - 99.0).abs() < 1e-9);
                assert!((north_east.latitude - 21.0).abs() < 1e-9);
                assert!((north_east.longitude - 111.0).abs() < 1e-9);
            }
            ViewportTarget::Single { .. } => panic!("expected bounds"),
        }
    }

    #[test]
    fn test_debounce_restarts() {
        let t0 = Utc::now();
        let mut fit = FitScheduler::new(Duration::from_secs(2));

        fit.request(t0);
        fit.request(t0 + ChronoDuration::seconds(1));

        assert!(!fit.poll(t0 + ChronoDuration::seconds(2)));
        assert!(fit.poll(t0 + ChronoDuration::seconds(3)));
        assert!(!fit.poll(t0 + ChronoDuration::seconds(4)));
    }

    #[test]
    fn test_cancel() {
        let t0 = Utc::now();
        let mut fit = FitScheduler::new(Duration::from_secs(2));
        fit.request(t0);
        fit.cancel();

        assert!(fit.deadline().is_none());
        assert!(!fit.poll(t0 + ChronoDuration::seconds(10)));
    }
}
