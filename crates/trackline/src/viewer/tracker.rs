//! Per-device liveness state machine for the viewer.
//!
//! The tracker owns all device state. Inbound broadcasts go through
//! [`LivenessTracker::apply`] and the polling tick through
//! [`LivenessTracker::tick`]; both return the [`TrackerEvent`]s a render layer
//! needs to mirror the change. Nothing else mutates device state.
//!
//! Status is derived from the age of the last accepted point:
//!
//! | Status       | Age            |
//! |--------------|----------------|
//! | Realtime     | `< 60s`        |
//! | Paused       | `60s..180s`    |
//! | Disconnected | `180s..240s`   |
//! | Removed      | `>= 240s`      |

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::color::device_color;
use super::fit::{FitScheduler, ViewportTarget};
use super::snapshot::{DeviceSnapshot, ViewerSnapshot};
use super::trail::{Position, TrailBuffer, TrailPoint};
use crate::config::Config;
use crate::wire::RealtimeUpdate;

/// Liveness classification of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    /// Recent point.
    Realtime,
    /// No point for a while.
    Paused,
    /// Long silence; hidden from the device list.
    Disconnected,
    /// Terminal; the device is evicted.
    Removed,
}

impl LivenessStatus {
    /// Classify a device by the age of its last point.
    ///
    /// A negative age (point ahead of the local clock) is `Realtime`.
    #[must_use]
    pub fn classify(age: chrono::Duration, thresholds: &LivenessThresholds) -> Self {
        let Ok(age) = age.to_std() else {
            return Self::Realtime;
        };
        if age >= thresholds.removed_after {
            Self::Removed
        } else if age >= thresholds.disconnected_after {
            Self::Disconnected
        } else if age >= thresholds.paused_after {
            Self::Paused
        } else {
            Self::Realtime
        }
    }
}

impl fmt::Display for LivenessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Realtime => write!(f, "realtime"),
            Self::Paused => write!(f, "paused"),
            Self::Disconnected => write!(f, "disconnected"),
            Self::Removed => write!(f, "removed"),
        }
    }
}

/// Age boundaries between statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessThresholds {
    /// Realtime becomes Paused.
    pub paused_after: Duration,
    /// Paused becomes Disconnected.
    pub disconnected_after: Duration,
    /// Disconnected becomes Removed.
    pub removed_after: Duration,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            paused_after: Duration::from_secs(60),
            disconnected_after: Duration::from_secs(180),
            removed_after: Duration::from_secs(240),
        }
    }
}

/// Tunables for a [`LivenessTracker`].
#[derive(Debug, Clone)]
pub struct TrackerSettings {
    /// Status boundaries.
    pub thresholds: LivenessThresholds,
    /// Points kept per trail.
    pub trail_capacity: usize,
    /// Debounce for routine viewport fits.
    pub fit_debounce: Duration,
    /// Broadcasts further than this from the local clock are dropped.
    pub max_clock_skew: Duration,
}

impl TrackerSettings {
    /// Build settings from the `[viewer]` configuration section.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            thresholds: LivenessThresholds {
                paused_after: Duration::from_secs(config.viewer.paused_after_secs),
                disconnected_after: Duration::from_secs(config.viewer.disconnected_after_secs),
                removed_after: Duration::from_secs(config.viewer.removed_after_secs),
            },
            trail_capacity: config.viewer.trail_capacity,
            fit_debounce: config.fit_debounce(),
            max_clock_skew: config.max_clock_skew(),
        }
    }
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            thresholds: LivenessThresholds::default(),
            trail_capacity: 500,
            fit_debounce: Duration::from_secs(2),
            max_clock_skew: Duration::from_secs(15),
        }
    }
}

/// State kept for one device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    /// Device id.
    pub device_id: String,
    /// Owning user, as last broadcast.
    pub user_name: String,
    /// Marker colour.
    pub color: String,
    /// Current status.
    pub status: LivenessStatus,
    /// Set while the device is Disconnected; hides it from the sidebar.
    pub is_offline: bool,
    /// Whether the device is shown on the map.
    pub visible: bool,
    /// Timestamp of the last accepted point.
    pub last_timestamp: DateTime<Utc>,
    /// Position of the last accepted point.
    pub last_position: Position,
    /// Recent path.
    pub trail: TrailBuffer,
}

/// A change the render layer should mirror.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TrackerEvent {
    /// First point from a device.
    #[serde(rename_all = "camelCase")]
    DeviceAdded {
        /// Device id.
        device_id: String,
        /// Owning user.
        user_name: String,
        /// Marker colour.
        color: String,
        /// First position.
        position: Position,
    },
    /// A device moved.
    #[serde(rename_all = "camelCase")]
    PositionUpdated {
        /// Device id.
        device_id: String,
        /// New position.
        position: Position,
        /// Point timestamp.
        timestamp: DateTime<Utc>,
    },
    /// A device changed status.
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        /// Device id.
        device_id: String,
        /// Previous status.
        from: LivenessStatus,
        /// New status.
        to: LivenessStatus,
    },
    /// A device was shown or hidden.
    #[serde(rename_all = "camelCase")]
    VisibilityChanged {
        /// Device id.
        device_id: String,
        /// Whether it is now shown.
        visible: bool,
    },
    /// A device was evicted; drop its marker and trail.
    #[serde(rename_all = "camelCase")]
    DeviceRemoved {
        /// Device id.
        device_id: String,
    },
    /// Move the viewport.
    FitViewport {
        /// Where to look.
        target: ViewportTarget,
    },
}

/// One device row in the sidebar.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebarEntry {
    /// Device id.
    pub device_id: String,
    /// Marker colour.
    pub color: String,
    /// Current status.
    pub status: LivenessStatus,
    /// Whether it is shown on the map.
    pub visible: bool,
}

/// Devices of one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SidebarGroup {
    /// User name.
    pub user_name: String,
    /// The user's listed devices.
    pub devices: Vec<SidebarEntry>,
}

/// Owns every tracked device and the viewport fit timer.
#[derive(Debug)]
pub struct LivenessTracker {
    settings: TrackerSettings,
    devices: BTreeMap<String, DeviceState>,
    fit: FitScheduler,
}

impl LivenessTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new(settings: TrackerSettings) -> Self {
        let fit = FitScheduler::new(settings.fit_debounce);
        Self {
            settings,
            devices: BTreeMap::new(),
            fit,
        }
    }

    /// Apply one realtime broadcast.
    ///
    /// Broadcasts outside the clock-skew window, or not newer than the
    /// device's last accepted point, are dropped without any state change.
    /// Status and the offline flag follow the age of the accepted point.
    pub fn apply(&mut self, update: RealtimeUpdate, now: DateTime<Utc>) -> Vec<TrackerEvent> {
        let skew = (now - update.timestamp).abs();
        if skew.to_std().map_or(true, |s| s > self.settings.max_clock_skew) {
            debug!(
                device_id = %update.device_id,
                timestamp = %update.timestamp,
                "Dropping broadcast outside clock-skew window"
            );
            return Vec::new();
        }

        let status = LivenessStatus::classify(now - update.timestamp, &self.settings.thresholds);
        if status == LivenessStatus::Removed {
            debug!(
                device_id = %update.device_id,
                timestamp = %update.timestamp,
                "Dropping broadcast older than the removal threshold"
            );
            return Vec::new();
        }
        let is_offline = status == LivenessStatus::Disconnected;

        let position = Position {
            latitude: update.latitude,
            longitude: update.longitude,
        };
        let point = TrailPoint {
            position,
            timestamp: update.timestamp,
        };

        let mut events = Vec::new();
        match self.devices.get_mut(&update.device_id) {
            Some(device) => {
                if update.timestamp <= device.last_timestamp {
                    debug!(
                        device_id = %update.device_id,
                        timestamp = %update.timestamp,
                        last = %device.last_timestamp,
                        "Dropping out-of-order broadcast"
                    );
                    return events;
                }

                device.trail.push(point);
                device.last_timestamp = update.timestamp;
                device.last_position = position;
                device.user_name = update.user_name;
                device.is_offline = is_offline;

                if status != device.status {
                    events.push(TrackerEvent::StatusChanged {
                        device_id: device.device_id.clone(),
                        from: device.status,
                        to: status,
                    });
                    device.status = status;
                }
                events.push(TrackerEvent::PositionUpdated {
                    device_id: device.device_id.clone(),
                    position,
                    timestamp: update.timestamp,
                });
                self.fit.request(now);
            }
            None => {
                let color = device_color(&update.device_id);
                let mut trail = TrailBuffer::new(self.settings.trail_capacity);
                trail.push(point);
                info!(device_id = %update.device_id, user_name = %update.user_name, "Tracking new device");

                events.push(TrackerEvent::DeviceAdded {
                    device_id: update.device_id.clone(),
                    user_name: update.user_name.clone(),
                    color: color.clone(),
                    position,
                });
                self.devices.insert(
                    update.device_id.clone(),
                    DeviceState {
                        device_id: update.device_id,
                        user_name: update.user_name,
                        color,
                        status,
                        is_offline,
                        visible: true,
                        last_timestamp: update.timestamp,
                        last_position: position,
                        trail,
                    },
                );
                events.extend(self.fit_now());
            }
        }
        events
    }

    /// Re-evaluate every device against `now` and fire a due fit.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        let mut evicted = Vec::new();

        for device in self.devices.values_mut() {
            let status =
                LivenessStatus::classify(now - device.last_timestamp, &self.settings.thresholds);
            if status == device.status {
                continue;
            }
            if status == LivenessStatus::Removed {
                evicted.push(device.device_id.clone());
                continue;
            }
            if status == LivenessStatus::Disconnected {
                device.is_offline = true;
            }
            debug!(device_id = %device.device_id, from = %device.status, to = %status, "Status changed");
            events.push(TrackerEvent::StatusChanged {
                device_id: device.device_id.clone(),
                from: device.status,
                to: status,
            });
            device.status = status;
        }

        for device_id in evicted {
            self.devices.remove(&device_id);
            info!(%device_id, "Evicted silent device");
            events.push(TrackerEvent::DeviceRemoved { device_id });
        }

        if self.fit.poll(now) {
            events.extend(self.viewport_target().map(|target| TrackerEvent::FitViewport { target }));
        }
        events
    }

    /// Show or hide one device and refit immediately.
    pub fn set_visible(&mut self, device_id: &str, visible: bool) -> Vec<TrackerEvent> {
        let Some(device) = self.devices.get_mut(device_id) else {
            return Vec::new();
        };
        device.visible = visible;
        let mut events = vec![TrackerEvent::VisibilityChanged {
            device_id: device_id.to_string(),
            visible,
        }];
        events.extend(self.fit_now());
        events
    }

    /// Show or hide every device of a user and refit immediately.
    pub fn set_user_visible(&mut self, user_name: &str, visible: bool) -> Vec<TrackerEvent> {
        let mut events: Vec<TrackerEvent> = self
            .devices
            .values_mut()
            .filter(|d| d.user_name == user_name)
            .map(|d| {
                d.visible = visible;
                TrackerEvent::VisibilityChanged {
                    device_id: d.device_id.clone(),
                    visible,
                }
            })
            .collect();
        if !events.is_empty() {
            events.extend(self.fit_now());
        }
        events
    }

    /// Listed devices grouped by user; offline devices are left out.
    #[must_use]
    pub fn sidebar(&self) -> Vec<SidebarGroup> {
        let mut groups: BTreeMap<&str, Vec<SidebarEntry>> = BTreeMap::new();
        for device in self.devices.values().filter(|d| !d.is_offline) {
            groups
                .entry(device.user_name.as_str())
                .or_default()
                .push(SidebarEntry {
                    device_id: device.device_id.clone(),
                    color: device.color.clone(),
                    status: device.status,
                    visible: device.visible,
                });
        }
        groups
            .into_iter()
            .map(|(user_name, devices)| SidebarGroup {
                user_name: user_name.to_string(),
                devices,
            })
            .collect()
    }

    /// Capture every tracked device for a later [`restore`](Self::restore).
    #[must_use]
    pub fn snapshot(&self) -> ViewerSnapshot {
        ViewerSnapshot {
            devices: self
                .devices
                .values()
                .map(|d| DeviceSnapshot {
                    device_id: d.device_id.clone(),
                    user_name: d.user_name.clone(),
                    visible: d.visible,
                    trail: d.trail.iter().copied().collect(),
                })
                .collect(),
        }
    }

    /// Re-add devices from a snapshot, classified against `now`.
    ///
    /// Devices already tracked, devices with an empty trail and devices old
    /// enough to be Removed are skipped. The clock-skew gate does not apply:
    /// restored points are expected to be old.
    pub fn restore(&mut self, snapshot: ViewerSnapshot, now: DateTime<Utc>) -> Vec<TrackerEvent> {
        let mut events = Vec::new();
        for saved in snapshot.devices {
            if self.devices.contains_key(&saved.device_id) {
                continue;
            }
            let Some(last) = saved.trail.iter().max_by_key(|p| p.timestamp).copied() else {
                continue;
            };
            let status = LivenessStatus::classify(now - last.timestamp, &self.settings.thresholds);
            if status == LivenessStatus::Removed {
                debug!(device_id = %saved.device_id, "Skipping expired device from snapshot");
                continue;
            }

            let mut trail = TrailBuffer::new(self.settings.trail_capacity);
            for point in saved.trail {
                trail.push(point);
            }
            let color = device_color(&saved.device_id);
            events.push(TrackerEvent::DeviceAdded {
                device_id: saved.device_id.clone(),
                user_name: saved.user_name.clone(),
                color: color.clone(),
                position: last.position,
            });
            if status != LivenessStatus::Realtime {
                events.push(TrackerEvent::StatusChanged {
                    device_id: saved.device_id.clone(),
                    from: LivenessStatus::Realtime,
                    to: status,
                });
            }
            if !saved.visible {
                events.push(TrackerEvent::VisibilityChanged {
                    device_id: saved.device_id.clone(),
                    visible: false,
                });
            }
            self.devices.insert(
                saved.device_id.clone(),
                DeviceState {
                    device_id: saved.device_id,
                    user_name: saved.user_name,
                    color,
                    status,
                    is_offline: status == LivenessStatus::Disconnected,
                    visible: saved.visible,
                    last_timestamp: last.timestamp,
                    last_position: last.position,
                    trail,
                },
            );
        }
        if !events.is_empty() {
            info!(devices = self.devices.len(), "Restored viewer state");
            events.extend(self.fit_now());
        }
        events
    }

    /// Look up one device.
    #[must_use]
    pub fn device(&self, device_id: &str) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    /// Number of tracked devices.
    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no device is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// When a debounced fit is due, if one is pending.
    #[must_use]
    pub fn fit_deadline(&self) -> Option<DateTime<Utc>> {
        self.fit.deadline()
    }

    /// Where the viewport should look right now.
    #[must_use]
    pub fn viewport_target(&self) -> Option<ViewportTarget> {
        let positions: Vec<Position> = self
            .devices
            .values()
            .filter(|d| d.visible && d.status == LivenessStatus::Realtime)
            .map(|d| d.last_position)
            .collect();
        ViewportTarget::covering(&positions)
    }

    fn fit_now(&mut self) -> Option<TrackerEvent> {
        self.fit.cancel();
        self.viewport_target()
            .map(|target| TrackerEvent::FitViewport { target })
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new(TrackerSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    fn update(device_id: &str, user_name: &str, timestamp: DateTime<Utc>) -> RealtimeUpdate {
        RealtimeUpdate {
            device_id: device_id.to_string(),
            user_name: user_name.to_string(),
            latitude: 10.77,
            longitude: 106.69,
            timestamp,
        }
    }

    fn secs(n: i64) -> ChronoDuration {
        ChronoDuration::seconds(n)
    }

    fn statuses(events: &[TrackerEvent]) -> Vec<LivenessStatus> {
        events
            .iter()
            .filter_map(|e| match e {
                TrackerEvent::StatusChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_classify_boundaries() {
        let t = LivenessThresholds::default();
        assert_eq!(LivenessStatus::classify(secs(0), &t), LivenessStatus::Realtime);
        assert_eq!(LivenessStatus::classify(secs(59), &t), LivenessStatus::Realtime);
        assert_eq!(LivenessStatus::classify(secs(60), &t), LivenessStatus::Paused);
        assert_eq!(LivenessStatus::classify(secs(179), &t), LivenessStatus::Paused);
        assert_eq!(LivenessStatus::classify(secs(180), &t), LivenessStatus::Disconnected);
        assert_eq!(LivenessStatus::classify(secs(239), &t), LivenessStatus::Disconnected);
        assert_eq!(LivenessStatus::classify(secs(240), &t), LivenessStatus::Removed);
    }

    #[test]
    fn test_negative_age_is_realtime() {
        let t = LivenessThresholds::default();
        assert_eq!(LivenessStatus::classify(secs(-30), &t), LivenessStatus::Realtime);
    }

    #[test]
    fn test_first_broadcast_adds_device_and_fits() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();

        let events = tracker.apply(update("dev-1", "alice", t0), t0);

        assert!(matches!(events[0], TrackerEvent::DeviceAdded { .. }));
        assert!(matches!(
            events[1],
            TrackerEvent::FitViewport {
                target: ViewportTarget::Single { zoom: 16, .. }
            }
        ));
        let device = tracker.device("dev-1").unwrap();
        assert_eq!(device.status, LivenessStatus::Realtime);
        assert_eq!(device.trail.len(), 1);
        assert!(tracker.fit_deadline().is_none());
    }

    #[test]
    fn test_silence_scenario() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-1", "alice", t0), t0);

        let events = tracker.tick(t0 + secs(65));
        assert_eq!(statuses(&events), vec![LivenessStatus::Paused]);
        assert_eq!(tracker.device("dev-1").unwrap().status, LivenessStatus::Paused);

        let events = tracker.tick(t0 + secs(185));
        assert_eq!(statuses(&events), vec![LivenessStatus::Disconnected]);
        let device = tracker.device("dev-1").unwrap();
        assert_eq!(device.status, LivenessStatus::Disconnected);
        assert!(device.is_offline);
        assert!(tracker.sidebar().is_empty());

        let events = tracker.tick(t0 + secs(245));
        assert_eq!(
            events,
            vec![TrackerEvent::DeviceRemoved {
                device_id: "dev-1".to_string()
            }]
        );
        assert!(tracker.device("dev-1").is_none());
        assert!(tracker.is_empty());
        assert!(tracker.sidebar().is_empty());
    }

    #[test]
    fn test_out_of_order_broadcast_ignored() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-1", "alice", t0), t0);

        let mut stale = update("dev-1", "alice", t0 - secs(1));
        stale.latitude = 11.0;
        let events = tracker.apply(stale, t0 + secs(1));

        assert!(events.is_empty());
        let device = tracker.device("dev-1").unwrap();
        assert_eq!(device.trail.len(), 1);
        assert_eq!(device.last_timestamp, t0);
        assert!((device.last_position.latitude - 10.77).abs() < 1e-9);
    }

    #[test]
    fn test_equal_timestamp_ignored() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-1", "alice", t0), t0);

        assert!(tracker.apply(update("dev-1", "alice", t0), t0).is_empty());
        assert_eq!(tracker.device("dev-1").unwrap().trail.len(), 1);
    }

    #[test]
    fn test_skewed_broadcast_dropped() {
        let mut tracker = LivenessTracker::default();
        let now = Utc::now();

        assert!(tracker.apply(update("dev-1", "alice", now - secs(16)), now).is_empty());
        assert!(tracker.apply(update("dev-1", "alice", now + secs(16)), now).is_empty());
        assert!(tracker.is_empty());

        assert!(!tracker.apply(update("dev-1", "alice", now - secs(14)), now).is_empty());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_routine_update_debounces_fit() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-1", "alice", t0), t0);

        let events = tracker.apply(update("dev-1", "alice", t0 + secs(1)), t0 + secs(1));
        assert!(matches!(events[0], TrackerEvent::PositionUpdated { .. }));
        assert!(!events.iter().any(|e| matches!(e, TrackerEvent::FitViewport { .. })));
        assert_eq!(tracker.fit_deadline(), Some(t0 + secs(3)));

        assert!(tracker.tick(t0 + secs(2)).is_empty());
        let events = tracker.tick(t0 + secs(3));
        assert!(matches!(events[0], TrackerEvent::FitViewport { .. }));
        assert_eq!(tracker.device("dev-1").unwrap().trail.len(), 2);
    }

    #[test]
    fn test_paused_device_recovers_on_new_point() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-1", "alice", t0), t0);
        tracker.tick(t0 + secs(65));

        let later = t0 + secs(70);
        let events = tracker.apply(update("dev-1", "alice", later), later);

        assert_eq!(statuses(&events), vec![LivenessStatus::Realtime]);
        assert_eq!(tracker.device("dev-1").unwrap().status, LivenessStatus::Realtime);
    }

    #[test]
    fn test_disconnected_device_relisted_on_new_point() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-1", "alice", t0), t0);
        tracker.tick(t0 + secs(185));
        assert!(tracker.sidebar().is_empty());

        let later = t0 + secs(190);
        tracker.apply(update("dev-1", "alice", later), later);

        let device = tracker.device("dev-1").unwrap();
        assert!(!device.is_offline);
        assert_eq!(tracker.sidebar().len(), 1);
    }

    #[test]
    fn test_late_point_keeps_disconnected_device_offline() {
        let settings = TrackerSettings {
            max_clock_skew: Duration::from_secs(200),
            ..TrackerSettings::default()
        };
        let mut tracker = LivenessTracker::new(settings);
        let t0 = Utc::now();
        tracker.apply(update("dev-1", "alice", t0), t0);
        tracker.tick(t0 + secs(185));

        let events = tracker.apply(update("dev-1", "alice", t0 + secs(1)), t0 + secs(185));

        assert!(statuses(&events).is_empty());
        let device = tracker.device("dev-1").unwrap();
        assert_eq!(device.status, LivenessStatus::Disconnected);
        assert!(device.is_offline);
        assert_eq!(device.trail.len(), 2);
        assert!(tracker.sidebar().is_empty());
    }

    #[test]
    fn test_late_first_point_is_classified_by_age() {
        let settings = TrackerSettings {
            max_clock_skew: Duration::from_secs(300),
            ..TrackerSettings::default()
        };
        let mut tracker = LivenessTracker::new(settings);
        let now = Utc::now();

        tracker.apply(update("dev-1", "alice", now - secs(190)), now);
        let device = tracker.device("dev-1").unwrap();
        assert_eq!(device.status, LivenessStatus::Disconnected);
        assert!(device.is_offline);
        assert!(tracker.sidebar().is_empty());

        assert!(tracker.apply(update("dev-2", "bob", now - secs(250)), now).is_empty());
        assert!(tracker.device("dev-2").is_none());
    }

    #[test]
    fn test_restore_keeps_visibility_and_trail() {
        let t0 = Utc::now();
        let mut tracker = LivenessTracker::default();
        tracker.apply(update("dev-1", "alice", t0), t0);
        tracker.apply(update("dev-1", "alice", t0 + secs(1)), t0 + secs(1));
        tracker.apply(update("dev-2", "bob", t0), t0);
        tracker.set_visible("dev-2", false);

        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.devices.len(), 2);

        let mut restored = LivenessTracker::default();
        let now = t0 + secs(2);
        let events = restored.restore(snapshot, now);

        assert!(events.contains(&TrackerEvent::VisibilityChanged {
            device_id: "dev-2".to_string(),
            visible: false,
        }));
        assert!(matches!(events.last(), Some(TrackerEvent::FitViewport { .. })));
        let dev1 = restored.device("dev-1").unwrap();
        assert_eq!(dev1.trail.len(), 2);
        assert_eq!(dev1.last_timestamp, t0 + secs(1));
        assert_eq!(dev1.status, LivenessStatus::Realtime);
        assert!(!restored.device("dev-2").unwrap().visible);

        // A replayed older point is still rejected after restore.
        assert!(restored.apply(update("dev-1", "alice", t0), now).is_empty());
    }

    #[test]
    fn test_restore_classifies_by_age() {
        let t0 = Utc::now();
        let mut tracker = LivenessTracker::default();
        tracker.apply(update("paused", "alice", t0), t0);
        tracker.apply(update("gone", "alice", t0 - secs(10)), t0);
        let mut snapshot = tracker.snapshot();
        snapshot.devices[0].trail[0].timestamp = t0 - secs(300);

        let mut restored = LivenessTracker::default();
        let events = restored.restore(snapshot.clone(), t0 + secs(100));

        assert!(restored.device("gone").is_none());
        let paused = restored.device("paused").unwrap();
        assert_eq!(paused.status, LivenessStatus::Paused);
        assert_eq!(statuses(&events), vec![LivenessStatus::Paused]);

        let mut later = LivenessTracker::default();
        later.restore(snapshot, t0 + secs(200));
        let device = later.device("paused").unwrap();
        assert_eq!(device.status, LivenessStatus::Disconnected);
        assert!(device.is_offline);
        assert!(later.sidebar().is_empty());
    }

    #[test]
    fn test_restore_skips_tracked_devices() {
        let t0 = Utc::now();
        let mut tracker = LivenessTracker::default();
        tracker.apply(update("dev-1", "alice", t0), t0);
        let snapshot = tracker.snapshot();

        let mut live = LivenessTracker::default();
        live.apply(update("dev-1", "alice", t0 + secs(5)), t0 + secs(5));

        assert!(live.restore(snapshot, t0 + secs(5)).is_empty());
        assert_eq!(live.device("dev-1").unwrap().last_timestamp, t0 + secs(5));
    }

    #[test]
    fn test_visibility_toggle_fits_immediately() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-1", "alice", t0), t0);
        let mut other = update("dev-2", "bob", t0);
        other.latitude = 10.80;
        tracker.apply(other, t0);
        tracker.apply(update("dev-1", "alice", t0 + secs(1)), t0 + secs(1));
        assert!(tracker.fit_deadline().is_some());

        let events = tracker.set_visible("dev-2", false);

        assert_eq!(
            events[0],
            TrackerEvent::VisibilityChanged {
                device_id: "dev-2".to_string(),
                visible: false
            }
        );
        assert!(matches!(
            events[1],
            TrackerEvent::FitViewport {
                target: ViewportTarget::Single { .. }
            }
        ));
        assert!(tracker.fit_deadline().is_none());
    }

    #[test]
    fn test_no_fit_when_nothing_visible() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-1", "alice", t0), t0);

        let events = tracker.set_visible("dev-1", false);

        assert_eq!(events.len(), 1);
        assert!(tracker.viewport_target().is_none());
    }

    #[test]
    fn test_sidebar_groups_by_user() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-b", "bob", t0), t0);
        tracker.apply(update("dev-a1", "alice", t0), t0);
        tracker.apply(update("dev-a2", "alice", t0), t0);

        let sidebar = tracker.sidebar();

        assert_eq!(sidebar.len(), 2);
        assert_eq!(sidebar[0].user_name, "alice");
        assert_eq!(sidebar[0].devices.len(), 2);
        assert_eq!(sidebar[1].user_name, "bob");
    }

    #[test]
    fn test_user_toggle_hides_all_devices() {
        let mut tracker = LivenessTracker::default();
        let t0 = Utc::now();
        tracker.apply(update("dev-a1", "alice", t0), t0);
        tracker.apply(update("dev-a2", "alice", t0), t0);
        tracker.apply(update("dev-b", "bob", t0), t0);

        let events = tracker.set_user_visible("alice", false);

        let hidden = events
            .iter()
            .filter(|e| matches!(e, TrackerEvent::VisibilityChanged { visible: false, .. }))
            .count();
        assert_eq!(hidden, 2);
        assert!(!tracker.device("dev-a1").unwrap().visible);
        assert!(!tracker.device("dev-a2").unwrap().visible);
        assert!(tracker.device("dev-b").unwrap().visible);
    }

    #[test]
    fn test_event_serialization() {
        let event = TrackerEvent::DeviceRemoved {
            device_id: "dev-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "deviceRemoved");
        assert_eq!(json["deviceId"], "dev-1");
    }
}
