//! Live map viewer core.
//!
//! [`ViewerSession`] subscribes to the realtime channel and drives a
//! [`LivenessTracker`], which emits [`TrackerEvent`]s for whatever renders
//! the map. [`ViewerSnapshot`] carries device state across restarts.

pub mod color;
pub mod fit;
pub mod session;
pub mod snapshot;
pub mod tracker;
pub mod trail;

pub use color::device_color;
pub use fit::{FitScheduler, ViewportTarget};
pub use session::{reconnect_delay, SessionTask, ViewerSession};
pub use snapshot::{DeviceSnapshot, ViewerSnapshot};
pub use tracker::{
    DeviceState, LivenessStatus, LivenessThresholds, LivenessTracker, SidebarEntry, SidebarGroup,
    TrackerEvent, TrackerSettings,
};
pub use trail::{Position, TrailBuffer, TrailPoint};
