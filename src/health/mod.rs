//! Health subsystem: heartbeat emission, per-channel reconnection, and
//! post-restart recovery.

pub mod heartbeat;
pub mod monitor;
pub mod recovery;

pub use heartbeat::{Heartbeat, HeartbeatPayload, HostStatus};
pub use monitor::ChannelMonitor;
pub use recovery::{notify_recovery, recover_orphaned_tasks, RecoveryEvent};
