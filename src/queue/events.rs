//! Notifications emitted by the queue manager
//!
//! Observers (a dashboard push channel, a log sink, a snapshot writer) receive
//! these through an injected publisher rather than a global hook.

use fleet_shared::capability::Capabilities;
use fleet_shared::{CommandStatus, DeviceStatus, Protocol};
use tokio::sync::mpsc;

/// Totals for one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Devices that had pending work
    pub devices: usize,
    /// Commands that reached a terminal state in this sweep
    pub executed: usize,
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    /// Left `PENDING` because the device went away mid-batch
    pub deferred: usize,
    /// Claimed by someone else first
    pub skipped: usize,
}

impl SweepReport {
    pub(crate) fn record(&mut self, status: CommandStatus) {
        self.executed += 1;
        match status {
            CommandStatus::Completed => self.completed += 1,
            CommandStatus::Timeout => self.timed_out += 1,
            _ => self.failed += 1,
        }
    }

    pub(crate) fn merge(&mut self, other: &SweepReport) {
        self.devices += other.devices;
        self.executed += other.executed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.deferred += other.deferred;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    CommandStarted {
        command_id: String,
        device_id: String,
        protocol: Protocol,
    },
    CommandFinished {
        command_id: String,
        device_id: String,
        status: CommandStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    },
    DeviceStatusChanged {
        device_id: String,
        from: DeviceStatus,
        to: DeviceStatus,
    },
    CapabilitiesUpdated {
        device_id: String,
        capabilities: Capabilities,
    },
    SweepCompleted(SweepReport),
}

/// Sink for queue events; must not block the caller
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: QueueEvent);
}

impl EventPublisher for mpsc::UnboundedSender<QueueEvent> {
    fn publish(&self, event: QueueEvent) {
        // A dropped receiver just means nobody is listening
        let _ = self.send(event);
    }
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl EventPublisher for NoopPublisher {
    fn publish(&self, _event: QueueEvent) {}
}
