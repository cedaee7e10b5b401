//! Command Queue Manager
//!
//! Reconciles command intent with device reachability:
//! - `execute_or_queue` runs a fresh command now if its device is online
//! - A periodic sweep drains `PENDING` commands of online devices
//!
//! Devices are processed concurrently, commands of one device strictly in
//! creation order. No single command's failure aborts a sweep.

use super::events::{EventPublisher, QueueEvent, SweepReport};
use crate::capability::CapabilityDetector;
use crate::command::CommandExecutor;
use crate::config::QueueConfig;
use crate::store::{CommandUpdate, DeviceUpdate, FleetStore, PendingBatch, StoreError};
use fleet_shared::{Command, CommandStatus, Device, DeviceStatus, ExecutionResult};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("command not found: {0}")]
    CommandNotFound(String),

    #[error("command {command} belongs to {actual}, not {requested}")]
    DeviceMismatch {
        command: String,
        requested: String,
        actual: String,
    },

    #[error("queue processing is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What `execute_or_queue` / `dispatch` did with a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Device not online; left `PENDING` for a later sweep
    Queued,
    /// Command was no longer `PENDING` when looked up
    AlreadyProcessed(CommandStatus),
    /// Ran (or was rejected) and reached this terminal status
    Executed(CommandStatus),
    /// Another worker claimed it first
    Skipped,
}

struct Sweeper {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct QueueManager {
    store: Arc<dyn FleetStore>,
    /// Priority order; the first that can handle a device wins
    executors: Vec<Arc<dyn CommandExecutor>>,
    detector: Option<Arc<CapabilityDetector>>,
    events: Arc<dyn EventPublisher>,
    config: QueueConfig,
    sweeper: Mutex<Option<Sweeper>>,
}

impl QueueManager {
    pub fn new(
        store: Arc<dyn FleetStore>,
        executors: Vec<Arc<dyn CommandExecutor>>,
        events: Arc<dyn EventPublisher>,
        config: QueueConfig,
    ) -> Self {
        Self {
            store,
            executors,
            detector: None,
            events,
            config,
            sweeper: Mutex::new(None),
        }
    }

    /// Enable capability feedback from command outcomes
    pub fn with_detector(mut self, detector: Arc<CapabilityDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// First registered executor whose protocol gate accepts the device
    pub fn select_executor(&self, device: &Device) -> Option<&Arc<dyn CommandExecutor>> {
        self.executors.iter().find(|e| e.can_handle(device))
    }

    /// Run a newly submitted command now, or leave it for the sweep
    pub async fn execute_or_queue(
        &self,
        device_id: &str,
        command_id: &str,
    ) -> Result<DispatchOutcome, QueueError> {
        let command = self
            .store
            .find_command(command_id)
            .await?
            .ok_or_else(|| QueueError::CommandNotFound(command_id.to_string()))?;
        if command.device_id != device_id {
            return Err(QueueError::DeviceMismatch {
                command: command_id.to_string(),
                requested: device_id.to_string(),
                actual: command.device_id,
            });
        }
        if command.status != CommandStatus::Pending {
            debug!(
                "[QUEUE] {} already {}, not executing again",
                command_id, command.status
            );
            return Ok(DispatchOutcome::AlreadyProcessed(command.status));
        }

        let device = self
            .store
            .find_device(device_id)
            .await?
            .ok_or_else(|| QueueError::DeviceNotFound(device_id.to_string()))?;
        if !device.is_online() {
            info!(
                "[QUEUE] {} is {}, keeping {} pending",
                device_id, device.status, command_id
            );
            return Ok(DispatchOutcome::Queued);
        }

        Ok(self.dispatch(&device, &command).await)
    }

    /// Execute one pending command on a device that was online when loaded
    ///
    /// Only the caller that claims the command runs it. Orchestration errors
    /// are logged and turned into a `FAILED` command.
    pub async fn dispatch(&self, device: &Device, command: &Command) -> DispatchOutcome {
        let Some(executor) = self.select_executor(device) else {
            warn!("[QUEUE] no executor can reach {}", device.id);
            return self
                .fail_unclaimed(command, ExecutionResult::routing_failure())
                .await;
        };

        match self
            .store
            .claim_command(&command.id, fleet_shared::now())
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("[QUEUE] {} was claimed elsewhere", command.id);
                return DispatchOutcome::Skipped;
            }
            Err(e) => {
                error!("[QUEUE] could not claim {}: {}", command.id, e);
                return self
                    .fail_unclaimed(command, ExecutionResult::internal(e.to_string()))
                    .await;
            }
        }

        match self.run_claimed(device, command, &**executor).await {
            Ok(status) => DispatchOutcome::Executed(status),
            Err(e) => {
                error!(
                    "[QUEUE] command {} on {} failed internally: {}",
                    command.id, device.id, e
                );
                let result = ExecutionResult::internal(e.to_string());
                match self
                    .store
                    .update_command(&command.id, CommandUpdate::from_result(&result))
                    .await
                {
                    Ok(_) => self.publish_finished(command, &result),
                    Err(e) => error!("[QUEUE] could not mark {} failed: {}", command.id, e),
                }
                DispatchOutcome::Executed(CommandStatus::Failed)
            }
        }
    }

    /// Record a failure for a command nobody has claimed
    ///
    /// Loses quietly if another worker claimed it in the meantime.
    async fn fail_unclaimed(&self, command: &Command, result: ExecutionResult) -> DispatchOutcome {
        match self
            .store
            .fail_pending(&command.id, CommandUpdate::from_result(&result))
            .await
        {
            Ok(true) => {
                self.publish_finished(command, &result);
                DispatchOutcome::Executed(result.status)
            }
            Ok(false) => {
                debug!("[QUEUE] {} is no longer pending, leaving it", command.id);
                DispatchOutcome::Skipped
            }
            Err(e) => {
                error!("[QUEUE] could not mark {} failed: {}", command.id, e);
                DispatchOutcome::Skipped
            }
        }
    }

    async fn run_claimed(
        &self,
        device: &Device,
        command: &Command,
        executor: &dyn CommandExecutor,
    ) -> Result<CommandStatus, StoreError> {
        self.events.publish(QueueEvent::CommandStarted {
            command_id: command.id.clone(),
            device_id: device.id.clone(),
            protocol: executor.protocol(),
        });
        info!(
            "[QUEUE] executing {} ({}) on {} via {}",
            command.id,
            command.shell_line(),
            device.id,
            executor.name()
        );

        let deadline = self.config.execution_deadline();
        let result = match timeout(deadline, executor.execute(device, command)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "[QUEUE] {} on {} exceeded the {:?} deadline",
                    command.id, device.id, deadline
                );
                ExecutionResult::timeout(
                    Some(executor.protocol()),
                    format!("Execution exceeded deadline of {:?}", deadline),
                )
            }
        };

        self.store
            .update_command(&command.id, CommandUpdate::from_result(&result))
            .await?;
        self.publish_finished(command, &result);

        // Follow-up writes must not turn a recorded outcome into a failure
        if result.is_success() && command.is_disruptive() {
            self.mark_offline_after(device, command).await;
        }
        self.apply_feedback(device, command, &result).await;

        Ok(result.status)
    }

    async fn mark_offline_after(&self, device: &Device, command: &Command) {
        match self
            .store
            .update_device(&device.id, DeviceUpdate::status(DeviceStatus::Offline))
            .await
        {
            Ok(_) => {
                info!(
                    "[QUEUE] {} accepted '{}', marking it offline",
                    device.id,
                    command.verb()
                );
                self.events.publish(QueueEvent::DeviceStatusChanged {
                    device_id: device.id.clone(),
                    from: device.status,
                    to: DeviceStatus::Offline,
                });
            }
            Err(e) => warn!("[QUEUE] could not mark {} offline: {}", device.id, e),
        }
    }

    async fn apply_feedback(&self, device: &Device, command: &Command, result: &ExecutionResult) {
        let (Some(detector), Some((protocol, success))) =
            (&self.detector, result.capability_evidence())
        else {
            return;
        };

        let updated = detector.reconcile(device, command, protocol, success);
        if updated == device.capabilities {
            return;
        }
        match self
            .store
            .update_device(&device.id, DeviceUpdate::capabilities(updated.clone()))
            .await
        {
            Ok(_) => self.events.publish(QueueEvent::CapabilitiesUpdated {
                device_id: device.id.clone(),
                capabilities: updated,
            }),
            Err(e) => warn!(
                "[QUEUE] could not store capabilities of {}: {}",
                device.id, e
            ),
        }
    }

    fn publish_finished(&self, command: &Command, result: &ExecutionResult) {
        self.events.publish(QueueEvent::CommandFinished {
            command_id: command.id.clone(),
            device_id: command.device_id.clone(),
            status: result.status,
            exit_code: result.exit_code,
            error: result.error.clone(),
        });
    }

    /// One sweep over every online device with pending work
    pub async fn process_queue(&self) -> Result<SweepReport, QueueError> {
        let batches = self
            .store
            .find_devices_with_pending_commands(DeviceStatus::Online)
            .await?;
        if batches.is_empty() {
            debug!("[QUEUE] sweep: nothing pending");
        }

        let reports: Vec<SweepReport> = stream::iter(batches)
            .map(|batch| self.process_batch(batch))
            .buffer_unordered(self.config.concurrency())
            .collect()
            .await;

        let mut report = SweepReport::default();
        for r in &reports {
            report.merge(r);
        }

        if report.devices > 0 {
            info!(
                "[QUEUE] sweep: {} devices, {} executed ({} ok, {} failed, {} timed out), {} deferred",
                report.devices,
                report.executed,
                report.completed,
                report.failed,
                report.timed_out,
                report.deferred
            );
        }
        self.events.publish(QueueEvent::SweepCompleted(report.clone()));
        Ok(report)
    }

    /// Commands of one device, in order, while it stays online
    async fn process_batch(&self, batch: PendingBatch) -> SweepReport {
        let mut report = SweepReport {
            devices: 1,
            ..Default::default()
        };
        let device_id = batch.device.id.clone();
        let total = batch.commands.len();

        for (done, command) in batch.commands.into_iter().enumerate() {
            // Re-read: an earlier command may have rebooted it or changed its profile
            let device = match self.store.find_device(&device_id).await {
                Ok(Some(device)) if device.is_online() => device,
                Ok(Some(device)) => {
                    debug!(
                        "[QUEUE] {} went {}, deferring {} commands",
                        device_id,
                        device.status,
                        total - done
                    );
                    report.deferred += total - done;
                    break;
                }
                Ok(None) => {
                    warn!("[QUEUE] {} disappeared mid-sweep", device_id);
                    report.deferred += total - done;
                    break;
                }
                Err(e) => {
                    error!("[QUEUE] reloading {} failed: {}", device_id, e);
                    report.deferred += total - done;
                    break;
                }
            };

            match self.dispatch(&device, &command).await {
                DispatchOutcome::Executed(status) => report.record(status),
                DispatchOutcome::Skipped | DispatchOutcome::AlreadyProcessed(_) => {
                    report.skipped += 1
                }
                DispatchOutcome::Queued => report.deferred += 1,
            }
        }
        report
    }

    /// Start periodic sweeps; the first runs immediately
    pub async fn start_queue_processing(
        self: &Arc<Self>,
        period: Duration,
    ) -> Result<(), QueueError> {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return Err(QueueError::AlreadyRunning);
        }

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!("[QUEUE] sweeping every {:?}", period);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.process_queue().await {
                            error!("[QUEUE] sweep failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            info!("[QUEUE] sweeping stopped");
        });

        *sweeper = Some(Sweeper { shutdown, task });
        Ok(())
    }

    /// Stop periodic sweeps, letting an in-flight sweep finish
    ///
    /// Returns false if sweeping was not running.
    pub async fn stop_queue_processing(&self) -> bool {
        let Some(sweeper) = self.sweeper.lock().await.take() else {
            return false;
        };
        let _ = sweeper.shutdown.send(true);
        if let Err(e) = sweeper.task.await {
            error!("[QUEUE] sweep task ended abnormally: {}", e);
        }
        true
    }

    /// Set a device's liveness status, as reported by the fleet registry
    pub async fn set_device_status(
        &self,
        device_id: &str,
        status: DeviceStatus,
    ) -> Result<Device, QueueError> {
        let before = self
            .store
            .find_device(device_id)
            .await?
            .ok_or_else(|| QueueError::DeviceNotFound(device_id.to_string()))?;
        let device = self
            .store
            .update_device(device_id, DeviceUpdate::status(status))
            .await?;
        if before.status != status {
            self.events.publish(QueueEvent::DeviceStatusChanged {
                device_id: device_id.to_string(),
                from: before.status,
                to: status,
            });
        }
        Ok(device)
    }
}
