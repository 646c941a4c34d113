//! Background scan scheduler
//!
//! Re-scans the bus on a fixed interval. The native listing call blocks, so
//! each scan runs on the Tokio blocking pool while the timer and the stop
//! signal stay on the async side.

use crate::error::TopologyError;
use crate::usb::backend::UsbBackend;
use crate::usb::manager::DeviceManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default scan interval
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Handle to the background scan loop
///
/// The loop ends when [`ScanScheduler::stop`] is called or the scheduler is
/// dropped. A scan already in flight is allowed to finish.
pub struct ScanScheduler {
    interval: Duration,
    stop_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ScanScheduler {
    /// Start scanning `manager` every `interval`
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<B: UsbBackend>(
        manager: Arc<DeviceManager<B>>,
        interval: Duration,
    ) -> Result<Self, TopologyError> {
        if interval.is_zero() {
            return Err(TopologyError::InvalidArgument(
                "scan interval must be greater than 0".to_string(),
            ));
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            TopologyError::InvalidArgument("scan scheduler requires a Tokio runtime".to_string())
        })?;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = runtime.spawn(run_scan_loop(manager, interval, stop_rx));

        Ok(Self {
            interval,
            stop_tx: Some(stop_tx),
            task,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether the loop is still running
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for it to exit
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Err(e) = (&mut self.task).await {
            error!("USB scanner task failed: {}", e);
        }
    }
}

/// Sleep, scan, repeat until the stop signal fires or its sender is dropped
async fn run_scan_loop<B: UsbBackend>(
    manager: Arc<DeviceManager<B>>,
    interval: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) {
    info!("USB scanner started (interval {:?})", interval);

    loop {
        tokio::select! {
            _ = &mut stop_rx => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let scan_manager = Arc::clone(&manager);
        match tokio::task::spawn_blocking(move || scan_manager.scan()).await {
            Ok(Ok(report)) => {
                if report.has_changes() {
                    debug!(
                        "Background scan: {} added, {} removed",
                        report.added.len(),
                        report.removed.len()
                    );
                }
            }
            Ok(Err(e)) => {
                warn!("Background USB scan failed: {}", e);
            }
            Err(e) => {
                // Panicked or cancelled at runtime shutdown; keep scanning
                error!("USB scan task failed: {}", e);
            }
        }
    }

    info!("USB scanner stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{DEFAULT_TEST_TIMEOUT, MockBus, MockDeviceSpec, wait_until};

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let manager = Arc::new(DeviceManager::new(MockBus::new()));
        let result = ScanScheduler::start(manager, Duration::ZERO);
        assert!(matches!(result, Err(TopologyError::InvalidArgument(_))));
    }

    #[test]
    fn test_requires_runtime() {
        let manager = Arc::new(DeviceManager::new(MockBus::new()));
        let result = ScanScheduler::start(manager, DEFAULT_SCAN_INTERVAL);
        assert!(matches!(result, Err(TopologyError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_scheduler_populates_topology() {
        let bus = MockBus::with_devices(vec![MockDeviceSpec::hub(1, 1, 0)]);
        let manager = Arc::new(DeviceManager::new(bus));

        let scheduler = ScanScheduler::start(Arc::clone(&manager), Duration::from_millis(10)).unwrap();
        assert!(scheduler.is_running());
        assert!(wait_until(DEFAULT_TEST_TIMEOUT, || manager.len() == 1).await);

        scheduler.stop().await;
        assert!(manager.has_scanned());
    }
}
