use parking_lot::Mutex;
use phantom_core::detector::KeystrokeSink;
use phantom_core::manager::{OperationControl, ProfileVaultManager};
use phantom_core::platform::PlatformAdapter;
use phantom_core::settings::ServiceSettings;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::Semaphore;

pub(crate) struct ServiceState<P: PlatformAdapter> {
    pub(crate) manager: Arc<ProfileVaultManager<P>>,
    /// Bounds concurrently running vault operations.
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) sink: Mutex<KeystrokeSink>,
    pub(crate) keyboard_capture: bool,
    pub(crate) detector: Mutex<Option<JoinHandle<()>>>,
    operations: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl<P: PlatformAdapter> ServiceState<P> {
    pub(crate) fn new(
        manager: Arc<ProfileVaultManager<P>>,
        settings: &ServiceSettings,
        sink: KeystrokeSink,
        keyboard_capture: bool,
        detector: Option<JoinHandle<()>>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.workers.max_concurrent_operations));
        Self {
            manager,
            workers,
            sink: Mutex::new(sink),
            keyboard_capture,
            detector: Mutex::new(detector),
            operations: Mutex::new(HashMap::new()),
        }
    }

    /// Makes `ctl` cancellable by id until the returned guard is dropped.
    pub(crate) fn register_operation(self: &Arc<Self>, ctl: &OperationControl) -> OperationGuard<P> {
        let id = ctl.operation_id().to_string();
        self.operations.lock().insert(id.clone(), ctl.cancel_flag());
        OperationGuard {
            state: self.clone(),
            id,
        }
    }

    pub(crate) fn cancel(&self, operation_id: &str) -> bool {
        match self.operations.lock().get(operation_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub(crate) fn active_operations(&self) -> usize {
        self.operations.lock().len()
    }

    pub(crate) fn detector_running(&self) -> bool {
        self.detector
            .lock()
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub(crate) fn stop_detector(&self) {
        self.sink.lock().shutdown();
        if let Some(handle) = self.detector.lock().take() {
            let _ = handle.join();
        }
    }
}

pub(crate) struct OperationGuard<P: PlatformAdapter> {
    state: Arc<ServiceState<P>>,
    id: String,
}

impl<P: PlatformAdapter> Drop for OperationGuard<P> {
    fn drop(&mut self) {
        self.state.operations.lock().remove(&self.id);
    }
}
