use crate::service_state::ServiceState;
use phantom_core::detector::Detection;
use phantom_core::manager::OperationControl;
use phantom_core::platform::PlatformAdapter;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

/// Acts on sequences matched by the detector thread. Each detection runs on
/// the blocking pool under a worker permit, like an IPC operation.
pub(crate) async fn run_detection_worker<P: PlatformAdapter>(
    state: Arc<ServiceState<P>>,
    mut detections: UnboundedReceiver<Detection>,
) {
    while let Some(detection) = detections.recv().await {
        let permit = match state.workers.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let state = state.clone();
        tokio::spawn(async move {
            let ctl = OperationControl::new(uuid::Uuid::new_v4().to_string(), "detector");
            let guard = state.register_operation(&ctl);
            let manager = state.manager.clone();
            let result = tokio::task::spawn_blocking(move || {
                let _permit = permit;
                let _guard = guard;
                manager.handle_detection(&ctl, &detection)
            })
            .await;
            match result {
                Ok(Ok(outcome)) => info!(
                    unlocked = outcome.unlocked.len(),
                    relocked = outcome.relocked.len(),
                    failed = outcome.failed,
                    "sequence handled"
                ),
                Ok(Err(e)) if e.is_auth_failure() => info!("sequence rejected"),
                Ok(Err(e)) => warn!(error = %e, "sequence handling failed"),
                Err(e) => warn!(error = %e, "sequence task panicked"),
            }
        });
    }
    info!("detection worker stopped");
}
