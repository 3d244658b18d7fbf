use crate::service_state::ServiceState;
use phantom_core::error::{VaultError, VaultResult};
use phantom_core::ipc::{operation_id, IpcHandler, IpcRequest, IpcResponse, RequestContext, ServiceStatus};
use phantom_core::lifecycle::Trigger;
use phantom_core::manager::{OperationControl, ProfileVaultManager};
use phantom_core::platform::PlatformAdapter;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub(crate) struct ServiceHandler<P: PlatformAdapter> {
    state: Arc<ServiceState<P>>,
}

impl<P: PlatformAdapter> ServiceHandler<P> {
    pub(crate) fn new(state: Arc<ServiceState<P>>) -> Self {
        Self { state }
    }

    /// Runs `op` on the blocking pool once a worker slot is free.
    async fn run<F>(&self, ctx: &RequestContext, op: F) -> VaultResult<IpcResponse>
    where
        F: FnOnce(&ProfileVaultManager<P>, &OperationControl) -> VaultResult<IpcResponse> + Send + 'static,
    {
        let permit = self
            .state
            .workers
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| VaultError::InvalidState("service is shutting down".into()))?;
        let ctl = OperationControl::new(ctx.operation_id(), ctx.source()).with_events(ctx.events.clone());
        let guard = self.state.register_operation(&ctl);
        let manager = self.state.manager.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let _guard = guard;
            op(&manager, &ctl)
        })
        .await
        .map_err(|e| VaultError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
    }

    async fn dispatch(&self, ctx: RequestContext, req: IpcRequest) -> VaultResult<IpcResponse> {
        match req {
            IpcRequest::Ping => Ok(IpcResponse::Pong),
            IpcRequest::GetStatus => {
                let manager = self.state.manager.clone();
                let exposed_folders = tokio::task::spawn_blocking(move || manager.exposed_folder_count())
                    .await
                    .map_err(|e| VaultError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))??;
                let mut capabilities = self.state.manager.platform().detect_capabilities();
                capabilities.keyboard_capture = self.state.keyboard_capture;
                Ok(IpcResponse::Status(ServiceStatus {
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    capabilities,
                    detector_running: self.state.detector_running(),
                    active_operations: self.state.active_operations(),
                    exposed_folders,
                }))
            }
            IpcRequest::ListProfiles => {
                self.run(&ctx, |m, _| {
                    Ok(IpcResponse::Profiles {
                        profiles: m.list_profiles()?,
                    })
                })
                .await
            }
            IpcRequest::CreateProfile { name, password } => {
                let password = Zeroizing::new(password);
                self.run(&ctx, move |m, _| {
                    let created = m.create_profile(&name, &password)?;
                    Ok(IpcResponse::ProfileCreated {
                        profile_id: created.profile_id,
                        recovery_key: created.recovery_key.to_string(),
                    })
                })
                .await
            }
            IpcRequest::DeleteProfile { profile_id, credential } => {
                let credential = credential.into_credential();
                self.run(&ctx, move |m, ctl| {
                    m.delete_profile(ctl, &profile_id, &credential)?;
                    Ok(IpcResponse::ProfileDeleted)
                })
                .await
            }
            IpcRequest::ChangePassword {
                profile_id,
                credential,
                new_password,
            } => {
                let credential = credential.into_credential();
                let new_password = Zeroizing::new(new_password);
                self.run(&ctx, move |m, ctl| {
                    let recovery_key = m.change_password(ctl, &profile_id, &credential, &new_password)?;
                    Ok(IpcResponse::PasswordChanged {
                        recovery_key: recovery_key.to_string(),
                    })
                })
                .await
            }
            IpcRequest::RecoverMasterKey { recovery_key } => {
                let recovery_key = Zeroizing::new(recovery_key);
                self.run(&ctx, move |m, ctl| {
                    let recovered = m.recover_master_key(ctl, &recovery_key)?;
                    Ok(IpcResponse::MasterKeyRecovered {
                        profile_id: recovered.profile_id,
                        master_password: recovered.master_password.to_string(),
                    })
                })
                .await
            }
            IpcRequest::ListFolders { profile_id, credential } => {
                let credential = credential.into_credential();
                self.run(&ctx, move |m, ctl| {
                    Ok(IpcResponse::Folders {
                        folders: m.list_folders(ctl, &profile_id, &credential)?,
                    })
                })
                .await
            }
            IpcRequest::LockFolder {
                profile_id,
                path,
                credential,
            } => {
                let credential = credential.into_credential();
                self.run(&ctx, move |m, ctl| {
                    let outcome = m.lock_folder(ctl, &profile_id, &PathBuf::from(path), &credential)?;
                    Ok(IpcResponse::FolderLocked(outcome))
                })
                .await
            }
            IpcRequest::UnlockFolder {
                profile_id,
                folder_id,
                mode,
                credential,
            } => {
                let credential = credential.into_credential();
                self.run(&ctx, move |m, ctl| {
                    let original = m.unlock_folder(ctl, &profile_id, &folder_id, mode, &credential)?;
                    Ok(IpcResponse::FolderUnlocked {
                        folder_id,
                        original_path: original.display().to_string(),
                        mode,
                    })
                })
                .await
            }
            IpcRequest::RelockFolder {
                profile_id,
                folder_id,
                credential,
            } => {
                let credential = credential.into_credential();
                self.run(&ctx, move |m, ctl| {
                    let hidden = m.relock_folder(ctl, &profile_id, &folder_id, &credential)?;
                    Ok(IpcResponse::FolderRelocked { folder_id, hidden })
                })
                .await
            }
            IpcRequest::LockAll => {
                self.run(&ctx, |m, ctl| Ok(IpcResponse::LockedAll(m.lock_all(ctl, Trigger::LockAll)?)))
                    .await
            }
            IpcRequest::BindSequence {
                profile_id,
                folder_id,
                credential,
                sequence,
            } => {
                let credential = credential.into_credential();
                let sequence = sequence.map(Zeroizing::new);
                self.run(&ctx, move |m, ctl| {
                    m.bind_sequence(ctl, &profile_id, &folder_id, &credential, sequence.as_deref().map(String::as_str))?;
                    Ok(IpcResponse::SequenceBound {
                        folder_id,
                        bound: sequence.is_some(),
                    })
                })
                .await
            }
            IpcRequest::ValidateIntegrity { profile_id, credential } => {
                let credential = credential.into_credential();
                self.run(&ctx, move |m, ctl| {
                    Ok(IpcResponse::Integrity(m.validate_integrity(ctl, &profile_id, &credential)?))
                })
                .await
            }
            IpcRequest::PasswordInput { text } => {
                let text = Zeroizing::new(text);
                if !self.state.sink.lock().type_sequence(&text) {
                    return Err(VaultError::PlatformUnsupported("sequence detector is not running".into()));
                }
                Ok(IpcResponse::InputAccepted)
            }
            IpcRequest::Cancel { request_id } => {
                let target = operation_id(&ctx.session_id, request_id);
                let found = self.state.cancel(&target);
                info!(operation_id = %target, found, "cancel requested");
                Ok(IpcResponse::CancelRequested { found })
            }
            IpcRequest::SystemLifecycle { event } => {
                self.run(&ctx, move |m, ctl| Ok(IpcResponse::LifecycleHandled(m.on_system_event(ctl, event)?)))
                    .await
            }
        }
    }
}

#[async_trait::async_trait]
impl<P: PlatformAdapter> IpcHandler for ServiceHandler<P> {
    async fn handle(&self, ctx: RequestContext, req: IpcRequest) -> IpcResponse {
        let request = req.name();
        let request_id = ctx.request_id;
        match self.dispatch(ctx, req).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    VaultError::IsolationViolation(_) => {
                        warn!(request, request_id, "request rejected: isolation violation")
                    }
                    e if e.is_auth_failure() => debug!(request, request_id, "authentication failed"),
                    e => warn!(request, request_id, error = %e, "request failed"),
                }
                IpcResponse::from(&err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phantom_core::detector::{keystroke_channel, CandidateSet, KeystrokeSink};
    use phantom_core::error::ErrorCode;
    use phantom_core::ipc::CredentialInput;
    use phantom_core::manager::ManagerConfig;
    use phantom_core::platform::{Capabilities, PlatformKind};
    use phantom_core::profile::ProfileStore;
    use phantom_core::settings::{DetectionScope, ServiceSettings};
    use phantom_core::throttle::AuthThrottle;
    use std::path::Path;
    use tempfile::tempdir;
    use tokio::sync::mpsc;

    struct TestPlatform;

    impl PlatformAdapter for TestPlatform {
        fn detect_capabilities(&self) -> Capabilities {
            Capabilities {
                platform: PlatformKind::current(),
                elevated: true,
                folder_hiding: true,
                keyboard_capture: false,
            }
        }
        fn is_elevated(&self) -> bool {
            true
        }
        fn restrict(&self, _path: &Path) -> VaultResult<()> {
            Ok(())
        }
        fn release(&self, _path: &Path, _permissions: u32) -> VaultResult<()> {
            Ok(())
        }
        fn register_keystroke_sink(&self, _sink: KeystrokeSink) -> VaultResult<()> {
            Err(VaultError::PlatformUnsupported("test".into()))
        }
    }

    fn handler(root: &Path) -> ServiceHandler<TestPlatform> {
        let settings = ServiceSettings::default();
        let candidates =
            CandidateSet::new(Zeroizing::new(vec![7u8; 32]), DetectionScope::Global).shared();
        let manager = ProfileVaultManager::new(
            ProfileStore::open(root).unwrap(),
            Arc::new(TestPlatform),
            ManagerConfig::from(&settings),
            candidates,
            AuthThrottle::new(&settings.auth),
        )
        .unwrap();
        let (sink, _rx) = keystroke_channel();
        let state = ServiceState::new(Arc::new(manager), &settings, sink, false, None);
        ServiceHandler::new(Arc::new(state))
    }

    fn ctx(request_id: u64) -> RequestContext {
        let (events, _rx) = mpsc::unbounded_channel();
        RequestContext {
            session_id: "s1".into(),
            client_id: "gui".into(),
            request_id,
            events,
        }
    }

    #[tokio::test]
    async fn wrong_password_maps_to_uniform_error() {
        let dir = tempdir().unwrap();
        let h = handler(dir.path());
        let created = h
            .handle(
                ctx(1),
                IpcRequest::CreateProfile {
                    name: "Work".into(),
                    password: "Str0ngPass!".into(),
                },
            )
            .await;
        let profile_id = match created {
            IpcResponse::ProfileCreated { profile_id, .. } => profile_id,
            other => panic!("unexpected {other:?}"),
        };

        let wrong = h
            .handle(
                ctx(2),
                IpcRequest::ListFolders {
                    profile_id,
                    credential: CredentialInput::Password("nope-nope".into()),
                },
            )
            .await;
        let unknown = h
            .handle(
                ctx(3),
                IpcRequest::ListFolders {
                    profile_id: "no-such-profile".into(),
                    credential: CredentialInput::Password("nope-nope".into()),
                },
            )
            .await;
        match (wrong, unknown) {
            (
                IpcResponse::Error { code: c1, message: m1 },
                IpcResponse::Error { code: c2, message: m2 },
            ) => {
                assert_eq!(c1, ErrorCode::AuthenticationFailed);
                assert_eq!(c1, c2);
                assert_eq!(m1, m2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_reports_counts_without_names() {
        let dir = tempdir().unwrap();
        let h = handler(dir.path());
        match h.handle(ctx(1), IpcRequest::GetStatus).await {
            IpcResponse::Status(status) => {
                assert_eq!(status.active_operations, 0);
                assert_eq!(status.exposed_folders, 0);
                assert!(!status.capabilities.keyboard_capture);
                assert!(!status.detector_running);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_of_unknown_request_is_reported() {
        let dir = tempdir().unwrap();
        let h = handler(dir.path());
        match h
            .handle(ctx(2), IpcRequest::Cancel { request_id: 1 })
            .await
        {
            IpcResponse::CancelRequested { found } => assert!(!found),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_reaches_only_the_callers_session() {
        let dir = tempdir().unwrap();
        let h = handler(dir.path());
        let foreign = OperationControl::new(operation_id("s2", 1), "ipc:gui");
        let own = OperationControl::new(operation_id("s1", 1), "ipc:gui");
        let _foreign_guard = h.state.register_operation(&foreign);

        match h.handle(ctx(2), IpcRequest::Cancel { request_id: 1 }).await {
            IpcResponse::CancelRequested { found } => assert!(!found),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!foreign.is_cancelled());

        let _own_guard = h.state.register_operation(&own);
        match h.handle(ctx(3), IpcRequest::Cancel { request_id: 1 }).await {
            IpcResponse::CancelRequested { found } => assert!(found),
            other => panic!("unexpected {other:?}"),
        }
        assert!(own.is_cancelled());
        assert!(!foreign.is_cancelled());
    }

    #[tokio::test]
    async fn password_input_without_detector_is_unsupported() {
        let dir = tempdir().unwrap();
        let h = handler(dir.path());
        // The receiver was dropped in `handler`, so the sink is disconnected.
        match h
            .handle(ctx(1), IpcRequest::PasswordInput { text: "Tsecret".into() })
            .await
        {
            IpcResponse::Error { code, .. } => assert_eq!(code, ErrorCode::PlatformUnsupported),
            other => panic!("unexpected {other:?}"),
        }
    }
}
