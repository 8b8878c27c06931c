//! The apply state machine: serializes "apply a staged update" requests
//! against a single in-flight guarantee, and hands the actual deploy work
//! off to a blocking worker.
//!
//! Grounded on `progress_jsonl.rs`'s `Arc<tokio::sync::Mutex<...>>` state
//! cell and `commit.rs`'s `tokio::task::spawn_blocking` handoff pattern —
//! both used here since the deploy primitive itself does blocking
//! filesystem I/O.

use crate::checksum::Checksum;
use crate::deploy_primitive::{DeployOutcome, DeployPrimitive, OriginFile};
use crate::error::{Result, SysrootError};
use crate::sysroot::Sysroot;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// The apply state machine's states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyState {
    /// No update staged; `Apply` is rejected.
    Idle,
    /// An update is staged and ready; `Apply` will proceed.
    UpdateReady,
    /// An `Apply` call is in flight.
    ApplyingUpdate,
    /// The most recent `Apply` succeeded.
    UpdateApplied,
    /// The most recent `Apply` failed.
    Error,
}

/// The result of a successful `Apply`, available via
/// [`ApplyEngine::last_outcome`] once the state reaches `UpdateApplied`.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    /// The deployment the apply produced.
    pub deployment: crate::deployment::Deployment,
    /// Whether the boot generation's bootversion changed, i.e. whether a
    /// reboot is required to pick up the new deployment versus the system
    /// having been redeployed onto the same generation.
    pub bootver_changed: bool,
}

struct Inner {
    state: ApplyState,
    error: Option<String>,
    update_id: Option<String>,
    outcome: Option<ApplyOutcome>,
}

/// Owns the apply state machine for one osname. External callers
/// transition into `UpdateReady` (out of scope here — staging a fetched
/// update is its own concern) and reset out of `Error`/`UpdateApplied`
/// back to `Idle` by calling [`ApplyEngine::reset`].
pub struct ApplyEngine {
    inner: Arc<Mutex<Inner>>,
    osname: String,
}

impl std::fmt::Debug for ApplyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplyEngine").field("osname", &self.osname).finish()
    }
}

impl ApplyEngine {
    /// Construct an engine idle for `osname`.
    pub fn new(osname: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: ApplyState::Idle,
                error: None,
                update_id: None,
                outcome: None,
            })),
            osname: osname.into(),
        }
    }

    /// The current state.
    pub async fn state(&self) -> ApplyState {
        self.inner.lock().await.state
    }

    /// The last error message, if the state is [`ApplyState::Error`].
    pub async fn error_message(&self) -> Option<String> {
        self.inner.lock().await.error.clone()
    }

    /// The result of the most recent `Apply`, if the state is
    /// [`ApplyState::UpdateApplied`].
    pub async fn last_outcome(&self) -> Option<ApplyOutcome> {
        self.inner.lock().await.outcome.clone()
    }

    /// Stage `update_id` as ready to apply. Callers outside this crate are
    /// responsible for having already fetched/verified the corresponding
    /// commit into the repo.
    pub async fn mark_update_ready(&self, update_id: impl Into<String>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.state = ApplyState::UpdateReady;
        inner.update_id = Some(update_id.into());
        inner.error = None;
        Ok(())
    }

    /// Reset out of a terminal state (`UpdateApplied` or `Error`) back to
    /// `Idle`.
    pub async fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            ApplyState::UpdateApplied | ApplyState::Error => {
                inner.state = ApplyState::Idle;
                inner.error = None;
                inner.update_id = None;
                inner.outcome = None;
                Ok(())
            }
            other => Err(SysrootError::WrongState(format!(
                "cannot reset from {other:?}"
            ))),
        }
    }

    /// Apply the currently staged update. Rejects with `WrongState` unless
    /// the machine is in `UpdateReady`; otherwise transitions atomically to
    /// `ApplyingUpdate` and returns immediately — the deploy itself runs on
    /// a detached worker that lands the terminal state (`UpdateApplied` or
    /// `Error`) by locking `inner` on its own. Callers observe that landing
    /// through [`Self::state`], [`Self::error_message`] and
    /// [`Self::last_outcome`], not through this call's return value: the
    /// IPC call completes as soon as the state transition is visible,
    /// before any blocking I/O has happened.
    ///
    /// At most one `Apply` is ever in flight per engine: the transition out
    /// of `UpdateReady` and the mutex hold together make this true even
    /// under concurrent callers.
    pub async fn apply(
        &self,
        sysroot: Arc<std::sync::Mutex<Sysroot>>,
        primitive: Arc<dyn DeployPrimitive + Send + Sync>,
        csum: Checksum,
        origin: OriginFile,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ApplyState::UpdateReady {
            return Err(SysrootError::WrongState(format!(
                "apply requires UpdateReady, got {:?}",
                inner.state
            )));
        }
        inner.state = ApplyState::ApplyingUpdate;
        inner.outcome = None;
        drop(inner);

        let osname = self.osname.clone();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || -> Result<(DeployOutcome, u8)> {
                let sysroot = sysroot.lock().unwrap();
                let bootver_before = sysroot.boot().bootversion;
                let outcome = primitive.deploy(&sysroot, &osname, &csum, &origin)?;
                Ok((outcome, bootver_before))
            })
            .await;

            let mut inner = inner.lock().await;
            match result {
                Ok(Ok((outcome, bootver_before))) => {
                    let bootver_changed = outcome.boot.bootversion != bootver_before;
                    if !bootver_changed {
                        info!("system redeployed same boot version");
                    }
                    inner.state = ApplyState::UpdateApplied;
                    inner.error = None;
                    inner.outcome = Some(ApplyOutcome {
                        deployment: outcome.deployment,
                        bootver_changed,
                    });
                }
                Ok(Err(e)) => {
                    inner.state = ApplyState::Error;
                    inner.error = Some(e.to_string());
                }
                Err(join_err) => {
                    inner.state = ApplyState::Error;
                    inner.error = Some(format!("deploy worker panicked: {join_err}"));
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy_primitive::DeployOutcome;
    use crate::deployment::Deployment;
    use camino::Utf8Path;

    struct FakeDeployPrimitive;
    impl DeployPrimitive for FakeDeployPrimitive {
        fn deploy(
            &self,
            sysroot: &Sysroot,
            osname: &str,
            csum: &Checksum,
            _origin: &OriginFile,
        ) -> Result<DeployOutcome> {
            let deployment = Deployment::new(0, osname, csum.clone(), 0, csum.clone(), 0);
            let new_boot = crate::sysroot::BootPointer {
                bootversion: 1 - sysroot.boot().bootversion,
                subbootversion: 0,
            };
            sysroot.persist_generation(new_boot, std::slice::from_ref(&deployment))?;
            Ok(DeployOutcome {
                deployment: deployment.clone(),
                deployments: vec![deployment],
                boot: new_boot,
            })
        }
    }

    fn csum(b: u8) -> Checksum {
        Checksum::parse(&(b as char).to_string().repeat(64)).unwrap()
    }

    #[tokio::test]
    async fn apply_rejects_without_update_ready() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let mut sysroot = Sysroot::open(path).unwrap();
        sysroot.load().unwrap();
        let sysroot = Arc::new(std::sync::Mutex::new(sysroot));

        let engine = ApplyEngine::new("myos");
        let primitive: Arc<dyn DeployPrimitive + Send + Sync> = Arc::new(FakeDeployPrimitive);
        let origin = OriginFile::with_refspec("r:b");
        let result = engine.apply(sysroot, primitive, csum(b'a'), origin).await;
        assert!(matches!(result, Err(SysrootError::WrongState(_))));
    }

    #[tokio::test]
    async fn apply_returns_before_worker_lands_terminal_state() {
        let td = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(td.path()).unwrap();
        let mut sysroot = Sysroot::open(path).unwrap();
        sysroot.load().unwrap();
        let sysroot = Arc::new(std::sync::Mutex::new(sysroot));

        let engine = ApplyEngine::new("myos");
        engine.mark_update_ready("update-1").await.unwrap();
        assert_eq!(engine.state().await, ApplyState::UpdateReady);

        let primitive: Arc<dyn DeployPrimitive + Send + Sync> = Arc::new(FakeDeployPrimitive);
        let origin = OriginFile::with_refspec("r:b");
        engine
            .apply(Arc::clone(&sysroot), primitive, csum(b'a'), origin)
            .await
            .unwrap();

        // The call above has already returned; nothing has forced the
        // spawned worker to run yet, so the state transition to
        // `ApplyingUpdate` must already be visible on its own.
        assert_eq!(engine.state().await, ApplyState::ApplyingUpdate);

        let final_state = wait_for_terminal(&engine).await;
        assert_eq!(final_state, ApplyState::UpdateApplied);
        assert!(engine.error_message().await.is_none());

        let outcome = engine.last_outcome().await.unwrap();
        assert!(outcome.bootver_changed);

        engine.reset().await.unwrap();
        assert_eq!(engine.state().await, ApplyState::Idle);
        assert!(engine.last_outcome().await.is_none());
    }

    /// Poll until the engine lands in a terminal state, for tests that need
    /// to observe the eventual outcome of a detached apply worker.
    async fn wait_for_terminal(engine: &ApplyEngine) -> ApplyState {
        for _ in 0..200 {
            let state = engine.state().await;
            if matches!(state, ApplyState::UpdateApplied | ApplyState::Error) {
                return state;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        engine.state().await
    }
}
