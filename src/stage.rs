//! The resumable install state machine.
//!
//! The last stage that completed is kept in a marker file on the bootstrap host, so a
//! rerun after a crash continues with the stage after it.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::error::{LaunchError, Result};
use crate::session::{argv, Transport};

pub const STAGE_MARKER_FILE: &str = "LAST_COMPLETED_STAGE";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum InstallStage {
    Setup,
    Genconf,
    Preflight,
    Deploy,
    Postflight,
}

impl InstallStage {
    pub const ALL: [InstallStage; 5] = [
        InstallStage::Setup,
        InstallStage::Genconf,
        InstallStage::Preflight,
        InstallStage::Deploy,
        InstallStage::Postflight,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InstallStage::Setup => "SETUP",
            InstallStage::Genconf => "GENCONF",
            InstallStage::Preflight => "PREFLIGHT",
            InstallStage::Deploy => "DEPLOY",
            InstallStage::Postflight => "POSTFLIGHT",
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            InstallStage::Setup => Some(InstallStage::Genconf),
            InstallStage::Genconf => Some(InstallStage::Preflight),
            InstallStage::Preflight => Some(InstallStage::Deploy),
            InstallStage::Deploy => Some(InstallStage::Postflight),
            InstallStage::Postflight => None,
        }
    }
}

impl fmt::Display for InstallStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstallStage {
    type Err = LaunchError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| LaunchError::UnknownStage(s.to_string()))
    }
}

/// Where the last completed stage is remembered.
#[async_trait]
pub trait StageStore: Send + Sync {
    /// `None` if no stage ever completed.
    async fn get_last_state(&self) -> Result<Option<InstallStage>>;

    async fn post_state(&self, stage: InstallStage) -> Result<()>;
}

/// Marker file in the SSH user's home directory on the bootstrap host.
pub struct RemoteStageStore<'a> {
    transport: &'a dyn Transport,
    host: String,
}

impl<'a> RemoteStageStore<'a> {
    pub fn new(transport: &'a dyn Transport, host: impl Into<String>) -> Self {
        Self {
            transport,
            host: host.into(),
        }
    }
}

#[async_trait]
impl StageStore for RemoteStageStore<'_> {
    async fn get_last_state(&self) -> Result<Option<InstallStage>> {
        let test = argv(&["test", "-f", STAGE_MARKER_FILE]);
        let output = self.transport.run(&self.host, &test).await?;
        match output.returncode {
            0 => {}
            // test(1) exits with 1 when the file does not exist.
            1 => return Ok(None),
            _ => {
                output.into_checked(&self.host, &test)?;
            }
        }
        let contents = self
            .transport
            .command(&self.host, &argv(&["cat", STAGE_MARKER_FILE]))
            .await?;
        String::from_utf8_lossy(&contents).parse().map(Some)
    }

    async fn post_state(&self, stage: InstallStage) -> Result<()> {
        self.transport
            .upload(&self.host, stage.as_str().as_bytes(), STAGE_MARKER_FILE)
            .await
    }
}

/// Work carried out for each stage.
#[async_trait]
pub trait StageWork: Send + Sync {
    async fn setup(&self) -> Result<()>;
    async fn genconf(&self) -> Result<()>;
    async fn preflight(&self) -> Result<()>;
    async fn deploy(&self) -> Result<()>;
    async fn postflight(&self) -> Result<()>;

    async fn run(&self, stage: InstallStage) -> Result<()> {
        match stage {
            InstallStage::Setup => self.setup().await,
            InstallStage::Genconf => self.genconf().await,
            InstallStage::Preflight => self.preflight().await,
            InstallStage::Deploy => self.deploy().await,
            InstallStage::Postflight => self.postflight().await,
        }
    }
}

pub struct StageMachine<'a> {
    store: &'a dyn StageStore,
    work: &'a dyn StageWork,
}

impl<'a> StageMachine<'a> {
    pub fn new(store: &'a dyn StageStore, work: &'a dyn StageWork) -> Self {
        Self { store, work }
    }

    async fn complete(&self, stage: InstallStage) -> Result<()> {
        tracing::info!(%stage, "Starting stage");
        self.work.run(stage).await?;
        self.store.post_state(stage).await?;
        tracing::info!(%stage, "Stage completed");
        Ok(())
    }

    /// Runs every stage after the last completed one. A no-op once POSTFLIGHT is done.
    pub async fn advance(&self) -> Result<()> {
        let mut current = match self.store.get_last_state().await? {
            Some(stage) => {
                tracing::info!(%stage, "Resuming after last completed stage");
                stage
            }
            None => {
                self.complete(InstallStage::Setup).await?;
                InstallStage::Setup
            }
        };
        while let Some(next) = current.next() {
            self.complete(next).await?;
            current = next;
        }
        match self.store.get_last_state().await? {
            Some(InstallStage::Postflight) => Ok(()),
            last => Err(LaunchError::InconsistentState(last)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct MemoryStore {
        stage: Mutex<Option<InstallStage>>,
        /// Posts are accepted but not stored.
        forgetful: bool,
    }

    #[async_trait]
    impl StageStore for MemoryStore {
        async fn get_last_state(&self) -> Result<Option<InstallStage>> {
            Ok(*self.stage.lock().unwrap())
        }

        async fn post_state(&self, stage: InstallStage) -> Result<()> {
            if !self.forgetful {
                *self.stage.lock().unwrap() = Some(stage);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingWork {
        ran: Mutex<Vec<InstallStage>>,
        fail_at: Option<InstallStage>,
    }

    impl RecordingWork {
        fn record(&self, stage: InstallStage) -> Result<()> {
            if self.fail_at == Some(stage) {
                return Err(LaunchError::validation("stage", "injected failure"));
            }
            self.ran.lock().unwrap().push(stage);
            Ok(())
        }
    }

    #[async_trait]
    impl StageWork for RecordingWork {
        async fn setup(&self) -> Result<()> {
            self.record(InstallStage::Setup)
        }
        async fn genconf(&self) -> Result<()> {
            self.record(InstallStage::Genconf)
        }
        async fn preflight(&self) -> Result<()> {
            self.record(InstallStage::Preflight)
        }
        async fn deploy(&self) -> Result<()> {
            self.record(InstallStage::Deploy)
        }
        async fn postflight(&self) -> Result<()> {
            self.record(InstallStage::Postflight)
        }
    }

    #[test]
    fn stage_text_round_trips_and_rejects_unknown() {
        for stage in InstallStage::ALL {
            assert_eq!(stage.as_str().parse::<InstallStage>().unwrap(), stage);
        }
        assert_eq!("DEPLOY\n".parse::<InstallStage>().unwrap(), InstallStage::Deploy);
        assert!(matches!(
            "INSTALLED".parse::<InstallStage>(),
            Err(LaunchError::UnknownStage(_))
        ));
        assert_eq!(InstallStage::Postflight.next(), None);
        assert!(InstallStage::Setup < InstallStage::Postflight);
    }

    #[tokio::test]
    async fn fresh_install_runs_every_stage_once() {
        let store = MemoryStore::default();
        let work = RecordingWork::default();
        StageMachine::new(&store, &work).advance().await.unwrap();
        assert_eq!(*work.ran.lock().unwrap(), InstallStage::ALL.to_vec());
        assert_eq!(*store.stage.lock().unwrap(), Some(InstallStage::Postflight));
    }

    #[tokio::test]
    async fn advance_is_idempotent_after_postflight() {
        let store = MemoryStore::default();
        let work = RecordingWork::default();
        StageMachine::new(&store, &work).advance().await.unwrap();
        let rerun = RecordingWork::default();
        StageMachine::new(&store, &rerun).advance().await.unwrap();
        assert!(rerun.ran.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_keeps_previous_marker_and_resume_continues() {
        let store = MemoryStore::default();
        let failing = RecordingWork {
            fail_at: Some(InstallStage::Preflight),
            ..Default::default()
        };
        assert!(StageMachine::new(&store, &failing).advance().await.is_err());
        assert_eq!(*store.stage.lock().unwrap(), Some(InstallStage::Genconf));

        let resumed = RecordingWork::default();
        StageMachine::new(&store, &resumed).advance().await.unwrap();
        assert_eq!(
            *resumed.ran.lock().unwrap(),
            [
                InstallStage::Preflight,
                InstallStage::Deploy,
                InstallStage::Postflight
            ]
        );
    }

    #[tokio::test]
    async fn lost_marker_is_inconsistent_state() {
        let store = MemoryStore {
            stage: Mutex::new(Some(InstallStage::Deploy)),
            forgetful: true,
        };
        let work = RecordingWork::default();
        let err = StageMachine::new(&store, &work).advance().await.unwrap_err();
        assert!(matches!(err, LaunchError::InconsistentState(Some(InstallStage::Deploy))));
    }
}
