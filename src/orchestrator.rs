//! Update state machine: check, download, finalize.
//!
//! Work runs on background tokio tasks which report through an unbounded
//! channel. Messages are applied to the state machine only inside
//! [`UpdateOrchestrator::next_event`], so the caller always observes state
//! changes in order and the tasks never touch orchestrator state directly.

use crate::error::{Result, UpdateError};
use crate::metadata::{MetadataFetcher, UpdateInfo};
use crate::process::{
    read_local_version, DetachedLauncher, Launcher, ProcessControl, SignalProcessControl,
    Termination,
};
use crate::transfer::{CancelFlag, Transfer, TransferOutcome, TransferRequest};
use crate::types::UpdraftSettings;
use crate::version::Version;
use crate::workspace::WorkspaceManager;
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

/// Validated invocation parameters for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateParams {
    pub endpoints: Vec<String>,
    pub pids: Vec<u32>,
    pub executable: Option<PathBuf>,
    pub local_version: Option<Version>,
}

impl UpdateParams {
    pub fn new(
        endpoints: Vec<String>,
        pids: Option<Vec<u32>>,
        executable: Option<PathBuf>,
        local_version: Option<&str>,
    ) -> Result<Self> {
        let pids = pids.ok_or_else(|| {
            UpdateError::Config("the list of process ids to terminate (--pids) is required".to_string())
        })?;
        let mut params = Self::check_only(endpoints, executable, local_version)?;
        params.pids = pids;
        Ok(params)
    }

    /// Parameters for a run that never gets past the check.
    pub fn check_only(
        endpoints: Vec<String>,
        executable: Option<PathBuf>,
        local_version: Option<&str>,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(UpdateError::Config(
                "no metadata endpoints given (use --endpoint or the 'endpoints' setting)".to_string(),
            ));
        }
        let local_version = local_version
            .map(|text| {
                Version::parse(text)
                    .map_err(|e| UpdateError::Config(format!("invalid --local-version: {}", e)))
            })
            .transpose()?;

        Ok(Self {
            endpoints,
            pids: Vec::new(),
            executable,
            local_version,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckFailure {
    Unreachable(String),
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    NoLocalVersion(String),
    CheckFailed(CheckFailure),
    Workspace(String),
    Transfer(String),
    Launch(String),
    Interrupted(String),
}

impl FailureReason {
    fn from_check_error(error: UpdateError) -> Self {
        match error {
            UpdateError::MetadataParse { .. } => {
                FailureReason::CheckFailed(CheckFailure::Malformed(error.to_string()))
            }
            other => FailureReason::CheckFailed(CheckFailure::Unreachable(other.to_string())),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoLocalVersion(cause) => write!(f, "local version unknown: {}", cause),
            FailureReason::CheckFailed(CheckFailure::Unreachable(cause))
            | FailureReason::CheckFailed(CheckFailure::Malformed(cause)) => {
                write!(f, "update check failed: {}", cause)
            }
            FailureReason::Workspace(cause) => write!(f, "could not prepare workspace: {}", cause),
            FailureReason::Transfer(cause) => write!(f, "download failed: {}", cause),
            FailureReason::Launch(cause) => write!(f, "could not start installer: {}", cause),
            FailureReason::Interrupted(cause) => write!(f, "update interrupted: {}", cause),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    Idle,
    Checking,
    UpToDate {
        local: Version,
        remote: Version,
    },
    UpdateAvailable {
        local: Version,
        info: UpdateInfo,
    },
    Downloading {
        version: Version,
    },
    /// `installer_pid` is set once the installer has been started.
    Finalizing {
        artifact: PathBuf,
        workspace: PathBuf,
        installer_pid: Option<u32>,
    },
    Cancelled,
    Failed(FailureReason),
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        match self {
            UpdateState::UpToDate { .. } | UpdateState::Cancelled | UpdateState::Failed(_) => true,
            UpdateState::Finalizing { installer_pid, .. } => installer_pid.is_some(),
            _ => false,
        }
    }

    /// Waiting on the caller rather than on a background task.
    fn is_settled(&self) -> bool {
        self.is_terminal() || matches!(self, UpdateState::Idle | UpdateState::UpdateAvailable { .. })
    }
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateState::Idle => write!(f, "idle"),
            UpdateState::Checking => write!(f, "checking"),
            UpdateState::UpToDate { local, .. } => write!(f, "up to date ({})", local),
            UpdateState::UpdateAvailable { info, .. } => write!(f, "update available ({})", info.version),
            UpdateState::Downloading { version } => write!(f, "downloading {}", version),
            UpdateState::Finalizing { .. } => write!(f, "finalizing"),
            UpdateState::Cancelled => write!(f, "cancelled"),
            UpdateState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateEvent {
    State(UpdateState),
    Progress(u8),
    ProcessTerminated { pid: u32, outcome: Termination },
}

#[derive(Debug)]
enum TaskMessage {
    Checked(std::result::Result<(Version, UpdateInfo), FailureReason>),
    WorkspaceReady(PathBuf),
    Progress(u8),
    Downloaded { artifact: PathBuf },
    DownloadCancelled,
    DownloadFailed(FailureReason),
    Terminated { pid: u32, outcome: Termination },
    Launched(std::result::Result<u32, String>),
}

pub struct UpdateOrchestrator {
    params: UpdateParams,
    fetcher: MetadataFetcher,
    transfer: Transfer,
    workspaces: WorkspaceManager,
    process_control: Arc<dyn ProcessControl>,
    launcher: Arc<dyn Launcher>,
    artifact_extension: String,
    version_exec_arg: Option<String>,
    timeout: Duration,
    state: UpdateState,
    workspace: Option<PathBuf>,
    cancel: CancelFlag,
    pending: VecDeque<UpdateEvent>,
    inbox: Option<UnboundedReceiver<TaskMessage>>,
    task: Option<JoinHandle<()>>,
}

impl UpdateOrchestrator {
    pub fn from_settings(params: UpdateParams, settings: &UpdraftSettings) -> Result<Self> {
        let timeout = settings.network_timeout();
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .connect_timeout(timeout)
            .build()
            .map_err(|e| UpdateError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            params,
            fetcher: MetadataFetcher::new(client.clone(), timeout),
            transfer: Transfer::new(client, settings.chunk_size, timeout),
            workspaces: WorkspaceManager::new(settings.workspace_root()),
            process_control: Arc::new(SignalProcessControl::new(settings.termination_grace())),
            launcher: Arc::new(DetachedLauncher),
            artifact_extension: settings.artifact_extension.clone(),
            version_exec_arg: settings
                .version_from_exec
                .then(|| settings.version_arg.clone()),
            timeout,
            state: UpdateState::Idle,
            workspace: None,
            cancel: CancelFlag::new(),
            pending: VecDeque::new(),
            inbox: None,
            task: None,
        })
    }

    #[cfg(test)]
    pub fn with_process_control(mut self, control: Arc<dyn ProcessControl>) -> Self {
        self.process_control = control;
        self
    }

    #[cfg(test)]
    pub fn with_launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    pub fn cancel(&self) {
        tracing::info!("Cancellation requested");
        self.cancel.cancel();
    }

    pub fn start_check(&mut self) -> Result<()> {
        match self.state {
            UpdateState::Idle => {}
            UpdateState::Checking => return Err(UpdateError::Busy),
            ref other => return Err(self.invalid("start_check", other)),
        }

        let local = self.params.local_version.clone();
        let executable = self.params.executable.clone();
        if local.is_none() && executable.is_none() {
            self.transition(UpdateState::Failed(FailureReason::NoLocalVersion(
                "neither a local version nor an executable was given".to_string(),
            )));
            return Ok(());
        }

        self.transition(UpdateState::Checking);

        let (tx, rx) = mpsc::unbounded_channel();
        let fetcher = self.fetcher.clone();
        let endpoints = self.params.endpoints.clone();
        let version_exec_arg = self.version_exec_arg.clone();
        let timeout = self.timeout;

        self.inbox = Some(rx);
        self.task = Some(tokio::spawn(async move {
            let result = check(fetcher, endpoints, local, executable, version_exec_arg, timeout).await;
            let _ = tx.send(TaskMessage::Checked(result));
        }));
        Ok(())
    }

    /// The user turned the offered update down.
    pub fn decline(&mut self) -> Result<()> {
        match self.state {
            UpdateState::UpdateAvailable { .. } => {
                self.transition(UpdateState::Cancelled);
                Ok(())
            }
            ref other => Err(self.invalid("decline", other)),
        }
    }

    pub fn start_download(&mut self) -> Result<()> {
        let info = match &self.state {
            UpdateState::UpdateAvailable { info, .. } => info.clone(),
            UpdateState::Downloading { .. } | UpdateState::Finalizing { installer_pid: None, .. } => {
                return Err(UpdateError::Busy)
            }
            other => return Err(self.invalid("start_download", other)),
        };

        // The check task has already delivered its only message.
        self.inbox = None;
        self.task = None;

        let job = DownloadJob {
            request_url: info.artifact_url(&self.artifact_extension),
            file_name: info.artifact_file_name(&self.artifact_extension),
            pids: self.params.pids.clone(),
            cancel: self.cancel.clone(),
            transfer: self.transfer.clone(),
            workspaces: self.workspaces.clone(),
            process_control: Arc::clone(&self.process_control),
            launcher: Arc::clone(&self.launcher),
        };

        self.transition(UpdateState::Downloading {
            version: info.version.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        self.inbox = Some(rx);
        self.task = Some(tokio::spawn(job.run(tx)));
        Ok(())
    }

    /// Stop the background task without waiting for it to notice the cancel
    /// flag, then remove whatever workspace it created.
    ///
    /// A finalize step that already started keeps running on its blocking
    /// thread. The run ends as `Failed(Interrupted)` unless it had already
    /// reached a terminal state.
    pub async fn abort(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(mut inbox) = self.inbox.take() {
            while let Ok(message) = inbox.try_recv() {
                if let TaskMessage::WorkspaceReady(path) = message {
                    self.workspace = Some(path);
                }
            }
        }

        if self.state.is_terminal() {
            return;
        }
        tracing::warn!("Aborting while {}", self.state);
        self.fail(FailureReason::Interrupted("aborted by the user".to_string()));
    }

    /// Next event of the run, or `None` once nothing is pending and no task
    /// is running.
    pub async fn next_event(&mut self) -> Option<UpdateEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            let inbox = self.inbox.as_mut()?;
            match inbox.recv().await {
                Some(message) => self.apply(message),
                None => self.task_closed().await,
            }
        }
    }

    fn apply(&mut self, message: TaskMessage) {
        match message {
            TaskMessage::Checked(Ok((local, info))) => {
                if info.version > local {
                    tracing::info!("Update available: {} -> {}", local, info.version);
                    self.transition(UpdateState::UpdateAvailable { local, info });
                } else {
                    tracing::info!("Up to date: local {} remote {}", local, info.version);
                    self.transition(UpdateState::UpToDate {
                        local,
                        remote: info.version,
                    });
                }
            }
            TaskMessage::Checked(Err(reason)) => self.fail(reason),
            TaskMessage::WorkspaceReady(path) => self.workspace = Some(path),
            TaskMessage::Progress(percent) => self.pending.push_back(UpdateEvent::Progress(percent)),
            TaskMessage::Downloaded { artifact } => {
                let workspace = self
                    .workspace
                    .clone()
                    .or_else(|| artifact.parent().map(Path::to_path_buf))
                    .unwrap_or_default();
                self.transition(UpdateState::Finalizing {
                    artifact,
                    workspace,
                    installer_pid: None,
                });
            }
            TaskMessage::DownloadCancelled => {
                self.discard_workspace();
                self.transition(UpdateState::Cancelled);
            }
            TaskMessage::DownloadFailed(reason) => self.fail(reason),
            TaskMessage::Terminated { pid, outcome } => {
                tracing::info!("Process {}: {}", pid, outcome);
                self.pending
                    .push_back(UpdateEvent::ProcessTerminated { pid, outcome });
            }
            TaskMessage::Launched(Ok(pid)) => {
                if let UpdateState::Finalizing {
                    artifact, workspace, ..
                } = &self.state
                {
                    let next = UpdateState::Finalizing {
                        artifact: artifact.clone(),
                        workspace: workspace.clone(),
                        installer_pid: Some(pid),
                    };
                    self.transition(next);
                }
            }
            TaskMessage::Launched(Err(cause)) => self.fail(FailureReason::Launch(cause)),
        }
    }

    async fn task_closed(&mut self) {
        // Only drop the handle once awaited, next_event may be cancelled here.
        let outcome = match self.task.as_mut() {
            Some(handle) => handle.await,
            None => Ok(()),
        };
        self.task = None;
        self.inbox = None;

        if self.state.is_settled() {
            return;
        }

        let cause = match outcome {
            Err(e) if e.is_panic() => "background task panicked".to_string(),
            Err(e) => format!("background task ended: {}", e),
            Ok(()) => format!("background task stopped while {}", self.state),
        };
        tracing::error!("{}", cause);
        self.fail(FailureReason::Interrupted(cause));
    }

    fn fail(&mut self, reason: FailureReason) {
        tracing::warn!("Update failed: {}", reason);
        self.discard_workspace();
        self.transition(UpdateState::Failed(reason));
    }

    fn discard_workspace(&mut self) {
        if let Some(path) = self.workspace.take() {
            self.workspaces.destroy(&path);
        }
    }

    fn transition(&mut self, next: UpdateState) {
        tracing::debug!("State {} -> {}", self.state, next);
        self.state = next.clone();
        self.pending.push_back(UpdateEvent::State(next));
    }

    fn invalid(&self, action: &'static str, state: &UpdateState) -> UpdateError {
        UpdateError::InvalidState {
            action,
            state: state.to_string(),
        }
    }
}

async fn check(
    fetcher: MetadataFetcher,
    endpoints: Vec<String>,
    local: Option<Version>,
    executable: Option<PathBuf>,
    version_exec_arg: Option<String>,
    timeout: Duration,
) -> std::result::Result<(Version, UpdateInfo), FailureReason> {
    let local = match (local, executable) {
        (Some(version), _) => version,
        (None, Some(exe)) => read_local_version(&exe, version_exec_arg.as_deref(), timeout)
            .await
            .map_err(|e| FailureReason::NoLocalVersion(e.to_string()))?,
        (None, None) => {
            return Err(FailureReason::NoLocalVersion(
                "no local version available".to_string(),
            ))
        }
    };

    let info = fetcher
        .fetch(&endpoints)
        .await
        .map_err(FailureReason::from_check_error)?;
    Ok((local, info))
}

struct DownloadJob {
    request_url: String,
    file_name: String,
    pids: Vec<u32>,
    cancel: CancelFlag,
    transfer: Transfer,
    workspaces: WorkspaceManager,
    process_control: Arc<dyn ProcessControl>,
    launcher: Arc<dyn Launcher>,
}

impl DownloadJob {
    async fn run(self, tx: UnboundedSender<TaskMessage>) {
        if self.cancel.is_cancelled() {
            let _ = tx.send(TaskMessage::DownloadCancelled);
            return;
        }

        let workspace = match self.workspaces.create() {
            Ok(workspace) => workspace,
            Err(e) => {
                let _ = tx.send(TaskMessage::DownloadFailed(FailureReason::Workspace(e.to_string())));
                return;
            }
        };
        let _ = tx.send(TaskMessage::WorkspaceReady(workspace.path().to_path_buf()));

        let request = TransferRequest {
            source_url: self.request_url,
            destination: workspace.artifact_path(&self.file_name),
        };

        let progress = tx.clone();
        let outcome = self
            .transfer
            .run(&request, &self.cancel, |percent| {
                let _ = progress.send(TaskMessage::Progress(percent));
            })
            .await;

        match outcome {
            Ok(TransferOutcome::Completed { bytes }) => {
                tracing::debug!("Artifact complete: {} bytes", bytes);
            }
            Ok(TransferOutcome::Cancelled) => {
                let _ = tx.send(TaskMessage::DownloadCancelled);
                return;
            }
            Err(e) => {
                let _ = tx.send(TaskMessage::DownloadFailed(FailureReason::Transfer(e.to_string())));
                return;
            }
        }

        let artifact = request.destination;
        let _ = tx.send(TaskMessage::Downloaded {
            artifact: artifact.clone(),
        });

        let process_control = self.process_control;
        let launcher = self.launcher;
        let pids = self.pids;
        let finalize = tokio::task::spawn_blocking(move || {
            for pid in pids {
                let outcome = process_control.terminate(pid);
                let _ = tx.send(TaskMessage::Terminated { pid, outcome });
            }
            let launched = launcher.launch(&artifact).map_err(|e| e.to_string());
            let _ = tx.send(TaskMessage::Launched(launched));
        });

        if let Err(e) = finalize.await {
            tracing::error!("Finalize step did not complete: {}", e);
        }
    }
}
