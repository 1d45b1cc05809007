//! Operating-system process capabilities: stopping the running application,
//! starting the installer and finding out which version is installed.

use crate::error::{Result, UpdateError};
use crate::version::{extract_version, Version};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What happened when a process was asked to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Terminated,
    NotRunning,
    StillRunning,
    Refused(String),
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Terminated => write!(f, "terminated"),
            Termination::NotRunning => write!(f, "not running"),
            Termination::StillRunning => write!(f, "still running after grace period"),
            Termination::Refused(reason) => write!(f, "refused: {}", reason),
        }
    }
}

pub trait ProcessControl: Send + Sync {
    /// Ask `pid` to exit. Never fails hard; every outcome is reported.
    fn terminate(&self, pid: u32) -> Termination;
}

pub trait Launcher: Send + Sync {
    /// Start `artifact` detached from this process and return its pid.
    fn launch(&self, artifact: &Path) -> Result<u32>;
}

/// Graceful termination: SIGTERM on Unix, `taskkill` without `/F` on Windows,
/// then wait up to `grace` for the process to disappear.
#[derive(Debug, Clone)]
pub struct SignalProcessControl {
    grace: Duration,
}

impl SignalProcessControl {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }

    fn wait_for_exit(&self, mut running: impl FnMut() -> bool) -> Termination {
        let start = Instant::now();
        loop {
            if !running() {
                return Termination::Terminated;
            }
            if start.elapsed() >= self.grace {
                return Termination::StillRunning;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(unix)]
impl ProcessControl for SignalProcessControl {
    fn terminate(&self, pid: u32) -> Termination {
        use nix::errno::Errno;
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        // 0 and negative values address process groups
        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => return Termination::Refused(format!("invalid pid {}", pid)),
        };
        let target = Pid::from_raw(raw);

        tracing::info!("Sending SIGTERM to pid {}", pid);
        match signal::kill(target, Signal::SIGTERM) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Termination::NotRunning,
            Err(e) => {
                tracing::warn!("Failed to send SIGTERM to {}: {}", pid, e);
                return Termination::Refused(e.to_string());
            }
        }

        self.wait_for_exit(|| !matches!(signal::kill(target, None::<Signal>), Err(Errno::ESRCH)))
    }
}

#[cfg(windows)]
impl ProcessControl for SignalProcessControl {
    fn terminate(&self, pid: u32) -> Termination {
        if !windows_process_exists(pid) {
            return Termination::NotRunning;
        }

        tracing::info!("Asking pid {} to exit", pid);
        let status = std::process::Command::new("taskkill")
            .args(["/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        match status {
            Ok(status) if status.success() => self.wait_for_exit(|| windows_process_exists(pid)),
            Ok(status) => Termination::Refused(format!("taskkill exited with {}", status)),
            Err(e) => Termination::Refused(e.to_string()),
        }
    }
}

#[cfg(windows)]
fn windows_process_exists(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {}", pid), "/NH"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// Starts the installer in its own process group with no inherited stdio,
/// using the directory that contains it as working directory.
#[derive(Debug, Clone, Default)]
pub struct DetachedLauncher;

impl Launcher for DetachedLauncher {
    fn launch(&self, artifact: &Path) -> Result<u32> {
        let artifact = std::fs::canonicalize(artifact)
            .map_err(|e| UpdateError::Launch(format!("{}: {}", artifact.display(), e)))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&artifact)
                .map_err(|e| UpdateError::Launch(format!("{}: {}", artifact.display(), e)))?
                .permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&artifact, perms).map_err(|e| {
                UpdateError::Launch(format!("could not mark {} executable: {}", artifact.display(), e))
            })?;
        }

        let mut command = launch_command(&artifact);
        let child = command
            .spawn()
            .map_err(|e| UpdateError::Launch(format!("failed to start {}: {}", artifact.display(), e)))?;

        tracing::info!("Started installer {} as pid {}", artifact.display(), child.id());
        Ok(child.id())
    }
}

#[cfg(unix)]
fn launch_command(artifact: &Path) -> std::process::Command {
    use std::os::unix::process::CommandExt;

    let mut command = std::process::Command::new(artifact);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0);
    if let Some(dir) = artifact.parent() {
        command.current_dir(dir);
    }
    command
}

/// `start` hands the installer to ShellExecute, which honours an elevation
/// request in its manifest. CreateProcess fails those with error 740.
/// The returned pid is that of the `cmd` shim.
#[cfg(windows)]
fn launch_command(artifact: &Path) -> std::process::Command {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

    // `start` does not understand verbatim `\\?\` paths
    let display = artifact.to_string_lossy();
    let target = display.strip_prefix(r"\\?\").unwrap_or(&display).to_string();

    let mut command = std::process::Command::new("cmd");
    command
        .args(["/C", "start", ""])
        .arg(&target)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
    if let Some(dir) = Path::new(&target).parent() {
        command.current_dir(dir);
    }
    command
}

/// Version of the installed application, without running it unless
/// `exec_arg` allows that as a fallback.
///
/// The file version in the PE version resource is tried first. Targets that
/// are not PE images only get a version when `exec_arg` is set, in which case
/// `path <exec_arg>` is run and its output searched.
pub async fn read_local_version(path: &Path, exec_arg: Option<&str>, timeout: Duration) -> Result<Version> {
    let image = path.to_path_buf();
    let embedded = tokio::task::spawn_blocking(move || read_embedded_version(&image))
        .await
        .map_err(|e| UpdateError::NoLocalVersion(format!("version lookup did not finish: {}", e)))?;

    match (embedded, exec_arg) {
        (Ok(version), _) => Ok(version),
        (Err(e), Some(arg)) => {
            tracing::info!("{}; asking the executable with {}", e, arg);
            read_executable_version(path, arg, timeout).await
        }
        (Err(e), None) => Err(e),
    }
}

/// File version from the `VS_VERSIONINFO` resource of a PE image.
pub fn read_embedded_version(path: &Path) -> Result<Version> {
    let failed = |reason: String| {
        UpdateError::NoLocalVersion(format!("could not read version of {}: {}", path.display(), reason))
    };

    let map = pelite::FileMap::open(path).map_err(|e| failed(e.to_string()))?;
    let resources = match pe64_resources(map.as_ref()) {
        Ok(resources) => resources,
        Err(_) => pe32_resources(map.as_ref())
            .map_err(|e| failed(format!("not a PE image with resources ({})", e)))?,
    };

    let info = resources
        .version_info()
        .map_err(|e| failed(format!("no version resource ({})", e)))?;
    let fixed = info
        .fixed()
        .ok_or_else(|| failed("version resource has no fixed file info".to_string()))?;
    let v = &fixed.dwFileVersion;
    let text = format!("{}.{}.{}.{}", v.Major, v.Minor, v.Patch, v.Build);

    let version = Version::parse(&text).map_err(|e| failed(e.to_string()))?;
    tracing::debug!("{} carries file version {}", path.display(), version);
    Ok(version)
}

fn pe64_resources(bytes: &[u8]) -> pelite::Result<pelite::resources::Resources<'_>> {
    use pelite::pe64::{Pe, PeFile};
    PeFile::from_bytes(bytes)?.resources()
}

fn pe32_resources(bytes: &[u8]) -> pelite::Result<pelite::resources::Resources<'_>> {
    use pelite::pe32::{Pe, PeFile};
    PeFile::from_bytes(bytes)?.resources()
}

/// Run `path <arg>` and pull the first dotted version out of its output.
async fn read_executable_version(path: &Path, arg: &str, timeout: Duration) -> Result<Version> {
    let failed = |reason: String| {
        UpdateError::NoLocalVersion(format!("could not read version of {}: {}", path.display(), reason))
    };

    let mut command = tokio::process::Command::new(path);
    command
        .arg(arg)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| failed(format!("no answer within {:?}", timeout)))?
        .map_err(|e| failed(e.to_string()))?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push('\n');
    text.push_str(&String::from_utf8_lossy(&output.stderr));

    let version = extract_version(&text).ok_or_else(|| failed("output contains no version".to_string()))?;
    tracing::debug!("{} reports version {}", path.display(), version);
    Ok(version)
}
