use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

// Each integration test binary uses a different subset of these helpers.
#[allow(dead_code)]
pub struct TestContext {
    pub _temp_dir: TempDir,
    pub config_path: PathBuf,
    pub workspace_root: PathBuf,
    pub bin_path: PathBuf,
}

#[allow(dead_code)]
impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config_path = temp_dir.path().join("config.json");
        let workspace_root = temp_dir.path().join("work");

        let bin_path = PathBuf::from(env!("CARGO_BIN_EXE_updraft"));

        Self {
            _temp_dir: temp_dir,
            config_path,
            workspace_root,
            bin_path,
        }
    }

    pub fn cmd(&self) -> Command {
        let mut cmd = Command::new(&self.bin_path);
        cmd.env("UPDRAFT_CONFIG_PATH", &self.config_path);
        cmd.env("UPDRAFT_WORKSPACE_ROOT", &self.workspace_root);
        cmd.env_remove("UPDRAFT_ENDPOINTS");
        cmd.env_remove("UPDRAFT_TIMEOUT_SECS");
        cmd.env_remove("RUST_LOG");
        cmd.env("HOME", self._temp_dir.path());
        cmd.env("XDG_CONFIG_HOME", self._temp_dir.path().join("config"));
        cmd
    }

    pub fn run(&self, args: &[&str]) -> CommandOutput {
        self.cmd()
            .args(args)
            .stdin(std::process::Stdio::null())
            .output()
            .expect("Failed to run updraft")
            .into()
    }

    /// Workspace directories currently present under the workspace root.
    pub fn workspaces(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.workspace_root) {
            Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[allow(dead_code)]
pub fn metadata_json(version: &str, complete_url: &str) -> String {
    serde_json::json!({
        "program": {
            "name": "Acme",
            "version": version,
            "beta": "0",
            "changelog": "Faster startup",
            "downloadURL": "",
            "completeDownloadURL": complete_url
        }
    })
    .to_string()
}

pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub status: std::process::ExitStatus,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            status: output.status,
        }
    }
}

#[allow(dead_code)]
impl CommandOutput {
    pub fn assert_success(&self) -> &Self {
        if !self.status.success() {
            panic!(
                "Command failed with status {:?}\nstdout: {}\nstderr: {}",
                self.status.code(),
                self.stdout,
                self.stderr
            );
        }
        self
    }

    pub fn assert_code(&self, code: i32) -> &Self {
        assert_eq!(
            self.status.code(),
            Some(code),
            "Unexpected exit status\nstdout: {}\nstderr: {}",
            self.stdout,
            self.stderr
        );
        self
    }

    pub fn assert_stdout_contains(&self, text: &str) -> &Self {
        assert!(
            self.stdout.contains(text),
            "Stdout did not contain '{}'\nActual stdout: {}",
            text,
            self.stdout
        );
        self
    }

    pub fn assert_stderr_contains(&self, text: &str) -> &Self {
        assert!(
            self.stderr.contains(text),
            "Stderr did not contain '{}'\nActual stderr: {}",
            text,
            self.stderr
        );
        self
    }
}
