//! Docker CLI runtime.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{ContainerRuntime, ContainerStatus, RunSpec};
use crate::error::{ControlError, ControlResult};
use crate::types::ContainerHandle;

/// Seconds `docker stop` waits before killing.
const STOP_GRACE_SECS: u32 = 10;

/// Runs containers through the `docker` command line.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: PathBuf,
}

/// Captured result of one CLI call.
struct CliOutput {
    success: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl CliOutput {
    fn describe(&self) -> String {
        let code = self
            .code
            .map_or_else(|| "signal".to_owned(), |c| c.to_string());
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("exit {code}")
        } else {
            format!("exit {code}: {stderr}")
        }
    }

    fn is_missing(&self) -> bool {
        is_missing_message(&self.stderr)
    }
}

impl DockerRuntime {
    /// Create a runtime using `binary`.
    #[must_use]
    pub fn new(binary: impl AsRef<Path>) -> Self {
        Self {
            binary: binary.as_ref().to_path_buf(),
        }
    }

    async fn exec(&self, args: &[String]) -> std::io::Result<CliOutput> {
        debug!(binary = %self.binary.display(), args = ?args, "running container CLI");
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;
        Ok(CliOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

pub(crate) fn build_args(context: &Path, tag: &str) -> Vec<String> {
    vec![
        "build".to_owned(),
        "--quiet".to_owned(),
        "-t".to_owned(),
        tag.to_owned(),
        context.display().to_string(),
    ]
}

pub(crate) fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_owned(),
        "--detach".to_owned(),
        "--name".to_owned(),
        spec.name.clone(),
        "--publish".to_owned(),
        format!("{}:{}/tcp", spec.host_port, spec.container_port),
    ];
    for (key, value) in &spec.env {
        args.push("--env".to_owned());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &spec.labels {
        args.push("--label".to_owned());
        args.push(format!("{key}={value}"));
    }
    args.push(spec.image.clone());
    args
}

fn is_missing_message(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

fn parse_state(state: &str) -> ContainerStatus {
    match state.trim() {
        "running" | "restarting" => ContainerStatus::Running,
        _ => ContainerStatus::Exited,
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    #[instrument(skip(self, context), fields(context = %context.display()))]
    async fn build(&self, context: &Path, tag: &str) -> ControlResult<()> {
        let output = self
            .exec(&build_args(context, tag))
            .await
            .map_err(|e| ControlError::BuildFailed(format!("failed to spawn: {e}")))?;
        if !output.success {
            return Err(ControlError::BuildFailed(output.describe()));
        }
        Ok(())
    }

    #[instrument(skip(self, spec), fields(name = %spec.name, port = spec.host_port))]
    async fn run(&self, spec: &RunSpec) -> ControlResult<ContainerHandle> {
        let output = self
            .exec(&run_args(spec))
            .await
            .map_err(|e| ControlError::RunFailed(format!("failed to spawn: {e}")))?;
        if !output.success {
            return Err(ControlError::RunFailed(output.describe()));
        }
        let id = output.stdout.trim();
        if id.is_empty() {
            return Err(ControlError::RunFailed("runtime returned no container id".to_owned()));
        }
        Ok(ContainerHandle::new(id))
    }

    async fn stop(&self, handle: &ContainerHandle) -> ControlResult<()> {
        let args = vec![
            "stop".to_owned(),
            "--time".to_owned(),
            STOP_GRACE_SECS.to_string(),
            handle.to_string(),
        ];
        let output = self
            .exec(&args)
            .await
            .map_err(|e| ControlError::runtime(format!("failed to spawn: {e}")))?;
        if output.success || output.is_missing() {
            Ok(())
        } else {
            Err(ControlError::runtime(format!(
                "stop {handle}: {}",
                output.describe()
            )))
        }
    }

    async fn remove(&self, handle: &ContainerHandle) -> ControlResult<()> {
        let args = vec!["rm".to_owned(), "--force".to_owned(), handle.to_string()];
        let output = self
            .exec(&args)
            .await
            .map_err(|e| ControlError::runtime(format!("failed to spawn: {e}")))?;
        if output.success || output.is_missing() {
            Ok(())
        } else {
            Err(ControlError::runtime(format!(
                "remove {handle}: {}",
                output.describe()
            )))
        }
    }

    async fn inspect(&self, handle: &ContainerHandle) -> ControlResult<ContainerStatus> {
        let args = vec![
            "inspect".to_owned(),
            "--format".to_owned(),
            "{{.State.Status}}".to_owned(),
            handle.to_string(),
        ];
        let output = self
            .exec(&args)
            .await
            .map_err(|e| ControlError::runtime(format!("failed to spawn: {e}")))?;
        if output.success {
            Ok(parse_state(&output.stdout))
        } else if output.is_missing() {
            Ok(ContainerStatus::Missing)
        } else {
            Err(ControlError::runtime(format!(
                "inspect {handle}: {}",
                output.describe()
            )))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn run_args_publish_port_and_pass_identity() {
        let spec = RunSpec {
            image: "foundry-svc-1:latest".to_owned(),
            name: "foundry-svc-1-abc".to_owned(),
            host_port: 8001,
            container_port: 8000,
            env: vec![("SERVICE_ID".to_owned(), "svc-1".to_owned())],
            labels: vec![("foundry.id".to_owned(), "svc-1".to_owned())],
        };
        assert_eq!(
            run_args(&spec),
            vec![
                "run",
                "--detach",
                "--name",
                "foundry-svc-1-abc",
                "--publish",
                "8001:8000/tcp",
                "--env",
                "SERVICE_ID=svc-1",
                "--label",
                "foundry.id=svc-1",
                "foundry-svc-1:latest",
            ]
        );
    }

    #[test]
    fn build_args_tag_context() {
        assert_eq!(
            build_args(Path::new("/tmp/a"), "foundry-a:latest"),
            vec!["build", "--quiet", "-t", "foundry-a:latest", "/tmp/a"]
        );
    }

    #[rstest]
    #[case("Error: No such container: abc", true)]
    #[case("Error: No such object: abc", true)]
    #[case("Cannot connect to the Docker daemon", false)]
    fn missing_detection(#[case] stderr: &str, #[case] missing: bool) {
        assert_eq!(is_missing_message(stderr), missing);
    }

    #[rstest]
    #[case("running\n", ContainerStatus::Running)]
    #[case("exited", ContainerStatus::Exited)]
    #[case("created", ContainerStatus::Exited)]
    fn state_parsing(#[case] state: &str, #[case] expected: ContainerStatus) {
        assert_eq!(parse_state(state), expected);
    }

    #[tokio::test]
    async fn missing_binary_is_a_build_failure() {
        let runtime = DockerRuntime::new("/nonexistent/foundry-docker");
        let err = runtime
            .build(Path::new("/tmp"), "foundry-x:latest")
            .await
            .unwrap_err();
        assert!(matches!(err, ControlError::BuildFailed(_)));
    }
}
