use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::config::SandboxConfig;
use crate::error::ExecutionError;

/// Longest stderr excerpt carried into an error message
const MAX_ERROR_TAIL: usize = 2048;

/// Opaque "build an image, run it" capability.
#[tonic::async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Build `image` from the recipe file, using `context` as build context.
    async fn build(&self, image: &str, recipe: &Path, context: &Path)
        -> Result<(), ExecutionError>;

    /// Run `image` to completion. Non-zero exit is a failure.
    async fn run(&self, image: &str) -> Result<(), ExecutionError>;

    /// Best-effort cleanup once the job is done.
    async fn remove(&self, image: &str);
}

/// Builds and runs job images with the Docker CLI.
///
/// Containers run sandboxed:
/// - Network isolation (disabled by default)
/// - Dropped capabilities
/// - No privilege escalation
/// - Memory and CPU limits
#[derive(Debug, Clone)]
pub struct DockerEngine {
    config: SandboxConfig,
}

impl DockerEngine {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn build_args(image: &str, recipe: &Path, context: &Path) -> Vec<String> {
        vec![
            "build".to_string(),
            "-t".to_string(),
            image.to_string(),
            "-f".to_string(),
            recipe.display().to_string(),
            context.display().to_string(),
        ]
    }

    pub fn run_args(&self, image: &str) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".to_string()];

        if self.config.network_disabled {
            args.push("--network=none".to_string());
        }
        if let Some(ref limit) = self.config.memory_limit {
            args.push(format!("--memory={}", limit));
        }
        if let Some(ref limit) = self.config.cpu_limit {
            args.push(format!("--cpus={}", limit));
        }

        args.push("--cap-drop=ALL".to_string());
        args.push("--security-opt=no-new-privileges".to_string());

        args.push(image.to_string());
        args
    }

    /// Job output is discarded; only the tail of stderr is kept for the
    /// failure message.
    async fn docker(args: &[String]) -> Result<Finished, std::io::Error> {
        let mut child = Command::new("docker")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stderr = match child.stderr.take() {
            Some(pipe) => read_tail(pipe, MAX_ERROR_TAIL).await?,
            None => Vec::new(),
        };
        let status = child.wait().await?;
        Ok(Finished { status, stderr })
    }
}

/// Exit status plus the last few KiB of stderr.
#[derive(Debug)]
struct Finished {
    status: ExitStatus,
    stderr: Vec<u8>,
}

/// Drain `reader` to EOF holding on to at most the last `max` bytes.
async fn read_tail<R: AsyncRead + Unpin>(
    mut reader: R,
    max: usize,
) -> Result<Vec<u8>, std::io::Error> {
    let mut kept = Vec::with_capacity(max);
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(kept);
        }
        kept.extend_from_slice(&buf[..n]);
        if kept.len() > max {
            kept.drain(..kept.len() - max);
        }
    }
}

/// Turn a finished docker invocation into a stage result.
fn process_output(
    result: Result<Finished, std::io::Error>,
    stage: fn(String) -> ExecutionError,
) -> Result<(), ExecutionError> {
    match result {
        Ok(output) if output.status.success() => Ok(()),
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            let detail = if stderr.is_empty() {
                format!("exit code: {:?}", output.status.code())
            } else {
                format!(
                    "exit code: {:?}: {}",
                    output.status.code(),
                    tail(stderr, MAX_ERROR_TAIL)
                )
            };
            Err(stage(detail))
        }
        Err(e) => Err(stage(format!("failed to invoke docker: {}", e))),
    }
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

#[tonic::async_trait]
impl ContainerEngine for DockerEngine {
    async fn build(
        &self,
        image: &str,
        recipe: &Path,
        context: &Path,
    ) -> Result<(), ExecutionError> {
        tracing::info!(image, recipe = %recipe.display(), "Building job image");
        let args = Self::build_args(image, recipe, context);
        process_output(Self::docker(&args).await, ExecutionError::Build)
    }

    async fn run(&self, image: &str) -> Result<(), ExecutionError> {
        tracing::info!(image, "Running job container");
        let args = self.run_args(image);
        process_output(Self::docker(&args).await, ExecutionError::Run)
    }

    async fn remove(&self, image: &str) {
        if !self.config.remove_image {
            return;
        }
        let args = vec!["rmi".to_string(), "-f".to_string(), image.to_string()];
        if let Err(e) = process_output(Self::docker(&args).await, ExecutionError::Run) {
            tracing::debug!(image, error = %e, "Image cleanup failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;

    #[test]
    fn build_args_name_image_and_recipe() {
        let args = DockerEngine::build_args(
            "job-image-j1",
            &PathBuf::from("/tmp/ctx/Dockerfile"),
            &PathBuf::from("/tmp/ctx"),
        );
        assert_eq!(
            args,
            vec![
                "build",
                "-t",
                "job-image-j1",
                "-f",
                "/tmp/ctx/Dockerfile",
                "/tmp/ctx"
            ]
        );
    }

    #[test]
    fn run_args_apply_sandbox() {
        let engine = DockerEngine::new(SandboxConfig::default());
        let args = engine.run_args("job-image-j1");
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--cpus=1.0".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("job-image-j1"));
    }

    #[test]
    fn run_args_without_limits() {
        let engine = DockerEngine::new(SandboxConfig {
            network_disabled: false,
            memory_limit: None,
            cpu_limit: None,
            remove_image: false,
        });
        let args = engine.run_args("img");
        assert!(!args.iter().any(|a| a.starts_with("--network")));
        assert!(!args.iter().any(|a| a.starts_with("--memory")));
        assert!(!args.iter().any(|a| a.starts_with("--cpus")));
    }

    #[test]
    fn process_output_success() {
        let output = Finished {
            status: ExitStatus::from_raw(0),
            stderr: Vec::new(),
        };
        assert!(process_output(Ok(output), ExecutionError::Run).is_ok());
    }

    #[test]
    fn process_output_failure_carries_stderr() {
        let output = Finished {
            // exit code 2, encoded as a wait status
            status: ExitStatus::from_raw(2 << 8),
            stderr: b"no such step\n".to_vec(),
        };
        match process_output(Ok(output), ExecutionError::Build) {
            Err(ExecutionError::Build(msg)) => {
                assert!(msg.contains("Some(2)"));
                assert!(msg.contains("no such step"));
            }
            other => panic!("expected build failure, got {:?}", other),
        }
    }

    #[test]
    fn process_output_spawn_error() {
        let err = std::io::Error::new(std::io::ErrorKind::NotFound, "docker not found");
        assert!(matches!(
            process_output(Err(err), ExecutionError::Run),
            Err(ExecutionError::Run(_))
        ));
    }

    #[tokio::test]
    async fn read_tail_keeps_only_the_last_bytes() {
        let noisy: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();

        let kept = read_tail(&noisy[..], MAX_ERROR_TAIL).await.unwrap();

        assert_eq!(kept.len(), MAX_ERROR_TAIL);
        assert_eq!(kept[..], noisy[noisy.len() - MAX_ERROR_TAIL..]);
    }

    #[tokio::test]
    async fn read_tail_short_input_is_kept_whole() {
        let kept = read_tail(&b"step 3 failed"[..], MAX_ERROR_TAIL).await.unwrap();
        assert_eq!(kept, b"step 3 failed");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = "ééééé";
        let t = tail(text, 3);
        assert!(t.len() <= 3);
        assert!(text.ends_with(t));
    }
}
