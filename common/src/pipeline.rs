//! Local process pipelines
//!
//! A [`Pipeline`] is a list of argv stages. Spawning it starts one process per stage and
//! connects each stage's stdout to the next stage's stdin with an OS pipe, without going
//! through a shell. [`Pipeline::to_shell_line`] renders the same pipeline as a quoted
//! shell line for the cases where it has to run on the other side of an `ssh` session.

use anyhow::{Context, anyhow};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Vec<String>>,
}

impl Pipeline {
    pub fn new(first: Vec<String>) -> Self {
        Self {
            stages: vec![first],
        }
    }

    /// Append a stage reading the output of the current last stage
    #[must_use]
    pub fn pipe(mut self, stage: Vec<String>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn stages(&self) -> &[Vec<String>] {
        &self.stages
    }

    /// Render as `a b | c d` with every word quoted for a POSIX shell
    pub fn to_shell_line(&self) -> anyhow::Result<String> {
        let stages = self
            .stages
            .iter()
            .map(|stage| {
                shlex::try_join(stage.iter().map(String::as_str))
                    .with_context(|| format!("cannot quote command {stage:?} for a shell"))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(stages.join(" | "))
    }

    /// Start all stages, the last one writes to the inherited stdout
    pub fn spawn(&self) -> anyhow::Result<RunningPipeline> {
        self.spawn_with_stdout(std::process::Stdio::inherit())
    }

    /// Run to completion and collect the output of the last stage
    pub async fn output(&self) -> anyhow::Result<(PipelineStatus, Vec<u8>)> {
        use tokio::io::AsyncReadExt;
        let mut running = self.spawn_with_stdout(std::process::Stdio::piped())?;
        let mut stdout = running
            .stages
            .last_mut()
            .and_then(|stage| stage.child.stdout.take())
            .context("pipeline output was not captured")?;
        let mut buffer = Vec::new();
        stdout
            .read_to_end(&mut buffer)
            .await
            .with_context(|| format!("failed reading output of `{self}`"))?;
        let status = running.wait().await?;
        Ok((status, buffer))
    }

    fn spawn_with_stdout(&self, stdout: std::process::Stdio) -> anyhow::Result<RunningPipeline> {
        let last = self.stages.len() - 1;
        let mut upstream: Option<std::process::Stdio> = None;
        let mut last_stdout = Some(stdout);
        let mut stages = Vec::with_capacity(self.stages.len());
        for (idx, stage) in self.stages.iter().enumerate() {
            let (program, args) = stage
                .split_first()
                .ok_or_else(|| anyhow!("stage {idx} of `{self}` has no program"))?;
            let mut command = tokio::process::Command::new(program);
            command
                .args(args)
                .stdin(upstream.take().unwrap_or_else(std::process::Stdio::null))
                .kill_on_drop(true);
            if idx == last {
                if let Some(stdout) = last_stdout.take() {
                    command.stdout(stdout);
                }
            } else {
                command.stdout(std::process::Stdio::piped());
            }
            tracing::trace!("spawning {:?}", stage);
            let mut child = command
                .spawn()
                .with_context(|| format!("failed spawning {program:?}"))?;
            if idx != last {
                let stdout = child
                    .stdout
                    .take()
                    .with_context(|| format!("stdout of {program:?} was not captured"))?;
                let stdio: std::process::Stdio = stdout
                    .try_into()
                    .with_context(|| format!("failed connecting stdout of {program:?}"))?;
                upstream = Some(stdio);
            }
            stages.push(RunningStage {
                command: stage.join(" "),
                child,
            });
        }
        Ok(RunningPipeline { stages })
    }
}

impl std::fmt::Display for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let stages: Vec<String> = self.stages.iter().map(|stage| stage.join(" ")).collect();
        write!(f, "{}", stages.join(" | "))
    }
}

#[derive(Debug)]
struct RunningStage {
    command: String,
    child: tokio::process::Child,
}

/// Handle to the processes of a spawned [`Pipeline`]
///
/// Dropping it kills every stage that is still running.
#[derive(Debug)]
pub struct RunningPipeline {
    stages: Vec<RunningStage>,
}

impl RunningPipeline {
    /// First stage that has already terminated, if any
    pub fn try_exited(&mut self) -> anyhow::Result<Option<StageStatus>> {
        for stage in &mut self.stages {
            if let Some(status) = stage
                .child
                .try_wait()
                .with_context(|| format!("failed polling `{}`", stage.command))?
            {
                return Ok(Some(StageStatus {
                    command: stage.command.clone(),
                    status,
                }));
            }
        }
        Ok(None)
    }

    /// Send a kill signal to every stage that is still running
    pub fn start_kill(&mut self) {
        for stage in &mut self.stages {
            if let Err(error) = stage.child.start_kill() {
                tracing::trace!("not killing `{}`: {}", stage.command, error);
            }
        }
    }

    /// Wait for every stage to terminate
    pub async fn wait(self) -> anyhow::Result<PipelineStatus> {
        let waits = self.stages.into_iter().map(|mut stage| async move {
            let status = stage
                .child
                .wait()
                .await
                .with_context(|| format!("failed waiting for `{}`", stage.command))?;
            tracing::debug!("`{}` finished with {}", stage.command, status);
            Ok::<_, anyhow::Error>(StageStatus {
                command: stage.command,
                status,
            })
        });
        let stages = futures::future::try_join_all(waits).await?;
        Ok(PipelineStatus { stages })
    }
}

#[derive(Debug, Clone)]
pub struct StageStatus {
    pub command: String,
    pub status: std::process::ExitStatus,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "`{}` {}", self.command, self.status)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineStatus {
    stages: Vec<StageStatus>,
}

impl PipelineStatus {
    pub fn success(&self) -> bool {
        self.stages.iter().all(|stage| stage.status.success())
    }

    /// First stage that exited unsuccessfully
    pub fn failed(&self) -> Option<&StageStatus> {
        self.stages.iter().find(|stage| !stage.status.success())
    }

    pub fn stages(&self) -> &[StageStatus] {
        &self.stages
    }
}
