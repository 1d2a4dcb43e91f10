//! Transfer orchestration
//!
//! Executes a [`ReplicationPlan`] one step at a time. Every step is a `zfs send` on the
//! source feeding a `zfs receive -F` on the destination, either as a single local
//! pipeline through a pass-through relay program ([`Transport::Ssh`]) or through two
//! `mbuffer` relays talking TCP over the coordination port ([`Transport::Mbuffer`]).
//! Steps extend one incremental chain, so the first failing step ends the run.

use common::pipeline::{Pipeline, StageStatus};
use common::plan::{ReplicationPlan, ReplicationStep};
use remote::Endpoint;
use remote::relay::{self, ReadinessError};
use tracing::instrument;

pub const DEFAULT_PIPE_RELAY: &str = "dd bs=128k";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Transport {
    /// Buffered relay: `mbuffer` listening on the destination, `mbuffer` sending from the source
    #[default]
    Mbuffer,
    /// Piped transfer: `zfs send | relay | zfs receive` driven from this host
    Ssh,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub transport: Transport,
    /// `zfs` binary on both endpoints
    pub zfs: String,
    /// Pass `-v` to `zfs receive`
    pub verbose_receive: bool,
    /// Pass-through program between send and receive for the piped transport
    pub pipe_relay: Vec<String>,
    pub relay: relay::RelaySettings,
    /// Host the sending relay connects to, defaults to the destination host
    pub relay_address: Option<String>,
    pub readiness: relay::ReadinessSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            zfs: remote::DEFAULT_ZFS.to_string(),
            verbose_receive: false,
            pipe_relay: DEFAULT_PIPE_RELAY
                .split_whitespace()
                .map(str::to_string)
                .collect(),
            relay: relay::RelaySettings::default(),
            relay_address: None,
            readiness: relay::ReadinessSettings::default(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub snapshots_present: usize,
    pub full_sends: usize,
    pub incremental_sends: usize,
}

impl Summary {
    /// Counts for one completed step
    pub fn of_step(step: &ReplicationStep) -> Self {
        if step.is_incremental() {
            Self {
                incremental_sends: 1,
                ..Default::default()
            }
        } else {
            Self {
                full_sends: 1,
                ..Default::default()
            }
        }
    }
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            snapshots_present: self.snapshots_present + other.snapshots_present,
            full_sends: self.full_sends + other.full_sends,
            incremental_sends: self.incremental_sends + other.incremental_sends,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "snapshots already present: {}\n\
            full sends: {}\n\
            incremental sends: {}",
            self.snapshots_present, self.full_sends, self.incremental_sends,
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferFailure {
    #[error("transfer of {step} failed: {stage}")]
    Command { step: String, stage: StageStatus },
    #[error("receiver for {step} exited before listening on port {port}: {stage}")]
    ReceiverExited {
        step: String,
        port: u16,
        stage: StageStatus,
    },
    #[error("receiver for {step} is not listening on port {port}: {reason}")]
    ListenerNotReady {
        step: String,
        port: u16,
        reason: String,
    },
}

/// Error type for transfers that preserves the summary of the steps completed before it.
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

/// `zfs send` of the step's target, incremental from its predecessor when there is one
pub fn send_args(zfs: &str, source: &Endpoint, step: &ReplicationStep) -> Vec<String> {
    let mut args = vec![zfs.to_string(), "send".to_string()];
    if let Some(predecessor) = &step.predecessor {
        args.extend(["-i".to_string(), source.snapshot(&predecessor.name)]);
    }
    args.push(source.snapshot(&step.target.name));
    args
}

/// `zfs receive -F` into the destination filesystem
pub fn receive_args(zfs: &str, destination: &Endpoint, verbose: bool) -> Vec<String> {
    vec![
        zfs.to_string(),
        "receive".to_string(),
        if verbose { "-Fv" } else { "-F" }.to_string(),
        destination.filesystem().to_string(),
    ]
}

/// Host the sending relay connects to.
pub fn relay_address(
    settings: &Settings,
    source: &Endpoint,
    destination: &Endpoint,
) -> anyhow::Result<String> {
    if let Some(address) = &settings.relay_address {
        return Ok(address.clone());
    }
    match destination.host() {
        Some(host) => Ok(host.to_string()),
        None if !source.is_remote() => Ok("localhost".to_string()),
        None => Err(anyhow::anyhow!(
            "destination {} is local to this host but the source {} is not, \
            a relay address reachable from the source is required",
            destination,
            source
        )),
    }
}

/// Processes started for one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepCommands {
    Piped(Pipeline),
    Buffered { receiver: Pipeline, sender: Pipeline },
}

pub fn step_commands(
    step: &ReplicationStep,
    source: &Endpoint,
    destination: &Endpoint,
    settings: &Settings,
    relay_address: Option<&str>,
) -> anyhow::Result<StepCommands> {
    let send = send_args(&settings.zfs, source, step);
    let receive = receive_args(&settings.zfs, destination, settings.verbose_receive);
    match (settings.transport, relay_address) {
        (Transport::Ssh, _) => Ok(StepCommands::Piped(
            Pipeline::new(source.build_command(send))
                .pipe(settings.pipe_relay.clone())
                .pipe(destination.build_command(receive)),
        )),
        (Transport::Mbuffer, Some(address)) => Ok(StepCommands::Buffered {
            receiver: destination
                .build_pipeline(Pipeline::new(settings.relay.listen_args()).pipe(receive))?,
            sender: source
                .build_pipeline(Pipeline::new(send).pipe(settings.relay.connect_args(address)))?,
        }),
        (Transport::Mbuffer, None) => Err(anyhow::anyhow!(
            "buffered relay transfer of {} needs a relay address",
            step
        )),
    }
}

/// Commands every step of `plan` would run, one line per process group
pub fn describe(
    plan: &ReplicationPlan,
    source: &Endpoint,
    destination: &Endpoint,
    settings: &Settings,
) -> anyhow::Result<Vec<String>> {
    let address = match settings.transport {
        Transport::Mbuffer => Some(relay_address(settings, source, destination)?),
        Transport::Ssh => None,
    };
    let mut lines = Vec::with_capacity(plan.len());
    for step in plan.steps() {
        match step_commands(step, source, destination, settings, address.as_deref())? {
            StepCommands::Piped(pipeline) => lines.push(format!("{step}: {pipeline}")),
            StepCommands::Buffered { receiver, sender } => {
                lines.push(format!("{step}: receive: {receiver}"));
                lines.push(format!("{step}: send: {sender}"));
            }
        }
    }
    Ok(lines)
}

fn log_missing(step: &ReplicationStep) {
    match &step.predecessor {
        Some(predecessor) => tracing::info!(
            "missing snapshot: {} (predecessor: {})",
            step.target,
            predecessor
        ),
        None => tracing::info!("missing initial snapshot: {}", step.target),
    }
}

/// Replicate every step of `plan` from `source` to `destination`, in order.
#[instrument(skip_all, fields(source = %source, destination = %destination, transport = ?settings.transport))]
pub async fn execute(
    plan: &ReplicationPlan,
    source: &Endpoint,
    destination: &Endpoint,
    settings: &Settings,
) -> Result<Summary, Error> {
    let mut summary = Summary {
        snapshots_present: plan.present().len(),
        ..Default::default()
    };
    for record in plan.present() {
        tracing::debug!("already present: {}", record);
    }
    if plan.is_empty() {
        tracing::info!("{} is up to date", destination);
        return Ok(summary);
    }
    let address = match settings.transport {
        Transport::Mbuffer => Some(
            relay_address(settings, source, destination)
                .map_err(|error| Error::new(error, summary))?,
        ),
        Transport::Ssh => None,
    };
    if address.is_some() {
        // a listener left over from an interrupted run would pass the readiness probe
        free_port(destination, &settings.relay).await;
    }
    for step in plan.steps() {
        log_missing(step);
        let commands = step_commands(step, source, destination, settings, address.as_deref())
            .map_err(|error| Error::new(error, summary))?;
        let result = match commands {
            StepCommands::Piped(pipeline) => run_piped(step, &pipeline).await,
            StepCommands::Buffered { receiver, sender } => {
                run_buffered(step, &receiver, &sender, destination, settings).await
            }
        };
        result.map_err(|error| Error::new(error, summary))?;
        summary = summary + Summary::of_step(step);
        tracing::info!("replicated {}", destination.snapshot(&step.target.name));
    }
    Ok(summary)
}

#[instrument(skip_all, fields(step = %step))]
async fn run_piped(step: &ReplicationStep, pipeline: &Pipeline) -> anyhow::Result<()> {
    tracing::info!("running: {}", pipeline);
    let status = pipeline.spawn()?.wait().await?;
    if let Some(stage) = status.failed() {
        return Err(TransferFailure::Command {
            step: step.to_string(),
            stage: stage.clone(),
        }
        .into());
    }
    Ok(())
}

#[instrument(skip_all, fields(step = %step))]
async fn run_buffered(
    step: &ReplicationStep,
    receiver: &Pipeline,
    sender: &Pipeline,
    destination: &Endpoint,
    settings: &Settings,
) -> anyhow::Result<()> {
    tracing::info!("receiver: {}", receiver);
    tracing::info!("sender: {}", sender);
    let result = relay_step(step, receiver, sender, destination, settings).await;
    free_port(destination, &settings.relay).await;
    result
}

/// Start the receiver, wait until it listens, then run the sender into it.
///
/// Returning early drops the running pipelines, which kills their local processes.
async fn relay_step(
    step: &ReplicationStep,
    receiver: &Pipeline,
    sender: &Pipeline,
    destination: &Endpoint,
    settings: &Settings,
) -> anyhow::Result<()> {
    let port = settings.relay.port;
    let mut receiving = receiver.spawn()?;
    match relay::wait_until_ready(&mut receiving, &settings.readiness, || {
        relay::is_listening(destination, &settings.relay)
    })
    .await
    {
        Ok(waited) => tracing::debug!("receiver listening on port {} after {:?}", port, waited),
        Err(ReadinessError::ReceiverExited(stage)) => {
            return Err(TransferFailure::ReceiverExited {
                step: step.to_string(),
                port,
                stage,
            }
            .into());
        }
        Err(error @ ReadinessError::Timeout { .. }) => {
            return Err(TransferFailure::ListenerNotReady {
                step: step.to_string(),
                port,
                reason: error.to_string(),
            }
            .into());
        }
        Err(ReadinessError::Process(error)) => return Err(error),
    }
    let send_status = sender.spawn()?.wait().await?;
    if let Some(stage) = send_status.failed() {
        // nothing will ever connect to the listener now
        free_port(destination, &settings.relay).await;
        receiving.start_kill();
        if let Err(error) = receiving.wait().await {
            tracing::debug!("receiver did not terminate cleanly: {:#}", error);
        }
        return Err(TransferFailure::Command {
            step: step.to_string(),
            stage: stage.clone(),
        }
        .into());
    }
    let receive_status = receiving.wait().await?;
    if let Some(stage) = receive_status.failed() {
        return Err(TransferFailure::Command {
            step: step.to_string(),
            stage: stage.clone(),
        }
        .into());
    }
    Ok(())
}

async fn free_port(destination: &Endpoint, relay: &relay::RelaySettings) {
    if let Err(error) = relay::kill_listener(destination, relay).await {
        tracing::warn!("{}: {:#}", error, error.source);
    }
}
