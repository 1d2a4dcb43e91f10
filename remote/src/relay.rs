//! Buffered network relay control
//!
//! The buffered transport runs `mbuffer` on both ends of a transfer: the destination
//! listens on a fixed coordination port and feeds `zfs receive`, the source feeds
//! `zfs send` into an `mbuffer` connecting to that port. This module builds those relay
//! commands, waits for the listener to come up, and frees the port afterwards.

use anyhow::{Context, anyhow};
use tracing::instrument;

use crate::endpoint::Endpoint;

pub const DEFAULT_PORT: u16 = 47099;

#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// `mbuffer` binary on both endpoints
    pub program: String,
    /// Coordination port the receiving side listens on
    pub port: u16,
    pub block_size: bytesize::ByteSize,
    pub memory: bytesize::ByteSize,
    /// `fuser` binary on the destination, used to probe and free the port
    pub fuser: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            program: "mbuffer".to_string(),
            port: DEFAULT_PORT,
            block_size: bytesize::ByteSize::kib(128),
            memory: bytesize::ByteSize::mib(256),
            fuser: "fuser".to_string(),
        }
    }
}

/// Size argument in the `<n>k` form mbuffer understands
fn mbuffer_size(size: bytesize::ByteSize) -> String {
    let bytes = size.as_u64();
    if bytes.is_multiple_of(1024) {
        format!("{}k", bytes / 1024)
    } else {
        bytes.to_string()
    }
}

impl RelaySettings {
    /// Receiving relay: listen on the coordination port (IPv4) and write to stdout
    pub fn listen_args(&self) -> Vec<String> {
        let mut args = self.common_args();
        args.extend([
            "-4".to_string(),
            "-I".to_string(),
            self.port.to_string(),
        ]);
        args
    }

    /// Sending relay: read stdin and connect to `address` on the coordination port
    pub fn connect_args(&self, address: &str) -> Vec<String> {
        let mut args = self.common_args();
        args.extend(["-O".to_string(), format!("{}:{}", address, self.port)]);
        args
    }

    fn common_args(&self) -> Vec<String> {
        vec![
            self.program.clone(),
            "-t".to_string(),
            "-s".to_string(),
            mbuffer_size(self.block_size),
            "-m".to_string(),
            mbuffer_size(self.memory),
        ]
    }
}

pub fn listener_probe_args(fuser: &str, port: u16) -> Vec<String> {
    vec![
        fuser.to_string(),
        "-s".to_string(),
        "-n".to_string(),
        "tcp".to_string(),
        port.to_string(),
    ]
}

pub fn listener_kill_args(fuser: &str, port: u16) -> Vec<String> {
    vec![
        fuser.to_string(),
        "-k".to_string(),
        "-n".to_string(),
        "tcp".to_string(),
        port.to_string(),
    ]
}

/// Run a `fuser` command on `endpoint`; exit code 1 means no process uses the port
async fn run_fuser(endpoint: &Endpoint, args: Vec<String>) -> anyhow::Result<bool> {
    let pipeline = common::pipeline::Pipeline::new(endpoint.build_command(args));
    let (status, _) = pipeline.output().await?;
    let stage = &status.stages()[0];
    match stage.status.code() {
        Some(0) => Ok(true),
        Some(1) => Ok(false),
        _ => Err(anyhow!("{}", stage)),
    }
}

/// Whether some process on `endpoint` has the coordination port open
pub async fn is_listening(endpoint: &Endpoint, settings: &RelaySettings) -> anyhow::Result<bool> {
    run_fuser(endpoint, listener_probe_args(&settings.fuser, settings.port))
        .await
        .with_context(|| format!("failed probing port {} on {}", settings.port, endpoint))
}

#[derive(Debug, thiserror::Error)]
#[error("failed freeing coordination port {port} on {endpoint}")]
pub struct PortCleanupFailure {
    pub endpoint: String,
    pub port: u16,
    #[source]
    pub source: anyhow::Error,
}

const CLEANUP_ATTEMPTS: usize = 5;
const CLEANUP_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(100);

/// Kill whatever holds the coordination port on `endpoint` and check it was released.
#[instrument(skip_all, fields(endpoint = %endpoint, port = settings.port))]
pub async fn kill_listener(
    endpoint: &Endpoint,
    settings: &RelaySettings,
) -> Result<(), PortCleanupFailure> {
    let port = settings.port;
    let failure = |source: anyhow::Error| PortCleanupFailure {
        endpoint: endpoint.to_string(),
        port,
        source,
    };
    for attempt in 1..=CLEANUP_ATTEMPTS {
        let killed = run_fuser(endpoint, listener_kill_args(&settings.fuser, port))
            .await
            .map_err(failure)?;
        if killed {
            tracing::debug!("killed processes bound to port {} (attempt {})", port, attempt);
        }
        if !is_listening(endpoint, settings).await.map_err(failure)? {
            return Ok(());
        }
        tokio::time::sleep(CLEANUP_RETRY_DELAY).await;
    }
    Err(failure(anyhow!(
        "port is still in use after {} attempts",
        CLEANUP_ATTEMPTS
    )))
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessSettings {
    /// How long to wait for the receiving relay to listen
    pub timeout: std::time::Duration,
    pub poll_interval: std::time::Duration,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            timeout: std::time::Duration::from_secs(30),
            poll_interval: std::time::Duration::from_millis(200),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReadinessError {
    #[error("receiver exited before listening: {0}")]
    ReceiverExited(common::pipeline::StageStatus),
    #[error("receiver was not listening after {waited:?}{}", probe_suffix(.last_probe_error))]
    Timeout {
        waited: std::time::Duration,
        last_probe_error: Option<String>,
    },
    #[error(transparent)]
    Process(#[from] anyhow::Error),
}

fn probe_suffix(last_probe_error: &Option<String>) -> String {
    match last_probe_error {
        Some(error) => format!(" (last probe error: {error})"),
        None => String::new(),
    }
}

/// Poll `probe` until it reports a listener.
///
/// Fails early if any stage of `receiver` terminates first. Probe errors count as "not
/// listening yet" until the timeout expires.
pub async fn wait_until_ready<P, Fut>(
    receiver: &mut common::pipeline::RunningPipeline,
    settings: &ReadinessSettings,
    mut probe: P,
) -> Result<std::time::Duration, ReadinessError>
where
    P: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<bool>>,
{
    let start = tokio::time::Instant::now();
    let mut last_probe_error = None;
    loop {
        if let Some(exited) = receiver.try_exited()? {
            return Err(ReadinessError::ReceiverExited(exited));
        }
        match probe().await {
            Ok(true) => return Ok(start.elapsed()),
            Ok(false) => tracing::trace!("receiver not listening yet"),
            Err(error) => {
                tracing::debug!("listener probe failed: {:#}", error);
                last_probe_error = Some(format!("{error:#}"));
            }
        }
        if start.elapsed() >= settings.timeout {
            return Err(ReadinessError::Timeout {
                waited: start.elapsed(),
                last_probe_error,
            });
        }
        tokio::time::sleep(settings.poll_interval).await;
    }
}
