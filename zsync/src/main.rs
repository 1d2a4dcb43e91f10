use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::instrument;
use zsync_tools_zsync::transfer;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "zsync",
    version,
    about = "Replicate missing ZFS snapshots from one filesystem to another",
    long_about = "`zsync` brings a destination ZFS filesystem up to date with a source filesystem by \
sending every snapshot the destination is missing, in creation order, each one incremental from \
the snapshot before it.

Endpoints are local filesystems (pool/fs) or remote ones (ssh://user@host[:port]:pool/fs).

EXAMPLE:
    # Replicate to a backup host through buffered mbuffer relays
    zsync tank/data ssh://root@backup1:tank/data --summary

    # Pull from a remote host, piping the stream through this host
    zsync ssh://root@primary:tank/data tank/data --transport ssh

Note: the destination is received with `zfs receive -F`, which rolls it back to its most \
recent snapshot."
)]
struct Args {
    // Transfer options
    /// How snapshot streams travel from the source to the destination
    ///
    /// `mbuffer` runs a listening mbuffer on the destination and a sending mbuffer on the source,
    /// connected over TCP on the relay port. `ssh` pipes `zfs send` into `zfs receive` through
    /// this host.
    #[arg(
        long,
        value_enum,
        default_value_t = transfer::Transport::Mbuffer,
        help_heading = "Transfer options"
    )]
    transport: transfer::Transport,

    /// SSH identity file used for every remote endpoint
    #[arg(
        long = "sshIdentity",
        visible_alias = "ssh-identity",
        value_name = "PATH",
        help_heading = "Transfer options"
    )]
    ssh_identity: Option<std::path::PathBuf>,

    /// zfs binary on both endpoints
    #[arg(long, default_value = remote::DEFAULT_ZFS, value_name = "PATH", help_heading = "Transfer options")]
    zfs_path: String,

    /// Pass-through program between send and receive for `--transport ssh`
    #[arg(
        long,
        default_value = transfer::DEFAULT_PIPE_RELAY,
        value_name = "COMMAND",
        help_heading = "Transfer options"
    )]
    pipe_relay: String,

    /// Print the commands that would run without running them
    #[arg(long, help_heading = "Transfer options")]
    dry_run: bool,

    // Buffered relay options
    /// Coordination port the receiving mbuffer listens on
    #[arg(
        long,
        default_value_t = remote::relay::DEFAULT_PORT,
        value_name = "PORT",
        help_heading = "Buffered relay options"
    )]
    relay_port: u16,

    /// Host the sending mbuffer connects to
    ///
    /// Defaults to the destination host, or localhost when both endpoints are local. Required
    /// when the source is remote and the destination is local.
    #[arg(long, value_name = "HOST", help_heading = "Buffered relay options")]
    relay_address: Option<String>,

    /// mbuffer binary on both endpoints
    #[arg(
        long,
        default_value = "mbuffer",
        value_name = "PATH",
        help_heading = "Buffered relay options"
    )]
    mbuffer_path: String,

    /// fuser binary on the destination, probes and frees the relay port
    #[arg(
        long,
        default_value = "fuser",
        value_name = "PATH",
        help_heading = "Buffered relay options"
    )]
    fuser_path: String,

    /// mbuffer block size, e.g. "128KiB"
    #[arg(
        long,
        default_value = "128KiB",
        value_name = "SIZE",
        help_heading = "Buffered relay options"
    )]
    mbuffer_block_size: bytesize::ByteSize,

    /// mbuffer memory buffer size, e.g. "256MiB"
    #[arg(
        long,
        default_value = "256MiB",
        value_name = "SIZE",
        help_heading = "Buffered relay options"
    )]
    mbuffer_memory: bytesize::ByteSize,

    /// How long to wait for the receiving mbuffer to listen, e.g. "30s"
    #[arg(
        long,
        default_value = "30s",
        value_name = "DELAY",
        value_parser = humantime::parse_duration,
        help_heading = "Buffered relay options"
    )]
    listen_timeout: std::time::Duration,

    /// Delay between checks whether the receiving mbuffer listens, e.g. "200ms"
    #[arg(
        long,
        default_value = "200ms",
        value_name = "DELAY",
        value_parser = humantime::parse_duration,
        help_heading = "Buffered relay options"
    )]
    listen_poll_interval: std::time::Duration,

    // Progress & output
    /// Debug level: no flag INFO / --debug DEBUG / --debug 2 TRACE
    ///
    /// At level 1 and above `zfs receive` also runs verbosely.
    #[arg(
        long,
        value_name = "LEVEL",
        num_args = 0..=1,
        default_missing_value = "1",
        default_value_t = 0,
        help_heading = "Progress & output"
    )]
    debug: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, only report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    // Advanced settings
    /// Number of worker threads, 0 means number of cores
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_workers: usize,

    /// Number of blocking worker threads, 0 means Tokio runtime default (512)
    #[arg(
        long,
        default_value = "0",
        value_name = "N",
        help_heading = "Advanced settings"
    )]
    max_blocking_threads: usize,

    // ARGUMENTS
    /// Source filesystem: pool/fs or ssh://user@host[:port]:pool/fs
    #[arg()]
    source: String,

    /// Destination filesystem: pool/fs or ssh://user@host[:port]:pool/fs
    #[arg()]
    destination: String,
}

impl Args {
    fn settings(&self) -> Result<transfer::Settings> {
        let pipe_relay = shlex::split(&self.pipe_relay)
            .filter(|words| !words.is_empty())
            .ok_or_else(|| anyhow!("invalid --pipe-relay command: {:?}", self.pipe_relay))?;
        Ok(transfer::Settings {
            transport: self.transport,
            zfs: self.zfs_path.clone(),
            verbose_receive: self.debug >= 1,
            pipe_relay,
            relay: remote::relay::RelaySettings {
                program: self.mbuffer_path.clone(),
                port: self.relay_port,
                block_size: self.mbuffer_block_size,
                memory: self.mbuffer_memory,
                fuser: self.fuser_path.clone(),
            },
            relay_address: self.relay_address.clone(),
            readiness: remote::relay::ReadinessSettings {
                timeout: self.listen_timeout,
                poll_interval: self.listen_poll_interval,
            },
        })
    }
}

#[instrument(skip(args))]
async fn async_main(args: Args) -> Result<transfer::Summary> {
    let settings = args.settings()?;
    let identity = args.ssh_identity.as_deref();
    let source = remote::Endpoint::parse(&args.source, identity)
        .with_context(|| format!("invalid source {:?}", args.source))?;
    let destination = remote::Endpoint::parse(&args.destination, identity)
        .with_context(|| format!("invalid destination {:?}", args.destination))?;
    let (source_catalog, destination_catalog) = tokio::try_join!(
        remote::read_catalog(&source, &settings.zfs),
        remote::read_catalog(&destination, &settings.zfs),
    )?;
    let plan = common::plan::plan(&source_catalog, &destination_catalog);
    if args.dry_run {
        for line in transfer::describe(&plan, &source, &destination, &settings)? {
            println!("{line}");
        }
        return Ok(transfer::Summary {
            snapshots_present: plan.present().len(),
            ..Default::default()
        });
    }
    match transfer::execute(&plan, &source, &destination, &settings).await {
        Ok(summary) => Ok(summary),
        Err(error) => {
            if args.summary {
                return Err(anyhow!("{}\n\n{}", error, &error.summary));
            }
            Err(anyhow!("{}", error))
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose: args.debug,
        print_summary: args.summary && !args.dry_run,
    };
    let runtime = common::RuntimeConfig {
        max_workers: args.max_workers,
        max_blocking_threads: args.max_blocking_threads,
    };
    let res = common::run(output, runtime, func);
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
