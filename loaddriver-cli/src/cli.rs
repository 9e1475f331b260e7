use std::path::PathBuf;

use anyhow::{Result, bail};
use argh::FromArgs;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::track::Track;
use crate::{driver, observability};

/// Load driver for benchmarking distributed data stores.
#[derive(Debug, FromArgs)]
struct Args {
    /// path to the YAML configuration file
    #[argh(option, short = 'c')]
    pub config: Option<PathBuf>,

    #[argh(subcommand)]
    pub command: Command,
}

#[derive(Debug, FromArgs)]
#[argh(subcommand)]
enum Command {
    Run(RunCommand),
    Validate(ValidateCommand),
    Version(VersionCommand),
}

/// run a benchmark track
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "run")]
struct RunCommand {
    /// path to the YAML track file
    #[argh(positional)]
    track: PathBuf,

    /// number of workers, overriding the configuration
    #[argh(option, short = 'w')]
    workers: Option<usize>,

    /// seed for randomized pacing, overriding the configuration
    #[argh(option)]
    seed: Option<u64>,
}

/// check a track file and print its tasks without running it
#[derive(Debug, FromArgs)]
#[argh(subcommand, name = "validate")]
struct ValidateCommand {
    /// path to the YAML track file
    #[argh(positional)]
    track: PathBuf,
}

/// print the load driver version
#[derive(Default, Debug, FromArgs)]
#[argh(subcommand, name = "version")]
struct VersionCommand {}

/// Bootstrap the runtime and execute the CLI command.
pub fn execute() -> Result<()> {
    let args: Args = argh::from_env();

    let command = match args.command {
        Command::Version(VersionCommand {}) => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Command::Validate(ValidateCommand { track }) => {
            Track::load(&track)?.print_outline();
            return Ok(());
        }
        Command::Run(command) => command,
    };

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(workers) = command.workers {
        config.driver.workers = workers;
    }
    if let Some(seed) = command.seed {
        config.driver.seed = Some(seed);
    }
    let track = Track::load(&command.track)?;

    // Sentry should be initialized before creating the async runtime.
    let _sentry_guard = observability::init_sentry(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("loaddriver-rt")
        .enable_all()
        .worker_threads(config.runtime.worker_threads)
        .build()?;
    let _runtime_guard = runtime.enter();

    observability::init_tracing(&config);
    tracing::debug!(?config);

    let summary = runtime.block_on(async {
        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupted, aborting run");
                interrupt.cancel();
            }
        });

        driver::run(&track, &config, cancel).await
    })?;

    summary.print(&track.name);
    if !summary.complete {
        bail!("run {} of track `{}` did not complete", summary.run, track.name);
    }

    Ok(())
}
