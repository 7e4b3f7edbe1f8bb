mod cli;

use analyzer::{Analyzer, Completion, HostReporter};
use clap::Parser;
use cli::Cli;
use config::{Config, Host, Paths};
use std::fs::File;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // NOTE: The verbosity flag takes precedence over the environment variable
    // for log control. `ANALYZER_LOG` can only tune the level per target, e.g.
    // `ANALYZER_LOG=monitor=warn sandbox-analyzer -vvv` logs everything at
    // trace level except what the instrumented processes report.
    let env_filter = EnvFilter::builder()
        .with_default_directive("hyper_util=warn".parse()?)
        .with_env_var("ANALYZER_LOG")
        .from_env()?
        .add_directive(cli.verbosity.log_level_filter().as_str().parse()?);

    let layer = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    // Open the log file before the subscriber exists, report trouble after.
    let (file_layer, logfile_error) = match &cli.logfile {
        Some(path) => match File::create(path) {
            Ok(file) => (
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(Mutex::new(file)),
                ),
                None,
            ),
            Err(err) => (None, Some((path, err))),
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(file_layer)
        .with(env_filter)
        .init();

    if let Some((path, err)) = logfile_error {
        warn!(path = %path.display(), %err, "unable to create log file, logging to stderr only");
    }

    let mut config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            // Nothing to go on but the defaults to tell the host.
            error!("unable to load configuration: {err:#}");
            HostReporter::new(Host::default().controller_url)
                .report(&Completion::failure(format!("{err:#}")), &Paths::default().results)
                .await;
            return Err(err);
        }
    };
    if let Some(package) = &cli.package {
        config.analysis.package = Some(package.clone());
    }
    if let Some(timeout) = cli.timeout {
        config.analysis.timeout = timeout;
    }
    debug!(?config, ?cli);

    let reporter = HostReporter::new(config.host.controller_url.clone());
    let mut analyzer = Analyzer::native(config);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupted, shutting down");
                interrupt.cancel();
            }
            Err(err) => error!(%err, "unable to listen for interrupts"),
        }
    });

    let result = analyzer.run(&cancel).await;
    // Shutdown runs whatever happened above.
    analyzer.shutdown().await;

    let completion = match &result {
        Ok(outcome) => {
            info!(sample = analyzer.target(), ?outcome, "analysis finished");
            Completion::success()
        }
        Err(err) => {
            error!(%err, "analysis failed");
            Completion::failure(err)
        }
    };
    reporter.report(&completion, &analyzer.results()).await;

    result?;
    Ok(())
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let config = match &cli.conffile {
        Some(path) => Config::load_with_env(path)?,
        _ => {
            let mut candidates = glob::glob("analysis.d/*.toml")?
                .filter_map(Result::ok)
                .collect::<Vec<_>>();
            candidates.sort();
            candidates.insert(0, "analysis.toml".into());
            trace!(?candidates, "config file candidates");
            Config::load_multiple(candidates)?
        }
    };
    Ok(config)
}
