//! busbridge - expose a D-Bus service from one bus on another.
//!
//! Each configuration file (or the command-line flags alone) describes one
//! proxy context: a service on a source bus mirrored by a façade object that
//! claims its own name on a target bus.

use std::path::{Path, PathBuf};

use clap::Parser;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use busbridge::{
    BusSelector, ConfigOverrides, ConfigWarning, Proxy, ProxyConfig, ProxyContextSpec, Result,
};

/// Items tagged with the label of the context they belong to.
type Labelled<T> = Vec<(String, T)>;

/// Cross-bus D-Bus proxy.
#[derive(Parser, Debug)]
#[command(name = "busbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; repeat to run several proxy contexts.
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Vec<PathBuf>,

    /// Bus the source service lives on ("system", "session" or an address).
    #[arg(long, short = 's', value_name = "BUS")]
    source: Option<BusSelector>,

    /// Bus the façade is exported on ("system", "session" or an address).
    #[arg(long, short = 't', value_name = "BUS")]
    target: Option<BusSelector>,

    /// Bus name of the source service.
    #[arg(long, short = 'n', value_name = "NAME")]
    service_name: Option<String>,

    /// Object path of the source service.
    #[arg(long, short = 'p', value_name = "PATH")]
    object_path: Option<String>,

    /// Bus name the façade claims on the target bus.
    #[arg(long, short = 'x', value_name = "NAME")]
    proxy_name: Option<String>,

    /// Forwarded call timeout in milliseconds (0 for none).
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<i64>,

    /// Verbose output.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Write logs to this file instead of stderr.
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Log level filter (e.g., "debug", "info", "busbridge=trace").
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,

    /// Write a configuration template with the effective values and exit.
    #[arg(long, value_name = "FILE")]
    create_config: Option<PathBuf>,

    /// Print the effective configuration and exit.
    #[arg(long)]
    show_config: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            source_bus: self.source.clone(),
            target_bus: self.target.clone(),
            source_bus_name: self.service_name.clone(),
            source_object_path: self.object_path.clone(),
            proxy_bus_name: self.proxy_name.clone(),
            timeout_ms: self.timeout_ms,
            verbose: self.verbose,
            log_file: self.log_file.clone(),
        }
    }

    /// Effective configuration of every context, labelled, plus the warnings
    /// raised while reading the files. Logging is not set up yet at this
    /// point, so the warnings are reported by the caller.
    fn load_configs(&self) -> Result<(Labelled<ProxyConfig>, Labelled<ConfigWarning>)> {
        let overrides = self.overrides();
        if self.config.is_empty() {
            let mut config = ProxyConfig::default();
            overrides.apply(&mut config);
            return Ok((vec![("default".to_string(), config)], Vec::new()));
        }

        let mut configs = Vec::with_capacity(self.config.len());
        let mut warnings = Vec::new();
        for path in &self.config {
            let label = context_label(path);
            let (mut config, found) = ProxyConfig::load_with_warnings(path)?;
            overrides.apply(&mut config);
            warnings.extend(found.into_iter().map(|w| (label.clone(), w)));
            configs.push((label, config));
        }
        Ok((configs, warnings))
    }
}

fn context_label(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Install the global subscriber. The returned guard flushes the log file
/// when dropped.
fn init_logging(args: &Args, config: &ProxyConfig) -> Option<WorkerGuard> {
    let filter = if !config.enable_logging {
        EnvFilter::new("off")
    } else {
        let level = args
            .log_level
            .clone()
            .unwrap_or_else(|| if config.verbose { "debug" } else { "info" }.to_string());
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    match &config.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .map(|name| name.to_os_string())
                .unwrap_or_else(|| "busbridge.log".into());
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);

            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .with(filter)
                .init();
            None
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let (configs, warnings) = args.load_configs()?;

    if let Some(path) = &args.create_config {
        for (label, warning) in &warnings {
            eprintln!("warning: {}: {}", label, warning);
        }
        if let Some((_, config)) = configs.first() {
            config.write_template(path)?;
            println!("Configuration template saved to: {}", path.display());
        }
        return Ok(());
    }

    if args.show_config {
        for (label, warning) in &warnings {
            eprintln!("warning: {}: {}", label, warning);
        }
        for (label, config) in &configs {
            println!("[{}]", label);
            print!("{}", config.render());
        }
        return Ok(());
    }

    for (_, config) in &configs {
        config.validate()?;
    }

    let _log_guard = configs
        .first()
        .and_then(|(_, config)| init_logging(&args, config));
    for (label, warning) in &warnings {
        let _span = tracing::info_span!("config", context = %label).entered();
        warning.report();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        built = env!("BUSBRIDGE_BUILD_TIMESTAMP"),
        commit = option_env!("BUSBRIDGE_GIT_HASH").unwrap_or("unknown"),
        contexts = configs.len(),
        "Starting busbridge"
    );
    for (label, config) in &configs {
        if config.verbose {
            tracing::debug!(context = %label, "{}", config.render());
        }
    }

    let specs: Vec<ProxyContextSpec> = configs
        .iter()
        .map(|(label, config)| config.to_spec(label.clone()))
        .collect();

    let proxy = Proxy::new(specs);
    let shutdown = proxy.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal");
        shutdown.shutdown();
    });

    proxy.run().await
}
