use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::{debug, error, info};
use usbprint_core::events::BackendObserver;
use usbprint_core::{
    BackendConfig, DiscoveryLine, JobOptions, JobStatus, MultiObserver, NullObserver, NusbBackend,
    PrintJob, QuirkDb, SpoolerObserver, TracingObserver, list_devices, run_job,
};

/// Environment variable naming a backend config file.
const CONFIG_ENV: &str = "USB_BACKEND_CONFIG";

#[derive(Parser, Debug)]
#[command(author, version, about = "USB printer backend", long_about = None)]
struct Args {
    /// Job ID
    job_id: Option<String>,

    /// Requesting user
    user: Option<String>,

    /// Job title
    title: Option<String>,

    /// Number of copies
    copies: Option<u32>,

    /// Job options (name=value ...)
    options: Option<String>,

    /// Print file; standard input when omitted
    file: Option<PathBuf>,

    /// Backend configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("DEBUG: Unable to install log subscriber: {e}");
    }
}

fn load_config(path: Option<PathBuf>) -> Result<BackendConfig> {
    let path = path.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    let config = match path {
        Some(path) => BackendConfig::load_from_file(&path)
            .with_context(|| format!("Unable to load config {}", path.display()))?,
        None => BackendConfig::default(),
    };
    Ok(config.with_env())
}

/// `DEVICE_URI`, or argv[0] when the spooler invoked us by URI.
fn device_uri() -> Option<String> {
    std::env::var("DEVICE_URI")
        .ok()
        .filter(|uri| !uri.is_empty())
        .or_else(|| std::env::args().next().filter(|arg0| arg0.contains(':')))
}

fn run(args: Args) -> Result<JobStatus> {
    let config = load_config(args.config)?;

    let Some(job_id) = args.job_id else {
        let quirks = QuirkDb::load(&config.quirks_dir());
        for printer in list_devices(&NusbBackend, &quirks, &config, &NullObserver) {
            println!("{}", DiscoveryLine(&printer));
        }
        return Ok(JobStatus::Ok);
    };

    let (Some(copies), Some(options)) = (args.copies, args.options) else {
        bail!("Usage: usb job-id user title copies options [file]");
    };
    let Some(device_uri) = device_uri() else {
        bail!("No device URI found in argv[0] or in DEVICE_URI environment variable");
    };

    info!(job_id = %job_id, uri = %device_uri, copies, "Printing");
    debug!(user = ?args.user, title = ?args.title, options = %options, "Job details");

    let job = PrintJob {
        device_uri,
        copies: if args.file.is_some() { copies } else { 1 },
        options: JobOptions::parse(&options),
        print_file: args.file,
        verbose: true,
    };

    let mut observers: Vec<Box<dyn BackendObserver>> = vec![Box::new(SpoolerObserver::stderr())];
    if args.verbose {
        observers.push(Box::new(TracingObserver));
    }

    run_job(&NusbBackend, &config, &job, Arc::new(MultiObserver(observers)))
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args) {
        Ok(status) => ExitCode::from(status.exit_code() as u8),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(JobStatus::Failed.exit_code() as u8)
        }
    }
}
