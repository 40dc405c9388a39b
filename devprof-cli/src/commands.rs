//! Command implementations

use std::path::{Path, PathBuf};

use devprof::{MeasurementSession, SessionConfig, SessionConfigBuilder, SessionMode};
use devprof_core::{ConfigError, LaunchSpec, ProcessController, ProfileError};
use devprof_http::{DEFAULT_COLLECTOR_ADDR, TraceCollector};
use thiserror::Error;

use crate::DevOptions;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("File '{}' does not exist or is not a readable file", .0.display())]
    InvalidFile(PathBuf),

    #[error("Interrupted")]
    Interrupted,

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub enum DevMode {
    Auto { files: Vec<PathBuf> },
    Manual,
}

/// Turn a page file path like `pages/blog/post.tsx` into its route `/blog/post`.
pub fn normalize_page(raw: &str) -> String {
    let page = raw
        .strip_prefix("pages")
        .filter(|rest| rest.starts_with('/'))
        .unwrap_or(raw);
    let page = [".tsx", ".ts", ".jsx", ".js"]
        .iter()
        .find_map(|ext| page.strip_suffix(ext))
        .unwrap_or(page);

    if page.starts_with('/') {
        page.to_string()
    } else {
        format!("/{page}")
    }
}

/// Resolve `path` against the working directory and require a regular file.
pub fn validate_file(path: &Path) -> Result<PathBuf, CliError> {
    let resolved = std::path::absolute(path).map_err(|_| CliError::InvalidFile(path.into()))?;
    match std::fs::metadata(&resolved) {
        Ok(meta) if meta.is_file() => Ok(resolved),
        _ => Err(CliError::InvalidFile(path.into())),
    }
}

pub fn default_outfile() -> PathBuf {
    PathBuf::from(format!(
        "{}.devprof.json",
        chrono::Utc::now().timestamp_millis()
    ))
}

fn session_config(
    page: Option<String>,
    mode: DevMode,
    options: DevOptions,
) -> Result<SessionConfig, CliError> {
    let mut builder = SessionConfigBuilder::from_env()?;

    if let Some(page) = page {
        builder = builder.page(normalize_page(&page));
    }
    if let Some(n) = options.page_load_iterations {
        builder = builder.page_load_iterations(n);
    }
    if options.capture_trace {
        builder = builder.capture_trace(true);
    }
    if let Some(url) = options.base_url {
        builder = builder.base_url(url);
    }
    if let Some(command) = options.command {
        builder = builder.command(command);
    }
    if let Some(pause) = options.pause {
        builder = builder.pause(pause);
    }
    if options.startup_timeout.is_some() {
        builder = builder.startup_timeout(options.startup_timeout);
    }
    if options.event_timeout.is_some() {
        builder = builder.event_timeout(options.event_timeout);
    }

    let mode = match mode {
        DevMode::Auto { files } => SessionMode::Auto {
            targets: files
                .iter()
                .map(|f| validate_file(f))
                .collect::<Result<_, _>>()?,
            iterations: options.hmr_iterations,
        },
        DevMode::Manual => SessionMode::Manual {
            iterations: options.hmr_iterations,
        },
    };

    Ok(builder.mode(mode).build()?)
}

pub async fn run_dev(
    page: Option<String>,
    mode: DevMode,
    options: DevOptions,
) -> Result<(), CliError> {
    let outfile = options.outfile.clone().unwrap_or_else(default_outfile);
    let config = session_config(page, mode, options)?;

    println!("🚀 Profiling {} with '{}'...", config.page_url(), config.command);
    println!(
        "🔁 {} rebuild cycle(s) after {} page load(s)",
        config.mode.total_cycles(),
        u64::from(config.page_load_iterations) + 2
    );
    let session = MeasurementSession::new(config);

    let report = tokio::select! {
        report = session.run() => report?,
        _ = tokio::signal::ctrl_c() => return Err(CliError::Interrupted),
    };

    println!("---");
    for line in report.stat_lines() {
        println!("{line}");
    }

    println!("📝 Writing measurements to file {}...", outfile.display());
    report.save(&outfile)?;

    Ok(())
}

pub async fn run_trace(command: &str, outfile: Option<PathBuf>) -> Result<(), CliError> {
    let outfile = outfile.unwrap_or_else(default_outfile);

    println!("🔍 Starting trace collector...");
    let collector = TraceCollector::start(DEFAULT_COLLECTOR_ADDR).await?;

    println!("🚀 Running command: {command}");
    let spec = LaunchSpec::new(command).with_trace_target(devprof::config::ZIPKIN_TRACE_TARGET);
    let process = ProcessController::start(&spec)?;

    println!("⏳ Waiting for command to complete...");
    let exit = tokio::select! {
        exit = process.await_exit() => exit?,
        _ = tokio::signal::ctrl_c() => {
            process.stop().await?;
            return Err(CliError::Interrupted);
        }
    };
    tracing::info!(code = ?exit.code, "Command finished");

    println!("🛑 Stopping trace collector...");
    let spans = collector.finish().await?;

    println!("📝 Writing {} span(s) to file {}...", spans.len(), outfile.display());
    let payload = serde_json::to_string_pretty(&spans).map_err(ProfileError::from)?;
    std::fs::write(&outfile, payload).map_err(|source| CliError::Write {
        path: outfile.clone(),
        source,
    })?;

    Ok(())
}
