use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

mod commands;

use commands::{DevMode, run_dev, run_trace};

#[derive(Parser, Debug)]
#[command(name = "devprof", version)]
#[command(about = "devprof - dev server cold start, page load and rebuild profiler")]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Profile a page, triggering rebuilds by editing files automatically
    Auto {
        /// Page to profile, e.g. `pages/blog.tsx` or `/blog`
        page: Option<String>,
        /// File edited to trigger a rebuild; repeat for more dimensions
        #[arg(short = 'f', long = "file", required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        options: DevOptions,
    },
    /// Profile a page while you trigger rebuilds by hand
    Manual {
        /// Page to profile, e.g. `pages/blog.tsx` or `/blog`
        page: Option<String>,
        #[command(flatten)]
        options: DevOptions,
    },
    /// Run a command and capture any trace spans it emits
    RunTrace {
        /// Command to run
        command: String,
        /// Where to write the captured spans
        #[arg(short = 'o', long)]
        outfile: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Clone)]
struct DevOptions {
    /// Page loads measured after the first two
    #[arg(short = 'p', long)]
    page_load_iterations: Option<u32>,
    /// Rebuilds measured per file (or in total, in manual mode)
    #[arg(short = 'n', long)]
    hmr_iterations: u32,
    /// Capture internal compilation timings from the dev server
    #[arg(short = 't', long)]
    capture_trace: bool,
    #[arg(short = 'b', long)]
    base_url: Option<String>,
    /// Report path (default: `<unix-millis>.devprof.json`)
    #[arg(short = 'o', long)]
    outfile: Option<PathBuf>,
    /// Command that starts the dev server
    #[arg(long)]
    command: Option<String>,
    /// Pause after each page load, e.g. `50ms`
    #[arg(long, value_parser = humantime::parse_duration)]
    pause: Option<Duration>,
    /// Give up if the server does not answer in time, e.g. `2m`
    #[arg(long, value_parser = humantime::parse_duration)]
    startup_timeout: Option<Duration>,
    /// Give up if a rebuild does not finish in time, e.g. `30s`
    #[arg(long, value_parser = humantime::parse_duration)]
    event_timeout: Option<Duration>,
}

fn init_tracing(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Failed to initialize logging: {e}");
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let result = match cli.command {
        Commands::Auto {
            page,
            files,
            options,
        } => run_dev(page, DevMode::Auto { files }, options).await,
        Commands::Manual { page, options } => run_dev(page, DevMode::Manual, options).await,
        Commands::RunTrace { command, outfile } => run_trace(&command, outfile).await,
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "devprof failed");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn auto_collects_one_dimension_per_file() {
        let cli = Cli::try_parse_from([
            "devprof", "auto", "pages/index.tsx", "-f", "a.tsx", "--file", "b.tsx", "-n", "5",
            "-p", "3", "--pause", "10ms",
        ])
        .unwrap();

        match cli.command {
            Commands::Auto {
                page,
                files,
                options,
            } => {
                assert_eq!(page.as_deref(), Some("pages/index.tsx"));
                assert_eq!(files, [PathBuf::from("a.tsx"), PathBuf::from("b.tsx")]);
                assert_eq!(options.hmr_iterations, 5);
                assert_eq!(options.page_load_iterations, Some(3));
                assert_eq!(options.pause, Some(Duration::from_millis(10)));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn auto_requires_a_file() {
        assert!(Cli::try_parse_from(["devprof", "auto", "/", "-n", "5"]).is_err());
    }

    #[test]
    fn manual_and_run_trace_parse() {
        let manual = Cli::try_parse_from(["devprof", "manual", "-n", "2", "-t"]).unwrap();
        assert!(matches!(
            manual.command,
            Commands::Manual { page: None, ref options } if options.capture_trace
        ));

        let trace = Cli::try_parse_from(["devprof", "--log-json", "run-trace", "next build"])
            .unwrap();
        assert!(trace.log_json);
        assert!(matches!(trace.command, Commands::RunTrace { ref command, .. } if command == "next build"));
    }
}
