//! mmult CLI
//!
//! Runs the matrix-multiply kernel from a pre-built device binary on an
//! accelerator card and checks the result against a host reference.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use console::style;
use mmult_host::runtime::simulated::SimulatedRuntime;
use mmult_host::{run_default, ComputeRuntime, HostConfig, HostError, LogFormat, Mismatch};
use tracing::{error, info};

mod exit;

use exit::{EXIT_GENERIC_FAIL, EXIT_SUCCESS};

/// Run and verify a matrix multiply on an accelerator
#[derive(Parser)]
#[command(name = "mmult")]
#[command(about = "Run and verify a matrix multiply on an OpenCL accelerator")]
#[command(long_about = r#"
Loads a pre-built device binary, runs its matrix-multiply kernel once on the
selected accelerator and compares the output with a host-computed reference.

Examples:
  # Run on the card
  mmult mmult.xclbin

  # Dry run without hardware
  mmult --backend simulated mmult.xclbin

  # Different card and size, settings from a file
  mmult --config mmult.toml --device xilinx_u250_xdma_201830_2 --dimension 32 mmult.xclbin
"#)]
#[command(version)]
struct Cli {
    /// Device binary image (.xclbin)
    #[arg(value_name = "XCLBIN")]
    xclbin: PathBuf,

    /// Configuration file path
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Accelerator runtime to drive
    #[arg(long, value_enum, default_value_t = Backend::Opencl)]
    backend: Backend,

    /// Target device name (overrides the config)
    #[arg(short, long, value_name = "NAME")]
    device: Option<String>,

    /// Matrix dimension N (overrides the config)
    #[arg(short = 'n', long, value_name = "N")]
    dimension: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log format (pretty, compact, json)
    #[arg(long, value_name = "FORMAT")]
    log_format: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// OpenCL ICD (needs the `opencl-runtime` feature)
    Opencl,
    /// In-process software accelerator; never touches hardware
    Simulated,
}

/// Success line; a simulated pass must not read like a hardware pass.
fn success_line(backend: Backend) -> &'static str {
    match backend {
        Backend::Opencl => "INFO: Test completed successfully.",
        Backend::Simulated => "INFO: Test completed successfully (simulated).",
    }
}

fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", style("ERROR:").red().bold(), e);
            std::process::exit(EXIT_GENERIC_FAIL);
        }
    };
    setup_logging(&config);

    let code = match execute(&cli, &config) {
        Ok(()) => {
            println!("{}", style(success_line(cli.backend)).green());
            EXIT_SUCCESS
        }
        Err(e) => {
            let mut stdout = io::stdout().lock();
            let code = report_failure(&e, &mut stdout);
            if let Err(io_err) = stdout.flush() {
                eprintln!("failed to write report: {io_err}");
            }
            code
        }
    };
    std::process::exit(code);
}

/// Load configuration from file or defaults and merge with CLI arguments
fn load_configuration(cli: &Cli) -> Result<HostConfig> {
    let mut config = match &cli.config {
        Some(path) => HostConfig::load(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?,
        None => HostConfig::from_env().context("invalid environment configuration")?,
    };

    if let Some(device) = &cli.device {
        config.device_name = device.clone();
    }
    if let Some(n) = cli.dimension {
        config.dimension = n;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// Setup logging based on configuration; `RUST_LOG` takes precedence
fn setup_logging(config: &HostConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    match config.log_format {
        LogFormat::Json => {
            subscriber.json().with_timer(tracing_subscriber::fmt::time::uptime()).init();
        }
        LogFormat::Compact => {
            subscriber.compact().init();
        }
        LogFormat::Pretty => {
            subscriber.pretty().init();
        }
    }
}

fn execute(cli: &Cli, config: &HostConfig) -> Result<()> {
    info!(
        "backend={:?} device={} dimension={} image={}",
        cli.backend,
        config.device_name,
        config.dimension,
        cli.xclbin.display()
    );
    match cli.backend {
        Backend::Simulated => {
            let runtime = SimulatedRuntime::single_device(
                &config.platform_vendor,
                &config.device_name,
                config.memory_banks,
            );
            run_on(&runtime, config, &cli.xclbin)
        }
        Backend::Opencl => run_opencl(config, &cli.xclbin),
    }
}

#[cfg(feature = "opencl-runtime")]
fn run_opencl(config: &HostConfig, image: &Path) -> Result<()> {
    let runtime = mmult_host::runtime::opencl::OpenClRuntime::new(config.memory_banks);
    run_on(&runtime, config, image)
}

#[cfg(not(feature = "opencl-runtime"))]
fn run_opencl(_config: &HostConfig, _image: &Path) -> Result<()> {
    anyhow::bail!("mmult was built without the `opencl-runtime` feature; use --backend simulated")
}

fn run_on<R: ComputeRuntime>(runtime: &R, config: &HostConfig, image: &Path) -> Result<()> {
    let outcome = run_default(runtime, config, image)?;
    outcome.ensure_verified()?;
    Ok(())
}

/// Log the error with its cause chain, write the failure report to `out`
/// and pick the exit code.
fn report_failure(e: &anyhow::Error, out: &mut impl Write) -> i32 {
    error!("Run failed: {}", e);
    let mut source = e.source();
    while let Some(err) = source {
        error!("  Caused by: {}", err);
        source = err.source();
    }

    let code = match e.downcast_ref::<HostError>() {
        Some(host) => {
            eprintln!("{} [{}] {}", style("ERROR:").red().bold(), host.stage(), host);
            if let HostError::VerificationMismatch { mismatches } = host {
                if let Err(io_err) = write_mismatches(out, mismatches) {
                    eprintln!("failed to write mismatch report: {io_err}");
                }
            }
            exit::for_stage(host.stage())
        }
        None => {
            eprintln!("{} {:#}", style("ERROR:").red().bold(), e);
            EXIT_GENERIC_FAIL
        }
    };
    if let Err(io_err) = writeln!(out, "{}", style("ERROR: Test failed").red().bold()) {
        eprintln!("failed to write report: {io_err}");
    }
    code
}

/// One `Error: Result mismatch` line per differing element, in index order.
fn write_mismatches(out: &mut impl Write, mismatches: &[Mismatch]) -> io::Result<()> {
    for m in mismatches {
        writeln!(out, "Error: Result mismatch: {m}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let cli = Cli::parse_from([
            "mmult",
            "--device",
            "u250",
            "-n",
            "8",
            "--log-format",
            "json",
            "x.xclbin",
        ]);
        let config = load_configuration(&cli).unwrap();
        assert_eq!(config.device_name, "u250");
        assert_eq!(config.dimension, 8);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn zero_dimension_is_rejected() {
        let cli = Cli::parse_from(["mmult", "--dimension", "0", "x.xclbin"]);
        assert!(load_configuration(&cli).is_err());
    }

    #[test]
    fn backend_defaults_to_opencl() {
        let cli = Cli::parse_from(["mmult", "x.xclbin"]);
        assert_eq!(cli.backend, Backend::Opencl);
    }

    #[test]
    fn simulated_success_is_tagged() {
        assert_eq!(success_line(Backend::Opencl), "INFO: Test completed successfully.");
        assert!(success_line(Backend::Simulated).ends_with("(simulated)."));
    }

    #[test]
    fn mismatches_are_reported_per_element() {
        let err = anyhow::Error::new(HostError::VerificationMismatch {
            mismatches: vec![
                Mismatch { index: 3, actual: 7, expected: 30 },
                Mismatch { index: 10, actual: -1, expected: 285 },
            ],
        });
        let mut out = Vec::new();
        let code = report_failure(&err, &mut out);

        assert_eq!(code, exit::EXIT_VERIFY_FAIL);
        let text = String::from_utf8(out).unwrap();
        let plain = console::strip_ansi_codes(&text);
        let lines: Vec<&str> = plain.lines().collect();
        assert_eq!(
            lines,
            [
                "Error: Result mismatch: hw_results[3] = 7, sw_results[3] = 30",
                "Error: Result mismatch: hw_results[10] = -1, sw_results[10] = 285",
                "ERROR: Test failed",
            ]
        );
    }

    #[test]
    fn non_host_error_is_generic_failure() {
        let err = anyhow::anyhow!("no backend");
        let mut out = Vec::new();
        assert_eq!(report_failure(&err, &mut out), EXIT_GENERIC_FAIL);
        let text = String::from_utf8(out).unwrap();
        assert_eq!(console::strip_ansi_codes(&text), "ERROR: Test failed\n");
    }
}
