use clap::Parser;
use colored::*;
use eyre::{Context, Result, eyre};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use hilloop::analysis::Analyzer;
use hilloop::config::{Config, ExecutionMode};
use hilloop::domain::{AttemptStatus, ExperimentParams, Transcript};
use hilloop::flash::FlashMethod;
use hilloop::orchestrator::{AttemptSummary, RunMode, RunOrchestrator, RunOutcome, StopReason};

const EXIT_CONFIGURATION: i32 = 2;
const EXIT_FAULT: i32 = 3;

/// Blocking work still running when a run ends is not waited on longer than this.
const RUNTIME_SHUTDOWN: Duration = Duration::from_secs(2);

fn setup_logging(filter: &str) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("hilloop")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("hilloop.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn run_application(cli: &Cli, config: &Config) -> Result<i32> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Run {
            case,
            max_attempts,
            mode,
            set,
            flash_method,
            execution_mode,
            json,
        } => handle_run_command(
            RunArgs {
                case_id: case,
                max_attempts: *max_attempts,
                mode: *mode,
                set,
                flash_method: *flash_method,
                execution_mode: *execution_mode,
                json: *json,
            },
            config,
        ),
        Commands::Analyze { log, case, run_id, set } => {
            handle_analyze_command(log, case.as_deref(), run_id.clone(), set, config)
        }
        Commands::Cases => handle_cases_command(config),
    }
}

struct RunArgs<'a> {
    case_id: &'a str,
    max_attempts: u32,
    mode: RunMode,
    set: &'a [String],
    flash_method: Option<FlashMethod>,
    execution_mode: Option<ExecutionMode>,
    json: bool,
}

fn configuration_error(message: impl std::fmt::Display) -> i32 {
    eprintln!("{} {}", "Configuration error:".red().bold(), message);
    EXIT_CONFIGURATION
}

fn handle_run_command(args: RunArgs<'_>, config: &Config) -> Result<i32> {
    info!("Run requested: case={} mode={} max_attempts={}", args.case_id, args.mode, args.max_attempts);

    let mut config = config.clone();
    if let Some(method) = args.flash_method {
        config.runner.flash_method = method;
    }
    if let Some(mode) = args.execution_mode {
        config.panel.execution_mode = mode;
    }

    let Some(case) = config.case(args.case_id) else {
        return Ok(configuration_error(format!(
            "unknown case '{}' (see `hilloop cases`)",
            args.case_id
        )));
    };
    let overrides = match ExperimentParams::from_overrides(args.set) {
        Ok(p) => p,
        Err(e) => return Ok(configuration_error(e)),
    };

    let orchestrator = match RunOrchestrator::from_config(&config, case, args.mode, args.max_attempts) {
        Ok(o) => o,
        Err(e) if e.is_configuration() => return Ok(configuration_error(e)),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            return Ok(EXIT_FAULT);
        }
    };
    let orchestrator = if args.json {
        orchestrator
    } else {
        println!(
            "{} {} ({} mode, up to {} attempts)",
            "Running".cyan(),
            args.case_id.bold(),
            args.mode,
            args.max_attempts
        );
        orchestrator.with_progress(Box::new(print_attempt))
    };

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    let outcome = runtime.block_on(orchestrator.run(&overrides));
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&outcome).context("Failed to serialize outcome")?);
    } else {
        print_summary(&outcome);
    }
    Ok(outcome.exit_code())
}

fn status_label(status: AttemptStatus) -> ColoredString {
    match status {
        AttemptStatus::Passed => status.as_str().green(),
        AttemptStatus::Failed => status.as_str().yellow(),
        AttemptStatus::Error => status.as_str().red(),
    }
}

fn print_attempt(a: &AttemptSummary) {
    let detail = match (&a.error, &a.last_error_code) {
        (Some(err), _) => err.clone(),
        (None, Some(code)) => format!("errors={} last={}", a.error_count.unwrap_or(0), code),
        (None, None) => format!("errors={}", a.error_count.unwrap_or(0)),
    };
    println!("  [{:>2}] {:<7} {}  {}", a.index, status_label(a.status), a.params, detail.dimmed());
}

fn print_summary(outcome: &RunOutcome) {
    println!();
    println!(
        "{:<4} {:<8} {:<40} {:<8} {}",
        "#".bold(),
        "status".bold(),
        "params".bold(),
        "errors".bold(),
        "run id".bold()
    );
    for a in &outcome.attempts {
        let errors = a.error_count.map(|n| n.to_string()).unwrap_or_else(|| "-".to_string());
        println!(
            "{:<4} {:<8} {:<40} {:<8} {}",
            a.index,
            status_label(a.status),
            a.params.to_string(),
            errors,
            a.run_id
        );
    }
    println!();

    let headline = match outcome.stop {
        StopReason::Pass => format!("{} with {}", outcome.stop, outcome.final_params).green().bold(),
        StopReason::Exhausted => format!("{} after {} attempts", outcome.stop, outcome.attempts.len())
            .yellow()
            .bold(),
        StopReason::Error => outcome.stop.to_string().red().bold(),
    };
    println!("{}", headline);
    if let Some(failure) = &outcome.failure {
        match failure.stage {
            Some(stage) => println!("  {} {}", format!("{}:", stage).red(), failure.message),
            None => println!("  {}", failure.message.red()),
        }
    }
    if let Some(last) = outcome.attempts.last() {
        println!("  {} {}", "bundle:".dimmed(), last.bundle.display());
    }
}

fn handle_analyze_command(
    log: &Path,
    case_id: Option<&str>,
    run_id: Option<String>,
    set: &[String],
    config: &Config,
) -> Result<i32> {
    info!("Analyzing {}", log.display());
    let text = fs::read_to_string(log).context(format!("Failed to read {}", log.display()))?;
    let transcript = Transcript::parse_log(&text, run_id).map_err(|e| eyre!(e))?;
    let expected = ExperimentParams::from_overrides(set).map_err(|e| eyre!(e))?;

    let (analyzer, expected) = match case_id {
        Some(id) => {
            let case = config.case(id).ok_or_else(|| eyre!("unknown case '{}'", id))?;
            (Analyzer::for_case(&case), case.initial_params().merged(&expected))
        }
        None => (Analyzer::new(), expected),
    };
    let result = analyzer.analyze(&transcript, &expected);
    println!("{}", serde_json::to_string_pretty(&result).context("Failed to serialize analysis")?);
    Ok(if result.pass_fail { 0 } else { 1 })
}

fn handle_cases_command(config: &Config) -> Result<i32> {
    for (id, case) in config.case_catalogue() {
        let target = if case.mock_target.is_some() { "" } else { " (real only)" };
        println!("{:<18} {}{}", id.bold(), case.search.describe(), target.dimmed());
        if !case.description.is_empty() {
            println!("{:<18} {}", "", case.description.dimmed());
        }
    }
    Ok(0)
}

/// Process exit code for the application result. Errors that escape a
/// command are unexpected faults, never a failed or exhausted run.
fn exit_code(result: Result<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            log::error!("{:#}", e);
            eprintln!("{} {:#}", "Error:".red().bold(), e);
            EXIT_FAULT
        }
    }
}

fn main() {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => std::process::exit(configuration_error(format!("{:#}", e))),
    };

    // Setup logging with the configured filter
    if let Err(e) = setup_logging(config.log_filter()) {
        std::process::exit(exit_code(Err(e.wrap_err("Failed to setup logging"))));
    }

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    let code = exit_code(run_application(&cli, &config).context("Application failed"));
    std::process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_passes_command_codes_through() {
        assert_eq!(exit_code(Ok(0)), 0);
        assert_eq!(exit_code(Ok(1)), 1);
        assert_eq!(exit_code(Ok(EXIT_CONFIGURATION)), EXIT_CONFIGURATION);
    }

    #[test]
    fn test_exit_code_for_escaped_error_is_fault() {
        assert_eq!(exit_code(Err(eyre!("runtime unavailable"))), EXIT_FAULT);
    }

    #[test]
    fn test_analyze_unreadable_log_is_fault() {
        let config = Config::default();
        let result = handle_analyze_command(Path::new("/nonexistent/uart.log"), None, None, &[], &config);
        assert!(result.is_err());
        assert_eq!(exit_code(result), EXIT_FAULT);
    }
}
