//! ScatterFlow CLI Entry Point
//!
//! Submits one template run and waits for it to end.
//!
//! # Usage
//!
//! ```bash
//! # Run a template with inputs
//! scatterflow pipeline.yaml --inputs inputs.yaml
//!
//! # Validate and show the step tree without running anything
//! scatterflow pipeline.yaml --inputs inputs.yaml --dry-run
//!
//! # Submit to the cluster with settings from a file
//! scatterflow pipeline.yaml --config scatterflow.yaml --backend cluster
//!
//! # Print the final status as JSON
//! scatterflow pipeline.yaml --json
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use colored::Colorize;
use log::{error, info};

use scatterflow::config::BackendKind;
use scatterflow::engine::RunSummary;
use scatterflow::template::{validate_template, RunInputs};
use scatterflow::{load_inputs, load_template, Engine, RunStatus, Settings, Template};
use scatterflow::{APP_NAME, VERSION};

/// Command-line configuration parsed from arguments.
#[derive(Debug, Default)]
struct Config {
    template_path: Option<String>,
    inputs_path: Option<String>,
    config_path: Option<String>,
    backend: Option<BackendKind>,
    working_dir: Option<PathBuf>,
    dry_run: bool,
    json: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Dataflow Workflow Scheduling Engine");
    println!();
}

fn print_usage() {
    println!("Usage: scatterflow [OPTIONS] <TEMPLATE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <TEMPLATE_FILE>       Path to template YAML file");
    println!();
    println!("Options:");
    println!("  --inputs PATH         YAML mapping of input channel names to values");
    println!("  --config PATH         Settings YAML file");
    println!("  --backend NAME        Task manager: local, cloud or cluster");
    println!("  --working-dir PATH    Directory for task working files");
    println!("  --dry-run             Validate and show the step tree without running");
    println!("  --json                Print the final run status as JSON");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Settings can also be overridden with SCATTERFLOW_* environment variables.");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    let value_for = |i: usize, option: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("{} requires an argument", option))
    };

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--dry-run" => config.dry_run = true,
            "--json" => config.json = true,
            "--verbose" | "-v" => config.verbose = true,
            "--inputs" => {
                i += 1;
                config.inputs_path = Some(value_for(i, "--inputs")?);
            }
            "--config" => {
                i += 1;
                config.config_path = Some(value_for(i, "--config")?);
            }
            "--backend" => {
                i += 1;
                let name = value_for(i, "--backend")?;
                config.backend = Some(name.parse::<BackendKind>().map_err(|e| e.to_string())?);
            }
            "--working-dir" => {
                i += 1;
                config.working_dir = Some(PathBuf::from(value_for(i, "--working-dir")?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.template_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.template_path = Some(arg.clone());
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Loads settings and applies command-line overrides.
fn load_settings(config: &Config) -> Result<Settings, Box<dyn std::error::Error>> {
    let mut settings = Settings::load(config.config_path.as_deref())?;

    if let Some(backend) = config.backend {
        settings.backend = backend;
    }

    if let Some(dir) = &config.working_dir {
        if dir.exists() && !dir.is_dir() {
            return Err(format!("Path is not a directory: {}", dir.display()).into());
        }
        settings.working_root = dir.clone();
    }

    info!("Backend: {}", settings.backend);
    info!("Working directory: {}", settings.working_root.display());
    Ok(settings)
}

fn print_template_tree(template: &Template, depth: usize) {
    let indent = "  ".repeat(depth);
    let channels = |names: Vec<&str>| {
        if names.is_empty() {
            "-".to_string()
        } else {
            names.join(", ")
        }
    };
    let inputs = channels(template.inputs.iter().map(|i| i.channel.as_str()).collect());
    let outputs = channels(template.outputs.iter().map(|o| o.channel.as_str()).collect());

    match &template.command {
        Some(command) => println!(
            "{}{} [{} -> {}]: {}",
            indent,
            template.name.bold(),
            inputs,
            outputs,
            command.dimmed()
        ),
        None => println!("{}{} [{} -> {}]", indent, template.name.bold(), inputs, outputs),
    }

    for step in &template.steps {
        print_template_tree(step, depth + 1);
    }
}

fn colored_status(status: RunStatus) -> colored::ColoredString {
    let text = status.to_string();
    match status {
        RunStatus::Finished => text.green(),
        RunStatus::Failed => text.red(),
        RunStatus::Killed => text.yellow(),
        RunStatus::Waiting | RunStatus::Running => text.cyan(),
    }
}

fn print_run_tree(summary: &RunSummary, depth: usize) {
    let indent = "  ".repeat(depth);
    let (finished, total) = summary.task_counts();
    println!(
        "{}{} {} ({}/{} tasks)",
        indent,
        summary.name.bold(),
        colored_status(summary.status),
        finished,
        total
    );

    for event in summary.events.iter().filter(|e| e.is_error) {
        println!("{}  {}", indent, event.message.red());
    }
    for step in &summary.steps {
        print_run_tree(step, depth + 1);
    }
}

fn print_outputs(summary: &RunSummary) {
    if summary.outputs.is_empty() {
        return;
    }
    println!();
    println!("Outputs:");
    for output in &summary.outputs {
        match &output.contents {
            Some(contents) => println!("  {}: {}", output.channel.bold(), contents.substitution_value()),
            None => println!("  {}: {}", output.channel.bold(), "(incomplete)".dimmed()),
        }
    }
}

/// Main application entry point. Returns whether the run finished.
fn run() -> Result<bool, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    if !config.json {
        print_banner();
    }

    let Some(template_path) = config.template_path.as_deref() else {
        print_usage();
        return Err("No template file given".into());
    };

    info!("Loading template: {}", template_path);
    let template = load_template(template_path).map_err(|e| {
        error!("Failed to load template: {}", e);
        format!("Could not load template from '{}': {}", template_path, e)
    })?;

    let inputs = match config.inputs_path.as_deref() {
        Some(path) => {
            info!("Loading inputs: {}", path);
            load_inputs(path)?
        }
        None => RunInputs::new(),
    };

    if config.dry_run {
        validate_template(&template)?;
        info!("Mode: DRY RUN (nothing will execute)");
        println!();
        print_template_tree(&template, 0);
        return Ok(true);
    }

    let settings = load_settings(&config)?;
    let engine = Engine::from_settings(settings);

    let run_id = engine.submit_run(template, inputs)?;
    info!("Run {} submitted", run_id);

    let status = engine.wait_for_run(run_id, None)?;
    let summary = engine.run_status(run_id)?;

    if config.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!();
        print_run_tree(&summary, 0);
        print_outputs(&summary);
    }

    Ok(status == RunStatus::Finished)
}

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
