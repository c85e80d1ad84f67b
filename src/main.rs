//! unitrun - run fixture-based test plans
//!
//! A CLI front end for the execution engine. Plans are YAML or JSON run
//! descriptors whose hook and body targets are scripts understood by the
//! scripted host (`pass`, `fail <msg>`, `sleep <ms>`, ...).
//!
//! ## Usage
//!
//! ```bash
//! # Run a plan with the configured defaults
//! unitrun run plan.yaml
//!
//! # Run fixtures in parallel on 4 workers and stop after 3 failures
//! unitrun run plan.yaml --scope fixture --workers 4 --max-failures 3
//!
//! # Write an example configuration file
//! unitrun config init
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

mod cli;

use cli::{Args, ConfigAction};
use unitrun::config::{print_env_help, ConfigFile, EnvConfig, ParallelScope};
use unitrun::output::{write_summary_to_file, OutputFormat, ResultFormatter};
use unitrun::report::{Fanout, FailureLimit, TracingReporter};
use unitrun::utils::{init_logger, LogLevel};
use unitrun::{Engine, EngineConfig, RunDescriptor, ScriptedHost};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let env_config = EnvConfig::load();

    let level = if args.verbose {
        LogLevel::Debug
    } else {
        args.log_level
            .as_deref()
            .or(env_config.log_level.as_deref())
            .and_then(LogLevel::from_str)
            .unwrap_or_default()
    };
    init_logger(level);

    match args.command {
        cli::Command::Run(run_args) => {
            let passed = run_plan(run_args, &env_config).await?;
            if !passed {
                std::process::exit(1);
            }
        }
        cli::Command::Config(config_args) => {
            manage_config(config_args.action, &env_config)?;
        }
        cli::Command::Env => {
            print_env_help();
        }
    }

    Ok(())
}

/// Configuration file, then environment, then command-line flags
fn load_config(path: Option<&str>, env_config: &EnvConfig) -> Result<EngineConfig> {
    let file = match path.or(env_config.config_file.as_deref()) {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::load_default()?,
    };
    let mut config = file.engine;
    env_config.apply(&mut config);
    Ok(config)
}

async fn run_plan(args: cli::RunArgs, env_config: &EnvConfig) -> Result<bool> {
    let mut config = load_config(args.config.as_deref(), env_config)?;
    if let Some(scope) = &args.scope {
        config.parallel.scope = ParallelScope::from_str(scope)
            .ok_or_else(|| anyhow::anyhow!("Unknown parallel scope: {scope}"))?;
    }
    if let Some(workers) = args.workers {
        config.parallel.workers = workers;
    }
    if let Some(retries) = args.retries {
        config.retry.max_retries = retries;
    }
    config.validate()?;

    let format = OutputFormat::from_str(&args.format)
        .ok_or_else(|| anyhow::anyhow!("Unknown output format: {}", args.format))?;
    let descriptor = RunDescriptor::load(&args.plan)?;

    let engine = Engine::new(config, Arc::new(ScriptedHost::new()));
    let plan = engine
        .plan(&descriptor)
        .with_context(|| format!("Invalid plan: {}", args.plan))?;

    if args.dry_run {
        for fixture in &plan.fixtures {
            println!("{} ({} case(s))", fixture.id, fixture.cases.len());
            for case in &fixture.cases {
                println!("  {}", case.display_name);
            }
        }
        return Ok(true);
    }

    let mut reporter = Fanout::new().with(Arc::new(TracingReporter));
    if let Some(limit) = args.max_failures {
        reporter = reporter.with(Arc::new(FailureLimit::new(limit, engine.control())));
    }
    let engine = engine.with_reporter(Arc::new(reporter));

    let control = engine.control();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            control.cancel();
        }
    });

    info!(
        "Running {} ({} case(s), scope {:?})",
        args.plan,
        plan.case_count(),
        engine.config().parallel.scope
    );
    let summary = engine.run(plan).await;

    let mut formatter = ResultFormatter::new(format);
    if args.no_color {
        formatter = formatter.no_color();
    }
    println!("{}", formatter.format_summary(&summary));

    if let Some(output) = &args.output {
        write_summary_to_file(output, &summary, format)?;
        info!("Results saved to {}", output);
    }

    Ok(summary.is_all_passed())
}

fn manage_config(action: ConfigAction, env_config: &EnvConfig) -> Result<()> {
    match action {
        ConfigAction::Init { output, force } => {
            let path = Path::new(&output);
            if path.exists() && !force {
                anyhow::bail!(
                    "Configuration file already exists: {output}. Use --force to overwrite."
                );
            }

            ConfigFile::example().save(path)?;
            println!("✓ Configuration file created: {output}");
            println!("\nEdit the file to customize your settings.");
        }

        ConfigAction::Show { format } => {
            let mut config = match env_config.config_file.as_deref() {
                Some(path) => ConfigFile::load(path)?,
                None => ConfigFile::load_default()?,
            };
            env_config.apply(&mut config.engine);
            let output = if format == "json" {
                serde_json::to_string_pretty(&config)?
            } else {
                serde_yaml::to_string(&config)?
            };
            println!("{output}");
        }

        ConfigAction::Validate { file } => {
            let path = file
                .or_else(|| ConfigFile::find().map(|p| p.to_string_lossy().to_string()))
                .unwrap_or_else(|| "./unitrun.yaml".to_string());

            match ConfigFile::load(&path) {
                Ok(_) => {
                    println!("✓ Configuration file is valid: {path}");
                }
                Err(e) => {
                    println!("✗ Configuration file is invalid: {path}");
                    println!("  Error: {e:#}");
                    return Err(e);
                }
            }
        }

        ConfigAction::Schema => {
            println!("{}", ConfigFile::schema()?);
        }
    }

    Ok(())
}
