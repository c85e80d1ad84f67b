//! CLI argument parsing
//!
//! Defines command-line interface using clap.

use clap::{Parser, Subcommand};

/// Unit-test execution engine
#[derive(Parser, Debug)]
#[command(name = "unitrun")]
#[command(author = "hephaex@gmail.com")]
#[command(version = "0.1.0")]
#[command(about = "Run fixture-based test plans with lifecycle hooks, timeouts and retries")]
#[command(long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a test plan
    Run(RunArgs),

    /// Manage configuration
    Config(ConfigArgs),

    /// Show supported environment variables
    Env,
}

/// Arguments for run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Plan file (YAML or JSON run descriptor)
    pub plan: String,

    /// Parallel scope (disabled, case, fixture)
    #[arg(short, long)]
    pub scope: Option<String>,

    /// Worker count, 0 uses the available hardware concurrency
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Retries after a failed attempt
    #[arg(short, long)]
    pub retries: Option<u32>,

    /// Configuration file (defaults to the standard locations)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Output format (table, json, json-pretty, csv, summary)
    #[arg(short, long, default_value = "table")]
    pub format: String,

    /// Stop starting new cases after this many failures
    #[arg(long)]
    pub max_failures: Option<usize>,

    /// Only build and print the plan
    #[arg(long)]
    pub dry_run: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Save results to file
    #[arg(short, long)]
    pub output: Option<String>,
}

/// Arguments for config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Write an example configuration file
    Init {
        /// Output path
        #[arg(short, long, default_value = "./unitrun.yaml")]
        output: String,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Show {
        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file (defaults to the standard locations)
        file: Option<String>,
    },

    /// Print the JSON schema of the configuration file
    Schema,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args() {
        let args = Args::parse_from([
            "unitrun",
            "run",
            "plan.yaml",
            "--scope",
            "fixture",
            "--workers",
            "4",
            "--max-failures",
            "3",
        ]);
        match args.command {
            Command::Run(run_args) => {
                assert_eq!(run_args.plan, "plan.yaml");
                assert_eq!(run_args.scope.as_deref(), Some("fixture"));
                assert_eq!(run_args.workers, Some(4));
                assert_eq!(run_args.max_failures, Some(3));
                assert_eq!(run_args.format, "table");
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_config_args() {
        let args = Args::parse_from(["unitrun", "--log-level", "debug", "config", "init", "--force"]);
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        match args.command {
            Command::Config(ConfigArgs {
                action: ConfigAction::Init { output, force },
            }) => {
                assert_eq!(output, "./unitrun.yaml");
                assert!(force);
            }
            _ => panic!("Expected config init"),
        }
    }
}
