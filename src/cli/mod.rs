//! Command Line Interface module
//!
//! Implements the CLI commands and argument parsing for toyz-dispatch.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "toyz-dispatch")]
#[command(about = "Toyz job socket client")]
#[command(long_about = "Send tasks to a Toyz server over its job websocket and stream responses")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    #[arg(long, default_value = "config.toml")]
    pub config_file: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Send one task and print every response frame
    Send {
        /// Server module, e.g. toyz.web.tasks
        module: String,

        /// Task name within the module
        task: String,

        /// Task parameters as a JSON object
        #[arg(long, default_value = "{}")]
        params: String,

        /// Send without waiting for responses
        #[arg(long)]
        detach: bool,
    },

    /// Print unsolicited frames pushed by the server
    Listen {
        /// Stop after this many seconds; runs until Ctrl-C when omitted
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Config { action: None }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Reset configuration to defaults
    Reset,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the actual command, using default if none provided
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or_default()
    }

    /// Log level from flags, falling back to the configured one
    pub fn effective_log_level(&self, configured: &str) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| configured.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send() {
        let cli = Cli::try_parse_from([
            "toyz-dispatch",
            "send",
            "toyz.web.tasks",
            "load_user_settings",
            "--params",
            r#"{"user_id":"a"}"#,
        ])
        .unwrap();

        match cli.command() {
            Commands::Send {
                module,
                task,
                params,
                detach,
            } => {
                assert_eq!(module, "toyz.web.tasks");
                assert_eq!(task, "load_user_settings");
                assert_eq!(params, r#"{"user_id":"a"}"#);
                assert!(!detach);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_effective_log_level() {
        let cli = Cli::try_parse_from(["toyz-dispatch"]).unwrap();
        assert_eq!(cli.effective_log_level("warn"), "warn");
        assert!(matches!(cli.command(), Commands::Config { action: None }));

        let cli = Cli::try_parse_from(["toyz-dispatch", "-v", "--log-level", "error"]).unwrap();
        assert_eq!(cli.effective_log_level("warn"), "debug");
    }
}
