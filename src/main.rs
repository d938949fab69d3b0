use std::path::PathBuf;

use clap::{Parser, Subcommand};

use gitwarden::cli;
use gitwarden::cli::run::RunOptions;
use gitwarden::logging::{init_logging, LogLevel};
use gitwarden::sandbox::HostSettings;

#[derive(Parser)]
#[command(
    name = "gitwarden",
    version,
    about = "Serialized, sandboxed git execution with credential prompting"
)]
struct Cli {
    /// Log level (overrides GITWARDEN_LOG)
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a git command through the pipeline
    Run {
        /// Working directory (defaults to the current one)
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Answer credential prompts on this terminal
        #[arg(long)]
        prompt: bool,
        /// Mark the command as modifying the repository
        #[arg(long)]
        write: bool,
        /// Sign through the gpg wrapper and retry once on signing failure
        #[arg(long)]
        sign: bool,
        /// Skip the sandbox hosts
        #[arg(long)]
        in_process: bool,
        /// git binary to run
        #[arg(long)]
        git_path: Option<String>,
        /// Arguments passed to git
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
    /// Serve as a sandbox host over stdin/stdout
    #[command(hide = true)]
    Host {
        #[arg(long, default_value_t = 10)]
        capacity: usize,
        #[arg(long, default_value = "git")]
        git_path: String,
        #[arg(long, default_value_t = 20)]
        slow_spawn_threshold_ms: u64,
    },
    /// Askpass helper invoked by git and ssh
    #[command(hide = true)]
    Askpass {
        prompt: Option<String>,
    },
    /// git credential helper
    #[command(hide = true)]
    Credential {
        /// get, store or erase
        operation: String,
    },
    /// gpg.program wrapper that can ask for the passphrase
    #[command(hide = true, disable_help_flag = true)]
    Gpg {
        /// Arguments passed through to gpg
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;

    match cli.command {
        Commands::Run {
            cwd,
            prompt,
            write,
            sign,
            in_process,
            git_path,
            args,
        } => {
            let code = cli::run::run_command(RunOptions {
                cwd,
                prompt,
                write,
                sign,
                in_process,
                git_path,
                args,
            })
            .await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Host {
            capacity,
            git_path,
            slow_spawn_threshold_ms,
        } => {
            cli::host::run_host(HostSettings {
                capacity,
                git_path,
                slow_spawn_threshold_ms,
            })
            .await?;
        }
        Commands::Askpass { prompt } => cli::helper::run_askpass(prompt).await?,
        Commands::Credential { operation } => cli::helper::run_credential(&operation).await?,
        Commands::Gpg { args } => {
            let code = cli::gpg::run_gpg(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}
