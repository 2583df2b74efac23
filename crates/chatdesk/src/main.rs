use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use chatdesk::app::{AppContext, is_cancelled};
use chatdesk::config::{APP_NAME, AppConfig, AppPaths, load_or_init_config};
use chatdesk::local::{EnvSource, EnvironmentSnapshot};
use chatdesk::window::{BrowserWindow, HeadlessWindow, WindowManager};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_run(
    ctx: RuntimeContext,
    cmd: RunCommand,
    env: Arc<EnvironmentSnapshot>,
) -> Result<()> {
    handle_run(&ctx, cmd, env).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command.unwrap_or_default() {
        Command::Run(cmd) => {
            // Blocking; must finish before the runtime starts.
            let env = Arc::new(ctx.capture_environment()?);
            async_run(ctx, cmd, env)
        }
        Command::Env(cmd) => handle_env(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "chatdesk - desktop launcher for the local chat server.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true)]
    json: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the chat server and open the UI (default)
    Run(RunCommand),
    /// Print the captured shell environment
    Env(EnvCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

impl Default for Command {
    fn default() -> Self {
        Command::Run(RunCommand::default())
    }
}

#[derive(Debug, Clone, Default, Args)]
struct RunCommand {
    /// Do not open a browser window; log the URL instead
    #[arg(long = "no-window")]
    no_window: bool,
    /// Run the server on this port instead of a free one
    #[arg(short, long)]
    port: Option<u16>,
}

#[derive(Debug, Clone, Args)]
struct EnvCommand {
    /// Show the full layered environment the server would receive
    #[arg(long)]
    merged: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let paths = AppPaths::discover(common.config.clone())?;
        let config = load_or_init_config(&paths.config_file)?;
        let paths = paths.apply_overrides(&config)?;
        paths.ensure_directories()?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("chatdesk={level},chatdesk_files={level}")));

        // Use JSON output if --json flag is set, otherwise pretty format
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_writer(io::stderr))
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(false),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.quiet {
            LevelFilter::Error
        } else if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    fn capture_environment(&self) -> Result<EnvironmentSnapshot> {
        match self.config.shell.capture()? {
            Some(capture) => Ok(capture.capture()),
            None => {
                info!("Shell environment capture disabled");
                Ok(EnvironmentSnapshot::empty())
            }
        }
    }

    fn window(&self, cmd: &RunCommand) -> Box<dyn WindowManager> {
        if cmd.no_window {
            Box::new(HeadlessWindow)
        } else {
            Box::new(BrowserWindow::new(APP_NAME))
        }
    }
}

async fn handle_run(
    ctx: &RuntimeContext,
    cmd: RunCommand,
    env: Arc<EnvironmentSnapshot>,
) -> Result<()> {
    let mut app = AppContext::new(
        ctx.config.clone(),
        &ctx.paths.data_dir,
        env,
        ctx.window(&cmd),
    )?;
    spawn_shutdown_listener(app.shutdown_token());

    let port = cmd.port.or(ctx.config.server.port);
    let result = match app.launch(port).await {
        Ok(launch) => {
            info!(
                "chatdesk running at {} (server pid {}, {} health probe(s))",
                launch.url, launch.pid, launch.attempts
            );
            app.run().await
        }
        Err(err) => Err(err),
    };

    if let Some(err) = result.as_ref().err().filter(|err| !is_cancelled(err)) {
        app.report_fatal(err);
    }

    app.shutdown().await;
    info!("Shutdown complete");

    match result {
        Err(err) if is_cancelled(&err) => Ok(()),
        other => other,
    }
}

/// Cancel `token` on Ctrl+C or SIGTERM.
fn spawn_shutdown_listener(token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
            _ = token.cancelled() => return,
        }

        info!("Shutdown signal received, stopping server...");
        token.cancel();
    });
}

#[derive(Serialize)]
struct EnvEntry<'a> {
    name: &'a str,
    source: EnvSource,
}

fn handle_env(ctx: &RuntimeContext, cmd: EnvCommand) -> Result<()> {
    let snapshot = ctx.capture_environment()?;

    let entries: Vec<(String, EnvSource)> = if cmd.merged {
        let command = ctx.config.server_command(&ctx.paths.data_dir)?;
        let port = ctx.config.server.port.unwrap_or(0);
        let layered = command.environment(port, &snapshot);
        layered
            .merged()
            .into_keys()
            .filter_map(|name| {
                let source = layered.source_of(&name)?;
                Some((name, source))
            })
            .collect()
    } else {
        snapshot
            .keys()
            .map(|name| (name.to_string(), EnvSource::Shell))
            .collect()
    };

    if ctx.common.json {
        let json: Vec<EnvEntry<'_>> = entries
            .iter()
            .map(|(name, source)| EnvEntry {
                name: name.as_str(),
                source: *source,
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("serializing environment to JSON")?
        );
    } else if cmd.merged {
        for (name, source) in &entries {
            println!("{name}\t{}", source_label(*source));
        }
    } else {
        for (name, _) in &entries {
            println!("{name}");
        }
    }
    Ok(())
}

fn source_label(source: EnvSource) -> &'static str {
    match source {
        EnvSource::Inherited => "inherited",
        EnvSource::Shell => "shell",
        EnvSource::Overrides => "override",
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else {
                println!("{:#?}", ctx.config);
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.paths.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}
