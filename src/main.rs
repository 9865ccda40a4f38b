use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kiri::{
   Result,
   cmd::{self, daemon::StartOptions, index::IndexOptions, serve::DaemonArgs},
   config,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the kiri application
#[derive(Parser)]
#[command(name = "kiri")]
#[command(about = "Local code-search daemon with a self-healing full-text index")]
#[command(version)]
struct Cli {
   /// Repository root (default: cwd)
   #[arg(long, global = true, env = "KIRI_REPO")]
   repo: Option<PathBuf>,

   /// Index database (default: `<repo>/.kiri/index.sqlite`)
   #[arg(long, global = true, env = "KIRI_DB")]
   db: Option<PathBuf>,

   #[command(subcommand)]
   command: Cmd,
}

/// Options forwarded to a daemon started on the client's behalf.
#[derive(Args, Debug, Clone, Default)]
struct DaemonFlags {
   #[arg(long, help = "Watch the repository and invalidate the index on change")]
   watch: bool,

   #[arg(long, help = "Serve a substring scan when the full-text index is unusable")]
   allow_degrade: bool,

   #[arg(long, help = "Security config with sensitive tokens to redact")]
   security_config: Option<PathBuf>,

   #[arg(long, help = "Lock file pinning the security config digest")]
   security_lock: Option<PathBuf>,

   #[arg(long, value_name = "MINUTES", help = "Shut down after this many idle minutes (0 disables)")]
   daemon_timeout: Option<u64>,
}

/// Available subcommands for kiri
#[derive(Subcommand)]
enum Cmd {
   #[command(about = "Run the daemon in the foreground")]
   Daemon {
      #[arg(long, help = "Explicit channel address (socket path or pipe name)")]
      socket_path: Option<String>,

      #[command(flatten)]
      flags: DaemonFlags,
   },

   #[command(about = "Start a background daemon unless one is already running")]
   Start {
      #[command(flatten)]
      flags: DaemonFlags,
   },

   #[command(about = "Stop the daemon for this database")]
   Stop,

   #[command(about = "Show the daemon status for this database")]
   Status {
      #[arg(long, help = "Output as JSON")]
      json: bool,

      #[arg(long, help = "Validate the layered configuration and fail on errors")]
      check_config: bool,
   },

   #[command(about = "Migrate the database and reconcile the full-text index")]
   Index {
      #[arg(long, help = "Rebuild the full-text index even if it looks healthy")]
      force_fts: bool,

      #[arg(long, help = "Flag the repository dirty before reconciling")]
      mark_dirty: bool,

      #[arg(long, help = "Output as JSON")]
      json: bool,
   },

   #[command(about = "Run as an MCP server (stdio transport)")]
   Mcp {
      #[command(flatten)]
      flags: DaemonFlags,
   },
}

fn init_tracing(daemon: bool) {
   let level = if daemon { Level::INFO } else { Level::WARN };
   tracing_subscriber::fmt()
      .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
      .with_ansi(!daemon)
      .with_writer(std::io::stderr)
      .init();
}

#[tokio::main]
async fn main() {
   let cli = Cli::parse();
   init_tracing(matches!(cli.command, Cmd::Daemon { .. }));

   if let Err(err) = run(cli).await {
      eprintln!("{err}");
      std::process::exit(err.exit_code());
   }
}

fn start_options(repo: PathBuf, db: Option<PathBuf>, flags: DaemonFlags) -> Result<StartOptions> {
   let (repo_root, db_path) = cmd::daemon::resolve_target(Some(&repo), db.as_deref(), config::get())?;
   Ok(StartOptions {
      repo_root,
      db_path,
      watch: flags.watch,
      allow_degrade: flags.allow_degrade,
      security_config: flags.security_config,
      security_lock: flags.security_lock,
      idle_timeout: flags.daemon_timeout,
   })
}

async fn run(cli: Cli) -> Result<()> {
   let repo = match cli.repo {
      Some(repo) => repo,
      None => std::env::current_dir()?,
   };
   let cfg = config::init_for_root(&repo);

   match cli.command {
      Cmd::Daemon { socket_path, flags } => {
         let db = cli.db.unwrap_or_else(|| cfg.db_path_for(&repo));
         cmd::serve::execute(DaemonArgs {
            repo,
            db,
            socket_path,
            watch: flags.watch,
            allow_degrade: flags.allow_degrade,
            security_config: flags.security_config,
            security_lock: flags.security_lock,
            daemon_timeout: flags.daemon_timeout,
         })
         .await
      },
      Cmd::Start { flags } => {
         let opts = start_options(repo, cli.db, flags)?;
         cmd::start::execute(opts, cfg).await
      },
      Cmd::Stop => cmd::stop::execute(Some(repo), cli.db).await,
      Cmd::Status { json, check_config } => {
         cmd::status::execute(Some(repo), cli.db, json, check_config).await
      },
      Cmd::Index { force_fts, mark_dirty, json } => {
         cmd::index::execute(Some(repo), cli.db, IndexOptions { force_fts, mark_dirty, json })
      },
      Cmd::Mcp { flags } => {
         let opts = start_options(repo, cli.db, flags)?;
         cmd::mcp::execute(opts, cfg.clone()).await
      },
   }
}
