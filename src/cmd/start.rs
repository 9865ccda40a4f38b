//! Start daemon command.

use console::style;

use crate::{
   Result,
   cmd::daemon::{self, DaemonLauncher, EnsureOutcome, StartOptions},
   config::Config,
};

/// Executes `kiri start`: reuse a live daemon or spawn one and wait for it.
pub async fn execute(opts: StartOptions, cfg: &Config) -> Result<()> {
   let launcher = DaemonLauncher::current_exe()?;
   let (identity, outcome) = daemon::ensure_daemon(&opts, &launcher, cfg).await?;

   match outcome {
      EnsureOutcome::Reused { pid } => {
         let pid = pid.map_or_else(|| "unknown".to_string(), |pid| pid.to_string());
         println!("{} {}", style("Daemon already running").green(), style(format!("(pid {pid})")).dim());
      },
      EnsureOutcome::Spawned { pid } => {
         println!("{} {}", style("Daemon started").green(), style(format!("(pid {pid})")).dim());
      },
   }
   println!("  {} {}", style("database:").dim(), identity.db_path().display());
   println!("  {} {}", style("address:").dim(), identity.address());
   println!("  {} {}", style("log:").dim(), identity.log_path().display());
   Ok(())
}
