//! Daemon status command.
//!
//! Shows the lease of the daemon for a database and, when it answers, the
//! serving state it reports over JSON-RPC.

use std::path::PathBuf;

use console::style;
use serde_json::{Value, json};

use crate::{
   Result,
   cmd::daemon,
   config::{self, Config},
   identity::DatabaseIdentity,
   lease::{self, LeaseState},
};

/// Lease state plus the daemon's own report, when reachable.
pub async fn collect(identity: &DatabaseIdentity, cfg: &Config) -> Value {
   let lease = lease::validate_lease(identity, cfg.probe_timeout()).await;
   let mut report = json!({
      "db_path": identity.db_path(),
      "address": identity.address().to_string(),
      "lease": lease_label(&lease),
   });

   if matches!(lease, LeaseState::Live { .. }) {
      let status = match daemon::connect(identity, cfg).await {
         Ok(mut client) => daemon::call(&mut client, "status", Value::Null, cfg).await,
         Err(e) => Err(e),
      };
      match status {
         Ok(status) => report["daemon"] = status,
         Err(e) => report["error"] = Value::String(e.to_string()),
      }
   }
   report
}

fn lease_label(lease: &LeaseState) -> Value {
   match lease {
      LeaseState::Live { pid } => json!({ "state": "live", "pid": pid }),
      LeaseState::Stale { pid, reason } => {
         json!({ "state": "stale", "pid": pid, "reason": format!("{reason:?}") })
      },
      LeaseState::Absent => json!({ "state": "absent" }),
   }
}

fn print_human(report: &Value) {
   let db = report["db_path"].as_str().unwrap_or_default();
   match report["lease"]["state"].as_str() {
      Some("live") => {
         let daemon = &report["daemon"];
         let serving = daemon["serving"]["mode"].as_str().unwrap_or("unknown");
         let marker = if serving == "full" {
            style("●").green()
         } else {
            style("●").yellow()
         };
         println!(
            "  {} {} {}",
            marker,
            db,
            style(format!(
               "(pid {}, {serving}, generation {}, up {}s)",
               report["lease"]["pid"],
               daemon["fts_generation"],
               daemon["uptime_secs"],
            ))
            .dim()
         );
         if let Some(reason) = daemon["serving"]["reason"].as_str() {
            println!("    {}", style(reason).yellow());
         }
         if let Some(err) = report["error"].as_str() {
            println!("    {}", style(format!("unresponsive: {err}")).red());
         }
      },
      Some("stale") => {
         println!("  {} {} {}", style("●").red(), db, style("(stale lease)").dim());
      },
      _ => println!("{}", style("No daemon running for this database").dim()),
   }
   println!("  {} {}", style("address:").dim(), report["address"].as_str().unwrap_or_default());
}

/// Executes `kiri status`.
pub async fn execute(
   repo: Option<PathBuf>,
   db: Option<PathBuf>,
   json_output: bool,
   check_config: bool,
) -> Result<()> {
   let cfg = config::get();
   let (repo_root, db_path) = daemon::resolve_target(repo.as_deref(), db.as_deref(), cfg)?;

   if check_config {
      config::validate(Some(&repo_root))?;
      if !json_output {
         println!("{}", style("Configuration is valid").green());
      }
   }

   let identity = DatabaseIdentity::resolve(&db_path);
   let report = collect(&identity, cfg).await;
   if json_output {
      println!("{}", serde_json::to_string_pretty(&report)?);
   } else {
      print_human(&report);
   }
   Ok(())
}
