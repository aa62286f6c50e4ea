use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use fieldsync::cache::{format_time_ago, CacheSource, Entity, LoadOutcome};
use fieldsync::campaign::{CampaignSync, PullSummary};
use fieldsync::config::Config;
use fieldsync::network::NetworkStatus;
use fieldsync::queue::{PendingAction, SupportLevel};
use fieldsync::store::Table;

#[derive(Parser, Debug)]
#[command(name = "fieldsync")]
#[command(about = "Offline-first sync for field campaign data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/fieldsync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Refresh a table (or "all") from the remote
  Pull { table: String },
  /// Show a table, cache first
  List { table: Table },
  /// Cached counts, recency and queue depth
  Status,
  /// Record a canvassing outcome for a voter
  VoterStatus { id: i64, status: SupportLevel },
  /// Mark a voter as having voted
  MarkVoted {
    id: i64,
    /// Clear the voted flag instead
    #[arg(long)]
    no: bool,
  },
  /// Activate or deactivate a tenant
  TenantStatus { id: i64, state: TenantState },
  /// Replay queued actions now
  Drain,
  /// Stay running: probe connectivity and drain whenever it returns
  Watch {
    /// Probe interval in seconds
    #[arg(long, default_value_t = 30)]
    interval: u64,
  },
  /// Clear every cached record and queued action
  Logout,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TenantState {
  Active,
  Inactive,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = fieldsync::logging::init(&config.logging)?;

  let sync = CampaignSync::from_config(&config)?;
  let result = run(&sync, args.command).await;
  sync.close()?;
  result
}

async fn run(sync: &CampaignSync, command: Command) -> Result<()> {
  match command {
    Command::Pull { table } => {
      let tables = if table.eq_ignore_ascii_case("all") {
        Table::ALL.to_vec()
      } else {
        vec![table.parse::<Table>().map_err(|e| color_eyre::eyre::eyre!(e))?]
      };
      report_network(sync.probe().await);
      for table in tables {
        print_summary(&sync.pull(table, true).await);
      }
    }
    Command::List { table } => {
      sync.probe().await;
      match table {
        Table::Tenants => print_records(&sync.tenants().load(false).await),
        Table::Voters => print_records(&sync.voters().load(false).await),
        Table::Workers => print_records(&sync.workers().load(false).await),
      }
    }
    Command::Status => {
      let report = sync.status()?;
      let now = Utc::now();
      for table in &report.tables {
        println!(
          "{:<8} {:>6} cached  synced {}",
          table.table,
          table.cached,
          format_time_ago(table.last_synced, now)
        );
      }
      println!("queue    {:>6} pending", report.pending);
      if report.dead_letters > 0 {
        println!("         {:>6} dead letters", report.dead_letters);
        for letter in sync.store().dead_letters()? {
          println!(
            "  #{} {} ({})",
            letter.item.seq,
            letter.item.action.kind(),
            letter.last_error.as_deref().unwrap_or("no error recorded")
          );
        }
      }
    }
    Command::VoterStatus { id, status } => {
      submit(sync, PendingAction::UpdateVoterStatus { voter_id: id, status }).await?;
    }
    Command::MarkVoted { id, no } => {
      submit(
        sync,
        PendingAction::MarkVoted {
          voter_id: id,
          has_voted: !no,
        },
      )
      .await?;
    }
    Command::TenantStatus { id, state } => {
      let active = matches!(state, TenantState::Active);
      submit(sync, PendingAction::SetTenantStatus { tenant_id: id, active }).await?;
    }
    Command::Drain => {
      report_network(sync.probe().await);
      let report = sync.queue().drain().await;
      match report.skipped {
        Some(reason) => println!("Drain skipped: {:?}", reason),
        None => println!(
          "{} committed, {} retained, {} deferred, {} dead-lettered",
          report.committed, report.retained, report.deferred, report.dead_lettered
        ),
      }
    }
    Command::Watch { interval } => watch(sync, Duration::from_secs(interval.max(1))).await?,
    Command::Logout => {
      sync.logout()?;
      println!("Local data cleared.");
    }
  }

  Ok(())
}

/// Queue an action and, if we are online, push it out before exiting.
async fn submit(sync: &CampaignSync, action: PendingAction) -> Result<()> {
  report_network(sync.probe().await);
  let submission = sync.submit(action, true).await?;
  let item = &submission.item;
  println!("Queued #{} {}", item.seq, item.action.kind());

  match submission.drained {
    Some(report) if report.committed > 0 => println!("Synced {} action(s).", report.committed),
    Some(_) => println!("Not synced yet: will retry on the next drain."),
    None => println!("Offline: will sync when connectivity returns."),
  }
  Ok(())
}

async fn watch(sync: &CampaignSync, interval: Duration) -> Result<()> {
  let handles = sync.spawn_background(interval);
  let mut network = sync.network().watch();
  let mut queue = sync.queue().subscribe();
  info!(interval_secs = interval.as_secs(), "watching for connectivity changes");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      changed = network.changed() => {
        if changed.is_err() {
          break;
        }
        let status = *network.borrow_and_update();
        report_network(status);
      }
      changed = queue.changed() => {
        if changed.is_err() {
          break;
        }
        let state = queue.borrow_and_update().clone();
        if let (false, Some(report)) = (state.is_draining, &state.last_report) {
          info!(
            pending = state.pending,
            committed = report.committed,
            retained = report.retained,
            "queue drained"
          );
        }
      }
    }
  }

  for handle in handles {
    handle.abort();
  }
  Ok(())
}

fn report_network(status: NetworkStatus) {
  if status == NetworkStatus::Offline {
    warn!("remote unreachable, working offline");
  }
}

fn print_summary(summary: &PullSummary) {
  let source = match summary.source {
    CacheSource::Network => "refreshed",
    CacheSource::Cache => "cached",
    CacheSource::Stale => "stale",
  };
  println!(
    "{:<8} {:>6} records ({}, synced {})",
    summary.table,
    summary.count,
    source,
    format_time_ago(summary.last_synced, Utc::now())
  );
  if let Some(notice) = &summary.notice {
    println!("  {}", notice);
  }
}

fn print_records<T: Entity>(outcome: &LoadOutcome<T>) {
  for record in &outcome.records {
    let index = record.index_values();
    println!(
      "{:>8}  {:<32} {:<14} {}",
      record.id(),
      index.name.unwrap_or("-"),
      index.mobile_number.unwrap_or("-"),
      index.status.as_deref().unwrap_or("-")
    );
  }
  if outcome.is_stale() {
    println!("(offline copy, synced {})", format_time_ago(outcome.last_synced, Utc::now()));
  }
  if let Some(notice) = &outcome.notice {
    println!("{}", notice);
  }
}
