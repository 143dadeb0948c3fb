mod app;
mod config;
mod event;
mod interceptor;
mod precache;
mod scope;
mod server;
mod store;
mod sync;
mod transport;

#[cfg(test)]
mod test_support;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

use crate::precache::{Category, OptionResult};
use crate::sync::SyncTag;

#[derive(Parser, Debug)]
#[command(name = "ocusync")]
#[command(about = "Offline-first caching proxy and sync engine for clinic workstations")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/ocusync/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the caching proxy (default)
  Serve,
  /// Warm the local store for a clinic
  Precache {
    /// Clinic to pre-cache (default: the active clinic)
    #[arg(long)]
    clinic: Option<String>,
    /// Every category
    #[arg(long, conflicts_with = "categories")]
    all: bool,
    /// Categories: essential, clinical, optical, pharmacy, laboratory, surgery
    categories: Vec<String>,
  },
  /// List pre-cache categories and their options
  Catalog,
  /// Storage used by a clinic
  Stats {
    /// Clinic (default: the active clinic)
    #[arg(long)]
    clinic: Option<String>,
  },
  /// Manage the active clinic
  Clinic {
    #[command(subcommand)]
    action: ClinicCommand,
  },
  /// Show the active clinic's outbound queue
  Queue {
    /// Requeue a write that ran out of retries
    #[arg(long, value_name = "ID")]
    retry: Option<i64>,
  },
  /// Replay queued writes now
  Sync {
    /// Sync tag (default: background-sync, the whole queue)
    tag: Option<String>,
  },
}

#[derive(Subcommand, Debug)]
enum ClinicCommand {
  /// Make a clinic the active one
  Use { clinic_id: String },
  /// Drop a clinic's cached data (queued writes are kept)
  Reset { clinic_id: String },
  /// Known clinics
  List,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = setup_logging();

  let config = config::Config::load(args.config.as_deref())?;
  let app = Arc::new(app::App::new(config)?);

  match args.command.unwrap_or(Command::Serve) {
    Command::Serve => app.serve().await?,
    Command::Precache {
      clinic,
      all,
      categories,
    } => {
      let categories = if all {
        Category::ALL.to_vec()
      } else {
        categories
          .iter()
          .map(|c| c.parse())
          .collect::<Result<Vec<Category>>>()?
      };
      if categories.is_empty() {
        return Err(eyre!("Pick at least one category, or pass --all"));
      }
      let clinic = app.scope.resolve(clinic.as_deref())?;

      let report = app
        .precache
        .run(&clinic, &categories, |p| match &p.outcome.result {
          OptionResult::Cached { records } => println!(
            "[{}/{}] {:<28} ok ({} records)",
            p.index, p.total, p.outcome.label, records
          ),
          OptionResult::Failed { message } => println!(
            "[{}/{}] {:<28} failed: {}",
            p.index, p.total, p.outcome.label, message
          ),
        })
        .await;

      println!(
        "\n{}: {} succeeded, {} failed, {} records cached",
        report.clinic_id, report.succeeded, report.failed, report.total_records
      );
    }
    Command::Catalog => {
      for entry in app.precache.catalog().entries() {
        println!("{} ({})", entry.label, entry.category);
        for option in entry.options {
          println!("  {:<26} {:<28} {}", option.id, option.label, option.path);
        }
      }
    }
    Command::Stats { clinic } => {
      let clinic = app.scope.resolve(clinic.as_deref())?;
      print_json(&app.scope.storage_stats(&clinic)?)?;
    }
    Command::Clinic { action } => match action {
      ClinicCommand::Use { clinic_id } => print_json(&app.scope.set_active_clinic(&clinic_id)?)?,
      ClinicCommand::Reset { clinic_id } => print_json(&app.scope.reset_clinic(&clinic_id)?)?,
      ClinicCommand::List => print_json(&app.scope.scopes()?)?,
    },
    Command::Queue { retry } => {
      if let Some(id) = retry {
        app.queue.retry(id)?;
      }
      print_json(&app.queue.all()?)?
    }
    Command::Sync { tag } => {
      let tag: SyncTag = match tag {
        Some(t) => t.parse()?,
        None => SyncTag::Generic,
      };
      let outcome = app.sync_now(tag).await?;
      print_json(&outcome)?;
    }
  }

  Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", out);
  Ok(())
}

/// Log to a daily file under the data directory, or to stderr when that is
/// not writable. `RUST_LOG` overrides the default `info` level.
fn setup_logging() -> Option<WorkerGuard> {
  use tracing_subscriber::EnvFilter;

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

  let log_dir = config::data_dir()
    .ok()
    .map(|dir| dir.join("logs"))
    .filter(|dir| std::fs::create_dir_all(dir).is_ok());

  match log_dir {
    Some(dir) => {
      let appender = tracing_appender::rolling::daily(dir, "ocusync.log");
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Some(guard)
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      None
    }
  }
}
