use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use patron::cache::{EntryStatus, SafeStorage};
use patron::config::Config;
use patron::{endpoints, PatronClient, RequestDescriptor};

#[derive(Parser, Debug)]
#[command(name = "patron")]
#[command(about = "Command-line client for the creator platform API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/patron/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr instead of the log file
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// GET an API path and print the JSON response
  Get {
    path: String,

    /// Override the default timeout
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Serve from and record into the cache, keyed by path
    #[arg(long)]
    cached: bool,
  },
  /// Fetch the admin dashboard
  Dashboard,
  /// Inspect or clear the persisted cache
  Cache {
    #[command(subcommand)]
    action: CacheAction,
  },
  /// End the session and drop all cached data
  Logout,
}

impl Command {
  /// Commands after which no snapshot may be written back on exit.
  fn clears_cache(&self) -> bool {
    matches!(
      self,
      Command::Logout
        | Command::Cache {
          action: CacheAction::Clear
        }
    )
  }
}

#[derive(Subcommand, Debug)]
enum CacheAction {
  Show,
  Clear,
}

const QUERY_STALE_TIME: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = patron::logging::init(&config.logging.level, args.verbose)?;

  let storage = SafeStorage::open(config.cache.path.as_deref());
  let client = PatronClient::new(config.client_config(), storage, None)?;
  if let Some(token) = Config::get_api_token() {
    client.sign_in(token);
  }
  client.cache().restored().await;

  let clears_cache = args.command.clears_cache();
  let result = run(&client, args.command).await;

  if !clears_cache {
    let written = client.cache().flush();
    info!(written, "cache flushed on exit");
  }

  result
}

async fn run(client: &PatronClient, command: Command) -> Result<()> {
  match command {
    Command::Get {
      path,
      timeout_ms,
      cached,
    } => {
      let mut descriptor = RequestDescriptor::get(path.as_str());
      if let Some(ms) = timeout_ms {
        descriptor = descriptor.with_timeout(Duration::from_millis(ms));
      }

      let value: Value = if cached {
        let key = endpoints::keys::for_path(&path);
        client.query(key, &descriptor, QUERY_STALE_TIME).await?
      } else {
        client.execute(&descriptor).await?
      };
      print_json(&value)
    }
    Command::Dashboard => {
      let value: Value = client
        .query(
          endpoints::keys::admin_dashboard(),
          &endpoints::admin::dashboard(),
          QUERY_STALE_TIME,
        )
        .await?;
      print_json(&value)
    }
    Command::Cache { action } => match action {
      CacheAction::Show => {
        let entries: Vec<Value> = client
          .cache()
          .entries()
          .into_iter()
          .map(|entry| {
            json!({
              "key": entry.key.to_string(),
              "status": status_label(entry.status()),
              "updatedAt": entry.updated_at.to_rfc3339(),
            })
          })
          .collect();
        print_json(&json!({
          "persistent": client.cache().is_persistent(),
          "storageKey": client.cache().config().versioned_key(),
          "entries": entries,
        }))
      }
      CacheAction::Clear => {
        client.cache().clear();
        println!("Cache cleared");
        Ok(())
      }
    },
    Command::Logout => {
      if client.credentials().is_present() {
        // The server side is best effort; local state is dropped regardless.
        if let Err(e) = client.execute::<Value>(&endpoints::auth::logout()).await {
          tracing::warn!(error = %e, "logout request failed");
        }
      }
      client.end_session();
      println!("Logged out");
      Ok(())
    }
  }
}

fn status_label(status: EntryStatus) -> &'static str {
  match status {
    EntryStatus::Pending => "pending",
    EntryStatus::Success => "success",
    EntryStatus::Error => "error",
  }
}

fn print_json(value: &Value) -> Result<()> {
  let out = serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to render JSON: {}", e))?;
  println!("{}", out);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn command(argv: &[&str]) -> Command {
    Args::try_parse_from(std::iter::once("patron").chain(argv.iter().copied()))
      .unwrap()
      .command
  }

  #[test]
  fn test_exit_flush_skipped_only_after_clearing() {
    assert!(command(&["logout"]).clears_cache());
    assert!(command(&["cache", "clear"]).clears_cache());

    assert!(!command(&["cache", "show"]).clears_cache());
    assert!(!command(&["dashboard"]).clears_cache());
    assert!(!command(&["get", "/creator/profile", "--cached"]).clears_cache());
  }
}
