use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tutorlink::api::{Method, RequestOptions};
use tutorlink::app::App;
use tutorlink::config::Config;
use tutorlink::outbox::{FlushOutcome, NewOutboxEntry, SendOutcome};

#[derive(Parser, Debug)]
#[command(name = "tutorlink")]
#[command(about = "Resilient client for the tutoring platform API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tutorlink/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// GET a path and print the JSON response
  Get {
    path: String,
    /// Cache the response for this many milliseconds
    #[arg(long)]
    cache_ttl_ms: Option<u64>,
    /// Cache the response with the configured default TTL
    #[arg(long)]
    cached: bool,
  },
  /// Send a mutation, queueing it in the outbox if it fails transiently
  Send {
    #[arg(value_enum)]
    method: MutationMethod,
    path: String,
    /// JSON request body
    #[arg(long)]
    body: Option<String>,
    /// Label shown for the queued entry
    #[arg(long)]
    title: Option<String>,
    /// Replace a queued entry with the same key instead of adding one
    #[arg(long)]
    dedupe_key: Option<String>,
  },
  /// Inspect or replay queued mutations
  Outbox {
    #[command(subcommand)]
    action: OutboxAction,
  },
  /// Probe the backend once and print the connectivity state
  Status,
  /// Track connectivity and replay the outbox until Ctrl-C
  Watch,
}

#[derive(Subcommand, Debug)]
enum OutboxAction {
  List,
  Flush,
  Clear,
  Remove { id: String },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum MutationMethod {
  Post,
  Put,
  Delete,
}

impl From<MutationMethod> for Method {
  fn from(method: MutationMethod) -> Self {
    match method {
      MutationMethod::Post => Method::Post,
      MutationMethod::Put => Method::Put,
      MutationMethod::Delete => Method::Delete,
    }
  }
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  let text =
    serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to format output: {}", e))?;
  println!("{}", text);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = tutorlink::logging::init(&config.logging)?;

  let app = App::new(config)?;

  match args.command {
    Command::Get {
      path,
      cache_ttl_ms,
      cached,
    } => {
      let mut options = RequestOptions::new();
      if cached {
        options = options.cached();
      }
      if let Some(ms) = cache_ttl_ms {
        options = options.cache_ttl(Duration::from_millis(ms));
      }
      let value = app.client.get(&path, options).await?;
      print_json(&value)?;
    }
    Command::Send {
      method,
      path,
      body,
      title,
      dedupe_key,
    } => {
      let method = Method::from(method);
      let title = title.unwrap_or_else(|| format!("{} {}", method, path));
      let mut entry = NewOutboxEntry::new(title, method, path);
      if let Some(body) = body {
        let body: Value =
          serde_json::from_str(&body).map_err(|e| eyre!("--body is not valid JSON: {}", e))?;
        entry = entry.body(body);
      }
      if let Some(key) = dedupe_key {
        entry = entry.dedupe_key(key);
      }

      match app.outbox.send_or_enqueue(entry).await? {
        SendOutcome::Delivered(value) => print_json(&value)?,
        SendOutcome::Queued(id) => eprintln!("Queued for replay as {}", id),
      }
    }
    Command::Outbox { action } => match action {
      OutboxAction::List => print_json(&app.outbox.entries())?,
      OutboxAction::Flush => match app.outbox.flush().await {
        FlushOutcome::Completed(summary) => println!(
          "delivered {}, dropped {}, remaining {}{}",
          summary.delivered,
          summary.dropped,
          summary.remaining,
          if summary.deferred { " (backing off)" } else { "" }
        ),
        FlushOutcome::Skipped(reason) => println!("flush skipped: {:?}", reason),
      },
      OutboxAction::Clear => {
        app.outbox.clear();
        println!("outbox cleared");
      }
      OutboxAction::Remove { id } => {
        if !app.outbox.remove(&id) {
          return Err(eyre!("No queued entry with id {}", id));
        }
      }
    },
    Command::Status => {
      app.monitor.probe().await;
      print_json(&app.monitor.state())?;
      println!("queued mutations: {}", app.outbox.len());
    }
    Command::Watch => watch(&app).await?,
  }

  Ok(())
}

async fn watch(app: &App) -> Result<()> {
  let shutdown = CancellationToken::new();
  let monitor = tokio::spawn(app.monitor.clone().run(shutdown.clone()));
  let mut state = app.monitor.subscribe();
  let mut queued = app.outbox.subscribe_len();

  app.monitor.probe().await;
  app.outbox.flush().await;
  println!("{} ({} queued)", app.monitor.status(), app.outbox.len());

  loop {
    tokio::select! {
      result = tokio::signal::ctrl_c() => {
        result.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
        break;
      }
      Ok(()) = state.changed() => {
        let current = state.borrow_and_update().clone();
        if !current.checking {
          println!("{} ({} queued)", current.status, app.outbox.len());
        }
      }
      Ok(()) = queued.changed() => {
        let len = *queued.borrow_and_update();
        println!("{} queued", len);
      }
    }
  }

  shutdown.cancel();
  monitor
    .await
    .map_err(|e| eyre!("Connectivity monitor failed: {}", e))?;
  Ok(())
}
