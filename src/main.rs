use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use formsync::cache::{CacheResult, GetOptions};
use formsync::config::Config;
use formsync::forms::{Answer, ApprovalDecision, Attachment};
use formsync::outbox::{OutboxEntry, OutboxKind};
use formsync::sync::{DrainReport, SubmitOutcome, SyncEvent};
use formsync::Engine;

#[derive(Parser, Debug)]
#[command(name = "formsync")]
#[command(about = "Offline-first sync for form submissions and approvals")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/formsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Log to stderr as well; repeat for more detail
  #[arg(short, long, action = clap::ArgAction::Count)]
  verbose: u8,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity, session and outbox state
  Status,
  /// List categories (root level unless --parent is given)
  Categories {
    #[arg(long)]
    parent: Option<String>,
    /// Skip the cache and ask the backend
    #[arg(long)]
    refresh: bool,
  },
  /// List the forms of a category
  Forms {
    category: String,
    #[arg(long)]
    include_subcategories: bool,
    #[arg(long)]
    refresh: bool,
  },
  /// Submit a form; answers are question=value pairs
  Submit {
    form_id: String,
    #[arg(short, long = "answer", value_parser = parse_answer)]
    answers: Vec<Answer>,
  },
  /// Approve or reject a response
  Approve {
    response_id: String,
    status: String,
    #[arg(short, long, default_value = "")]
    message: String,
    /// Evidence file to attach; repeatable
    #[arg(short, long = "file")]
    files: Vec<PathBuf>,
  },
  /// Replay every queued write now
  Drain,
  /// Replay the queued writes for one subject id
  Retry { id: String },
  /// Discard every queued write
  ClearOutbox,
  /// Store the bearer token used for backend calls
  SetToken { token: String },
  /// Run the reachability probe and drain on reconnect until interrupted
  Watch,
}

fn parse_answer(raw: &str) -> Result<Answer, String> {
  let (question, value) = raw
    .split_once('=')
    .ok_or_else(|| format!("expected question=value, got '{}'", raw))?;
  let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
  Ok(Answer::new(question, value))
}

fn init_tracing(verbose: u8) -> Result<WorkerGuard> {
  let log_dir = dirs::data_dir()
    .ok_or_else(|| eyre!("Could not determine data directory"))?
    .join("formsync")
    .join("logs");
  std::fs::create_dir_all(&log_dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", log_dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "formsync.log"));

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
    0 | 1 => EnvFilter::new("formsync=info"),
    _ => EnvFilter::new("formsync=debug"),
  });

  let stderr = (verbose > 0).then(|| {
    tracing_subscriber::fmt::layer()
      .with_writer(std::io::stderr)
      .with_target(false)
      .without_time()
  });

  tracing_subscriber::registry()
    .with(filter)
    .with(
      tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false),
    )
    .with(stderr)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let engine = Engine::new(&config)?;

  let result = run(&engine, args.command).await;
  engine.shutdown();
  result
}

async fn run(engine: &Engine, command: Command) -> Result<()> {
  match command {
    Command::Status => print_status(engine),
    Command::Categories { parent, refresh } => {
      let result = engine
        .catalog()
        .categories(parent.as_deref(), options(refresh))
        .await;
      print_source(&result);
      for category in &result.data {
        println!("{}\t{}", category.id, category.name);
      }
    }
    Command::Forms {
      category,
      include_subcategories,
      refresh,
    } => {
      let result = engine
        .catalog()
        .forms(&category, include_subcategories, options(refresh))
        .await;
      print_source(&result);
      for form in &result.data {
        println!("{}\t{}", form.id, form.name);
      }
    }
    Command::Submit { form_id, answers } => {
      let outcome = engine
        .coordinator()
        .submit(OutboxEntry::form_submission(&form_id, answers))
        .await;
      print_outcome(outcome)?;
    }
    Command::Approve {
      response_id,
      status,
      message,
      files,
    } => {
      let files = files.into_iter().map(attachment).collect::<Result<Vec<_>>>()?;
      let outcome = engine
        .coordinator()
        .submit(OutboxEntry::approval_decision(ApprovalDecision {
          response_id,
          status,
          message,
          files,
        }))
        .await;
      print_outcome(outcome)?;
    }
    Command::Drain => print_report(&engine.coordinator().drain().await)?,
    Command::Retry { id } => {
      if engine.coordinator().outbox().find(&id).is_empty() {
        return Err(eyre!("Nothing queued for {}", id));
      }
      print_report(&engine.coordinator().retry(&id).await)?;
    }
    Command::ClearOutbox => {
      let pending = engine.coordinator().outbox().len();
      engine.coordinator().outbox().clear();
      println!("Discarded {} queued writes", pending);
    }
    Command::SetToken { token } => {
      engine.session().set_token(&token);
      println!("Token saved");
    }
    Command::Watch => watch(engine).await?,
  }

  Ok(())
}

async fn watch(engine: &Engine) -> Result<()> {
  let mut events = engine.coordinator().subscribe();
  let tasks = engine.start();
  info!("Watching connectivity");

  loop {
    tokio::select! {
      _ = tokio::signal::ctrl_c() => break,
      event = events.recv() => match event {
        Ok(SyncEvent::DrainStarted { pending }) => println!("Draining {} queued writes", pending),
        Ok(SyncEvent::EntrySucceeded { id }) => println!("  sent {}", id),
        Ok(SyncEvent::EntryFailed { id, error }) => println!("  failed {}: {}", id, error),
        Ok(SyncEvent::DrainFinished(report)) => println!("Done, {} still queued", report.remaining),
        Ok(SyncEvent::SessionExpired) => {
          println!("Session expired; run `formsync set-token` and try again");
          break;
        }
        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
      },
    }
  }

  for task in tasks {
    task.abort();
  }
  Ok(())
}

fn options(refresh: bool) -> GetOptions {
  if refresh {
    GetOptions::refresh()
  } else {
    GetOptions::default()
  }
}

fn attachment(path: PathBuf) -> Result<Attachment> {
  let file_name = path
    .file_name()
    .and_then(|name| name.to_str())
    .ok_or_else(|| eyre!("Invalid attachment path: {}", path.display()))?
    .to_string();

  Ok(Attachment {
    path,
    file_name,
    mime: None,
  })
}

fn print_source<T>(result: &CacheResult<T>) {
  let updated = result
    .updated_at
    .map(|at| at.to_rfc3339())
    .unwrap_or_else(|| "never".to_string());
  let stale = if result.is_stale { " (stale)" } else { "" };
  eprintln!("# source: {:?}, updated: {}{}", result.source, updated, stale);
}

fn print_status(engine: &Engine) {
  let session = engine.session();
  let coordinator = engine.coordinator();

  println!("online:     {}", engine.connectivity().is_online());
  println!(
    "session:    {}",
    match (session.token().is_some(), session.is_logged_out()) {
      (true, _) => "active",
      (false, true) => "expired",
      (false, false) => "none",
    }
  );
  println!(
    "last sync:  {}",
    coordinator
      .last_sync_at()
      .map(|at| at.to_rfc3339())
      .unwrap_or_else(|| "never".to_string())
  );

  let pending = coordinator.outbox().peek_all();
  println!("queued:     {}", pending.len());
  for entry in pending {
    let detail = match &entry.kind {
      OutboxKind::FormSubmission(submission) => format!("{} answers", submission.answers.len()),
      OutboxKind::ApprovalDecision(decision) => decision.status.clone(),
    };
    println!(
      "  {}  {:<17} {:<8} {}",
      entry.created_at.format("%Y-%m-%d %H:%M"),
      entry.label(),
      entry.id,
      detail
    );
  }
}

fn print_outcome(outcome: SubmitOutcome) -> Result<()> {
  match outcome {
    SubmitOutcome::Submitted => println!("Submitted"),
    SubmitOutcome::Queued => println!("Queued; it will be sent when the backend is reachable"),
    SubmitOutcome::SessionExpired => return Err(eyre!("Session expired; set a new token")),
  }
  Ok(())
}

fn print_report(report: &DrainReport) -> Result<()> {
  if report.skipped {
    return Err(eyre!("No session token; run `formsync set-token` first"));
  }
  println!(
    "{} sent, {} failed, {} still queued",
    report.succeeded, report.failed, report.remaining
  );
  if report.session_expired {
    return Err(eyre!("Session expired during sync; set a new token"));
  }
  Ok(())
}
