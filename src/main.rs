#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use courier::config::Config;
use courier::dispatch::{Dispatcher, ProcessOutcome};
use courier::fsm::{EventOutcome, TaskEvent, TaskEventKind, TaskState};
use courier::health::HealthMonitor;
use courier::observability::QueueJournal;
use courier::queue::{
    DeadLetterFilter, Message, MessageCategory, MessagePriority, QueueEntry, QueueFilter,
    QueueStatus, QueueStore, SqliteQueueStore,
};
use courier::{ConfigCommands, TaskCommands};
use std::io::{Read, Write};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `courier` - durable message queue and delivery for agent swarms.
#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(version)]
#[command(about = "Queue, deliver and track messages between coordinated agents.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue a message for an agent
    #[command(long_about = "\
Enqueue a message for an agent.

The message is validated, routed, rate-limited and deduplicated, then
stored as pending. Delivery happens in the daemon (or `courier deliver`).
Use `-` as content to read it from stdin.

Examples:
  courier submit Worker-1 'run checks'
  courier submit Worker-1 'build the parser' --task task-42 --category c2a
  git diff | courier submit Reviewer - --from Worker-1 --category a2a")]
    Submit {
        /// Recipient agent name
        recipient: String,
        /// Message content, or `-` for stdin
        content: String,
        /// Sender name
        #[arg(long = "from", default_value = "Coordinator")]
        sender: String,
        /// Category (a2a, c2a, s2a, e2a or the long names)
        #[arg(long, default_value = "captain_to_agent")]
        category: MessageCategory,
        /// Priority (low, normal, high, urgent); urgent skips deduplication
        #[arg(long, default_value = "normal")]
        priority: MessagePriority,
        /// Track this message as a task assignment
        #[arg(long)]
        task: Option<String>,
    },

    /// Show the status of one queue entry
    Status {
        /// Queue entry id
        queue_id: String,
        /// Also print the entry's journal history
        #[arg(long)]
        history: bool,
    },

    /// List queue entries, oldest first
    List {
        /// Only entries in this status
        #[arg(long)]
        status: Option<QueueStatus>,
        /// Only entries for this recipient
        #[arg(long)]
        recipient: Option<String>,
        /// Maximum number of entries (0 = all)
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },

    /// List dead-lettered entries for triage
    DeadLetters {
        /// Only records for this recipient
        #[arg(long)]
        recipient: Option<String>,
        /// Only records dead-lettered at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Only records dead-lettered before this RFC 3339 time
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },

    /// Remove old dead-letter records
    PurgeDeadLetters {
        /// Remove records older than this many days
        #[arg(long, default_value_t = 30)]
        older_than_days: u32,
    },

    /// Cancel an entry that has not been claimed yet
    Cancel {
        /// Queue entry id
        queue_id: String,
    },

    /// Force a stuck or failed entry back to pending
    Requeue {
        /// Queue entry id
        queue_id: String,
    },

    /// Deliver every due entry once and exit
    Deliver {
        /// Only entries for this recipient
        #[arg(long)]
        recipient: Option<String>,
    },

    /// Manage tracked tasks
    Task {
        #[command(subcommand)]
        task_command: TaskCommands,
    },

    /// Scan the queue for stuck and aged entries
    Health {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run delivery workers, health monitor and dedup sweep until Ctrl+C
    Daemon,

    /// Manage configuration
    #[command(long_about = "\
Manage courier configuration.

Examples:
  courier config schema              # print JSON Schema to stdout
  courier config schema > schema.json")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `courier`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(courier completions bash)
  courier completions zsh > ~/.zfunc/_courier
  courier completions fish > ~/.config/fish/completions/courier.fish")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("COURIER_CONFIG_DIR", config_dir);
    }

    // Completions must remain stdout-only and should not load config or initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    if let Commands::Config { config_command } = &cli.command {
        match config_command {
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                println!("{}", serde_json::to_string_pretty(&schema)?);
                return Ok(());
            }
        }
    }

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Completions { .. } | Commands::Config { .. } => unreachable!(),

        Commands::Submit {
            recipient,
            content,
            sender,
            category,
            priority,
            task,
        } => {
            let content = if content == "-" {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read message content from stdin")?;
                buf
            } else {
                content
            };
            let mut message =
                Message::new(sender, recipient, category, content).with_priority(priority);
            if let Some(task_id) = task {
                message = message.with_task(task_id);
            }

            let dispatcher = cli_dispatcher(&config)?;
            dispatcher.restore_state()?;
            let entry = dispatcher.submit(message)?;
            println!("✅ Enqueued {}", entry.queue_id);
            print_entry(&entry);
            Ok(())
        }

        Commands::Status { queue_id, history } => {
            let store = open_store(&config)?;
            let entry = store.get(&queue_id)?;
            print_entry(&entry);
            if history {
                let events = courier::observability::load_events(
                    &config.journal_path(),
                    Some(&queue_id),
                    0,
                )?;
                if events.is_empty() {
                    println!("  (no journal history)");
                }
                for event in events {
                    println!(
                        "  {} {:?} attempts={}{}",
                        event.timestamp,
                        event.kind,
                        event.delivery_attempts,
                        event
                            .detail
                            .map(|d| format!(" ({d})"))
                            .unwrap_or_default()
                    );
                }
            }
            Ok(())
        }

        Commands::List {
            status,
            recipient,
            limit,
        } => {
            let store = open_store(&config)?;
            let entries = store.list(&QueueFilter {
                status,
                recipient,
                updated_since: None,
                limit: Some(limit),
            })?;
            if entries.is_empty() {
                println!("No queue entries.");
            }
            for entry in &entries {
                println!(
                    "{}  {:<11} {:<16} attempts={} {}",
                    entry.queue_id,
                    entry.status.as_str(),
                    entry.recipient(),
                    entry.delivery_attempts,
                    entry.created_at.to_rfc3339()
                );
            }
            Ok(())
        }

        Commands::DeadLetters {
            recipient,
            since,
            until,
        } => {
            let store = open_store(&config)?;
            let records = store.list_dead_letters(&DeadLetterFilter {
                recipient,
                since,
                until,
            })?;
            if records.is_empty() {
                println!("No dead letters.");
            }
            for record in &records {
                println!(
                    "💀 {}  {}  attempts={}  at {}",
                    record.queue_id,
                    record.recipient(),
                    record.total_attempts,
                    record.dead_lettered_at.to_rfc3339()
                );
                println!("   reason: {}", record.failure_reason);
                for error in &record.entry.error_history {
                    println!("   - {error}");
                }
            }
            Ok(())
        }

        Commands::PurgeDeadLetters { older_than_days } => {
            let before = Utc::now()
                .checked_sub_signed(TimeDelta::days(i64::from(older_than_days)))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let removed = open_store(&config)?.purge_dead_letters(before)?;
            println!("🧹 Removed {removed} dead-letter record(s) older than {older_than_days} day(s)");
            Ok(())
        }

        Commands::Cancel { queue_id } => {
            let dispatcher = cli_dispatcher(&config)?;
            let entry = dispatcher.cancel(&queue_id)?;
            println!("🛑 Cancelled {}", entry.queue_id);
            Ok(())
        }

        Commands::Requeue { queue_id } => {
            let dispatcher = cli_dispatcher(&config)?;
            let entry = dispatcher.requeue(&queue_id)?;
            println!(
                "🔁 Requeued {} (attempts so far: {})",
                entry.queue_id, entry.delivery_attempts
            );
            Ok(())
        }

        Commands::Deliver { recipient } => {
            let dispatcher = cli_dispatcher(&config)?;
            dispatcher.reconcile_tasks()?;
            dispatcher.restore_state()?;
            let outcomes = dispatcher.drain(recipient.as_deref()).await?;
            if outcomes.is_empty() {
                println!("Nothing due.");
            }
            for outcome in &outcomes {
                print_outcome(outcome);
            }
            Ok(())
        }

        Commands::Task { task_command } => handle_task_command(task_command, &config),

        Commands::Health { json } => {
            let monitor = HealthMonitor::from_config(open_store(&config)?, &config);
            let report = monitor.scan()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            println!("Queue health at {}", report.scanned_at.to_rfc3339());
            for status in QueueStatus::ALL {
                println!("  {:<11} {}", status.as_str(), report.count(status));
            }
            println!("  dead-letter records: {}", report.dead_letter_records);
            if report.is_healthy() {
                println!("✅ No stuck or aged entries");
            }
            for entry in &report.stuck {
                println!(
                    "⚠️  stuck   {}  {}  {}s in processing",
                    entry.queue_id, entry.recipient, entry.age_secs
                );
            }
            for entry in &report.aged_pending {
                println!(
                    "⚠️  aged    {}  {}  {}s pending",
                    entry.queue_id, entry.recipient, entry.age_secs
                );
            }
            Ok(())
        }

        Commands::Daemon => courier::daemon::run(config).await,
    }
}

/// Dispatcher for a one-shot command. The journal only appends here; the
/// daemon is the one process that trims it.
fn cli_dispatcher(config: &Config) -> Result<Dispatcher> {
    Ok(Dispatcher::from_config(config)?
        .with_journal(QueueJournal::from_config(config).append_only()))
}

fn open_store(config: &Config) -> Result<Arc<dyn QueueStore>> {
    Ok(Arc::new(SqliteQueueStore::open(&config.queue_db_path())?))
}

fn handle_task_command(command: TaskCommands, config: &Config) -> Result<()> {
    let dispatcher = cli_dispatcher(config)?;
    match command {
        TaskCommands::Show { task_id } => {
            print_task(&dispatcher.task(&task_id)?);
            Ok(())
        }
        TaskCommands::List => {
            let tasks = dispatcher.tasks()?;
            if tasks.is_empty() {
                println!("No tasks tracked.");
            }
            for task in &tasks {
                println!(
                    "{:<24} {:<12} {:<16} {}",
                    task.task_id,
                    task.status.as_str(),
                    task.assigned_agent,
                    task.linked_queue_id
                );
            }
            Ok(())
        }
        TaskCommands::Event {
            task_id,
            kind,
            payload,
        } => {
            let kind: TaskEventKind = kind.parse()?;
            let mut event = TaskEvent::new(task_id.clone(), kind);
            if let Some(payload) = payload {
                event = event.with_payload(payload);
            }
            match dispatcher.task_event(&event)? {
                EventOutcome::Advanced { from, to } => println!("✅ {task_id}: {from} → {to}"),
                EventOutcome::Ignored { status } => {
                    println!("ℹ️  {task_id}: {kind} ignored while {status}");
                }
                EventOutcome::Discarded { status } => {
                    println!("ℹ️  {task_id}: already {status}; event discarded");
                }
            }
            Ok(())
        }
    }
}

fn print_entry(entry: &QueueEntry) {
    println!("  queue_id:   {}", entry.queue_id);
    println!("  status:     {}", entry.status);
    println!("  recipient:  {}", entry.recipient());
    println!("  sender:     {}", entry.message.sender);
    println!("  category:   {}", entry.message.category);
    println!("  priority:   {}", entry.message.priority);
    println!("  attempts:   {}", entry.delivery_attempts);
    if let Some(task_id) = &entry.message.task_id {
        println!("  task:       {task_id}");
    }
    if let Some(error) = &entry.last_error {
        println!("  last error: {error}");
    }
    if entry.status == QueueStatus::Pending && entry.next_attempt_at > Utc::now() {
        println!("  next try:   {}", entry.next_attempt_at.to_rfc3339());
    }
}

fn print_task(task: &TaskState) {
    println!("Task {}", task.task_id);
    println!("  status:  {}", task.status);
    println!("  agent:   {}", task.assigned_agent);
    println!("  entry:   {}", task.linked_queue_id);
    for transition in &task.history {
        match &transition.note {
            Some(note) => println!(
                "  {} {} ({note})",
                transition.at.to_rfc3339(),
                transition.status
            ),
            None => println!("  {} {}", transition.at.to_rfc3339(), transition.status),
        }
    }
}

fn print_outcome(outcome: &ProcessOutcome) {
    match outcome {
        ProcessOutcome::Delivered { entry, receipt } => println!(
            "📬 {} delivered to {} via {}",
            entry.queue_id,
            entry.recipient(),
            receipt.transport
        ),
        ProcessOutcome::Requeued {
            entry,
            error,
            next_attempt_at,
        } => println!(
            "🔁 {} failed ({error}); retry after {}",
            entry.queue_id,
            next_attempt_at.to_rfc3339()
        ),
        ProcessOutcome::DeadLettered(record) => println!(
            "💀 {} dead-lettered: {}",
            record.queue_id, record.failure_reason
        ),
    }
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
