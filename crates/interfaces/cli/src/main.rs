use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use kira_config::AppConfig;
use kira_core::{EntityState, Header, Kind, now_utc, parse_utc, parse_zone};
use kira_rollup::{RollupEngine, render_markdown};
use kira_runtime::Runtime;
use kira_vault::{HeaderPatch, Host, NullEmitter, WriteOptions};

#[derive(Debug, Parser)]
#[command(
    name = "kira",
    version,
    about = "A Markdown-vault knowledge and task engine"
)]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, global = true, default_value = "kira.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scaffold the vault directory layout and a default kira.toml.
    Init,
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    Note {
        #[command(subcommand)]
        command: NoteCommands,
    },
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },
    /// Print one entity (header and body).
    Show { id: String },
    Delete { id: String },
    /// List entities whose links resolve to the given id.
    Backlinks { id: String },
    /// Render a day or week rollup to stdout.
    Rollup {
        #[arg(value_enum)]
        scope: RollupScopeArg,
        /// Civil date (YYYY-MM-DD); defaults to today in the configured zone.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Scan the vault, rebuild the link graph, and report its health.
    Doctor,
    /// Run the engine (scheduler, inbox watcher, bus) until Ctrl-C.
    Daemon,
}

#[derive(Debug, Subcommand)]
enum TaskCommands {
    Add {
        title: String,
        /// Due instant, ISO-8601 with offset (e.g. 2025-10-20T17:00:00+00:00).
        #[arg(long)]
        due: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// `<int>(m|h|d)` or minutes.
        #[arg(long)]
        estimate: Option<String>,
        #[arg(long)]
        assignee: Option<String>,
    },
    List {
        /// Filter by state (todo, doing, review, done, blocked).
        #[arg(long)]
        state: Option<String>,
    },
    /// todo -> doing.
    Start { id: String },
    /// Complete the task; stamps done_ts and freezes the estimate.
    Done { id: String },
    Block { id: String, reason: String },
    /// done -> doing; a reason is mandatory.
    Reopen { id: String, reason: String },
}

#[derive(Debug, Subcommand)]
enum NoteCommands {
    Add {
        title: String,
        #[arg(long)]
        body: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum EventCommands {
    Add {
        title: String,
        #[arg(long)]
        start: String,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        location: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RollupScopeArg {
    Daily,
    Weekly,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.telemetry.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init => init(&cli.config, &config),
        Commands::Task { command } => task(&config, command),
        Commands::Note { command } => note(&config, command),
        Commands::Event { command } => event(&config, command),
        Commands::Show { id } => show(&config, &id),
        Commands::Delete { id } => delete(&config, &id),
        Commands::Backlinks { id } => backlinks(&config, &id),
        Commands::Rollup { scope, date } => rollup(&config, scope, date),
        Commands::Doctor => doctor(&config),
        Commands::Daemon => daemon(config).await,
    }
}

fn open_host(config: &AppConfig) -> Result<Host> {
    Ok(Host::open(
        &config.vault.root,
        &config.host,
        Box::new(NullEmitter),
    )?)
}

fn init(config_path: &PathBuf, config: &AppConfig) -> Result<()> {
    if !config_path.exists() {
        config.save_to(config_path)?;
        println!("wrote {}", config_path.display());
    }
    open_host(config)?;
    println!("vault ready at {}", config.vault.root);
    Ok(())
}

fn task(config: &AppConfig, command: TaskCommands) -> Result<()> {
    let host = open_host(config)?;
    let opts = WriteOptions::default();
    match command {
        TaskCommands::Add {
            title,
            due,
            tags,
            estimate,
            assignee,
        } => {
            let mut header = Header::draft(Kind::Task, title);
            header.tags = tags;
            header.estimate = estimate;
            header.assignee = assignee;
            if let Some(due) = due {
                header.due_ts = Some(parse_utc(&due)?);
            }
            let entity = host.create(Kind::Task, header, "", &opts)?;
            println!("{}", entity.id());
        }
        TaskCommands::List { state } => {
            let wanted = state
                .map(|s| {
                    EntityState::from_slug(&s)
                        .ok_or_else(|| anyhow::anyhow!("unknown state '{s}'"))
                })
                .transpose()?;
            for entity in host.list(Some(Kind::Task))? {
                if wanted.is_some_and(|w| w != entity.header.state) {
                    continue;
                }
                println!(
                    "{:<8} {:<44} {}",
                    entity.header.state, entity.header.id, entity.header.title
                );
            }
        }
        TaskCommands::Start { id } => {
            host.transition(&id, EntityState::Doing, None, &opts)?;
            println!("{id} -> doing");
        }
        TaskCommands::Done { id } => {
            host.transition(&id, EntityState::Done, None, &opts)?;
            println!("{id} -> done");
        }
        TaskCommands::Block { id, reason } => {
            host.transition(&id, EntityState::Blocked, Some(&reason), &opts)?;
            println!("{id} -> blocked");
        }
        TaskCommands::Reopen { id, reason } => {
            host.transition(&id, EntityState::Doing, Some(&reason), &opts)?;
            println!("{id} -> doing");
        }
    }
    Ok(())
}

fn note(config: &AppConfig, command: NoteCommands) -> Result<()> {
    let host = open_host(config)?;
    match command {
        NoteCommands::Add { title, body, tags } => {
            let mut header = Header::draft(Kind::Note, title);
            header.tags = tags;
            let entity = host.create(
                Kind::Note,
                header,
                body.as_deref().unwrap_or(""),
                &WriteOptions::default(),
            )?;
            println!("{}", entity.id());
        }
    }
    Ok(())
}

fn event(config: &AppConfig, command: EventCommands) -> Result<()> {
    let host = open_host(config)?;
    match command {
        EventCommands::Add {
            title,
            start,
            end,
            location,
        } => {
            let mut header = Header::draft(Kind::Event, title);
            header.start_ts = Some(parse_utc(&start)?);
            header.end_ts = end.map(|e| parse_utc(&e)).transpose()?;
            header.location = location;
            let entity = host.create(Kind::Event, header, "", &WriteOptions::default())?;
            println!("{}", entity.id());
        }
    }
    Ok(())
}

fn show(config: &AppConfig, id: &str) -> Result<()> {
    let host = open_host(config)?;
    let entity = host.read(id)?;
    print!(
        "{}",
        kira_vault::render_document(&entity.header, &entity.body)
    );
    Ok(())
}

fn delete(config: &AppConfig, id: &str) -> Result<()> {
    let host = open_host(config)?;
    host.delete(id, &WriteOptions::default())?;
    println!("deleted {id}");
    Ok(())
}

fn backlinks(config: &AppConfig, id: &str) -> Result<()> {
    let host = open_host(config)?;
    for source in host.backlinks(id)? {
        println!("{source}");
    }
    Ok(())
}

fn rollup(config: &AppConfig, scope: RollupScopeArg, date: Option<NaiveDate>) -> Result<()> {
    let host = Arc::new(open_host(config)?);
    let zone = parse_zone(&config.time.timezone)?;
    let date = date.unwrap_or_else(|| now_utc().with_timezone(&zone).date_naive());
    let engine = RollupEngine::new(host);
    let doc = match scope {
        RollupScopeArg::Daily => engine.daily(date, zone)?,
        RollupScopeArg::Weekly => engine.weekly(date, zone)?,
    };
    print!("{}", render_markdown(&doc));
    Ok(())
}

fn doctor(config: &AppConfig) -> Result<()> {
    let host = open_host(config)?;
    let scanned = host.rebuild_graph()?;
    let diagnosis = host.diagnose()?;
    println!("entities scanned : {scanned}");
    println!("orphans          : {}", diagnosis.orphans.len());
    println!("cycles           : {}", diagnosis.cycles.len());
    println!("broken links     : {}", diagnosis.broken.len());
    println!("near-duplicates  : {}", diagnosis.near_duplicates.len());
    for broken in &diagnosis.broken {
        println!("  broken: {} -> {}", broken.source, broken.target);
    }
    for pair in &diagnosis.near_duplicates {
        println!(
            "  near-duplicate: {} ~ {} ({:.2})",
            pair.left, pair.right, pair.similarity
        );
    }
    Ok(())
}

async fn daemon(config: AppConfig) -> Result<()> {
    if config.sync.enabled {
        // The calendar client is an external collaborator; the daemon
        // refuses to pretend one is wired in.
        bail!("sync.enabled is set but no calendar provider is built into this binary");
    }
    let runtime = Runtime::start(config, None).await?;
    println!("kira daemon running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    runtime.shutdown().await;
    Ok(())
}
