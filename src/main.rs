//! bpmnflow - BPMN process engine
//!
//! One-shot command execution against event-sourced process instances.

use bpmnflow_core::{Command, Query};
use bpmnflow_engine::{Config, ProcessEngine, ProcessSession};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bpmnflow")]
#[command(about = "Drive BPMN process instances from the command line")]
#[command(version)]
struct Cli {
    /// Process graph JSON (or @graph.json to read from file)
    #[arg(short, long, env = "BPMNFLOW_GRAPH")]
    graph: String,

    /// Output raw JSON instead of formatted text
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start an instance
    Create {
        /// Instance ID
        id: String,
    },

    /// Raise a catching event on an instance
    Raise {
        /// Instance ID
        id: String,

        /// Event name
        #[arg(short, long)]
        name: String,

        /// Event payload JSON
        #[arg(short, long)]
        payload: Option<String>,
    },

    /// Commit a job with its result
    Commit {
        /// Instance ID
        id: String,

        /// Job ID
        #[arg(short, long)]
        job: String,

        /// Job result JSON
        #[arg(short, long)]
        result: Option<String>,
    },

    /// Fail a job with an error
    Fail {
        /// Instance ID
        id: String,

        /// Job ID
        #[arg(short, long)]
        job: String,

        /// Error JSON
        #[arg(short, long)]
        error: Option<String>,
    },

    /// Stop an instance
    Stop {
        /// Instance ID
        id: String,
    },

    /// Continue a stopped instance
    Continue {
        /// Instance ID
        id: String,
    },

    /// Show instance status, open jobs and published events
    Status {
        /// Instance ID
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            // An explicitly named config file must load
            if std::env::var("BPMNFLOW_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    let engine = ProcessEngine::from_config(&config)?;
    let graph = parse_json_arg(&cli.graph)?;
    let definition = engine.deploy(&graph)?;

    let (id, command) = match cli.command {
        Commands::Create { id } => (id, Some(Command::CreateInstance)),
        Commands::Raise { id, name, payload } => {
            let payload = parse_optional(payload.as_deref())?;
            (id, Some(Command::RaiseEvent { name, payload }))
        }
        Commands::Commit { id, job, result } => {
            let result = parse_optional(result.as_deref())?;
            (
                id,
                Some(Command::CommitJob {
                    job_id: job,
                    result,
                }),
            )
        }
        Commands::Fail { id, job, error } => {
            let error = parse_optional(error.as_deref())?;
            (id, Some(Command::FailJob { job_id: job, error }))
        }
        Commands::Stop { id } => (id, Some(Command::StopInstance)),
        Commands::Continue { id } => (id, Some(Command::ContinueInstance)),
        Commands::Status { id } => (id, None),
    };

    let mut session = engine.load(&id, &definition.process_id)?;
    let before = session.version();

    if let Some(command) = command {
        session.execute(command)?;
        session.wait_idle().await;

        if !session.persist()? {
            eprintln!(
                "{}: instance {} was modified concurrently, retry the command",
                "Conflict".red(),
                id
            );
            std::process::exit(1);
        }
    }

    // Jobs and events produced by this invocation only
    let since = match (before, session.version()) {
        (Some(old), Some(new)) if new > old => new,
        (None, Some(new)) => new,
        _ => 0,
    };
    print_session(&session, since, cli.json)
}

/// Parses a JSON argument (either inline JSON or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    } else {
        Ok(serde_json::from_str(arg)?)
    }
}

fn parse_optional(arg: Option<&str>) -> Result<Value, Box<dyn std::error::Error>> {
    match arg {
        Some(arg) => parse_json_arg(arg),
        None => Ok(Value::Null),
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn print_session(
    session: &ProcessSession,
    since: u64,
    raw: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = session.query(&Query::Status)?;
    let jobs = session.get_jobs(0);
    let throwing = session.get_throwing(since);

    if raw {
        let out = serde_json::json!({
            "status": status,
            "jobs": jobs,
            "throwing": throwing,
        });
        println!("{}", out);
        return Ok(());
    }

    let state = status["status"].as_str().unwrap_or("unknown");
    let colored_state = match state {
        "completed" => state.green(),
        "stopped" => state.yellow(),
        "running" => state.cyan(),
        _ => state.normal(),
    };
    println!(
        "{} {} {}",
        "Instance".bold(),
        session.instance_id(),
        colored_state
    );
    match session.version() {
        Some(version) => println!("  {}: {}", "Version".dimmed(), version),
        None => println!("  {}: {}", "Version".dimmed(), "not stored".dimmed()),
    }

    if jobs.is_empty() {
        println!("{}", "No open jobs".dimmed());
    } else {
        println!("{}", "Open jobs:".bold());
        for job in &jobs {
            println!(
                "  {} {} [{}] {}",
                job.job_id.cyan(),
                job.element_id,
                job.action.as_deref().unwrap_or("-"),
                job.data
            );
        }
    }

    if !throwing.is_empty() {
        println!("{}", "Published events:".bold());
        for event in &throwing {
            println!("  {} {}", event.name.green(), format_json(&event.payload));
        }
    }
    Ok(())
}
