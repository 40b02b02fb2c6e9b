use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use sql_agent_domain::{AgentConfig, RunId, SessionId};
use sql_agent_orchestrator::{RunOutput, RunRequest, SessionOrchestrator};
use sql_agent_provider::route_language_model;
use sql_agent_safety::{SafetyValidator, SqlGuard};
use sql_agent_store_core::{HistoryStore, TraceStore};
use sql_agent_store_sqlite::SqliteStore;
use sql_agent_warehouse::{QueryExecutor, SqliteWarehouse, WarehouseConfig};

#[derive(Debug, Parser)]
#[command(name = "sql-agent")]
#[command(about = "Answer questions about a SQL database with guarded, audited queries")]
struct Cli {
    /// Emit debug diagnostics on stderr.
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Ask(AskArgs),
    Validate(ValidateArgs),
    Schema(SchemaArgs),
    History(HistoryArgs),
    Trace(TraceArgs),
    Replay(ReplayArgs),
}

#[derive(Debug, Args)]
struct AskArgs {
    #[arg(long)]
    query: String,
    #[arg(long)]
    session_id: Option<String>,
    #[arg(long)]
    role: Option<String>,
    #[arg(long)]
    warehouse_db: PathBuf,
    /// Conversation and trace database. Defaults to a store that lives only for this process.
    #[arg(long)]
    store_db: Option<PathBuf>,
    #[arg(long, default_value = "mock")]
    llm: String,
    #[arg(long)]
    llm_url: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    auth_bearer_env: Option<String>,
    #[arg(long, default_value_t = 10)]
    row_limit: usize,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    #[arg(long)]
    sql: String,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Args)]
struct SchemaArgs {
    #[arg(long)]
    warehouse_db: PathBuf,
}

#[derive(Debug, Args)]
struct HistoryArgs {
    #[command(subcommand)]
    command: HistorySubcommand,
}

#[derive(Debug, Subcommand)]
enum HistorySubcommand {
    Show {
        #[arg(long)]
        store_db: PathBuf,
        #[arg(long)]
        session_id: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    Sessions {
        #[arg(long)]
        store_db: PathBuf,
    },
    Clear {
        #[arg(long)]
        store_db: PathBuf,
        #[arg(long)]
        session_id: String,
    },
}

#[derive(Debug, Args)]
struct TraceArgs {
    #[command(subcommand)]
    command: TraceSubcommand,
}

#[derive(Debug, Subcommand)]
enum TraceSubcommand {
    Runs {
        #[arg(long)]
        store_db: PathBuf,
    },
    Events {
        #[arg(long)]
        store_db: PathBuf,
        #[arg(long)]
        run_id: String,
    },
}

#[derive(Debug, Args)]
struct ReplayArgs {
    #[arg(long)]
    store_db: PathBuf,
    #[arg(long)]
    run_id: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Ask(args) => ask_command(&args),
        Commands::Validate(args) => validate_command(&args),
        Commands::Schema(args) => schema_command(&args),
        Commands::History(args) => history_command(args),
        Commands::Trace(args) => trace_command(args),
        Commands::Replay(args) => replay_command(&args),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn ask_command(args: &AskArgs) -> Result<()> {
    let llm = route_language_model(&args.llm, &llm_params(args))?;
    let warehouse = SqliteWarehouse::open(
        &args.warehouse_db,
        WarehouseConfig {
            row_limit: args.row_limit,
        },
    )?;
    let guard = SafetyValidator::new()?;
    let store = open_store(args.store_db.as_deref())?;
    store.migrate()?;
    tracing::debug!(
        llm = llm.name(),
        warehouse = %args.warehouse_db.display(),
        persistent_store = args.store_db.is_some(),
        "collaborators ready"
    );

    let orchestrator = SessionOrchestrator::new(
        llm.as_ref(),
        &warehouse,
        &guard,
        &store,
        &store,
        AgentConfig::default(),
    );
    let output = orchestrator.run_request(RunRequest {
        query: args.query.clone(),
        session_id: args.session_id.clone(),
        caller_role: args.role.clone(),
        run_id: None,
    })?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output_json(&output))?);
    } else {
        for message in &output.messages {
            println!("{}\n", message.content);
        }
        println!(
            "run_id={} session_id={} outcome={}",
            output.run_id,
            output.session_id,
            output.outcome()
        );
    }
    Ok(())
}

fn llm_params(args: &AskArgs) -> serde_json::Value {
    let mut params = json!({});
    if let Some(url) = &args.llm_url {
        params["url"] = json!(url);
    }
    if let Some(model) = &args.model {
        params["model_id"] = json!(model);
    }
    if let Some(env) = &args.auth_bearer_env {
        params["auth_bearer_env"] = json!(env);
    }
    params
}

fn output_json(output: &RunOutput) -> serde_json::Value {
    json!({
        "run_id": output.run_id,
        "session_id": output.session_id,
        "messages": output.messages,
        "sql": output.generated_sql(),
        "outcome": output.outcome(),
        "answer": output.final_answer(),
    })
}

fn validate_command(args: &ValidateArgs) -> Result<()> {
    let validator = SafetyValidator::new()?;
    if args.json {
        println!("{}", serde_json::to_string(&validator.validate(&args.sql))?);
    } else {
        println!("{}", validator.violation_report(&args.sql));
    }
    Ok(())
}

fn schema_command(args: &SchemaArgs) -> Result<()> {
    let warehouse = SqliteWarehouse::open(&args.warehouse_db, WarehouseConfig::default())?;
    println!("{}", warehouse.schema_info(false)?);
    Ok(())
}

fn history_command(args: HistoryArgs) -> Result<()> {
    match args.command {
        HistorySubcommand::Show {
            store_db,
            session_id,
            limit,
        } => {
            let store = open_store(Some(&store_db))?;
            store.migrate()?;
            let session_id = SessionId::from(session_id.as_str());
            for record in store.recent_interactions(&session_id, limit)? {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        HistorySubcommand::Sessions { store_db } => {
            let store = open_store(Some(&store_db))?;
            store.migrate()?;
            for session_id in store.list_sessions()? {
                println!("{session_id}");
            }
        }
        HistorySubcommand::Clear {
            store_db,
            session_id,
        } => {
            let store = open_store(Some(&store_db))?;
            store.migrate()?;
            let removed = store.clear_session(&SessionId::from(session_id.as_str()))?;
            println!("session_id={session_id} removed={removed}");
        }
    }
    Ok(())
}

fn trace_command(args: TraceArgs) -> Result<()> {
    match args.command {
        TraceSubcommand::Runs { store_db } => {
            let store = open_store(Some(&store_db))?;
            store.migrate()?;
            for run in store.list_runs()? {
                println!("{}", serde_json::to_string(&run)?);
            }
        }
        TraceSubcommand::Events { store_db, run_id } => {
            let store = open_store(Some(&store_db))?;
            store.migrate()?;
            let run_id = RunId::parse(&run_id)?;
            for event in store.list_events_for_run(run_id)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }
    Ok(())
}

fn replay_command(args: &ReplayArgs) -> Result<()> {
    let store = open_store(Some(&args.store_db))?;
    store.migrate()?;
    let run_id = RunId::parse(&args.run_id)?;
    if store.get_run(run_id)?.is_none() {
        return Err(anyhow!("run_id {run_id} not found"));
    }

    // Replay only reads the trace; the other collaborators are never consulted.
    let llm = route_language_model("mock", &json!({}))?;
    let guard = SafetyValidator::new()?;
    let warehouse = NoWarehouse;
    let report = SessionOrchestrator::new(
        llm.as_ref(),
        &warehouse,
        &guard,
        &store,
        &store,
        AgentConfig::default(),
    )
    .replay_audit(run_id)?;

    println!(
        "run_id={} events={} chain_valid={}",
        report.run_id, report.events, report.chain_valid
    );
    Ok(())
}

fn open_store(path: Option<&Path>) -> Result<SqliteStore> {
    match path {
        Some(path) => SqliteStore::open(path),
        None => SqliteStore::open_in_memory(),
    }
}

struct NoWarehouse;

impl QueryExecutor for NoWarehouse {
    fn name(&self) -> &'static str {
        "none"
    }

    fn execute(&self, _sql: &str) -> Result<sql_agent_warehouse::QueryOutcome> {
        Err(anyhow!("no warehouse is attached"))
    }

    fn schema_info(&self, _use_cache: bool) -> Result<String> {
        Err(anyhow!("no warehouse is attached"))
    }

    fn clear_schema_cache(&self) {}
}
