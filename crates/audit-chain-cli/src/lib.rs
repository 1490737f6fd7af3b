#![forbid(unsafe_code)]

//! Operator CLI over a local `SQLite` audit chain database.
//!
//! Every command prints pretty JSON on stdout. `chain verify` exits non-zero
//! when the chain cannot be trusted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use audit_chain_domain::{
    AuditChain, ChainLink, ChainOutcome, DecisionContent, Instrumentation, RunId, StageName,
    VerificationReport,
};
use audit_chain_ledger::{AuditLedger, RecordRequest};
use audit_chain_store::ChainStore;
use audit_chain_store_sqlite::SqliteChainStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "achain")]
#[command(about = "Record and verify decision audit chains")]
pub struct Cli {
    #[arg(long, env = "ACHAIN_DB", default_value = "./audit_chain.sqlite3")]
    db: PathBuf,

    /// Used when `RUST_LOG` is not set. Logs go to stderr.
    #[arg(long, env = "ACHAIN_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    #[arg(long, env = "ACHAIN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record one decision and the handshake routing it.
    Record(RecordArgs),
    Chain {
        #[command(subcommand)]
        command: ChainCommand,
    },
    /// End a run with a terminal ABORTED handshake.
    Abort(AbortArgs),
}

#[derive(Debug, Subcommand)]
pub enum ChainCommand {
    Show(ShowArgs),
    Verify(RunArgs),
    List,
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct RecordArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    stage: String,
    /// Omit to end the run.
    #[arg(long)]
    target_stage: Option<String>,
    #[arg(long)]
    parent: Option<String>,
    #[arg(long)]
    outcome: String,
    #[arg(long)]
    confidence: f64,
    #[arg(long = "citation")]
    citations: Vec<String>,
    #[arg(long)]
    reason: String,
    #[arg(long, default_value = "{}")]
    metadata_json: String,
    #[arg(long)]
    cost_usd: Option<f64>,
    #[arg(long)]
    duration_ms: Option<u64>,
    #[arg(long)]
    model: Option<String>,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
pub struct AbortArgs {
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    stage: String,
    #[arg(long)]
    reason: String,
}

/// Chain plus its verification, as shown and exported.
#[derive(Debug, Serialize)]
struct ChainDocument<'a> {
    run_id: &'a RunId,
    outcome: ChainOutcome,
    total_cost_usd: f64,
    total_duration_ms: u64,
    links: &'a [ChainLink],
    verification: &'a VerificationReport,
}

impl<'a> ChainDocument<'a> {
    fn new(chain: &'a AuditChain, verification: &'a VerificationReport) -> Self {
        Self {
            run_id: chain.run_id(),
            outcome: chain.outcome(),
            total_cost_usd: chain.total_cost_usd(),
            total_duration_ms: chain.total_duration_ms(),
            links: chain.links(),
            verification,
        }
    }
}

/// Install the stderr subscriber. Safe to call once per process.
pub fn init_tracing(cli: &Cli) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| cli.log_level.as_str().into());

    if cli.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// # Errors
/// Returns an error when the database cannot be opened or migrated, when the
/// command is rejected by the ledger, or when `chain verify` finds a break.
pub fn run_cli(cli: Cli) -> Result<()> {
    let ledger = open_ledger(&cli.db)?;
    match cli.command {
        Command::Record(args) => run_record(&ledger, args),
        Command::Chain { command } => run_chain(&ledger, command),
        Command::Abort(args) => {
            let run_id = RunId::parse(args.run_id)?;
            let stage = StageName::parse(&args.stage)?;
            let receipt = ledger.abort(&run_id, &stage, &args.reason)?;
            print_json(&receipt)
        }
    }
}

fn open_ledger(db_path: &Path) -> Result<AuditLedger<SqliteChainStore>> {
    let store = SqliteChainStore::open(db_path)?;
    store.migrate()?;
    Ok(AuditLedger::new(store))
}

fn run_record(ledger: &AuditLedger<SqliteChainStore>, args: RecordArgs) -> Result<()> {
    let metadata = parse_metadata_json(&args.metadata_json)?;
    let mut content = DecisionContent::new(args.outcome, args.confidence);
    for citation in args.citations {
        content = content.with_citation(citation);
    }
    if args.cost_usd.is_some() || args.duration_ms.is_some() || args.model.is_some() {
        content = content.with_instrumentation(&Instrumentation {
            cost_usd: args.cost_usd.unwrap_or(0.0),
            duration_ms: args.duration_ms.unwrap_or(0),
            model: args.model,
            attempts: 1,
        })?;
    }

    let receipt = ledger.record(RecordRequest {
        run_id: args.run_id,
        source_stage: args.stage,
        target_stage: args.target_stage,
        parent_decision_hash: args.parent,
        decision_content: content,
        transition_reason: args.reason,
        metadata,
    })?;
    print_json(&receipt)
}

fn run_chain(ledger: &AuditLedger<SqliteChainStore>, command: ChainCommand) -> Result<()> {
    match command {
        ChainCommand::Show(args) => {
            let chain = ledger.chain(&RunId::parse(args.run_id)?)?;
            let report = audit_chain_domain::verify_chain(&chain);
            match args.format {
                OutputFormat::Json => print_json(&ChainDocument::new(&chain, &report)),
                OutputFormat::Text => {
                    print!("{}", chain.summary(&report));
                    Ok(())
                }
            }
        }
        ChainCommand::Verify(args) => {
            let report = ledger.verify(&RunId::parse(args.run_id)?)?;
            print_json(&report)?;
            report.ensure_trusted()?;
            Ok(())
        }
        ChainCommand::List => print_json(&ledger.runs()?),
        ChainCommand::Export(args) => {
            let chain = ledger.chain(&RunId::parse(args.run_id)?)?;
            let report = audit_chain_domain::verify_chain(&chain);
            let document = serde_json::to_string_pretty(&ChainDocument::new(&chain, &report))?;
            std::fs::write(&args.out, document)
                .with_context(|| format!("failed to write export to {}", args.out.display()))?;
            print_json(&serde_json::json!({
                "run_id": chain.run_id(),
                "out": args.out,
                "links": chain.len(),
                "valid": report.valid,
            }))
        }
    }
}

fn parse_metadata_json(raw: &str) -> Result<BTreeMap<String, Value>> {
    let value: Value = serde_json::from_str(raw).context("--metadata-json MUST be valid JSON")?;
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(audit_chain_domain::ChainError::Validation(format!(
            "--metadata-json MUST be a JSON object, got {other}"
        ))
        .into()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_json_must_be_an_object() {
        let parsed = match parse_metadata_json(r#"{"lane": 3, "source": "dob"}"#) {
            Ok(parsed) => parsed,
            Err(err) => panic!("object metadata must parse: {err:#}"),
        };
        assert_eq!(parsed["lane"], 3);

        assert!(parse_metadata_json("[1, 2]").is_err());
        assert!(parse_metadata_json("{not json").is_err());
    }

    #[test]
    fn chain_subcommands_parse() {
        let cli = match Cli::try_parse_from([
            "achain", "--db", "chain.sqlite3", "chain", "show", "--run-id", "R1", "--format",
            "text",
        ]) {
            Ok(cli) => cli,
            Err(err) => panic!("chain show must parse: {err}"),
        };
        assert!(matches!(
            cli.command,
            Command::Chain {
                command: ChainCommand::Show(ShowArgs {
                    format: OutputFormat::Text,
                    ..
                })
            }
        ));

        let cli = match Cli::try_parse_from([
            "achain", "record", "--run-id", "R1", "--stage", "discovery", "--outcome", "found",
            "--confidence", "0.8", "--reason", "leads_discovered", "--citation", "a",
            "--citation", "b",
        ]) {
            Ok(cli) => cli,
            Err(err) => panic!("record must parse: {err}"),
        };
        match cli.command {
            Command::Record(args) => {
                assert_eq!(args.citations, vec!["a".to_string(), "b".to_string()]);
                assert!(args.target_stage.is_none());
            }
            other => panic!("expected record command, got {other:?}"),
        }
    }
}
