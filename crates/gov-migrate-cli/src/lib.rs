//! Operator surface for the governance state upgrade.
//!
//! Every command prints one JSON document to stdout; diagnostics go to
//! stderr through `tracing`. Embedders can call [`run_cli`] with a parsed
//! [`Cli`] or [`run_command`] against an already opened store.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use gov_migrate_core::content::{unwrap_legacy_content, ContentRegistry, Envelope};
use gov_migrate_core::keys::proposal_key;
use gov_migrate_core::numeric::timestamp_to_datetime;
use gov_migrate_core::params::{read_param, DEPOSIT_PARAMS_KEY, TALLY_PARAMS_KEY, VOTING_PARAMS_KEY};
use gov_migrate_core::types::{v1, v1beta1, Coin, DepositParams, ProposalStatus, VotingParams};
use gov_migrate_core::{
    format_rfc3339, verify_migration, KvStore, MigrationConfig, Migrator, VerificationReport,
};
use gov_migrate_store_sqlite::{run_module_migration, seed_legacy_fixture, SqliteStateStore};
use prost_types::{Any, Timestamp};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "govmig")]
#[command(about = "Governance state upgrade CLI (v1beta1 proposals to v1)")]
pub struct Cli {
    #[arg(long, default_value = "./gov_state.sqlite3")]
    db: PathBuf,

    /// JSON migration config; omitted fields keep the v0.46 defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ledger state and key counts.
    Status,
    Migrate(MigrateArgs),
    /// Audit this state file against a pre-upgrade copy.
    Verify(VerifyArgs),
    Show {
        #[command(subcommand)]
        command: ShowCommand,
    },
    Fixture {
        #[command(subcommand)]
        command: FixtureCommand,
    },
}

#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Plan and audit without writing.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
pub struct VerifyArgs {
    #[arg(long)]
    before: PathBuf,
}

#[derive(Debug, Subcommand)]
pub enum ShowCommand {
    Proposal(ShowProposalArgs),
    Params,
}

#[derive(Debug, Args)]
pub struct ShowProposalArgs {
    #[arg(long)]
    id: u64,
}

#[derive(Debug, Subcommand)]
pub enum FixtureCommand {
    /// Write the two-proposal pre-upgrade fixture into an empty state file.
    Seed,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    let migrator = Migrator::new(config, ContentRegistry::v1beta1())?;
    let mut store = open_store(&cli.db)?;
    run_command(cli.command, &mut store, &migrator)
}

pub fn run_command(command: Command, store: &mut SqliteStateStore, migrator: &Migrator) -> Result<()> {
    let config = migrator.config();
    match command {
        Command::Status => {
            let status = store.status(config)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Migrate(args) => {
            let run = run_module_migration(store, migrator, args.dry_run)?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            require_healthy(&run.verification)
        }
        Command::Verify(args) => {
            if !args.before.exists() {
                bail!("before state file {} does not exist", args.before.display());
            }
            let before = SqliteStateStore::open_read_only(&args.before)?;
            let report = verify_migration(&before, &*store, migrator.registry(), config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            require_healthy(&report)
        }
        Command::Show { command } => {
            let migrated = store.applied_migration(&config.module, config.to_version)?.is_some();
            let view = match command {
                ShowCommand::Proposal(args) => {
                    show_proposal(store, migrator.registry(), config, args.id, migrated)?
                }
                ShowCommand::Params => show_params(store, config, migrated)?,
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
            Ok(())
        }
        Command::Fixture {
            command: FixtureCommand::Seed,
        } => {
            let existing = store.count_prefix(config.module_namespace().prefix())?;
            if existing > 0 {
                bail!("state already holds {existing} governance key(s); refusing to seed fixture");
            }
            seed_legacy_fixture(store, config)?;
            info!(event = "gov_fixture.seeded", module = %config.module);
            println!("{}", serde_json::to_string_pretty(&store.status(config)?)?);
            Ok(())
        }
    }
}

fn open_store(path: &Path) -> Result<SqliteStateStore> {
    let store = SqliteStateStore::open(path)?;
    store.migrate()?;
    Ok(store)
}

fn require_healthy(report: &VerificationReport) -> Result<()> {
    if !report.healthy {
        bail!("verification failed with {} issue(s)", report.issues.len());
    }
    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<MigrationConfig> {
    let Some(path) = path else {
        return Ok(MigrationConfig::v046());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
    Ok(MigrationConfig::from_json(&value)?)
}

fn schema_label(migrated: bool) -> &'static str {
    if migrated {
        "v1"
    } else {
        "v1beta1"
    }
}

fn show_proposal(
    store: &SqliteStateStore,
    registry: &ContentRegistry,
    config: &MigrationConfig,
    id: u64,
    migrated: bool,
) -> Result<Value> {
    let raw = store
        .get(&config.module_namespace().key(&proposal_key(id)))?
        .ok_or_else(|| anyhow!("proposal {id} not found"))?;

    if migrated {
        let proposal = <v1::Proposal as prost::Message>::decode(raw.as_slice())
            .with_context(|| format!("proposal {id} does not decode as v1"))?;
        let messages = proposal
            .messages
            .iter()
            .map(|message| message_view(message, registry))
            .collect::<Vec<_>>();
        let tally = proposal.final_tally_result.unwrap_or_default();
        Ok(json!({
            "schema": schema_label(true),
            "id": proposal.id,
            "status": ProposalStatus::describe(proposal.status),
            "messages": messages,
            "final_tally_result": {
                "yes": tally.yes,
                "abstain": tally.abstain,
                "no": tally.no,
                "no_with_veto": tally.no_with_veto,
            },
            "total_deposit": coins_view(&proposal.total_deposit),
            "submit_time": time_view(proposal.submit_time.as_ref())?,
            "deposit_end_time": time_view(proposal.deposit_end_time.as_ref())?,
            "voting_start_time": time_view(proposal.voting_start_time.as_ref())?,
            "voting_end_time": time_view(proposal.voting_end_time.as_ref())?,
            "metadata": proposal.metadata,
        }))
    } else {
        let proposal = <v1beta1::Proposal as prost::Message>::decode(raw.as_slice())
            .with_context(|| format!("proposal {id} does not decode as v1beta1"))?;
        let tally = proposal
            .final_tally_result
            .unwrap_or_else(v1beta1::TallyResult::empty);
        Ok(json!({
            "schema": schema_label(false),
            "proposal_id": proposal.proposal_id,
            "status": ProposalStatus::describe(proposal.status),
            "content": proposal.content.as_ref().map(|any| content_view(any, registry)),
            "final_tally_result": {
                "yes": tally.yes,
                "abstain": tally.abstain,
                "no": tally.no,
                "no_with_veto": tally.no_with_veto,
            },
            "total_deposit": coins_view(&proposal.total_deposit),
            "submit_time": time_view(proposal.submit_time.as_ref())?,
            "deposit_end_time": time_view(proposal.deposit_end_time.as_ref())?,
            "voting_start_time": time_view(proposal.voting_start_time.as_ref())?,
            "voting_end_time": time_view(proposal.voting_end_time.as_ref())?,
        }))
    }
}

fn show_params(store: &SqliteStateStore, config: &MigrationConfig, migrated: bool) -> Result<Value> {
    let subspace = config.params_namespace();
    let deposit: DepositParams = read_param(store, &subspace, DEPOSIT_PARAMS_KEY)?;
    let voting: VotingParams = read_param(store, &subspace, VOTING_PARAMS_KEY)?;
    let tally = if migrated {
        serde_json::to_value(read_param::<_, v1::TallyParams>(store, &subspace, TALLY_PARAMS_KEY)?)?
    } else {
        serde_json::to_value(read_param::<_, v1beta1::TallyParams>(store, &subspace, TALLY_PARAMS_KEY)?)?
    };

    Ok(json!({
        "schema": schema_label(migrated),
        DEPOSIT_PARAMS_KEY: deposit,
        VOTING_PARAMS_KEY: voting,
        TALLY_PARAMS_KEY: tally,
    }))
}

fn content_view(any: &Any, registry: &ContentRegistry) -> Value {
    match registry.decode(any) {
        Ok(content) => json!({
            "type_url": any.type_url,
            "title": content.title(),
            "description": content.description(),
        }),
        Err(err) => json!({
            "type_url": any.type_url,
            "error": err.to_string(),
        }),
    }
}

fn message_view(message: &Any, registry: &ContentRegistry) -> Value {
    let envelope = Envelope::from_any(message.clone());
    match unwrap_legacy_content(&envelope, registry) {
        Ok(exec) => json!({
            "type_url": envelope.type_url(),
            "authority": exec.authority,
            "content": content_view(exec.content.as_any(), registry),
        }),
        Err(err) => json!({
            "type_url": envelope.type_url(),
            "error": err.to_string(),
        }),
    }
}

fn coins_view(coins: &[Coin]) -> Value {
    Value::Array(
        coins
            .iter()
            .map(|coin| json!({ "denom": coin.denom, "amount": coin.amount }))
            .collect(),
    )
}

fn time_view(value: Option<&Timestamp>) -> Result<Value> {
    let Some(value) = value else {
        return Ok(Value::Null);
    };
    let instant = timestamp_to_datetime(value)?;
    Ok(Value::String(format_rfc3339(instant)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn missing_config_file_is_reported() {
        let err = match load_config(Some(Path::new("/nonexistent/govmig.json"))) {
            Ok(_) => panic!("expected missing config to fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn unhealthy_report_fails_the_command() {
        use gov_migrate_core::{IssueSeverity, VerificationIssue};

        let mut report = VerificationReport {
            contract_version: "gov_migration_verification.v1".to_string(),
            healthy: true,
            proposals_checked: 2,
            votes_checked: 0,
            issues: Vec::new(),
        };
        assert!(require_healthy(&report).is_ok());

        report.healthy = false;
        report.issues.push(VerificationIssue {
            code: "content_mismatch".to_string(),
            severity: IssueSeverity::Error,
            message: "proposal 1 content changed".to_string(),
        });
        let err = match require_healthy(&report) {
            Ok(()) => panic!("expected unhealthy report to fail"),
            Err(err) => err,
        };
        assert_eq!(err.to_string(), "verification failed with 1 issue(s)");
    }

    #[test]
    fn zero_time_renders_as_year_one() {
        let rendered = match time_view(Some(&Timestamp {
            seconds: -62_135_596_800,
            nanos: 0,
        })) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(rendered, json!("0001-01-01T00:00:00Z"));
    }
}
