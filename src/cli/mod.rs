//! Command-line interface for arkmongo.
//!
//! Provides commands for hashing query results, anchoring them on the
//! ledger, verifying current results against anchored hashes, and
//! inspecting the hash index.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::warn;

use crate::adapters::{jsonl_stream, DocumentStore, HttpLedgerClient, JsonlDocumentStore};
use crate::config::{self, paths, ResolvedConfig};
use crate::core::hasher::compute_stream;
use crate::core::{AnchorOrchestrator, HashIndexStore, IdentityDeriver, SqliteIndexStore};
use crate::domain::{ContentHash, HashRecord, QueryIdentity};

/// arkmongo - Anchor query results on a public ledger
#[derive(Parser, Debug)]
#[command(name = "arkmongo")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Document store root (overrides configuration)
    #[arg(long, global = true)]
    pub documents: Option<PathBuf>,

    /// Hash index database (overrides configuration)
    #[arg(long, global = true)]
    pub index: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Identifies a query
#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    /// Store (database) name
    pub store: String,

    /// Collection name
    pub collection: String,

    /// Filter document as JSON
    #[arg(short, long, default_value = "{}")]
    pub filter: String,

    /// Projection document as JSON
    #[arg(short, long, default_value = "{}")]
    pub projection: String,
}

impl QueryArgs {
    fn identity(&self) -> Result<QueryIdentity> {
        let filter: Value = serde_json::from_str(&self.filter)
            .with_context(|| format!("Invalid filter JSON: {}", self.filter))?;
        let projection: Value = serde_json::from_str(&self.projection)
            .with_context(|| format!("Invalid projection JSON: {}", self.projection))?;
        Ok(QueryIdentity::new(
            self.store.clone(),
            self.collection.clone(),
            filter,
            projection,
        ))
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compute the content hash of a query's results without anchoring
    Hash {
        #[command(flatten)]
        query: QueryArgs,

        /// Hash this JSONL result set instead of running the query
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Hash a query's results and anchor the hash on the ledger
    Anchor {
        #[command(flatten)]
        query: QueryArgs,

        /// Ledger submission deadline in seconds (overrides configuration)
        #[arg(short, long)]
        timeout: Option<u64>,
    },

    /// Check a query's current results against its anchored hash
    Verify {
        #[command(flatten)]
        query: QueryArgs,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reconcile a signed anchor with the ledger
    Confirm {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Show the hash record of a query
    Show {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Show the status history and archived lineages of a query
    History {
        #[command(flatten)]
        query: QueryArgs,
    },

    /// List all hash records
    List,

    /// Find a record by content hash or ledger address
    Lookup {
        /// Content hash (hex)
        #[arg(long, conflicts_with = "address", required_unless_present = "address")]
        hash: Option<String>,

        /// Derived ledger address
        #[arg(long)]
        address: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;
        let env = Environment {
            config: cfg,
            documents: self.documents.unwrap_or_else(|| cfg.documents.clone()),
            index: self.index,
        };

        match self.command {
            Commands::Hash { query, input } => hash_query(&env, &query, input).await,
            Commands::Anchor { query, timeout } => anchor_query(&env, &query, timeout).await,
            Commands::Verify { query, json } => verify_query(&env, &query, json).await,
            Commands::Confirm { query } => confirm_query(&env, &query).await,
            Commands::Show { query } => show_record(&env, &query).await,
            Commands::History { query } => show_history(&env, &query).await,
            Commands::List => list_records(&env).await,
            Commands::Lookup { hash, address } => lookup_record(&env, hash, address).await,
            Commands::Config => show_config(&env),
        }
    }
}

/// Resolved locations for one invocation
struct Environment {
    config: &'static ResolvedConfig,
    documents: PathBuf,
    index: Option<PathBuf>,
}

impl Environment {
    fn index_path(&self) -> PathBuf {
        self.index
            .clone()
            .unwrap_or_else(|| paths::index_db_in(&self.config.home))
    }

    fn document_store(&self) -> JsonlDocumentStore {
        JsonlDocumentStore::new(self.documents.clone())
    }

    fn open_index(&self) -> Result<Arc<SqliteIndexStore>> {
        let path = self.index_path();
        let store = SqliteIndexStore::open(&path, self.config.index.busy_timeout)
            .with_context(|| format!("Failed to open hash index: {}", path.display()))?;
        Ok(Arc::new(store))
    }

    fn orchestrator(&self) -> Result<AnchorOrchestrator> {
        let ledger_cfg = &self.config.ledger;
        if ledger_cfg.uses_default_key() {
            warn!("Using the built-in derivation key; set ARKMONGO_DERIVATION_KEY for production");
        }

        let ledger = HttpLedgerClient::with_timeout(&ledger_cfg.endpoint, ledger_cfg.submit_timeout)
            .context("Failed to create ledger client")?;
        let deriver = IdentityDeriver::new(&ledger_cfg.derivation_key, ledger_cfg.network_prefix)
            .context("Invalid derivation key")?;

        Ok(AnchorOrchestrator::new(self.open_index()?, Arc::new(ledger), deriver)
            .with_settings(self.config.anchor_settings()))
    }
}

/// Compute and print a content hash
async fn hash_query(env: &Environment, query: &QueryArgs, input: Option<PathBuf>) -> Result<()> {
    let identity = query.identity()?;

    let documents = match input {
        Some(path) => jsonl_stream(&path)
            .await
            .with_context(|| format!("Failed to open input file: {}", path.display()))?,
        None => env
            .document_store()
            .find(&identity)
            .await
            .with_context(|| format!("Failed to query {}", identity.namespace()))?,
    };
    let (hash, count) = compute_stream(&identity, documents)
        .await
        .context("Failed to read result set")?;

    println!("Query:     {}", identity);
    println!("Documents: {}", count);
    println!("Hash:      {}", hash);
    Ok(())
}

/// Anchor a query's results
async fn anchor_query(env: &Environment, query: &QueryArgs, timeout: Option<u64>) -> Result<()> {
    let identity = query.identity()?;
    let orchestrator = env.orchestrator()?;
    let documents = env.document_store();

    let deadline = timeout
        .map(Duration::from_secs)
        .or(orchestrator.settings().submit_timeout);
    let result = orchestrator
        .anchor_query_with_deadline(&documents, &identity, deadline)
        .await;

    match result {
        Ok(record) => {
            println!("Anchored {}", identity);
            print_record(&record);
            Ok(())
        }
        Err(e) => {
            if e.outcome_unknown() {
                eprintln!("The ledger outcome is unknown. Run `arkmongo verify` before anchoring again.");
            }
            Err(e.into())
        }
    }
}

/// Verify a query's current results
async fn verify_query(env: &Environment, query: &QueryArgs, json: bool) -> Result<()> {
    let identity = query.identity()?;
    let verifier = env.orchestrator()?.verifier();
    let result = verifier.verify_query(&env.document_store(), &identity).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("Query:         {}", identity);
        println!("Matches:       {}", if result.matches { "yes" } else { "NO" });
        println!("Status:        {}", result.status);
        println!("Attempt:       {}", result.attempt);
        println!("Stored hash:   {}", result.stored_hash);
        println!("Computed hash: {}", result.computed_hash);
        println!("Documents:     {}", result.document_count);
        let confirmed = match result.ledger_confirmed {
            Some(true) => "yes",
            Some(false) => "not yet",
            None => "n/a",
        };
        println!("On ledger:     {}", confirmed);
    }

    if !result.matches {
        anyhow::bail!("Query results no longer match the anchored hash");
    }
    Ok(())
}

/// Reconcile a signed record with the ledger
async fn confirm_query(env: &Environment, query: &QueryArgs) -> Result<()> {
    let identity = query.identity()?;
    let record = env.orchestrator()?.confirm(&identity).await?;
    print_record(&record);
    Ok(())
}

/// Show one record
async fn show_record(env: &Environment, query: &QueryArgs) -> Result<()> {
    let identity = query.identity()?;
    let index = env.open_index()?;
    let record = index
        .get(&identity)
        .await?
        .with_context(|| format!("No hash record for {}", identity))?;

    println!("Query: {}", identity);
    print_record(&record);
    Ok(())
}

/// Show status history and archived lineages
async fn show_history(env: &Environment, query: &QueryArgs) -> Result<()> {
    let identity = query.identity()?;
    let index = env.open_index()?;
    let events = index.history(&identity).await?;

    if events.is_empty() {
        println!("No history for {}", identity);
        return Ok(());
    }

    println!("{:<28} {:<8} {:<30} {}", "TIMESTAMP", "ATTEMPT", "TRANSITION", "DETAIL");
    println!("{}", "-".repeat(90));
    for event in &events {
        let from = event
            .from_status
            .map(|s| s.as_str())
            .unwrap_or("-");
        println!(
            "{:<28} {:<8} {:<30} {}",
            event.timestamp.to_rfc3339(),
            event.attempt,
            format!("{} -> {}", from, event.to_status),
            event.detail
        );
    }

    let lineage = index.lineage(&identity).await?;
    if !lineage.is_empty() {
        println!("\nArchived lineages:");
        for record in &lineage {
            println!("  attempt {}: {} ({})", record.attempt, record.status, record.hash);
        }
    }
    Ok(())
}

/// List all records
async fn list_records(env: &Environment) -> Result<()> {
    let records = env.open_index()?.list().await?;

    if records.is_empty() {
        println!("No hash records found");
        return Ok(());
    }

    println!("{:<30} {:<30} {:<8} {:<16}", "QUERY", "STATUS", "ATTEMPT", "HASH");
    println!("{}", "-".repeat(90));
    for (identity, record) in records {
        println!(
            "{:<30} {:<30} {:<8} {:<16}",
            identity.namespace(),
            record.status,
            record.attempt,
            &record.hash.as_str()[..16]
        );
    }
    Ok(())
}

/// Reverse lookup by hash or address
async fn lookup_record(env: &Environment, hash: Option<String>, address: Option<String>) -> Result<()> {
    let index = env.open_index()?;
    let found = match (hash, address) {
        (Some(hash), _) => {
            let hash = ContentHash::from_hex(hash).map_err(anyhow::Error::msg)?;
            index.find_by_hash(&hash).await?
        }
        (None, Some(address)) => index.find_by_address(&address).await?,
        (None, None) => anyhow::bail!("Provide --hash or --address"),
    };

    match found {
        Some((identity, record)) => {
            println!("Query: {}", identity);
            print_record(&record);
        }
        None => println!("No matching record"),
    }
    Ok(())
}

fn print_record(record: &HashRecord) {
    println!("Status:      {}", record.status);
    println!("Attempt:     {}", record.attempt);
    println!("Hash:        {}", record.hash);
    println!("Created:     {}", record.created_at.to_rfc3339());
    println!("Updated:     {}", record.updated_at.to_rfc3339());
    if let Some(address) = &record.ledger_address {
        println!("Address:     {}", address);
    }
    if let Some(fingerprint) = &record.ledger_secret_fingerprint {
        println!("Fingerprint: {}", fingerprint);
    }
    let ids = record.transaction_ids();
    if !ids.is_empty() {
        println!("Transactions:");
        for id in ids {
            println!("  {}", id);
        }
    }
}

/// Show resolved configuration
fn show_config(env: &Environment) -> Result<()> {
    let cfg = env.config;

    println!("arkmongo configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Index:     {}", env.index_path().display());
    println!("  Documents: {}", env.documents.display());
    println!();
    println!("Index:");
    println!("  Busy timeout:  {}ms", cfg.index.busy_timeout.as_millis());
    println!("  Retry:         {} attempts", cfg.index.retry.max_attempts);
    println!();
    println!("Ledger:");
    println!("  Endpoint:       {}", cfg.ledger.endpoint);
    println!("  Network prefix: 0x{:02x}", cfg.ledger.network_prefix);
    println!("  Amount:         {}", cfg.ledger.amount);
    println!("  Submit timeout: {}s", cfg.ledger.submit_timeout.as_secs());
    println!(
        "  Derivation key: {}",
        if cfg.ledger.uses_default_key() { "built-in default" } else { "configured" }
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cli_parses_anchor() {
        let cli = Cli::try_parse_from([
            "arkmongo",
            "anchor",
            "shop",
            "orders",
            "--filter",
            r#"{"status":"paid"}"#,
            "--timeout",
            "5",
        ])
        .unwrap();

        match cli.command {
            Commands::Anchor { query, timeout } => {
                let identity = query.identity().unwrap();
                assert_eq!(identity.namespace(), "shop.orders");
                assert_eq!(identity.filter, json!({"status": "paid"}));
                assert_eq!(identity.projection, json!({}));
                assert_eq!(timeout, Some(5));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_invalid_filter_json() {
        let query = QueryArgs {
            store: "shop".to_string(),
            collection: "orders".to_string(),
            filter: "{not json".to_string(),
            projection: "{}".to_string(),
        };
        assert!(query.identity().is_err());
    }

    #[test]
    fn test_lookup_requires_hash_or_address() {
        assert!(Cli::try_parse_from(["arkmongo", "lookup"]).is_err());
        assert!(Cli::try_parse_from(["arkmongo", "lookup", "--address", "17ab"]).is_ok());
    }

    #[test]
    fn test_global_documents_option() {
        let cli = Cli::try_parse_from(["arkmongo", "list", "--documents", "/data"]).unwrap();
        assert_eq!(cli.documents, Some(PathBuf::from("/data")));
    }
}
