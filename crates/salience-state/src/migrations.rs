//! SurrealDB schema migrations and initialization
//!
//! This module provides initialization functions to set up all tables
//! with indexes and the append-only permissions of the ledgers.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Table holding the salience (thinking) ledger.
pub const SALIENCE_LEDGER_TABLE: &str = "salience_ledger";
/// Table holding the impulse (speaking) ledger.
pub const IMPULSE_LEDGER_TABLE: &str = "impulse_ledger";
/// Table holding layer run audit records.
pub const LAYER_RUNS_TABLE: &str = "layer_runs";
/// Table holding insights.
pub const INSIGHTS_TABLE: &str = "insights";

/// Initialize all salience tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing salience SurrealDB schema");

    init_ledger_table(db, SALIENCE_LEDGER_TABLE).await?;
    init_ledger_table(db, IMPULSE_LEDGER_TABLE).await?;
    init_layer_runs_table(db).await?;
    init_insights_table(db).await?;

    info!("salience schema initialization complete");
    Ok(())
}

/// Initialize a ledger table
///
/// Schema:
/// ```text
/// TABLE <ledger> {
///   entry_id:          STRING (unique)
///   topic_key:         STRING (indexed)
///   transaction_type:  STRING (earn | spend | reset | retain | decay | propagate | spillover | warm | flood)
///   amount:            FLOAT (signed)
///   reason:            STRING?
///   source_topic:      STRING? (propagate/spillover only)
///   pool:              STRING? (impulse pool name)
///   created_at:        DATETIME (indexed)
/// }
/// ```
///
/// Entries are never updated or deleted; balances are derived by summing.
async fn init_ledger_table(db: &Surreal<Any>, table: &str) -> Result<()> {
    debug!(table, "Initializing ledger table");

    let sql = format!(
        r#"
        DEFINE TABLE {table} AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update NONE
                FOR delete NONE;

        DEFINE INDEX idx_{table}_entry_id ON TABLE {table} COLUMNS entry_id UNIQUE;
        DEFINE INDEX idx_{table}_topic ON TABLE {table} COLUMNS topic_key;
        DEFINE INDEX idx_{table}_topic_created ON TABLE {table} COLUMNS topic_key, created_at;
        DEFINE INDEX idx_{table}_type ON TABLE {table} COLUMNS transaction_type;
        DEFINE INDEX idx_{table}_pool ON TABLE {table} COLUMNS pool;
        "#
    );

    db.query(sql).await?;
    info!(table, "ledger table initialized");
    Ok(())
}

/// Initialize `layer_runs` table
///
/// Schema:
/// ```text
/// TABLE layer_runs {
///   run_id:        STRING (unique)
///   layer_name:    STRING (indexed)
///   layer_hash:    STRING
///   status:        STRING (running | success | partial | failed | dry_run)
///   started_at:    DATETIME (indexed)
///   completed_at:  DATETIME?
///   errors:        ARRAY<OBJECT>
///   model_calls:   ARRAY<OBJECT>
///   ...counters and usage aggregates
/// }
/// ```
///
/// Status transitions once (running → terminal), enforced in application logic.
async fn init_layer_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing layer_runs table");

    let sql = r#"
        DEFINE TABLE layer_runs AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_layer_runs_run_id ON TABLE layer_runs COLUMNS run_id UNIQUE;
        DEFINE INDEX idx_layer_runs_layer ON TABLE layer_runs COLUMNS layer_name;
        DEFINE INDEX idx_layer_runs_layer_started ON TABLE layer_runs COLUMNS layer_name, started_at;
        DEFINE INDEX idx_layer_runs_status ON TABLE layer_runs COLUMNS status;
    "#;

    db.query(sql).await?;
    info!("layer_runs table initialized");
    Ok(())
}

/// Initialize `insights` table
///
/// Content is immutable; only `quarantined` is ever updated.
async fn init_insights_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing insights table");

    let sql = r#"
        DEFINE TABLE insights AS
            SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX idx_insights_insight_id ON TABLE insights COLUMNS insight_id UNIQUE;
        DEFINE INDEX idx_insights_topic ON TABLE insights COLUMNS topic_key;
        DEFINE INDEX idx_insights_category_created ON TABLE insights COLUMNS category, created_at;
        DEFINE INDEX idx_insights_run ON TABLE insights COLUMNS layer_run_id;
    "#;

    db.query(sql).await?;
    info!("insights table initialized");
    Ok(())
}
