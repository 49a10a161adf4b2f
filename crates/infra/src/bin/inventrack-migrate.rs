//! Apply the ledger schema to the database named by `DATABASE_URL`.

use anyhow::Context;
use tracing::info;

use inventrack_infra::{LedgerConfig, MIGRATION, PostgresLedgerStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    inventrack_observability::init();

    let config = LedgerConfig::from_env().context("invalid ledger configuration")?;
    let store = PostgresLedgerStore::connect(&config)
        .await
        .context("failed to connect to the ledger database")?;

    sqlx::raw_sql(MIGRATION)
        .execute(store.pool())
        .await
        .context("failed to apply ledger schema")?;

    info!("ledger schema applied");
    Ok(())
}
