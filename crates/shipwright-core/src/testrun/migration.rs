//! Migration simulation: restore a production dump and update onto it.

use futures::FutureExt;
use shipwright_state::{Branch, LineKind};

use super::batch::{BatchItem, BatchSummary, LineReport, LineWriter};
use super::instance::Instance;
use crate::error::{Result, ShipwrightError};
use crate::remote::shell_quote;

pub(super) async fn run(
    instance: &Instance,
    writer: &mut LineWriter,
    branch: &Branch,
) -> Result<BatchSummary> {
    let Some(dump) = branch.migration_dump.clone() else {
        writer
            .failed_line(
                LineKind::Migration,
                "migration",
                "branch has no migration dump configured",
            )
            .await?;
        return Ok(BatchSummary {
            failed: 1,
            ..BatchSummary::default()
        });
    };

    let item = BatchItem::new(format!("migration from {dump}"), dump);
    writer
        .run_batch(LineKind::Migration, vec![item], 1, |item| {
            async move {
                instance
                    .cli(&format!("-f restore odoo-db {}", shell_quote(&item.target)))
                    .await?;
                instance.wait_for_postgres().await?;
                instance.cli_timed("update").await?;
                Ok::<_, ShipwrightError>(LineReport::default())
            }
            .boxed()
        })
        .await
}
