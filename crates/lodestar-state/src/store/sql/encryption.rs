//! Re-encryption of stored blobs under the active key.

use futures::future::try_join_all;

use lodestar_core::format::Format;

use super::schema::{ColumnType, ENCRYPTED_TABLES, EncryptedTable};
use super::{SqlStore, SqlValue, rows};
use crate::Result;
use crate::store::EncryptionReport;

fn key_conditions(table: &EncryptedTable) -> String {
    table
        .key_columns
        .iter()
        .map(|(column, _)| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(" AND ")
}

impl SqlStore {
    /// Rewrites every encrypted column of every table, one row per
    /// transaction, with the tables processed concurrently.
    pub(super) async fn perform_encryption_all(&self) -> Result<EncryptionReport> {
        let label = self.encoder.active_label().to_string();
        tracing::info!(key_label = %label, "re-encrypting stored records");

        let reports = try_join_all(ENCRYPTED_TABLES.iter().map(|t| self.reencrypt_table(t))).await?;
        let total = reports
            .into_iter()
            .fold(EncryptionReport::default(), |mut total, report| {
                total.rewritten += report.rewritten;
                total.skipped += report.skipped;
                total
            });

        tracing::info!(
            key_label = %label,
            rewritten = total.rewritten,
            skipped = total.skipped,
            "re-encryption finished"
        );
        Ok(total)
    }

    async fn reencrypt_table(&self, table: &EncryptedTable) -> Result<EncryptionReport> {
        let key_names: Vec<&str> = table.key_columns.iter().map(|(column, _)| *column).collect();
        let statement = format!("SELECT {} FROM {}", key_names.join(", "), table.table);
        let found = sqlx::query(&statement)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| self.err(e))?;

        let mut report = EncryptionReport::default();
        for row in &found {
            let key = table
                .key_columns
                .iter()
                .map(|(column, kind)| match kind {
                    ColumnType::Text => rows::text(row, column).map(SqlValue::Text),
                    ColumnType::Integer => rows::int(row, column).map(SqlValue::Int),
                })
                .collect::<Result<Vec<_>>>()?;
            let key = &key;
            let rewritten = self
                .retry
                .run("perform_encryption", move || self.reencrypt_row(table, key))
                .await?;
            if rewritten {
                report.rewritten += 1;
            } else {
                report.skipped += 1;
            }
        }
        Ok(report)
    }

    /// Returns false if the row vanished or a blob could not be decoded.
    async fn reencrypt_row(&self, table: &EncryptedTable, key: &[SqlValue]) -> Result<bool> {
        let conditions = key_conditions(table);
        let select = self.sql(&format!(
            "SELECT {} FROM {} WHERE {conditions}{}",
            table.blob_columns.join(", "),
            table.table,
            self.dialect.for_update()
        ));

        let mut tx = self.begin().await?;
        let mut query = sqlx::query(&select);
        for value in key {
            query = value.bind(query);
        }
        let Some(row) = query.fetch_optional(&mut *tx).await.map_err(|e| self.err(e))? else {
            return Ok(false);
        };

        let mut sealed = Vec::with_capacity(table.blob_columns.len());
        for column in table.blob_columns {
            let envelope = rows::text(&row, column)?;
            // Unclaimed instances carry no net info.
            if envelope.is_empty() {
                sealed.push(envelope);
                continue;
            }
            let payload = match self.encoder.decode(&envelope) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(
                        table = table.table,
                        column,
                        error = %e,
                        "leaving undecodable blob in place"
                    );
                    return Ok(false);
                }
            };
            sealed.push(self.encoder.encode(Format::Base64Encrypted, &payload)?);
        }

        let assignments = table
            .blob_columns
            .iter()
            .map(|column| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let update = self.sql(&format!(
            "UPDATE {} SET {assignments} WHERE {conditions}",
            table.table
        ));
        let mut query = sqlx::query(&update);
        for value in &sealed {
            query = query.bind(value.as_str());
        }
        for value in key {
            query = value.bind(query);
        }
        query.execute(&mut *tx).await.map_err(|e| self.err(e))?;
        self.commit(tx).await?;
        Ok(true)
    }
}
