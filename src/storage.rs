use crate::error::AppError;
use crate::models::{RequestDetail, SnapshotExport, StatisticsSnapshot, TokenStats};
use crate::source::SnapshotSource;
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, types::Type, Connection};
use std::path::Path;

pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        let this = Self { conn };
        this.init()?;
        Ok(this)
    }

    fn init(&self) -> Result<(), AppError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS usage_details (
                id INTEGER PRIMARY KEY,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                source TEXT NOT NULL DEFAULT '',
                input_tokens INTEGER NOT NULL,
                output_tokens INTEGER NOT NULL,
                reasoning_tokens INTEGER NOT NULL,
                cached_tokens INTEGER NOT NULL,
                total_tokens INTEGER NOT NULL,
                failed INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_usage_details_timestamp
                ON usage_details (timestamp);
            "#,
        )?;
        Ok(())
    }

    pub fn record(
        &self,
        provider: &str,
        model: &str,
        detail: &RequestDetail,
    ) -> Result<(), AppError> {
        insert_detail(&self.conn, provider, model, detail)
    }

    /// Inserts every detail of `snapshot` in one transaction.
    pub fn import_snapshot(&mut self, snapshot: &StatisticsSnapshot) -> Result<usize, AppError> {
        let tx = self.conn.transaction()?;
        let mut inserted = 0;
        for (provider, api) in &snapshot.apis {
            for (model, model_snapshot) in &api.models {
                for detail in &model_snapshot.details {
                    insert_detail(&tx, provider, model, detail)?;
                    inserted += 1;
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn load_snapshot(&self) -> Result<StatisticsSnapshot, AppError> {
        let mut stmt = self.conn.prepare(
            "SELECT provider, model, timestamp, source, input_tokens, output_tokens,
                    reasoning_tokens, cached_tokens, total_tokens, failed
             FROM usage_details ORDER BY timestamp, id",
        )?;

        let rows = stmt
            .query_map([], |r| {
                let provider: String = r.get(0)?;
                let model: String = r.get(1)?;
                let detail = RequestDetail {
                    timestamp: chrono::DateTime::parse_from_rfc3339(&r.get::<_, String>(2)?)
                        .map(|d| d.with_timezone(&Utc))
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e))
                        })?,
                    source: r.get(3)?,
                    tokens: TokenStats {
                        input_tokens: r.get(4)?,
                        output_tokens: r.get(5)?,
                        reasoning_tokens: r.get(6)?,
                        cached_tokens: r.get(7)?,
                        total_tokens: r.get(8)?,
                    },
                    failed: r.get(9)?,
                };
                Ok((provider, model, detail))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut snapshot = StatisticsSnapshot::default();
        for (provider, model, detail) in rows {
            snapshot.push_detail(&provider, &model, detail);
        }
        Ok(snapshot)
    }

    pub fn export_json(&self) -> Result<String, AppError> {
        let export = SnapshotExport {
            version: 1,
            exported_at: Some(Utc::now()),
            usage: self.load_snapshot()?,
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }
}

impl SnapshotSource for Storage {
    fn snapshot(&self) -> Result<StatisticsSnapshot, AppError> {
        self.load_snapshot()
    }
}

fn insert_detail(
    conn: &Connection,
    provider: &str,
    model: &str,
    detail: &RequestDetail,
) -> Result<(), AppError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO usage_details (provider, model, timestamp, source, input_tokens, output_tokens,
                                    reasoning_tokens, cached_tokens, total_tokens, failed)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )?;
    stmt.execute(params![
        provider,
        model,
        detail
            .timestamp
            .to_rfc3339_opts(SecondsFormat::AutoSi, true),
        detail.source,
        detail.tokens.input_tokens,
        detail.tokens.output_tokens,
        detail.tokens.reasoning_tokens,
        detail.tokens.cached_tokens,
        detail.tokens.total_tokens,
        detail.failed,
    ])?;
    Ok(())
}
