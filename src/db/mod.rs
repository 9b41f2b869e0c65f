use anyhow::Result;
use sqlx::{Pool, Postgres, postgres::PgPoolOptions};
use tokio::sync::OnceCell as AsyncOnceCell;

pub type Db = Pool<Postgres>;

static INIT_DDL: AsyncOnceCell<()> = AsyncOnceCell::const_new();

/// Pusty URL → `Ok(None)`: audyt wyłączony.
pub async fn connect(url: &str, max: Option<u32>) -> Result<Option<Db>> {
    if url.trim().is_empty() {
        return Ok(None);
    }
    let pool = PgPoolOptions::new()
        .max_connections(max.unwrap_or(5))
        .connect(url)
        .await?;
    Ok(Some(pool))
}

pub async fn maybe_ensure_tables(db: &Db) {
    let db = db.clone();
    let _ = INIT_DDL
        .get_or_init(|| async move {
            if let Err(e) = ensure_tables(&db).await {
                tracing::error!(?e, "ensure_tables failed");
            }
        })
        .await;
}

pub async fn ensure_tables(db: &Db) -> Result<()> {
    let _ = sqlx::query(r#"CREATE SCHEMA IF NOT EXISTS tss"#)
        .execute(db)
        .await?;

    let _ = sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tss.phish_actions (
          id             BIGSERIAL PRIMARY KEY,
          guild_id       BIGINT NOT NULL,
          channel_id     BIGINT NOT NULL,
          message_id     BIGINT NOT NULL,
          user_id        BIGINT NOT NULL,
          verdict        TEXT   NOT NULL,
          label          TEXT   NOT NULL,
          outcome        TEXT   NOT NULL,
          confidence     DOUBLE PRECISION,
          content_hashes TEXT[] NOT NULL DEFAULT '{}',
          created_at     TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(db)
    .await?;

    let _ = sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_phish_actions_guild ON tss.phish_actions(guild_id, created_at DESC)"#,
    )
    .execute(db)
    .await?;

    Ok(())
}

/// Jeden wiersz audytu na wykonaną decyzję.
#[derive(Debug, Clone)]
pub struct AuditRow {
    pub guild_id: u64,
    pub channel_id: u64,
    pub message_id: u64,
    pub user_id: u64,
    pub verdict: &'static str,
    pub label: &'static str,
    pub outcome: &'static str,
    pub confidence: Option<f64>,
    pub content_hashes: Vec<String>,
}

pub async fn record_outcome(db: &Db, row: &AuditRow) -> Result<()> {
    maybe_ensure_tables(db).await;
    sqlx::query(
        r#"
        INSERT INTO tss.phish_actions
          (guild_id, channel_id, message_id, user_id, verdict, label, outcome, confidence, content_hashes)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(row.guild_id as i64)
    .bind(row.channel_id as i64)
    .bind(row.message_id as i64)
    .bind(row.user_id as i64)
    .bind(row.verdict)
    .bind(row.label)
    .bind(row.outcome)
    .bind(row.confidence)
    .bind(row.content_hashes.clone())
    .execute(db)
    .await?;
    Ok(())
}

/// Liczba akcji danego typu w gildii (do /phishguard stats).
pub async fn count_outcomes(db: &Db, guild_id: u64) -> Result<Vec<(String, i64)>> {
    maybe_ensure_tables(db).await;
    let rows: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT outcome, COUNT(*)::BIGINT
        FROM tss.phish_actions
        WHERE guild_id = $1
        GROUP BY outcome
        ORDER BY 2 DESC
        "#,
    )
    .bind(guild_id as i64)
    .fetch_all(db)
    .await?;
    Ok(rows)
}
