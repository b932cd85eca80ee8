use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;
use tengine_transfer::{
    CallbackDescriptor, MediaItem, NewTransfer, Transfer, TransferId, TransferMetadata,
    TransferStatus, TransferType,
};
use tracing::{info, warn};

const SCHEMA_SQL: &str = include_str!("sql/schema.sql");

/// Bump whenever `schema.sql` changes shape; a mismatch drops every table.
pub const SCHEMA_VERSION: i64 = 1;

const DROP_SQL: [&str; 3] = [
    "DROP TABLE IF EXISTS metadata",
    "DROP TABLE IF EXISTS callback",
    "DROP TABLE IF EXISTS transfers",
];

const TRANSFER_SELECT: &str = "SELECT t.transfer_id, t.transfer_type, t.timestamp, t.status, t.progress, \
     t.display_name, t.application_icon, t.thumbnail_icon, t.service_icon, t.url, t.resource_name, \
     t.mime_type, t.file_size, t.plugin_id, t.account_id, t.strip_metadata, t.scale_percent, \
     t.cancel_supported, t.restart_supported, m.title, m.description, \
     c.service AS cb_service, c.path AS cb_path, c.interface AS cb_interface, \
     c.cancel_method AS cb_cancel_method, c.restart_method AS cb_restart_method \
     FROM transfers t \
     LEFT JOIN metadata m ON m.transfer_id = t.transfer_id \
     LEFT JOIN callback c ON c.transfer_id = t.transfer_id";

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub sqlite_path: String,
}

/// Durable record of every job. Single writer process per database file.
#[derive(Debug, Clone)]
pub struct TransferStore {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct TransferRow {
    transfer_id: i64,
    transfer_type: i64,
    timestamp: String,
    status: i64,
    progress: f64,
    display_name: Option<String>,
    application_icon: Option<String>,
    thumbnail_icon: Option<String>,
    service_icon: Option<String>,
    url: Option<String>,
    resource_name: Option<String>,
    mime_type: Option<String>,
    file_size: i64,
    plugin_id: Option<String>,
    account_id: Option<String>,
    strip_metadata: bool,
    scale_percent: f64,
    cancel_supported: bool,
    restart_supported: bool,
    title: Option<String>,
    description: Option<String>,
    cb_service: Option<String>,
    cb_path: Option<String>,
    cb_interface: Option<String>,
    cb_cancel_method: Option<String>,
    cb_restart_method: Option<String>,
}

#[derive(Debug, FromRow)]
struct CallbackRow {
    service: String,
    path: String,
    interface: String,
    cancel_method: String,
    restart_method: String,
}

impl TryFrom<TransferRow> for Transfer {
    type Error = anyhow::Error;

    fn try_from(row: TransferRow) -> Result<Self> {
        let metadata = match (row.title, row.description) {
            (None, None) => None,
            (title, description) => Some(TransferMetadata {
                title: title.unwrap_or_default(),
                description: description.unwrap_or_default(),
            }),
        };
        let callback = row.cb_service.map(|service| CallbackDescriptor {
            service,
            path: row.cb_path.unwrap_or_default(),
            interface: row.cb_interface.unwrap_or_default(),
            cancel_method: row.cb_cancel_method.unwrap_or_default(),
            restart_method: row.cb_restart_method.unwrap_or_default(),
        });

        Ok(Transfer {
            transfer_id: row.transfer_id,
            transfer_type: TransferType::from_code(row.transfer_type)
                .with_context(|| format!("transfer {}", row.transfer_id))?,
            status: TransferStatus::from_code(row.status)
                .with_context(|| format!("transfer {}", row.transfer_id))?,
            progress: row.progress,
            timestamp: row.timestamp,
            display_name: row.display_name.unwrap_or_default(),
            application_icon: row.application_icon.unwrap_or_default(),
            thumbnail_icon: row.thumbnail_icon.unwrap_or_default(),
            service_icon: row.service_icon.unwrap_or_default(),
            url: row.url.unwrap_or_default(),
            resource_name: row.resource_name.unwrap_or_default(),
            mime_type: row.mime_type.unwrap_or_default(),
            file_size: row.file_size,
            plugin_id: row.plugin_id.unwrap_or_default(),
            account_id: row.account_id.unwrap_or_default(),
            strip_metadata: row.strip_metadata,
            scale_percent: row.scale_percent,
            cancel_supported: row.cancel_supported,
            restart_supported: row.restart_supported,
            metadata,
            callback,
        })
    }
}

impl TransferStore {
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let uri = normalize_sqlite_uri(&config.sqlite_path);
        let options = SqliteConnectOptions::from_str(&uri)
            .with_context(|| format!("invalid sqlite URI: {}", uri))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect sqlite pool")?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Creates the schema, or drops and recreates it when the stored version
    /// differs. Jobs are a transient cache, so losing them here is acceptable.
    pub async fn migrate(&self) -> Result<()> {
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .context("read schema version")?;

        if version == SCHEMA_VERSION {
            info!(version, "tengine sqlite schema ready");
            return Ok(());
        }

        if version != 0 {
            warn!(
                found = version,
                expected = SCHEMA_VERSION,
                "schema version mismatch, recreating transfer tables"
            );
        }

        for sql in DROP_SQL {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("drop failed for statement: {sql}"))?;
        }

        for statement in SCHEMA_SQL.split(';') {
            let sql = statement.trim();
            if sql.is_empty() {
                continue;
            }
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("migration failed for statement: {sql}"))?;
        }

        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&self.pool)
            .await
            .context("write schema version")?;

        info!(version = SCHEMA_VERSION, "tengine sqlite schema created");
        Ok(())
    }

    /// Inserts the job together with its metadata and callback rows.
    pub async fn create_transfer(&self, transfer: &NewTransfer) -> Result<TransferId> {
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.context("begin transfer insert")?;

        let transfer_id = sqlx::query(
            "INSERT INTO transfers(transfer_type, timestamp, status, progress, display_name, application_icon, \
             thumbnail_icon, service_icon, url, resource_name, mime_type, file_size, plugin_id, account_id, \
             strip_metadata, scale_percent, cancel_supported, restart_supported) \
             VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(transfer.transfer_type.code())
        .bind(&now)
        .bind(TransferStatus::NotStarted.code())
        .bind(&transfer.display_name)
        .bind(&transfer.application_icon)
        .bind(&transfer.thumbnail_icon)
        .bind(&transfer.service_icon)
        .bind(&transfer.url)
        .bind(&transfer.resource_name)
        .bind(&transfer.mime_type)
        .bind(transfer.file_size)
        .bind(&transfer.plugin_id)
        .bind(&transfer.account_id)
        .bind(transfer.strip_metadata)
        .bind(transfer.scale_percent)
        .bind(transfer.cancel_supported)
        .bind(transfer.restart_supported)
        .execute(&mut *tx)
        .await
        .context("insert transfer")?
        .last_insert_rowid();

        if let Some(metadata) = transfer.metadata.as_ref().filter(|m| !m.is_empty()) {
            sqlx::query("INSERT INTO metadata(title, description, transfer_id) VALUES (?, ?, ?)")
                .bind(&metadata.title)
                .bind(&metadata.description)
                .bind(transfer_id)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("insert metadata for transfer {transfer_id}"))?;
        }

        if let Some(callback) = transfer.callback.as_ref().filter(|cb| cb.is_usable()) {
            sqlx::query(
                "INSERT INTO callback(service, path, interface, cancel_method, restart_method, transfer_id) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&callback.service)
            .bind(&callback.path)
            .bind(&callback.interface)
            .bind(&callback.cancel_method)
            .bind(&callback.restart_method)
            .bind(transfer_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert callback for transfer {transfer_id}"))?;
        }

        tx.commit().await.context("commit transfer insert")?;
        Ok(transfer_id)
    }

    /// Writes the status and refreshes the timestamp. Progress follows the
    /// status: 0 on (re)start, cancel or interruption, 1 on finish.
    pub async fn update_status(&self, transfer_id: TransferId, status: TransferStatus) -> Result<bool> {
        let progress = match status {
            TransferStatus::Started | TransferStatus::Canceled | TransferStatus::Interrupted => Some(0.0),
            TransferStatus::Finished => Some(1.0),
            TransferStatus::NotStarted => None,
        };
        let now = Utc::now().to_rfc3339();

        let result = sqlx::query(
            "UPDATE transfers SET status = ?, timestamp = ?, progress = COALESCE(?, progress) WHERE transfer_id = ?",
        )
        .bind(status.code())
        .bind(now)
        .bind(progress)
        .bind(transfer_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("update status for transfer {transfer_id}"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Writes progress only. Finished rows keep their final progress.
    pub async fn update_progress(&self, transfer_id: TransferId, progress: f64) -> Result<bool> {
        let result = sqlx::query("UPDATE transfers SET progress = ? WHERE transfer_id = ? AND status != ?")
            .bind(progress)
            .bind(transfer_id)
            .bind(TransferStatus::Finished.code())
            .execute(&self.pool)
            .await
            .with_context(|| format!("update progress for transfer {transfer_id}"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Forces every NotStarted/Started row to Interrupted and returns how many
    /// were touched. Used for crash recovery.
    pub async fn interrupt_live_transfers(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        let result = sqlx::query(
            "UPDATE transfers SET status = ?, progress = 0, timestamp = ? WHERE status IN (?, ?)",
        )
        .bind(TransferStatus::Interrupted.code())
        .bind(now)
        .bind(TransferStatus::NotStarted.code())
        .bind(TransferStatus::Started.code())
        .execute(&self.pool)
        .await
        .context("interrupt live transfers")?;

        Ok(result.rows_affected())
    }

    pub async fn remove_transfer(&self, transfer_id: TransferId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM transfers WHERE transfer_id = ?")
            .bind(transfer_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete transfer {transfer_id}"))?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes Interrupted rows of `transfer_type` sharing the display name of
    /// `exclude_id`, keeping only `exclude_id` as the failure record.
    pub async fn remove_failed_siblings(
        &self,
        exclude_id: TransferId,
        transfer_type: TransferType,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM transfers WHERE transfer_id != ? AND status = ? AND transfer_type = ? \
             AND display_name = (SELECT display_name FROM transfers WHERE transfer_id = ?)",
        )
        .bind(exclude_id)
        .bind(TransferStatus::Interrupted.code())
        .bind(transfer_type.code())
        .bind(exclude_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("delete failed siblings of transfer {exclude_id}"))?;

        Ok(result.rows_affected())
    }

    /// Deletes every Finished, Canceled and Interrupted row.
    pub async fn clear_terminal(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM transfers WHERE status IN (?, ?, ?)")
            .bind(TransferStatus::Finished.code())
            .bind(TransferStatus::Canceled.code())
            .bind(TransferStatus::Interrupted.code())
            .execute(&self.pool)
            .await
            .context("clear terminal transfers")?;
        Ok(result.rows_affected())
    }

    /// All jobs, newest first. List projections rely on this order.
    pub async fn list_transfers(&self) -> Result<Vec<Transfer>> {
        let rows = sqlx::query_as::<_, TransferRow>(&format!(
            "{TRANSFER_SELECT} ORDER BY t.transfer_id DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("query transfers")?;

        rows.into_iter().map(Transfer::try_from).collect()
    }

    pub async fn get_transfer(&self, transfer_id: TransferId) -> Result<Option<Transfer>> {
        let row = sqlx::query_as::<_, TransferRow>(&format!(
            "{TRANSFER_SELECT} WHERE t.transfer_id = ?"
        ))
        .bind(transfer_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query transfer {transfer_id}"))?;

        row.map(Transfer::try_from).transpose()
    }

    pub async fn transfer_status(&self, transfer_id: TransferId) -> Result<Option<TransferStatus>> {
        let code = sqlx::query_scalar::<_, i64>("SELECT status FROM transfers WHERE transfer_id = ?")
            .bind(transfer_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("query status of transfer {transfer_id}"))?;

        code.map(|code| TransferStatus::from_code(code).map_err(anyhow::Error::from))
            .transpose()
    }

    pub async fn transfer_type(&self, transfer_id: TransferId) -> Result<Option<TransferType>> {
        let code =
            sqlx::query_scalar::<_, i64>("SELECT transfer_type FROM transfers WHERE transfer_id = ?")
                .bind(transfer_id)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("query type of transfer {transfer_id}"))?;

        code.map(|code| TransferType::from_code(code).map_err(anyhow::Error::from))
            .transpose()
    }

    pub async fn callback(&self, transfer_id: TransferId) -> Result<Option<CallbackDescriptor>> {
        let row = sqlx::query_as::<_, CallbackRow>(
            "SELECT service, path, interface, cancel_method, restart_method FROM callback WHERE transfer_id = ?",
        )
        .bind(transfer_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("query callback of transfer {transfer_id}"))?;

        Ok(row.map(|row| CallbackDescriptor {
            service: row.service,
            path: row.path,
            interface: row.interface,
            cancel_method: row.cancel_method,
            restart_method: row.restart_method,
        }))
    }

    /// Rebuilds the media item an upload was created from, for restarts.
    pub async fn media_item(&self, transfer_id: TransferId) -> Result<Option<MediaItem>> {
        Ok(self
            .get_transfer(transfer_id)
            .await?
            .map(|transfer| MediaItem::from(&transfer)))
    }
}

fn normalize_sqlite_uri(raw: &str) -> String {
    if raw.starts_with("sqlite:") {
        raw.to_string()
    } else {
        format!("sqlite://{raw}")
    }
}
