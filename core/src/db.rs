use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{Connection, params};
use uuid::Uuid;

use crate::models::{
    ImagePayload, NewFieldUpdate, NewPhotoOp, PendingCounts, PendingFieldUpdate, PendingKind,
    PendingPhotoOp, Product, ProductField, ProductRef,
};

const LAST_REFRESHED_KEY: &str = "last_refreshed_at";

type PhotoOpRow = (String, String, Vec<u8>, String, Option<i64>, String);
type FieldUpdateRow = (String, String, String, Option<f64>, String);

/// Handle shared between the orchestrator, the cache manager and the
/// presentation surfaces. Locks are held for single statements, never
/// across an await.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub fn lock(db: &SharedDatabase) -> MutexGuard<'_, Database> {
    db.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Durable local store: pending photo operations, pending field updates and
/// the cached product snapshot.
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
            .context("Failed to configure database durability")?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Database { conn };
        db.migrate()?;
        Ok(db)
    }

    #[must_use]
    pub fn into_shared(self) -> SharedDatabase {
        Arc::new(Mutex::new(self))
    }

    // Steps are additive only: a collection is created when missing, never
    // renamed or rebuilt.
    fn migrate(&self) -> Result<()> {
        let version: i64 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))?;

        if version < 1 {
            self.migration_step(
                "CREATE TABLE IF NOT EXISTS pending_photo_ops (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    item_code TEXT NOT NULL,
                    image_data BLOB NOT NULL,
                    mime TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_pending_photo_ops_item ON pending_photo_ops(item_code);

                PRAGMA user_version = 1;",
            )?;
        }

        if version < 2 {
            self.migration_step(
                "ALTER TABLE pending_photo_ops ADD COLUMN photo_to_delete_id INTEGER;

                CREATE TABLE IF NOT EXISTS pending_field_updates (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    item_code TEXT NOT NULL,
                    field TEXT NOT NULL,
                    value REAL,
                    timestamp TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_pending_field_updates_item ON pending_field_updates(item_code);

                PRAGMA user_version = 2;",
            )?;
        }

        if version < 3 {
            self.migration_step(
                "CREATE TABLE IF NOT EXISTS cached_products (
                    product_id INTEGER PRIMARY KEY,
                    item_code TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    payload TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS sync_meta (
                    key TEXT PRIMARY KEY NOT NULL,
                    value TEXT NOT NULL
                );

                PRAGMA user_version = 3;",
            )?;
        }

        Ok(())
    }

    /// Run one step and its `user_version` bump as a single transaction, so a
    /// crash never leaves a half-applied step behind.
    fn migration_step(&self, sql: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(sql)?;
        tx.commit().context("Failed to commit migration step")?;
        Ok(())
    }

    fn new_pending_id(kind: PendingKind) -> String {
        format!("{}_{}", kind.id_prefix(), Uuid::now_v7().simple())
    }

    // --- Row mapping helpers ---

    // Expects columns:
    // 0: id, 1: item_code, 2: image_data, 3: mime, 4: photo_to_delete_id, 5: created_at
    fn photo_op_from_row(row: &rusqlite::Row) -> rusqlite::Result<PhotoOpRow> {
        Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
        ))
    }

    fn photo_op_from_parts(
        (id, item_code, bytes, mime, photo_to_delete_id, created_at): PhotoOpRow,
    ) -> Result<PendingPhotoOp> {
        Ok(PendingPhotoOp {
            image: ImagePayload::new(bytes, mime)
                .with_context(|| format!("Corrupt image payload in pending photo {id}"))?,
            item_code: ProductRef::new(item_code)?,
            id,
            photo_to_delete_id,
            created_at,
        })
    }

    // Expects columns: 0: id, 1: item_code, 2: field, 3: value, 4: timestamp
    fn field_update_from_row(row: &rusqlite::Row) -> rusqlite::Result<FieldUpdateRow> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
    }

    fn field_update_from_parts(
        (id, item_code, field, value, timestamp): FieldUpdateRow,
    ) -> Result<PendingFieldUpdate> {
        Ok(PendingFieldUpdate {
            item_code: ProductRef::new(item_code)?,
            field: ProductField::parse(&field)?,
            id,
            value,
            timestamp,
        })
    }

    // --- Pending operations ---

    pub fn enqueue_photo_op(&self, op: &NewPhotoOp) -> Result<String> {
        let id = Self::new_pending_id(PendingKind::Photo);
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO pending_photo_ops (id, item_code, image_data, mime, photo_to_delete_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    op.item_code.as_str(),
                    op.image.bytes(),
                    op.image.mime(),
                    op.photo_to_delete_id,
                    now,
                ],
            )
            .context("Failed to save photo locally")?;
        Ok(id)
    }

    pub fn enqueue_field_update(&self, update: &NewFieldUpdate) -> Result<String> {
        let id = Self::new_pending_id(PendingKind::Field);
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO pending_field_updates (id, item_code, field, value, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    id,
                    update.item_code.as_str(),
                    update.field.as_str(),
                    update.value,
                    now,
                ],
            )
            .context("Failed to save field update locally")?;
        Ok(id)
    }

    /// Ids of one collection in creation order.
    pub fn list_pending_ids(&self, kind: PendingKind) -> Result<Vec<String>> {
        let table = kind.table();
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {table} ORDER BY seq"))?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn get_photo_op(&self, id: &str) -> Result<Option<PendingPhotoOp>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_code, image_data, mime, photo_to_delete_id, created_at
             FROM pending_photo_ops WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::photo_op_from_parts(Self::photo_op_from_row(row)?)?))
        } else {
            Ok(None)
        }
    }

    pub fn get_field_update(&self, id: &str) -> Result<Option<PendingFieldUpdate>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_code, field, value, timestamp
             FROM pending_field_updates WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        if let Some(row) = rows.next()? {
            Ok(Some(Self::field_update_from_parts(
                Self::field_update_from_row(row)?,
            )?))
        } else {
            Ok(None)
        }
    }

    pub fn list_photo_ops(&self) -> Result<Vec<PendingPhotoOp>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_code, image_data, mime, photo_to_delete_id, created_at
             FROM pending_photo_ops ORDER BY seq",
        )?;
        let parts = stmt
            .query_map([], Self::photo_op_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        parts.into_iter().map(Self::photo_op_from_parts).collect()
    }

    pub fn list_field_updates(&self) -> Result<Vec<PendingFieldUpdate>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, item_code, field, value, timestamp
             FROM pending_field_updates ORDER BY seq",
        )?;
        let parts = stmt
            .query_map([], Self::field_update_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        parts
            .into_iter()
            .map(Self::field_update_from_parts)
            .collect()
    }

    pub fn remove_pending(&self, kind: PendingKind, id: &str) -> Result<bool> {
        let table = kind.table();
        let rows = self
            .conn
            .execute(&format!("DELETE FROM {table} WHERE id = ?1"), params![id])?;
        Ok(rows > 0)
    }

    pub fn count_pending(&self, kind: PendingKind) -> Result<i64> {
        let table = kind.table();
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get(0)
            })?;
        Ok(count)
    }

    pub fn pending_counts(&self) -> Result<PendingCounts> {
        Ok(PendingCounts {
            photos: self.count_pending(PendingKind::Photo)?,
            field_updates: self.count_pending(PendingKind::Field)?,
        })
    }

    /// Pending work for one product, used to flag rows with unsynced changes.
    pub fn pending_for_product(&self, item_code: &ProductRef) -> Result<PendingCounts> {
        let photos = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_photo_ops WHERE item_code = ?1",
            params![item_code.as_str()],
            |row| row.get(0),
        )?;
        let field_updates = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_field_updates WHERE item_code = ?1",
            params![item_code.as_str()],
            |row| row.get(0),
        )?;
        Ok(PendingCounts {
            photos,
            field_updates,
        })
    }

    /// Pending photo adds (not replacements) for one product.
    pub fn pending_photo_adds(&self, item_code: &ProductRef) -> Result<i64> {
        let count = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_photo_ops
             WHERE item_code = ?1 AND photo_to_delete_id IS NULL",
            params![item_code.as_str()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // --- Cached product snapshot ---

    /// Clear and rewrite the snapshot in one transaction, so no reader or
    /// crash recovery ever sees two fetch generations mixed.
    pub fn replace_snapshot(&self, products: &[Product]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM cached_products", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO cached_products (product_id, item_code, position, payload)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (position, product) in products.iter().enumerate() {
                let payload = serde_json::to_string(product)?;
                stmt.execute(params![
                    product.id,
                    product.item_code.as_str(),
                    position as i64,
                    payload
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO sync_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_REFRESHED_KEY, Utc::now().to_rfc3339()],
        )?;
        tx.commit().context("Failed to commit product snapshot")?;
        Ok(())
    }

    pub fn read_snapshot(&self) -> Result<Vec<Product>> {
        let mut stmt = self
            .conn
            .prepare("SELECT payload FROM cached_products ORDER BY position")?;
        let payloads = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        payloads
            .iter()
            .map(|p| serde_json::from_str(p).context("Corrupt cached product"))
            .collect()
    }

    pub fn last_refreshed_at(&self) -> Result<Option<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM sync_meta WHERE key = ?1")?;
        let mut rows = stmt.query(params![LAST_REFRESHED_KEY])?;
        if let Some(row) = rows.next()? {
            Ok(Some(row.get(0)?))
        } else {
            Ok(None)
        }
    }
}
