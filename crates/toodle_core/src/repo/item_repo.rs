//! Item repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide create/query/update/delete APIs over the `items` table.
//! - Keep SQL details inside the core persistence boundary.
//!
//! # Invariants
//! - List queries return active items in insertion order (`seq ASC`).
//! - Read paths reject invalid persisted state instead of masking it.

use crate::db::migrations::{current_user_version, latest_version};
use crate::db::DbError;
use crate::model::item::{normalize_name, Identifier, Item, ItemId, ItemValidationError};
use rusqlite::{params, Connection, Row};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const ITEM_SELECT_SQL: &str = "SELECT
    uuid,
    name,
    due_date,
    completion_date
FROM items";

const REQUIRED_ITEM_COLUMNS: &[&str] = &[
    "seq",
    "uuid",
    "name",
    "due_date",
    "completion_date",
    "is_deleted",
    "created_at",
    "updated_at",
];

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error for item persistence and query operations.
#[derive(Debug)]
pub enum RepoError {
    Validation(ItemValidationError),
    Db(DbError),
    NotFound(ItemId),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "item not found: {id}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "item repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "item repository requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => write!(
                f,
                "item repository requires column `{column}` in table `{table}`"
            ),
            Self::InvalidData(message) => write!(f, "invalid persisted item data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ItemValidationError> for RepoError {
    fn from(value: ItemValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Repository interface for item operations.
pub trait ItemRepository {
    fn create_item(&self, item: &Item) -> RepoResult<ItemId>;
    fn get_item(&self, id: ItemId) -> RepoResult<Option<Item>>;
    /// Lists active items in insertion order.
    fn list_items(&self) -> RepoResult<Vec<Item>>;
    /// Lists active item keys in insertion order.
    fn list_identifiers(&self) -> RepoResult<Vec<Identifier>>;
    fn update_item(&self, item: &Item) -> RepoResult<()>;
    fn soft_delete_item(&self, id: ItemId) -> RepoResult<()>;
}

/// SQLite-backed item repository borrowing a migrated connection.
pub struct SqliteItemRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteItemRepository<'conn> {
    /// Constructs a repository from a migrated/ready connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_item_connection_ready(conn)?;
        Ok(Self { conn })
    }
}

impl ItemRepository for SqliteItemRepository<'_> {
    fn create_item(&self, item: &Item) -> RepoResult<ItemId> {
        normalize_name(&item.name)?;

        self.conn.execute(
            "INSERT INTO items (
                uuid,
                name,
                due_date,
                completion_date
            ) VALUES (?1, ?2, ?3, ?4);",
            params![
                item.id.to_string(),
                item.name.as_str(),
                item.due_date,
                item.completion_date,
            ],
        )?;

        Ok(item.id)
    }

    fn get_item(&self, id: ItemId) -> RepoResult<Option<Item>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ITEM_SELECT_SQL}
             WHERE uuid = ?1
               AND is_deleted = 0;"
        ))?;

        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_item_row(row)?));
        }

        Ok(None)
    }

    fn list_items(&self) -> RepoResult<Vec<Item>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ITEM_SELECT_SQL}
             WHERE is_deleted = 0
             ORDER BY seq ASC;"
        ))?;

        let mut rows = stmt.query([])?;
        let mut items = Vec::new();
        while let Some(row) = rows.next()? {
            items.push(parse_item_row(row)?);
        }

        Ok(items)
    }

    fn list_identifiers(&self) -> RepoResult<Vec<Identifier>> {
        let mut stmt = self.conn.prepare(
            "SELECT uuid
             FROM items
             WHERE is_deleted = 0
             ORDER BY seq ASC;",
        )?;

        let mut rows = stmt.query([])?;
        let mut identifiers = Vec::new();
        while let Some(row) = rows.next()? {
            let uuid_text: String = row.get(0)?;
            identifiers.push(Identifier(parse_uuid(&uuid_text)?));
        }

        Ok(identifiers)
    }

    fn update_item(&self, item: &Item) -> RepoResult<()> {
        normalize_name(&item.name)?;

        let changed = self.conn.execute(
            "UPDATE items
             SET
                name = ?1,
                due_date = ?2,
                completion_date = ?3,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE uuid = ?4
               AND is_deleted = 0;",
            params![
                item.name.as_str(),
                item.due_date,
                item.completion_date,
                item.id.to_string(),
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(item.id));
        }

        Ok(())
    }

    fn soft_delete_item(&self, id: ItemId) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE items
             SET
                is_deleted = 1,
                updated_at = (strftime('%s', 'now') * 1000)
             WHERE uuid = ?1
               AND is_deleted = 0;",
            [id.to_string()],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }

        Ok(())
    }
}

fn parse_item_row(row: &Row<'_>) -> RepoResult<Item> {
    let uuid_text: String = row.get("uuid")?;
    let name: String = row.get("name")?;
    if name.trim().is_empty() {
        return Err(RepoError::InvalidData(format!(
            "empty name for item `{uuid_text}` in items.name"
        )));
    }

    Ok(Item {
        id: parse_uuid(&uuid_text)?,
        name,
        due_date: row.get("due_date")?,
        completion_date: row.get("completion_date")?,
    })
}

fn parse_uuid(value: &str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid value `{value}` in items.uuid")))
}

fn ensure_item_connection_ready(conn: &Connection) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version = current_user_version(conn)?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    if !table_exists(conn, "items")? {
        return Err(RepoError::MissingRequiredTable("items"));
    }

    for &column in REQUIRED_ITEM_COLUMNS {
        if !table_has_column(conn, "items", column)? {
            return Err(RepoError::MissingRequiredColumn {
                table: "items",
                column,
            });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}
