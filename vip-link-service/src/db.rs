//! SQLite identity store: chat, billing, and player identities plus the
//! links between them.
//!
//! All uniqueness rules live here as SQL constraints: external names/ids
//! are unique per table, and two partial indexes guarantee at most one
//! primary link per chat identity and at most one primary link per player
//! identity. Callers get a `Conflict` error instead of a raw storage error
//! when a constraint trips.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::Connection;
use vip_link_types::{BillingIdentity, ChatIdentity, LinkStats, PlayerIdentity};

use crate::error::{ServiceError, ServiceResult};

pub struct Db {
    conn: Mutex<Connection>,
}

/// Snapshot of everything reconciliation needs for one billing identity,
/// read under a single lock acquisition.
pub struct GrantTargets {
    pub billing: BillingIdentity,
    pub chat: Option<ChatIdentity>,
    pub players: Vec<PlayerIdentity>,
}

impl Db {
    pub fn open(path: &str) -> ServiceResult<Self> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.create_tables()?;
        Ok(db)
    }

    fn create_tables(&self) -> ServiceResult<()> {
        let conn = self.conn();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chat_identities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                modified_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS billing_identities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT NOT NULL UNIQUE,
                chat_id INTEGER REFERENCES chat_identities(id),
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                modified_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS player_identities (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                external_id TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                modified_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE TABLE IF NOT EXISTS identity_links (
                chat_id INTEGER NOT NULL REFERENCES chat_identities(id),
                player_id INTEGER NOT NULL REFERENCES player_identities(id),
                is_primary INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(chat_id, player_id, is_primary)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS one_primary_per_chat
                ON identity_links(chat_id) WHERE is_primary = 1;
            CREATE UNIQUE INDEX IF NOT EXISTS one_primary_per_player
                ON identity_links(player_id) WHERE is_primary = 1;",
        )?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap()
    }

    pub fn get_or_create_chat(&self, name: &str) -> ServiceResult<ChatIdentity> {
        let conn = self.conn();
        get_or_create_chat(&conn, name)
    }

    pub fn get_or_create_player(&self, external_id: &str) -> ServiceResult<PlayerIdentity> {
        let conn = self.conn();
        get_or_create_player(&conn, external_id)
    }

    pub fn find_billing_by_external_id(
        &self,
        external_id: &str,
    ) -> ServiceResult<Option<BillingIdentity>> {
        let conn = self.conn();
        find_billing_by_external_id(&conn, external_id)
    }

    /// Everything a pledge reconciliation needs, as one consistent read:
    /// the billing identity, its owning chat identity (if any), and every
    /// player linked to that chat by any role.
    pub fn grant_targets(&self, billing_external_id: &str) -> ServiceResult<Option<GrantTargets>> {
        let conn = self.conn();
        let billing = match find_billing_by_external_id(&conn, billing_external_id)? {
            Some(b) => b,
            None => return Ok(None),
        };

        let chat = match billing.chat_id {
            Some(chat_id) => find_chat_by_id(&conn, chat_id)?,
            None => None,
        };

        let players = match &chat {
            Some(chat) => players_linked_to_chat(&conn, chat.id)?,
            None => Vec::new(),
        };

        Ok(Some(GrantTargets {
            billing,
            chat,
            players,
        }))
    }

    pub fn stats(&self) -> ServiceResult<LinkStats> {
        let conn = self.conn();
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
        Ok(LinkStats {
            chat_identities: count("SELECT COUNT(*) FROM chat_identities")?,
            billing_identities: count("SELECT COUNT(*) FROM billing_identities")?,
            player_identities: count("SELECT COUNT(*) FROM player_identities")?,
            primary_links: count("SELECT COUNT(*) FROM identity_links WHERE is_primary = 1")?,
            sponsored_links: count("SELECT COUNT(*) FROM identity_links WHERE is_primary = 0")?,
        })
    }
}

// Store primitives shared by the transactional linking operations. These
// take a plain connection so they compose inside one transaction.

pub(crate) fn get_or_create_chat(conn: &Connection, name: &str) -> ServiceResult<ChatIdentity> {
    let now = Utc::now().to_rfc3339();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO chat_identities (name, created_at, modified_at)
         VALUES (?1, ?2, ?2)",
        rusqlite::params![name, now],
    )?;
    if inserted > 0 {
        log::warn!("[Store] Created new chat identity {}", name);
    }
    find_chat_by_name(conn, name)?
        .ok_or_else(|| ServiceError::Database(format!("chat identity {} vanished", name)))
}

pub(crate) fn get_or_create_player(
    conn: &Connection,
    external_id: &str,
) -> ServiceResult<PlayerIdentity> {
    let now = Utc::now().to_rfc3339();
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO player_identities (external_id, created_at, modified_at)
         VALUES (?1, ?2, ?2)",
        rusqlite::params![external_id, now],
    )?;
    if inserted > 0 {
        log::warn!("[Store] Created new player identity {}", external_id);
    }
    let player = conn
        .query_row(
            "SELECT id, external_id, created_at, modified_at
             FROM player_identities WHERE external_id = ?1",
            rusqlite::params![external_id],
            row_to_player,
        )
        .map_err(ServiceError::from)?;
    Ok(player)
}

/// Billing identities are only ever created with an owning chat identity.
pub(crate) fn create_billing(
    conn: &Connection,
    chat_id: i64,
    external_id: &str,
) -> ServiceResult<BillingIdentity> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO billing_identities (external_id, chat_id, created_at, modified_at)
         VALUES (?1, ?2, ?3, ?3)",
        rusqlite::params![external_id, chat_id, now],
    )?;
    log::warn!(
        "[Store] Created new billing identity {} owned by chat {}",
        external_id,
        chat_id
    );
    find_billing_by_external_id(conn, external_id)?
        .ok_or_else(|| ServiceError::Database(format!("billing identity {} vanished", external_id)))
}

pub(crate) fn set_billing_owner(
    conn: &Connection,
    billing_id: i64,
    chat_id: Option<i64>,
) -> ServiceResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE billing_identities SET chat_id = ?1, modified_at = ?2 WHERE id = ?3",
        rusqlite::params![chat_id, now, billing_id],
    )?;
    Ok(())
}

pub(crate) fn find_chat_by_name(
    conn: &Connection,
    name: &str,
) -> ServiceResult<Option<ChatIdentity>> {
    optional(conn.query_row(
        "SELECT id, name, created_at, modified_at FROM chat_identities WHERE name = ?1",
        rusqlite::params![name],
        row_to_chat,
    ))
}

pub(crate) fn find_chat_by_id(conn: &Connection, id: i64) -> ServiceResult<Option<ChatIdentity>> {
    optional(conn.query_row(
        "SELECT id, name, created_at, modified_at FROM chat_identities WHERE id = ?1",
        rusqlite::params![id],
        row_to_chat,
    ))
}

pub(crate) fn find_player_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> ServiceResult<Option<PlayerIdentity>> {
    optional(conn.query_row(
        "SELECT id, external_id, created_at, modified_at
         FROM player_identities WHERE external_id = ?1",
        rusqlite::params![external_id],
        row_to_player,
    ))
}

pub(crate) fn find_billing_by_external_id(
    conn: &Connection,
    external_id: &str,
) -> ServiceResult<Option<BillingIdentity>> {
    optional(conn.query_row(
        "SELECT id, external_id, chat_id, created_at, modified_at
         FROM billing_identities WHERE external_id = ?1",
        rusqlite::params![external_id],
        row_to_billing,
    ))
}

pub(crate) fn find_billing_by_owner(
    conn: &Connection,
    chat_id: i64,
) -> ServiceResult<Option<BillingIdentity>> {
    optional(conn.query_row(
        "SELECT id, external_id, chat_id, created_at, modified_at
         FROM billing_identities WHERE chat_id = ?1",
        rusqlite::params![chat_id],
        row_to_billing,
    ))
}

/// The chat identity currently holding a primary link to this player.
pub(crate) fn find_primary_owner_of_player(
    conn: &Connection,
    player_id: i64,
) -> ServiceResult<Option<ChatIdentity>> {
    optional(conn.query_row(
        "SELECT c.id, c.name, c.created_at, c.modified_at
         FROM identity_links l JOIN chat_identities c ON c.id = l.chat_id
         WHERE l.player_id = ?1 AND l.is_primary = 1",
        rusqlite::params![player_id],
        row_to_chat,
    ))
}

/// The player this chat identity holds a primary link to.
pub(crate) fn find_primary_player_of_chat(
    conn: &Connection,
    chat_id: i64,
) -> ServiceResult<Option<PlayerIdentity>> {
    optional(conn.query_row(
        "SELECT p.id, p.external_id, p.created_at, p.modified_at
         FROM identity_links l JOIN player_identities p ON p.id = l.player_id
         WHERE l.chat_id = ?1 AND l.is_primary = 1",
        rusqlite::params![chat_id],
        row_to_player,
    ))
}

pub(crate) fn sponsored_link_exists(
    conn: &Connection,
    chat_id: i64,
    player_id: i64,
) -> ServiceResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM identity_links
         WHERE chat_id = ?1 AND player_id = ?2 AND is_primary = 0",
        rusqlite::params![chat_id, player_id],
        |r| r.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn insert_link(
    conn: &Connection,
    chat_id: i64,
    player_id: i64,
    primary: bool,
) -> ServiceResult<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO identity_links (chat_id, player_id, is_primary, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        rusqlite::params![chat_id, player_id, if primary { 1 } else { 0 }, now],
    )?;
    Ok(())
}

pub(crate) fn delete_primary_link_of_player(
    conn: &Connection,
    player_id: i64,
) -> ServiceResult<usize> {
    let n = conn.execute(
        "DELETE FROM identity_links WHERE player_id = ?1 AND is_primary = 1",
        rusqlite::params![player_id],
    )?;
    Ok(n)
}

pub(crate) fn delete_primary_link_of_chat(conn: &Connection, chat_id: i64) -> ServiceResult<usize> {
    let n = conn.execute(
        "DELETE FROM identity_links WHERE chat_id = ?1 AND is_primary = 1",
        rusqlite::params![chat_id],
    )?;
    Ok(n)
}

pub(crate) fn retarget_primary_link(
    conn: &Connection,
    chat_id: i64,
    new_player_id: i64,
) -> ServiceResult<usize> {
    let n = conn.execute(
        "UPDATE identity_links SET player_id = ?1 WHERE chat_id = ?2 AND is_primary = 1",
        rusqlite::params![new_player_id, chat_id],
    )?;
    Ok(n)
}

pub(crate) fn delete_sponsored_link(
    conn: &Connection,
    chat_id: i64,
    player_id: i64,
) -> ServiceResult<usize> {
    let n = conn.execute(
        "DELETE FROM identity_links
         WHERE chat_id = ?1 AND player_id = ?2 AND is_primary = 0",
        rusqlite::params![chat_id, player_id],
    )?;
    Ok(n)
}

/// Every player linked to this chat identity by any role, primary first.
pub(crate) fn players_linked_to_chat(
    conn: &Connection,
    chat_id: i64,
) -> ServiceResult<Vec<PlayerIdentity>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT p.id, p.external_id, p.created_at, p.modified_at
         FROM identity_links l JOIN player_identities p ON p.id = l.player_id
         WHERE l.chat_id = ?1
         ORDER BY l.is_primary DESC, p.id",
    )?;
    let players = stmt
        .query_map(rusqlite::params![chat_id], row_to_player)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(players)
}

fn optional<T>(result: rusqlite::Result<T>) -> ServiceResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn row_to_chat(row: &rusqlite::Row) -> rusqlite::Result<ChatIdentity> {
    Ok(ChatIdentity {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        modified_at: row.get(3)?,
    })
}

fn row_to_billing(row: &rusqlite::Row) -> rusqlite::Result<BillingIdentity> {
    Ok(BillingIdentity {
        id: row.get(0)?,
        external_id: row.get(1)?,
        chat_id: row.get(2)?,
        created_at: row.get(3)?,
        modified_at: row.get(4)?,
    })
}

fn row_to_player(row: &rusqlite::Row) -> rusqlite::Result<PlayerIdentity> {
    Ok(PlayerIdentity {
        id: row.get(0)?,
        external_id: row.get(1)?,
        created_at: row.get(2)?,
        modified_at: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_on_disk_creates_schema() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("links.db");
        let db = Db::open(path.to_str().unwrap()).expect("open db");
        let stats = db.stats().expect("stats");
        assert_eq!(stats.chat_identities, 0);
        assert_eq!(stats.primary_links, 0);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let db = Db::open(":memory:").expect("in-memory db");
        let a = db.get_or_create_chat("patron#1").unwrap();
        let b = db.get_or_create_chat("patron#1").unwrap();
        assert_eq!(a.id, b.id);

        let p1 = db.get_or_create_player("76561198000000001").unwrap();
        let p2 = db.get_or_create_player("76561198000000001").unwrap();
        assert_eq!(p1.id, p2.id);
        assert_eq!(db.stats().unwrap().chat_identities, 1);
        assert_eq!(db.stats().unwrap().player_identities, 1);
    }

    #[test]
    fn billing_requires_owner_at_creation() {
        let db = Db::open(":memory:").expect("in-memory db");
        let chat = db.get_or_create_chat("patron#1").unwrap();
        let conn = db.conn();
        let billing = create_billing(&conn, chat.id, "billing-1").unwrap();
        assert_eq!(billing.chat_id, Some(chat.id));

        // A second row with the same external id violates uniqueness.
        let err = create_billing(&conn, chat.id, "billing-1").unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }

    #[test]
    fn duplicate_primary_links_are_conflicts() {
        let db = Db::open(":memory:").expect("in-memory db");
        let chat = db.get_or_create_chat("patron#1").unwrap();
        let p1 = db.get_or_create_player("1111").unwrap();
        let p2 = db.get_or_create_player("2222").unwrap();
        let conn = db.conn();
        insert_link(&conn, chat.id, p1.id, true).unwrap();

        // Second primary for the same chat trips the partial index.
        let err = insert_link(&conn, chat.id, p2.id, true).unwrap_err();
        assert!(matches!(err, ServiceError::Conflict(_)));
    }
}
