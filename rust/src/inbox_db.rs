use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::watch;

use crate::collaborators::{InboxStore, InboxWriter};
use crate::error::StorageError;
use crate::model::{Inbox, InboxProvider, InboxType, LinkedIdentity, Profile};

pub const DB_FILE_NAME: &str = "inboxes.sqlite3";

const SCHEMA: &str = "
    PRAGMA foreign_keys = ON;
    CREATE TABLE IF NOT EXISTS inboxes (
        inbox_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        inbox_type TEXT NOT NULL,
        provider TEXT NOT NULL,
        provider_id TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_inboxes_provider_id ON inboxes(provider_id);
    CREATE TABLE IF NOT EXISTS inbox_identities (
        inbox_id TEXT NOT NULL REFERENCES inboxes(inbox_id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        identifier TEXT NOT NULL,
        PRIMARY KEY (inbox_id, kind, identifier)
    );
    CREATE TABLE IF NOT EXISTS profiles (
        inbox_id TEXT PRIMARY KEY REFERENCES inboxes(inbox_id) ON DELETE CASCADE,
        name TEXT,
        username TEXT,
        avatar_url TEXT
    );
";

/// SQLite-backed inbox persistence with a live view of all rows.
///
/// Cheap to clone. The synchronous methods block on SQLite; the async store traits run them
/// on tokio's blocking pool.
#[derive(Clone)]
pub struct InboxDb {
    inner: Arc<DbInner>,
}

struct DbInner {
    conn: Mutex<Connection>,
    live: watch::Sender<Vec<Inbox>>,
}

impl InboxDb {
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        Self::from_connection(Connection::open(data_dir.join(DB_FILE_NAME))?)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        let rows = load_all(&conn)?;
        let (live, _) = watch::channel(rows);
        Ok(Self {
            inner: Arc::new(DbInner {
                conn: Mutex::new(conn),
                live,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.inner.conn.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    fn publish(&self, conn: &Connection) {
        match load_all(conn) {
            Ok(rows) => {
                self.inner.live.send_replace(rows);
            }
            Err(e) => tracing::warn!(%e, "failed to refresh live inbox view"),
        }
    }

    /// Replaces the stored row (and its identities/profile) keyed by inbox id.
    /// `created_at` of an existing row is kept.
    pub fn upsert(&self, inbox: &Inbox) -> Result<(), StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO inboxes (inbox_id, user_id, inbox_type, provider, provider_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(inbox_id) DO UPDATE SET
                user_id = excluded.user_id,
                inbox_type = excluded.inbox_type,
                provider = excluded.provider,
                provider_id = excluded.provider_id",
            params![
                inbox.inbox_id,
                inbox.user_id,
                inbox.inbox_type.as_str(),
                inbox.provider.as_str(),
                inbox.provider_id,
                inbox.created_at,
            ],
        )?;
        tx.execute(
            "DELETE FROM inbox_identities WHERE inbox_id = ?1",
            [&inbox.inbox_id],
        )?;
        for identity in &inbox.identities {
            tx.execute(
                "INSERT OR IGNORE INTO inbox_identities (inbox_id, kind, identifier)
                 VALUES (?1, ?2, ?3)",
                params![inbox.inbox_id, identity.kind, identity.identifier],
            )?;
        }
        tx.execute(
            "INSERT OR REPLACE INTO profiles (inbox_id, name, username, avatar_url)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                inbox.inbox_id,
                inbox.profile.name,
                inbox.profile.username,
                inbox.profile.avatar_url,
            ],
        )?;
        tx.commit()?;
        self.publish(&conn);
        Ok(())
    }

    pub fn load_all(&self) -> Result<Vec<Inbox>, StorageError> {
        load_all(&self.lock())
    }

    pub fn get(&self, inbox_id: &str) -> Result<Option<Inbox>, StorageError> {
        Ok(load_all(&self.lock())?
            .into_iter()
            .find(|inbox| inbox.inbox_id == inbox_id))
    }

    pub fn find_by_provider_id(&self, provider_id: &str) -> Result<Option<Inbox>, StorageError> {
        let conn = self.lock();
        let inbox_id: Option<String> = conn
            .query_row(
                "SELECT inbox_id FROM inboxes WHERE provider_id = ?1",
                [provider_id],
                |row| row.get(0),
            )
            .optional()?;
        drop(conn);
        match inbox_id {
            Some(id) => self.get(&id),
            None => Ok(None),
        }
    }

    pub fn delete(&self, inbox_id: &str) -> Result<(), StorageError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM inbox_identities WHERE inbox_id = ?1", [inbox_id])?;
        tx.execute("DELETE FROM profiles WHERE inbox_id = ?1", [inbox_id])?;
        tx.execute("DELETE FROM inboxes WHERE inbox_id = ?1", [inbox_id])?;
        tx.commit()?;
        self.publish(&conn);
        Ok(())
    }

    pub fn delete_everything(&self) -> Result<(), StorageError> {
        let conn = self.lock();
        conn.execute_batch(
            "BEGIN;
             DELETE FROM inbox_identities;
             DELETE FROM profiles;
             DELETE FROM inboxes;
             COMMIT;",
        )?;
        self.publish(&conn);
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Inbox>> {
        self.inner.live.subscribe()
    }
}

fn load_all(conn: &Connection) -> Result<Vec<Inbox>, StorageError> {
    let mut identities: HashMap<String, Vec<LinkedIdentity>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT inbox_id, kind, identifier FROM inbox_identities ORDER BY rowid",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                LinkedIdentity {
                    kind: row.get(1)?,
                    identifier: row.get(2)?,
                },
            ))
        })?;
        for row in rows {
            let (inbox_id, identity) = row?;
            identities.entry(inbox_id).or_default().push(identity);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT i.inbox_id, i.user_id, i.inbox_type, i.provider, i.provider_id, i.created_at,
                p.name, p.username, p.avatar_url
         FROM inboxes i
         LEFT JOIN profiles p ON p.inbox_id = i.inbox_id
         ORDER BY i.created_at, i.inbox_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, i64>(5)?,
            row.get::<_, Option<String>>(6)?,
            row.get::<_, Option<String>>(7)?,
            row.get::<_, Option<String>>(8)?,
        ))
    })?;

    let mut inboxes = Vec::new();
    for row in rows {
        let (inbox_id, user_id, inbox_type, provider, provider_id, created_at, name, username, avatar_url) =
            row?;
        let inbox_type = InboxType::parse(&inbox_type).ok_or_else(|| StorageError::Corrupt {
            inbox_id: inbox_id.clone(),
            reason: format!("unknown inbox type {inbox_type:?}"),
        })?;
        let provider = InboxProvider::parse(&provider).ok_or_else(|| StorageError::Corrupt {
            inbox_id: inbox_id.clone(),
            reason: format!("unknown provider {provider:?}"),
        })?;
        inboxes.push(Inbox {
            identities: identities.remove(&inbox_id).unwrap_or_default(),
            profile: Profile {
                inbox_id: inbox_id.clone(),
                name,
                username,
                avatar_url,
            },
            inbox_id,
            user_id,
            inbox_type,
            provider,
            provider_id,
            created_at,
        });
    }
    Ok(inboxes)
}

impl InboxDb {
    async fn blocking<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&InboxDb) -> Result<T, StorageError> + Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

#[async_trait]
impl InboxWriter for InboxDb {
    async fn store_inbox(&self, inbox: &Inbox) -> Result<(), StorageError> {
        let inbox = inbox.clone();
        self.blocking(move |db| db.upsert(&inbox)).await
    }
}

#[async_trait]
impl InboxStore for InboxDb {
    async fn all_inboxes(&self) -> Result<Vec<Inbox>, StorageError> {
        self.blocking(|db| db.load_all()).await
    }

    async fn inbox(&self, inbox_id: &str) -> Result<Option<Inbox>, StorageError> {
        let inbox_id = inbox_id.to_string();
        self.blocking(move |db| db.get(&inbox_id)).await
    }

    fn observe_inboxes(&self) -> watch::Receiver<Vec<Inbox>> {
        self.subscribe()
    }

    async fn delete_inbox(&self, inbox_id: &str) -> Result<(), StorageError> {
        let inbox_id = inbox_id.to_string();
        self.blocking(move |db| db.delete(&inbox_id)).await
    }

    async fn delete_all(&self) -> Result<(), StorageError> {
        self.blocking(|db| db.delete_everything()).await
    }
}
