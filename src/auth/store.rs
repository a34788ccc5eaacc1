// Durable session storage
//
// A session is persisted as a handful of string entries in a local key-value
// area. Both stores share the same key layout and decoding rules.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::types::{PrincipalKind, TokenPair};

pub const KEY_ACCESS: &str = "session.access";
pub const KEY_REFRESH: &str = "session.refresh";
pub const KEY_PRINCIPAL: &str = "session.principal";
pub const KEY_ISSUED_AT: &str = "session.issued_at";

const ALL_KEYS: [&str; 4] = [KEY_ACCESS, KEY_REFRESH, KEY_PRINCIPAL, KEY_ISSUED_AT];

/// Persistence of the current session
///
/// The session manager is the only writer. Implementations must make `save`
/// atomic with respect to `load`: a reader never sees half of a pair.
pub trait TokenStore: Send + Sync {
    /// Load the persisted session
    /// Absent and malformed data both come back as `None`
    fn load(&self) -> Option<(TokenPair, PrincipalKind)>;

    /// Overwrite the persisted session
    fn save(&self, pair: &TokenPair, kind: PrincipalKind) -> Result<()>;

    /// Remove every persisted session entry (idempotent)
    fn clear(&self) -> Result<()>;
}

/// Encode a session into its key-value entries
fn encode_entries(pair: &TokenPair, kind: PrincipalKind) -> [(&'static str, String); 4] {
    [
        (KEY_ACCESS, pair.access.clone()),
        (KEY_REFRESH, pair.refresh.clone()),
        (KEY_PRINCIPAL, kind.as_str().to_string()),
        (KEY_ISSUED_AT, pair.issued_at.to_rfc3339()),
    ]
}

/// Decode a session from its key-value entries
fn decode_entries(entries: &HashMap<String, String>) -> Option<(TokenPair, PrincipalKind)> {
    let access = entries.get(KEY_ACCESS).filter(|v| !v.is_empty())?;
    let refresh = entries.get(KEY_REFRESH).filter(|v| !v.is_empty())?;

    // Sessions written before the principal was stored belong to clients
    let kind = match entries.get(KEY_PRINCIPAL) {
        None => PrincipalKind::Client,
        Some(raw) => match raw.parse() {
            Ok(kind) => kind,
            Err(e) => {
                tracing::warn!("Ignoring persisted session: {}", e);
                return None;
            }
        },
    };

    let issued_at = entries
        .get(KEY_ISSUED_AT)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some((
        TokenPair {
            access: access.clone(),
            refresh: refresh.clone(),
            issued_at,
        },
        kind,
    ))
}

/// Session store backed by a SQLite key-value table
pub struct SqliteTokenStore {
    conn: Mutex<rusqlite::Connection>,
    path: PathBuf,
}

impl SqliteTokenStore {
    /// Open (or create) the store at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create session directory: {}", parent.display())
            })?;
        }

        let conn = rusqlite::Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database: {}", path.display()))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS session_kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )
        .context("Failed to create session table")?;

        tracing::debug!("Session store opened at {}", path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_entries(&self) -> Result<HashMap<String, String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Session store lock poisoned"))?;

        // One statement, one read snapshot
        let mut stmt = conn
            .prepare("SELECT key, value FROM session_kv WHERE key LIKE 'session.%'")
            .context("Failed to prepare session query")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .context("Failed to query session entries")?;

        let mut entries = HashMap::new();
        for row in rows {
            let (key, value) = row.context("Failed to read session entry")?;
            entries.insert(key, value);
        }
        Ok(entries)
    }
}

impl TokenStore for SqliteTokenStore {
    fn load(&self) -> Option<(TokenPair, PrincipalKind)> {
        match self.read_entries() {
            Ok(entries) => decode_entries(&entries),
            Err(e) => {
                tracing::warn!("Failed to load persisted session: {:#}", e);
                None
            }
        }
    }

    fn save(&self, pair: &TokenPair, kind: PrincipalKind) -> Result<()> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Session store lock poisoned"))?;

        let tx = conn
            .transaction()
            .context("Failed to begin session transaction")?;
        for (key, value) in encode_entries(pair, kind) {
            tx.execute(
                "INSERT OR REPLACE INTO session_kv (key, value) VALUES (?1, ?2)",
                rusqlite::params![key, value],
            )
            .with_context(|| format!("Failed to write {}", key))?;
        }
        tx.commit().context("Failed to commit session")?;

        tracing::debug!(principal = %kind, "Session persisted");
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("Session store lock poisoned"))?;

        conn.execute("DELETE FROM session_kv WHERE key LIKE 'session.%'", [])
            .context("Failed to clear session")?;

        tracing::debug!("Persisted session cleared");
        Ok(())
    }
}

/// In-process session store, nothing survives a restart
#[derive(Default)]
pub struct MemoryTokenStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with raw entries
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: Mutex::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Raw entry, for inspection
    pub fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.entries
            .lock()
            .map(|entries| ALL_KEYS.iter().all(|k| !entries.contains_key(*k)))
            .unwrap_or(true)
    }
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Option<(TokenPair, PrincipalKind)> {
        let entries = self.entries.lock().ok()?;
        decode_entries(&entries)
    }

    fn save(&self, pair: &TokenPair, kind: PrincipalKind) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("Session store lock poisoned"))?;
        for (key, value) in encode_entries(pair, kind) {
            entries.insert(key.to_string(), value);
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| anyhow!("Session store lock poisoned"))?;
        for key in ALL_KEYS {
            entries.remove(key);
        }
        Ok(())
    }
}
