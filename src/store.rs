//! SQLite entity store with an FTS5 search side table.
//!
//! Entity rows and their search rows share a rowid and are written in the
//! same transaction, so readers see a batch entirely or not at all.
//!
//! `entity_search` decides which rows match. Relevance comes from one
//! single-column table per field, so a long description never dilutes a
//! label match.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Transaction, params};
use serde::Serialize;

use crate::domain::{Entity, EntityId, EntityKind, EntitySummary, Source, pick_language};
use crate::error::MirrorError;

const SCHEMA_VERSION: i64 = 2;
const LABEL_WEIGHT: f64 = 10.0;
const ALIAS_WEIGHT: f64 = 5.0;
const DESCRIPTION_WEIGHT: f64 = 1.0;
const MAX_IDLE_READERS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchSettings {
    /// Languages whose terms are indexed; `None` indexes every language.
    pub index_languages: Option<Vec<String>>,
    pub display_language: String,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            index_languages: None,
            display_language: "en".to_string(),
        }
    }
}

impl SearchSettings {
    fn includes(&self, language: &str) -> bool {
        self.index_languages
            .as_ref()
            .is_none_or(|languages| languages.iter().any(|l| l == language))
    }
}

/// Destination of committed import batches.
pub trait BatchWriter: Send + Sync {
    fn upsert_batch(&self, entities: &[Entity]) -> Result<CommitToken, MirrorError>;
}

impl BatchWriter for EntityStore {
    fn upsert_batch(&self, entities: &[Entity]) -> Result<CommitToken, MirrorError> {
        EntityStore::upsert_batch(self, entities)
    }
}

/// Outcome of one committed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CommitToken {
    pub written: usize,
    /// Rows skipped because the stored copy was written later.
    pub stale: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub entity: EntitySummary,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: u64,
    pub by_kind: BTreeMap<EntityKind, u64>,
}

#[derive(Debug)]
pub struct EntityStore {
    path: Utf8PathBuf,
    search: SearchSettings,
    writer: Mutex<Connection>,
    readers: Mutex<Vec<Connection>>,
}

impl EntityStore {
    pub fn open(path: impl Into<Utf8PathBuf>, search: SearchSettings) -> Result<Self, MirrorError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| MirrorError::Filesystem(format!("create {parent}: {err}")))?;
        }

        let conn = Connection::open(path.as_std_path())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        // FULL so a returned commit survives power loss before the checkpoint moves.
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.pragma_update(None, "cache_size", -64000)?;
        let migrated = init_schema(&conn)?;

        let store = Self {
            path,
            search,
            writer: Mutex::new(conn),
            readers: Mutex::new(Vec::new()),
        };
        if migrated {
            tracing::info!(path = %store.path, "search tables added; reindexing");
            store.rebuild_search_index()?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn search_settings(&self) -> &SearchSettings {
        &self.search
    }

    /// Replace rows by id in one transaction; last write by `fetched_at` wins.
    pub fn upsert_batch(&self, entities: &[Entity]) -> Result<CommitToken, MirrorError> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| MirrorError::StorageIo("writer lock poisoned".to_string()))?;
        let tx = conn.transaction()?;
        let mut token = CommitToken {
            written: 0,
            stale: 0,
        };
        for entity in entities {
            if self.upsert_one(&tx, entity)? {
                token.written += 1;
            } else {
                token.stale += 1;
            }
        }
        tx.commit()?;
        Ok(token)
    }

    /// Store an entity that upstream returned for `requested`, remembering
    /// the redirect in the same transaction.
    pub fn upsert_redirected(
        &self,
        requested: &EntityId,
        entity: &Entity,
    ) -> Result<CommitToken, MirrorError> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| MirrorError::StorageIo("writer lock poisoned".to_string()))?;
        let tx = conn.transaction()?;
        let written = self.upsert_one(&tx, entity)?;
        if requested != &entity.id {
            tx.prepare_cached(
                "INSERT INTO redirects (from_id, to_id) VALUES (?1, ?2)
                 ON CONFLICT(from_id) DO UPDATE SET to_id = excluded.to_id",
            )?
            .execute(params![requested.as_str(), entity.id.as_str()])?;
        }
        tx.commit()?;
        Ok(CommitToken {
            written: usize::from(written),
            stale: usize::from(!written),
        })
    }

    fn upsert_one(&self, tx: &Transaction<'_>, entity: &Entity) -> Result<bool, MirrorError> {
        let row = EncodedRow::encode(entity)?;
        let rowid: Option<i64> = tx
            .prepare_cached(
                "INSERT INTO entities
                    (id, kind, labels_json, descriptions_json, aliases_json, claims_json,
                     modified, source, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    kind = excluded.kind,
                    labels_json = excluded.labels_json,
                    descriptions_json = excluded.descriptions_json,
                    aliases_json = excluded.aliases_json,
                    claims_json = excluded.claims_json,
                    modified = excluded.modified,
                    source = excluded.source,
                    fetched_at = excluded.fetched_at
                 WHERE excluded.fetched_at >= entities.fetched_at
                 RETURNING rowid",
            )?
            .query_row(
                params![
                    entity.id.as_str(),
                    entity.kind.as_str(),
                    row.labels,
                    row.descriptions,
                    row.aliases,
                    row.claims,
                    entity.modified,
                    entity.source.as_str(),
                    entity.fetched_at.timestamp_millis(),
                ],
                |r| r.get(0),
            )
            .optional()?;

        let Some(rowid) = rowid else {
            return Ok(false);
        };

        for table in SEARCH_TABLES {
            tx.prepare_cached(&format!("DELETE FROM {table} WHERE rowid = ?1"))?
                .execute(params![rowid])?;
        }
        self.search_terms(entity).insert(tx, rowid)?;
        Ok(true)
    }

    /// Row for `id`, or for the entity `id` redirects to.
    pub fn get(&self, id: &EntityId) -> Result<Option<Entity>, MirrorError> {
        self.with_reader(|conn| {
            let mut select = conn.prepare_cached(
                "SELECT id, kind, labels_json, descriptions_json, aliases_json, claims_json,
                        modified, source, fetched_at
                 FROM entities WHERE id = ?1",
            )?;
            let mut row = select
                .query_row(params![id.as_str()], StoredRow::from_row)
                .optional()?;
            if row.is_none() {
                let target: Option<String> = conn
                    .prepare_cached("SELECT to_id FROM redirects WHERE from_id = ?1")?
                    .query_row(params![id.as_str()], |r| r.get(0))
                    .optional()?;
                if let Some(target) = target {
                    row = select
                        .query_row(params![target], StoredRow::from_row)
                        .optional()?;
                }
            }
            row.map(StoredRow::into_entity).transpose()
        })
    }

    /// Tokenized match over labels, aliases and descriptions.
    ///
    /// Highest relevance first; equal scores are ordered by id prefix, then
    /// numerically.
    pub fn search(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, MirrorError> {
        let Some(tokens) = fts_tokens(text) else {
            return Ok(Vec::new());
        };
        if limit == 0 {
            return Ok(Vec::new());
        }

        let language = self.search.display_language.clone();
        self.with_reader(|conn| {
            let mut stmt = conn.prepare_cached(
                "WITH matched AS MATERIALIZED (
                     SELECT rowid FROM entity_search WHERE entity_search MATCH ?1
                 ),
                 label_rank AS MATERIALIZED (
                     SELECT rowid, bm25(search_labels) AS relevance
                     FROM search_labels WHERE search_labels MATCH ?2
                 ),
                 alias_rank AS MATERIALIZED (
                     SELECT rowid, bm25(search_aliases) AS relevance
                     FROM search_aliases WHERE search_aliases MATCH ?2
                 ),
                 description_rank AS MATERIALIZED (
                     SELECT rowid, bm25(search_descriptions) AS relevance
                     FROM search_descriptions WHERE search_descriptions MATCH ?2
                 )
                 SELECT e.id, e.kind, e.labels_json, e.descriptions_json,
                        ?3 * COALESCE(l.relevance, 0.0)
                          + ?4 * COALESCE(a.relevance, 0.0)
                          + ?5 * COALESCE(d.relevance, 0.0) AS score
                 FROM matched m
                 JOIN entities e ON e.rowid = m.rowid
                 LEFT JOIN label_rank l ON l.rowid = m.rowid
                 LEFT JOIN alias_rank a ON a.rowid = m.rowid
                 LEFT JOIN description_rank d ON d.rowid = m.rowid
                 ORDER BY score, substr(e.id, 1, 1), CAST(substr(e.id, 2) AS INTEGER)
                 LIMIT ?6",
            )?;
            let all_tokens = tokens.join(" ");
            let any_token = tokens.join(" OR ");
            let params = params![
                all_tokens,
                any_token,
                LABEL_WEIGHT,
                ALIAS_WEIGHT,
                DESCRIPTION_WEIGHT,
                limit as i64
            ];
            let rows = stmt.query_map(params, |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                ))
            })?;

            let mut hits = Vec::new();
            for row in rows {
                let (id, kind, labels, descriptions, rank) = row?;
                let labels: BTreeMap<String, String> = parse_column(&id, "labels", &labels)?;
                let descriptions: BTreeMap<String, String> =
                    parse_column(&id, "descriptions", &descriptions)?;
                hits.push(SearchHit {
                    entity: EntitySummary {
                        id: parse_stored_id(&id)?,
                        kind: parse_stored_kind(&kind)?,
                        label: pick_language(&labels, &language).map(str::to_string),
                        description: pick_language(&descriptions, &language).map(str::to_string),
                    },
                    score: -rank,
                });
            }
            Ok(hits)
        })
    }

    pub fn stats(&self) -> Result<StoreStats, MirrorError> {
        self.with_reader(|conn| {
            let mut stmt =
                conn.prepare_cached("SELECT kind, COUNT(*) FROM entities GROUP BY kind")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut stats = StoreStats::default();
            for row in rows {
                let (kind, count) = row?;
                let count = count.max(0) as u64;
                stats.by_kind.insert(parse_stored_kind(&kind)?, count);
                stats.total += count;
            }
            Ok(stats)
        })
    }

    /// Drop and repopulate the search tables from entity rows.
    pub fn rebuild_search_index(&self) -> Result<u64, MirrorError> {
        let mut conn = self
            .writer
            .lock()
            .map_err(|_| MirrorError::StorageIo("writer lock poisoned".to_string()))?;
        let tx = conn.transaction()?;
        for table in SEARCH_TABLES {
            tx.execute(&format!("DELETE FROM {table}"), [])?;
        }
        let mut indexed = 0u64;
        {
            let mut select = tx.prepare(
                "SELECT rowid, id, kind, labels_json, descriptions_json, aliases_json, claims_json,
                        modified, source, fetched_at
                 FROM entities",
            )?;
            let mut rows = select.query([])?;
            while let Some(row) = rows.next()? {
                let rowid: i64 = row.get(0)?;
                let entity = StoredRow {
                    id: row.get(1)?,
                    kind: row.get(2)?,
                    labels: row.get(3)?,
                    descriptions: row.get(4)?,
                    aliases: row.get(5)?,
                    claims: row.get(6)?,
                    modified: row.get(7)?,
                    source: row.get(8)?,
                    fetched_at: row.get(9)?,
                }
                .into_entity()?;
                self.search_terms(&entity).insert(&tx, rowid)?;
                indexed += 1;
            }
        }
        tx.commit()?;
        tracing::info!(indexed, "rebuilt search index");
        Ok(indexed)
    }

    fn search_terms(&self, entity: &Entity) -> SearchTerms {
        let labels = entity
            .labels
            .iter()
            .filter(|(language, _)| self.search.includes(language))
            .map(|(_, value)| value.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let descriptions = entity
            .descriptions
            .iter()
            .filter(|(language, _)| self.search.includes(language))
            .map(|(_, value)| value.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let aliases = entity
            .aliases
            .iter()
            .filter(|(language, _)| self.search.includes(language))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        SearchTerms {
            labels,
            descriptions,
            aliases,
        }
    }

    fn with_reader<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, MirrorError>,
    ) -> Result<T, MirrorError> {
        let pooled = self
            .readers
            .lock()
            .map_err(|_| MirrorError::StorageIo("reader pool lock poisoned".to_string()))?
            .pop();
        let conn = match pooled {
            Some(conn) => conn,
            None => self.open_reader()?,
        };
        let result = f(&conn);
        if let Ok(mut readers) = self.readers.lock() {
            if readers.len() < MAX_IDLE_READERS {
                readers.push(conn);
            }
        }
        result
    }

    fn open_reader(&self) -> Result<Connection, MirrorError> {
        let conn = Connection::open_with_flags(
            self.path.as_std_path(),
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(conn)
    }
}

/// Returns true when an older database gained search tables that still
/// need filling.
fn init_schema(conn: &Connection) -> Result<bool, MirrorError> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if version == SCHEMA_VERSION {
        return Ok(false);
    }
    if version > SCHEMA_VERSION {
        return Err(MirrorError::StorageIo(format!(
            "database schema version {version} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS entities (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            labels_json TEXT NOT NULL,
            descriptions_json TEXT NOT NULL,
            aliases_json TEXT NOT NULL,
            claims_json TEXT NOT NULL,
            modified TEXT,
            source TEXT NOT NULL,
            fetched_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entities_kind ON entities(kind);

        CREATE VIRTUAL TABLE IF NOT EXISTS entity_search USING fts5(
            labels,
            descriptions,
            aliases,
            tokenize = 'unicode61 remove_diacritics 2'
        );

        CREATE VIRTUAL TABLE IF NOT EXISTS search_labels USING fts5(
            terms, tokenize = 'unicode61 remove_diacritics 2'
        );
        CREATE VIRTUAL TABLE IF NOT EXISTS search_aliases USING fts5(
            terms, tokenize = 'unicode61 remove_diacritics 2'
        );
        CREATE VIRTUAL TABLE IF NOT EXISTS search_descriptions USING fts5(
            terms, tokenize = 'unicode61 remove_diacritics 2'
        );

        CREATE TABLE IF NOT EXISTS redirects (
            from_id TEXT PRIMARY KEY,
            to_id TEXT NOT NULL
        );

        PRAGMA user_version = 2;
        ",
    )?;
    Ok(version == 1)
}

const SEARCH_TABLES: [&str; 4] = [
    "entity_search",
    "search_labels",
    "search_aliases",
    "search_descriptions",
];

/// Alphanumeric tokens, each quoted so FTS5 syntax in user input is inert.
fn fts_tokens(text: &str) -> Option<Vec<String>> {
    let tokens = text
        .split(|ch: char| !ch.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| format!("\"{token}\""))
        .collect::<Vec<_>>();
    (!tokens.is_empty()).then_some(tokens)
}

struct SearchTerms {
    labels: String,
    descriptions: String,
    aliases: String,
}

impl SearchTerms {
    fn insert(&self, conn: &Connection, rowid: i64) -> Result<(), MirrorError> {
        conn.prepare_cached(
            "INSERT INTO entity_search (rowid, labels, descriptions, aliases) VALUES (?1, ?2, ?3, ?4)",
        )?
        .execute(params![rowid, self.labels, self.descriptions, self.aliases])?;
        for (table, terms) in [
            ("search_labels", &self.labels),
            ("search_aliases", &self.aliases),
            ("search_descriptions", &self.descriptions),
        ] {
            if !terms.is_empty() {
                conn.prepare_cached(&format!("INSERT INTO {table} (rowid, terms) VALUES (?1, ?2)"))?
                    .execute(params![rowid, terms])?;
            }
        }
        Ok(())
    }
}

struct EncodedRow {
    labels: String,
    descriptions: String,
    aliases: String,
    claims: String,
}

impl EncodedRow {
    fn encode(entity: &Entity) -> Result<Self, MirrorError> {
        let encode = |field: &str, result: serde_json::Result<String>| {
            result.map_err(|err| {
                MirrorError::StorageIo(format!("{}: encode {field}: {err}", entity.id))
            })
        };
        Ok(Self {
            labels: encode("labels", serde_json::to_string(&entity.labels))?,
            descriptions: encode("descriptions", serde_json::to_string(&entity.descriptions))?,
            aliases: encode("aliases", serde_json::to_string(&entity.aliases))?,
            claims: encode("claims", serde_json::to_string(&entity.claims))?,
        })
    }
}

struct StoredRow {
    id: String,
    kind: String,
    labels: String,
    descriptions: String,
    aliases: String,
    claims: String,
    modified: Option<String>,
    source: String,
    fetched_at: i64,
}

impl StoredRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1)?,
            labels: row.get(2)?,
            descriptions: row.get(3)?,
            aliases: row.get(4)?,
            claims: row.get(5)?,
            modified: row.get(6)?,
            source: row.get(7)?,
            fetched_at: row.get(8)?,
        })
    }

    fn into_entity(self) -> Result<Entity, MirrorError> {
        let fetched_at = DateTime::<Utc>::from_timestamp_millis(self.fetched_at).ok_or_else(|| {
            MirrorError::StorageIo(format!("{}: invalid fetched_at {}", self.id, self.fetched_at))
        })?;
        let source: Source = self.source.parse()?;
        Ok(Entity {
            kind: parse_stored_kind(&self.kind)?,
            labels: parse_column(&self.id, "labels", &self.labels)?,
            descriptions: parse_column(&self.id, "descriptions", &self.descriptions)?,
            aliases: parse_column(&self.id, "aliases", &self.aliases)?,
            claims: parse_column(&self.id, "claims", &self.claims)?,
            modified: self.modified,
            fetched_at,
            source,
            id: parse_stored_id(&self.id)?,
        })
    }
}

fn parse_column<T: serde::de::DeserializeOwned>(
    id: &str,
    column: &str,
    raw: &str,
) -> Result<T, MirrorError> {
    serde_json::from_str(raw)
        .map_err(|err| MirrorError::StorageIo(format!("{id}: corrupt {column} column: {err}")))
}

fn parse_stored_id(raw: &str) -> Result<EntityId, MirrorError> {
    raw.parse::<EntityId>()
        .map_err(|_| MirrorError::StorageIo(format!("corrupt id column: {raw}")))
}

fn parse_stored_kind(raw: &str) -> Result<EntityKind, MirrorError> {
    raw.parse::<EntityKind>()
        .map_err(|_| MirrorError::StorageIo(format!("corrupt kind column: {raw}")))
}
