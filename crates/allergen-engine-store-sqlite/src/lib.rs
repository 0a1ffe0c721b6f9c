//! SQLite persistence for the allergen flag engine.
//!
//! Owns the taxonomy tables and the per-ingredient flag, "none", and
//! dismissal rows. Writes are transactional; the mutual exclusion between a
//! category's "none" assertion and its active flags is enforced here as well
//! as in the domain layer, so a crashed client cannot leave both behind.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use allergen_engine_core::{
    CategoryId, Dismissal, DismissalId, Flag, FlagCategory, FlagId, FlagSource, FlagTaxonomy,
    IngredientFlagAssignment, IngredientId, PropagationType,
};

/// Forward-only migrations. Append new versions, never edit applied ones.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "
    CREATE TABLE flag_categories (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL CHECK (length(trim(name)) > 0),
        propagation_type TEXT NOT NULL
            CHECK (propagation_type IN ('contains', 'suitable_for')),
        required INTEGER NOT NULL DEFAULT 0 CHECK (required IN (0, 1)),
        sort_order INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE flags (
        id INTEGER PRIMARY KEY,
        category_id INTEGER NOT NULL
            REFERENCES flag_categories(id) ON DELETE CASCADE,
        name TEXT NOT NULL CHECK (length(trim(name)) > 0),
        code TEXT,
        icon TEXT,
        sort_order INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX idx_flags_category ON flags(category_id);

    CREATE TABLE ingredient_flags (
        ingredient_id INTEGER NOT NULL,
        flag_id INTEGER NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
        source TEXT NOT NULL
            CHECK (source IN ('manual', 'suggested', 'auto_applied')),
        created_at TEXT NOT NULL,
        PRIMARY KEY (ingredient_id, flag_id)
    );

    CREATE TABLE ingredient_flag_nones (
        ingredient_id INTEGER NOT NULL,
        category_id INTEGER NOT NULL
            REFERENCES flag_categories(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL,
        PRIMARY KEY (ingredient_id, category_id)
    );

    CREATE TABLE flag_dismissals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ingredient_id INTEGER NOT NULL,
        flag_id INTEGER NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
        dismissed_by TEXT NOT NULL CHECK (length(trim(dismissed_by)) > 0),
        reason TEXT,
        matched_keyword TEXT,
        created_at TEXT NOT NULL,
        UNIQUE (ingredient_id, flag_id)
    );
    ",
)];

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct MigrationReport {
    pub from_version: i64,
    pub to_version: i64,
    pub applied: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub latest_version: i64,
    pub pending: Vec<i64>,
}

pub struct FlagStore {
    conn: Connection,
    db_path: PathBuf,
}

impl FlagStore {
    /// Open (creating if needed) the database at `db_path` and apply the
    /// session pragmas. Does not migrate; call [`FlagStore::migrate`] first
    /// on a fresh or upgraded database.
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite database at {}", db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("set journal_mode=WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")
            .context("enable foreign keys")?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .context("set busy_timeout")?;
        Ok(Self { conn, db_path: db_path.to_path_buf() })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Apply all pending migrations, each in its own transaction.
    pub fn migrate(&mut self) -> Result<MigrationReport> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                )",
                [],
            )
            .context("create schema_migrations table")?;

        let from_version = self.current_version()?;
        let mut applied = Vec::new();

        for (version, sql) in MIGRATIONS {
            if *version <= from_version {
                continue;
            }
            let tx = self.conn.transaction().context("begin migration transaction")?;
            tx.execute_batch(sql)
                .with_context(|| format!("apply migration {version}"))?;
            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                params![version, now_rfc3339()?],
            )
            .with_context(|| format!("record migration {version}"))?;
            tx.commit().with_context(|| format!("commit migration {version}"))?;
            applied.push(*version);
        }

        Ok(MigrationReport {
            from_version,
            to_version: self.current_version()?,
            applied,
        })
    }

    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = if self.table_exists("schema_migrations")? {
            self.current_version()?
        } else {
            0
        };
        let latest_version = MIGRATIONS.last().map_or(0, |(version, _)| *version);
        let pending = MIGRATIONS
            .iter()
            .map(|(version, _)| *version)
            .filter(|version| *version > current_version)
            .collect();
        Ok(SchemaStatus { current_version, latest_version, pending })
    }

    /// Replace the stored taxonomy wholesale. Ingredient rows referencing
    /// removed flags or categories are dropped by the cascades.
    pub fn seed_taxonomy(&mut self, taxonomy: &FlagTaxonomy) -> Result<()> {
        let tx = self.conn.transaction().context("begin taxonomy seed")?;
        tx.execute("DELETE FROM flags", []).context("clear flags")?;
        tx.execute("DELETE FROM flag_categories", []).context("clear flag categories")?;

        for category in taxonomy.categories() {
            tx.execute(
                "INSERT INTO flag_categories (id, name, propagation_type, required, sort_order)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    category.id.0,
                    category.name,
                    category.propagation.as_str(),
                    i64::from(category.required),
                    category.sort_order,
                ],
            )
            .with_context(|| format!("insert category {}", category.id))?;

            for flag in &category.flags {
                tx.execute(
                    "INSERT INTO flags (id, category_id, name, code, icon, sort_order)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        flag.id.0,
                        category.id.0,
                        flag.name,
                        flag.code,
                        flag.icon,
                        flag.sort_order,
                    ],
                )
                .with_context(|| format!("insert flag {}", flag.id))?;
            }
        }

        tx.commit().context("commit taxonomy seed")
    }

    /// Load and re-validate the stored taxonomy. Fails closed: invalid rows
    /// surface as an error rather than a partial taxonomy.
    pub fn load_taxonomy(&self) -> Result<FlagTaxonomy> {
        let mut category_stmt = self
            .conn
            .prepare(
                "SELECT id, name, propagation_type, required, sort_order
                 FROM flag_categories ORDER BY sort_order, id",
            )
            .context("prepare category query")?;
        let raw_categories = category_stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .context("query flag categories")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read flag category rows")?;

        let mut flag_stmt = self
            .conn
            .prepare(
                "SELECT id, name, code, icon, sort_order FROM flags
                 WHERE category_id = ?1 ORDER BY sort_order, id",
            )
            .context("prepare flag query")?;

        let mut categories = Vec::with_capacity(raw_categories.len());
        for (id, name, propagation_raw, required, sort_order) in raw_categories {
            let Some(propagation) = PropagationType::parse(&propagation_raw) else {
                bail!("category {id} has unknown propagation type: {propagation_raw}");
            };
            let flags = flag_stmt
                .query_map(params![id], |row| {
                    Ok(Flag {
                        id: FlagId(row.get(0)?),
                        name: row.get(1)?,
                        code: row.get(2)?,
                        icon: row.get(3)?,
                        sort_order: row.get(4)?,
                    })
                })
                .with_context(|| format!("query flags for category {id}"))?
                .collect::<rusqlite::Result<Vec<_>>>()
                .with_context(|| format!("read flag rows for category {id}"))?;

            categories.push(FlagCategory {
                id: CategoryId(id),
                name,
                propagation,
                required: required != 0,
                sort_order,
                flags,
            });
        }

        FlagTaxonomy::new(categories).context("validate stored taxonomy")
    }

    pub fn list_ingredient_flags(
        &self,
        ingredient_id: IngredientId,
    ) -> Result<Vec<IngredientFlagAssignment>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT flag_id, source FROM ingredient_flags
                 WHERE ingredient_id = ?1 ORDER BY flag_id",
            )
            .context("prepare ingredient flag query")?;
        let rows = stmt
            .query_map(params![ingredient_id.0], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .context("query ingredient flags")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read ingredient flag rows")?;

        let mut assignments = Vec::with_capacity(rows.len());
        for (flag_id, source_raw) in rows {
            let Some(source) = FlagSource::parse(&source_raw) else {
                bail!("ingredient {ingredient_id} flag {flag_id} has unknown source: {source_raw}");
            };
            assignments.push(IngredientFlagAssignment {
                ingredient_id,
                flag_id: FlagId(flag_id),
                source,
            });
        }
        Ok(assignments)
    }

    pub fn list_ingredient_nones(&self, ingredient_id: IngredientId) -> Result<Vec<CategoryId>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT category_id FROM ingredient_flag_nones
                 WHERE ingredient_id = ?1 ORDER BY category_id",
            )
            .context("prepare ingredient none query")?;
        let rows = stmt
            .query_map(params![ingredient_id.0], |row| row.get::<_, i64>(0))
            .context("query ingredient nones")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read ingredient none rows")?;
        Ok(rows.into_iter().map(CategoryId).collect())
    }

    pub fn list_dismissals(&self, ingredient_id: IngredientId) -> Result<Vec<Dismissal>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, flag_id, dismissed_by, reason, matched_keyword
                 FROM flag_dismissals WHERE ingredient_id = ?1 ORDER BY flag_id",
            )
            .context("prepare dismissal query")?;
        let rows = stmt
            .query_map(params![ingredient_id.0], |row| {
                Ok(Dismissal {
                    id: Some(DismissalId(row.get(0)?)),
                    flag_id: FlagId(row.get(1)?),
                    dismissed_by: row.get(2)?,
                    reason: row.get(3)?,
                    matched_keyword: row.get(4)?,
                })
            })
            .context("query dismissals")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("read dismissal rows")?;
        Ok(rows)
    }

    /// Transactional full replace of an ingredient's active flag set. Also
    /// clears the "none" row of every category a written flag belongs to.
    pub fn replace_ingredient_flags(
        &mut self,
        ingredient_id: IngredientId,
        assignments: &[(FlagId, FlagSource)],
    ) -> Result<()> {
        let created_at = now_rfc3339()?;
        let tx = self.conn.transaction().context("begin flag replace")?;

        tx.execute(
            "DELETE FROM ingredient_flags WHERE ingredient_id = ?1",
            params![ingredient_id.0],
        )
        .context("clear existing ingredient flags")?;

        for (flag_id, source) in assignments {
            tx.execute(
                "INSERT INTO ingredient_flags (ingredient_id, flag_id, source, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![ingredient_id.0, flag_id.0, source.as_str(), created_at],
            )
            .with_context(|| format!("insert ingredient flag {flag_id}"))?;
            tx.execute(
                "DELETE FROM ingredient_flag_nones
                 WHERE ingredient_id = ?1
                   AND category_id = (SELECT category_id FROM flags WHERE id = ?2)",
                params![ingredient_id.0, flag_id.0],
            )
            .with_context(|| format!("clear none row shadowed by flag {flag_id}"))?;
        }

        tx.commit().context("commit flag replace")
    }

    /// Idempotent "none" assertion. Clears flag rows in the category in the
    /// same transaction.
    pub fn assert_ingredient_none(
        &mut self,
        ingredient_id: IngredientId,
        category_id: CategoryId,
    ) -> Result<()> {
        let tx = self.conn.transaction().context("begin none assert")?;
        tx.execute(
            "DELETE FROM ingredient_flags
             WHERE ingredient_id = ?1
               AND flag_id IN (SELECT id FROM flags WHERE category_id = ?2)",
            params![ingredient_id.0, category_id.0],
        )
        .context("clear category flags for none assert")?;
        tx.execute(
            "INSERT OR IGNORE INTO ingredient_flag_nones (ingredient_id, category_id, created_at)
             VALUES (?1, ?2, ?3)",
            params![ingredient_id.0, category_id.0, now_rfc3339()?],
        )
        .context("insert none row")?;
        tx.commit().context("commit none assert")
    }

    pub fn clear_ingredient_none(
        &mut self,
        ingredient_id: IngredientId,
        category_id: CategoryId,
    ) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM ingredient_flag_nones
                 WHERE ingredient_id = ?1 AND category_id = ?2",
                params![ingredient_id.0, category_id.0],
            )
            .context("delete none row")?;
        Ok(())
    }

    /// Store a dismissal. One row per (ingredient, flag); a repeat dismissal
    /// updates attribution in place and keeps the original row id.
    pub fn create_dismissal(
        &mut self,
        ingredient_id: IngredientId,
        dismissal: &Dismissal,
    ) -> Result<DismissalId> {
        self.conn
            .execute(
                "INSERT INTO flag_dismissals
                     (ingredient_id, flag_id, dismissed_by, reason, matched_keyword, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT (ingredient_id, flag_id) DO UPDATE SET
                     dismissed_by = excluded.dismissed_by,
                     reason = excluded.reason,
                     matched_keyword = excluded.matched_keyword",
                params![
                    ingredient_id.0,
                    dismissal.flag_id.0,
                    dismissal.dismissed_by,
                    dismissal.reason,
                    dismissal.matched_keyword,
                    now_rfc3339()?,
                ],
            )
            .context("insert dismissal")?;

        let id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM flag_dismissals WHERE ingredient_id = ?1 AND flag_id = ?2",
                params![ingredient_id.0, dismissal.flag_id.0],
                |row| row.get(0),
            )
            .context("read dismissal id")?;
        Ok(DismissalId(id))
    }

    /// Delete a dismissal by its server id. Returns whether a row existed.
    pub fn delete_dismissal(&mut self, dismissal_id: DismissalId) -> Result<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM flag_dismissals WHERE id = ?1", params![dismissal_id.0])
            .context("delete dismissal")?;
        Ok(deleted > 0)
    }

    fn current_version(&self) -> Result<i64> {
        let version: Option<i64> = self
            .conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .optional()
            .context("read schema version")?
            .flatten();
        Ok(version.unwrap_or(0))
    }

    fn table_exists(&self, name: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()
            .context("probe sqlite_master")?;
        Ok(found.is_some())
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("format current timestamp")
}
