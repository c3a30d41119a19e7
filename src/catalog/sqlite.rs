//! SQLite-backed catalog, one database file per repository.
//!
//! Registration statements use `ON CONFLICT DO NOTHING` followed by a
//! comparison with the stored row, so concurrent registration rules racing on
//! the same record settle on a single row and the loser reports
//! [`Registration::AlreadyPresent`].

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use super::{
    Catalog, FileRecord, GroupRecord, NewResult, Registration, ResultRecord, SampleRecord,
};
use crate::definition::{FileType, Level};
use crate::error::CatalogError;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS file_types (
    name        TEXT PRIMARY KEY,
    extension   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sample_types (
    name        TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS result_schemas (
    name        TEXT PRIMARY KEY,
    files       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS samples (
    name        TEXT PRIMARY KEY,
    sample_type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sample_groups (
    name        TEXT PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS group_members (
    group_name  TEXT    NOT NULL,
    sample_name TEXT    NOT NULL,
    position    INTEGER NOT NULL,
    PRIMARY KEY (group_name, sample_name)
);

CREATE TABLE IF NOT EXISTS files (
    name        TEXT PRIMARY KEY,
    path        TEXT NOT NULL,
    file_type   TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS results (
    name        TEXT PRIMARY KEY,
    result_type TEXT NOT NULL,
    owner       TEXT NOT NULL,
    level       TEXT NOT NULL,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS result_files (
    result_name TEXT NOT NULL,
    role        TEXT NOT NULL,
    file_name   TEXT NOT NULL,
    PRIMARY KEY (result_name, role)
);

CREATE INDEX IF NOT EXISTS idx_results_owner ON results(owner, level);
"#;

#[derive(Clone)]
pub struct SqliteCatalog {
    pool: SqlitePool,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SqliteCatalog({})", self.path.display())
    }
}

impl SqliteCatalog {
    /// Opens (creating if needed) the catalog database at `path`.
    pub async fn open(path: &Path) -> Result<Self, CatalogError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        sqlx::query(SCHEMA_SQL).execute(&pool).await?;

        debug!(path = %path.display(), "Catalog opened");
        Ok(Self {
            pool,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every result of the given level, keyed by owner.
    async fn results_by_owner(
        &self,
        level: Level,
    ) -> Result<HashMap<String, Vec<ResultRecord>>, CatalogError> {
        let rows = sqlx::query(
            "SELECT r.name AS result_name, r.result_type, r.owner,
                    rf.role, f.name AS file_name, f.path, f.file_type
             FROM results r
             LEFT JOIN result_files rf ON rf.result_name = r.name
             LEFT JOIN files f ON f.name = rf.file_name
             WHERE r.level = ?1
             ORDER BY r.owner, r.name, rf.role",
        )
        .bind(level.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut by_name: BTreeMap<String, ResultRecord> = BTreeMap::new();
        for row in rows {
            let name: String = row.get("result_name");
            let record = by_name.entry(name.clone()).or_insert_with(|| ResultRecord {
                name,
                result_type: row.get("result_type"),
                owner: row.get("owner"),
                level,
                files: BTreeMap::new(),
            });

            let role: Option<String> = row.get("role");
            let file_name: Option<String> = row.get("file_name");
            if let (Some(role), Some(file_name)) = (role, file_name) {
                let path: String = row.get("path");
                record.files.insert(
                    role,
                    FileRecord {
                        name: file_name,
                        path: PathBuf::from(path),
                        file_type: row.get("file_type"),
                    },
                );
            }
        }

        let mut by_owner: HashMap<String, Vec<ResultRecord>> = HashMap::new();
        for record in by_name.into_values() {
            by_owner.entry(record.owner.clone()).or_default().push(record);
        }
        Ok(by_owner)
    }

    async fn load_samples(&self) -> Result<Vec<SampleRecord>, CatalogError> {
        let mut results = self.results_by_owner(Level::Sample).await?;
        let rows = sqlx::query("SELECT name, sample_type FROM samples ORDER BY name")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let name: String = row.get("name");
                SampleRecord {
                    results: results.remove(&name).unwrap_or_default(),
                    sample_type: row.get("sample_type"),
                    name,
                }
            })
            .collect())
    }

    async fn load_groups(&self) -> Result<Vec<GroupRecord>, CatalogError> {
        let samples: HashMap<String, SampleRecord> = self
            .load_samples()
            .await?
            .into_iter()
            .map(|s| (s.name.clone(), s))
            .collect();
        let mut results = self.results_by_owner(Level::Group).await?;

        let group_rows = sqlx::query("SELECT name FROM sample_groups ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        let member_rows = sqlx::query(
            "SELECT group_name, sample_name FROM group_members ORDER BY group_name, position",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut members: HashMap<String, Vec<SampleRecord>> = HashMap::new();
        for row in member_rows {
            let group: String = row.get("group_name");
            let sample: String = row.get("sample_name");
            match samples.get(&sample) {
                Some(record) => members.entry(group).or_default().push(record.clone()),
                None => warn!(group = %group, sample = %sample, "Group member missing from catalog"),
            }
        }

        Ok(group_rows
            .into_iter()
            .map(|row| {
                let name: String = row.get("name");
                GroupRecord {
                    members: members.remove(&name).unwrap_or_default(),
                    results: results.remove(&name).unwrap_or_default(),
                    name,
                }
            })
            .collect())
    }

    async fn owner_exists(&self, owner: &str, level: Level) -> Result<bool, CatalogError> {
        let sql = match level {
            Level::Sample => "SELECT 1 FROM samples WHERE name = ?1",
            Level::Group => "SELECT 1 FROM sample_groups WHERE name = ?1",
        };
        let row = sqlx::query(sql)
            .bind(owner)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn stored_result_files(
        &self,
        result: &str,
    ) -> Result<BTreeMap<String, String>, CatalogError> {
        let rows = sqlx::query("SELECT role, file_name FROM result_files WHERE result_name = ?1")
            .bind(result)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("role"), row.get("file_name")))
            .collect())
    }
}

/// Keeps the records whose names were asked for, in request order.
fn select_named<T>(
    kind: &'static str,
    names: &[String],
    records: Vec<T>,
    name_of: impl Fn(&T) -> &str,
) -> Result<Vec<T>, CatalogError> {
    let mut by_name: HashMap<String, T> = records
        .into_iter()
        .map(|r| (name_of(&r).to_string(), r))
        .collect();
    names
        .iter()
        .map(|name| {
            by_name.remove(name).ok_or_else(|| CatalogError::NotFound {
                kind,
                name: name.clone(),
            })
        })
        .collect()
}

#[async_trait]
impl Catalog for SqliteCatalog {
    async fn all_samples(&self) -> Result<Vec<SampleRecord>, CatalogError> {
        self.load_samples().await
    }

    async fn samples(&self, names: &[String]) -> Result<Vec<SampleRecord>, CatalogError> {
        select_named("Sample", names, self.load_samples().await?, |s| s.name.as_str())
    }

    async fn all_groups(&self) -> Result<Vec<GroupRecord>, CatalogError> {
        self.load_groups().await
    }

    async fn groups(&self, names: &[String]) -> Result<Vec<GroupRecord>, CatalogError> {
        select_named("Group", names, self.load_groups().await?, |g| g.name.as_str())
    }

    async fn file_types(&self) -> Result<BTreeMap<String, String>, CatalogError> {
        let rows = sqlx::query("SELECT name, extension FROM file_types")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("name"), row.get("extension")))
            .collect())
    }

    async fn add_file_type(&self, file_type: &FileType) -> Result<Registration, CatalogError> {
        let inserted = sqlx::query(
            "INSERT INTO file_types (name, extension) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        )
        .bind(&file_type.name)
        .bind(&file_type.extension)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            return Ok(Registration::Created);
        }
        let existing = self.file_type_extension(&file_type.name).await?;
        match existing {
            Some(ext) if ext == file_type.extension => Ok(Registration::AlreadyPresent),
            Some(ext) => Err(CatalogError::Conflict {
                kind: "File type",
                name: file_type.name.clone(),
                detail: format!("extension '{}' vs '{}'", ext, file_type.extension),
            }),
            None => Err(CatalogError::NotFound {
                kind: "File type",
                name: file_type.name.clone(),
            }),
        }
    }

    async fn add_sample_type(&self, name: &str) -> Result<Registration, CatalogError> {
        let inserted =
            sqlx::query("INSERT INTO sample_types (name) VALUES (?1) ON CONFLICT(name) DO NOTHING")
                .bind(name)
                .execute(&self.pool)
                .await?
                .rows_affected();
        Ok(if inserted > 0 {
            Registration::Created
        } else {
            Registration::AlreadyPresent
        })
    }

    async fn add_result_schema(
        &self,
        name: &str,
        files: &BTreeMap<String, String>,
    ) -> Result<Registration, CatalogError> {
        let encoded = serde_json::to_string(files).unwrap_or_else(|_| "{}".to_string());
        let inserted = sqlx::query(
            "INSERT INTO result_schemas (name, files) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(&encoded)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted > 0 {
            return Ok(Registration::Created);
        }
        let row = sqlx::query("SELECT files FROM result_schemas WHERE name = ?1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        let stored: String = row.get("files");
        if stored == encoded {
            return Ok(Registration::AlreadyPresent);
        }
        // A newer pipeline version may declare a different file set.
        sqlx::query("UPDATE result_schemas SET files = ?2 WHERE name = ?1")
            .bind(name)
            .bind(&encoded)
            .execute(&self.pool)
            .await?;
        info!(result_type = %name, from = %stored, to = %encoded, "Updated result schema files");
        Ok(Registration::Updated)
    }

    async fn add_sample(
        &self,
        name: &str,
        sample_type: &str,
    ) -> Result<Registration, CatalogError> {
        let inserted = sqlx::query(
            "INSERT INTO samples (name, sample_type) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(sample_type)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(if inserted > 0 {
            Registration::Created
        } else {
            Registration::AlreadyPresent
        })
    }

    async fn add_group(
        &self,
        name: &str,
        members: &[String],
    ) -> Result<Registration, CatalogError> {
        for member in members {
            if !self.owner_exists(member, Level::Sample).await? {
                return Err(CatalogError::NotFound {
                    kind: "Sample",
                    name: member.clone(),
                });
            }
        }

        let mut tx = self.pool.begin().await?;
        let inserted =
            sqlx::query("INSERT INTO sample_groups (name) VALUES (?1) ON CONFLICT(name) DO NOTHING")
                .bind(name)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        let offset = sqlx::query("SELECT COUNT(*) AS n FROM group_members WHERE group_name = ?1")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?
            .get::<i64, _>("n");
        let mut added = 0i64;
        for member in members {
            added += sqlx::query(
                "INSERT INTO group_members (group_name, sample_name, position) VALUES (?1, ?2, ?3)
                 ON CONFLICT(group_name, sample_name) DO NOTHING",
            )
            .bind(name)
            .bind(member)
            .bind(offset + added)
            .execute(&mut *tx)
            .await?
            .rows_affected() as i64;
        }
        tx.commit().await?;

        Ok(if inserted > 0 || added > 0 {
            Registration::Created
        } else {
            Registration::AlreadyPresent
        })
    }

    async fn register_file(&self, file: &FileRecord) -> Result<Registration, CatalogError> {
        let mut conn = self.pool.acquire().await?;
        insert_file(&mut *conn, file).await
    }

    async fn register_result(&self, result: &NewResult) -> Result<Registration, CatalogError> {
        if !self.owner_exists(&result.owner, result.level).await? {
            return Err(CatalogError::NotFound {
                kind: match result.level {
                    Level::Sample => "Sample",
                    Level::Group => "Group",
                },
                name: result.owner.clone(),
            });
        }

        let name = result.name();
        let mut tx = self.pool.begin().await?;
        for file in result.files.values() {
            insert_file(&mut *tx, file).await?;
        }
        let inserted = sqlx::query(
            "INSERT INTO results (name, result_type, owner, level) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(&name)
        .bind(&result.result_type)
        .bind(&result.owner)
        .bind(result.level.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted > 0 {
            for (role, file) in &result.files {
                sqlx::query(
                    "INSERT INTO result_files (result_name, role, file_name) VALUES (?1, ?2, ?3)",
                )
                .bind(&name)
                .bind(role)
                .bind(&file.name)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            info!(result = %name, files = result.files.len(), "Registered result");
            return Ok(Registration::Created);
        }
        tx.rollback().await?;

        let wanted: BTreeMap<String, String> = result
            .files
            .iter()
            .map(|(role, f)| (role.clone(), f.name.clone()))
            .collect();
        let stored = self.stored_result_files(&name).await?;
        if stored == wanted {
            warn!(result = %name, "Result already registered");
            Ok(Registration::AlreadyPresent)
        } else {
            Err(CatalogError::Conflict {
                kind: "Result",
                name,
                detail: "registered with a different file set".to_string(),
            })
        }
    }
}

/// Inserts a file row on `conn`, comparing with any stored row of that name.
async fn insert_file(
    conn: &mut SqliteConnection,
    file: &FileRecord,
) -> Result<Registration, CatalogError> {
    let known_type = sqlx::query("SELECT 1 FROM file_types WHERE name = ?1")
        .bind(&file.file_type)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    if !known_type {
        return Err(CatalogError::UnknownFileType(file.file_type.clone()));
    }

    let path = file.path.to_string_lossy().into_owned();
    let inserted = sqlx::query(
        "INSERT INTO files (name, path, file_type) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO NOTHING",
    )
    .bind(&file.name)
    .bind(&path)
    .bind(&file.file_type)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if inserted > 0 {
        return Ok(Registration::Created);
    }

    let row = sqlx::query("SELECT path, file_type FROM files WHERE name = ?1")
        .bind(&file.name)
        .fetch_one(&mut *conn)
        .await?;
    let stored_path: String = row.get("path");
    let stored_type: String = row.get("file_type");
    if stored_path == path && stored_type == file.file_type {
        warn!(file = %file.name, "File already registered");
        Ok(Registration::AlreadyPresent)
    } else {
        Err(CatalogError::Conflict {
            kind: "File",
            name: file.name.clone(),
            detail: format!("stored as {stored_path} ({stored_type})"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_catalog(dir: &tempfile::TempDir) -> SqliteCatalog {
        let catalog = SqliteCatalog::open(&dir.path().join("catalog.db"))
            .await
            .unwrap();
        catalog
            .add_file_type(&FileType::new("fastq", "fastq.gz"))
            .await
            .unwrap();
        catalog.add_sample("s1", "metagenome").await.unwrap();
        catalog.add_sample("s2", "metagenome").await.unwrap();
        catalog
    }

    fn reads_result(owner: &str) -> NewResult {
        let mut files = BTreeMap::new();
        files.insert(
            "read1".to_string(),
            FileRecord::from_path(format!("/data/{owner}.r1.fastq.gz"), "fastq"),
        );
        NewResult {
            owner: owner.to_string(),
            level: Level::Sample,
            result_type: "raw_reads".to_string(),
            files,
        }
    }

    #[tokio::test]
    async fn test_register_result_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir).await;

        let result = reads_result("s1");
        assert_eq!(
            catalog.register_result(&result).await.unwrap(),
            Registration::Created
        );
        assert_eq!(
            catalog.register_result(&result).await.unwrap(),
            Registration::AlreadyPresent
        );

        let samples = catalog.samples(&["s1".to_string()]).await.unwrap();
        assert_eq!(samples.len(), 1);
        let results = &samples[0].results;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "s1::raw_reads");
        assert_eq!(
            results[0].file_paths().get("read1").map(String::as_str),
            Some("/data/s1.r1.fastq.gz")
        );
    }

    #[tokio::test]
    async fn test_conflicting_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir).await;

        let file = FileRecord::from_path("/a/x.fastq.gz", "fastq");
        catalog.register_file(&file).await.unwrap();
        let moved = FileRecord {
            path: PathBuf::from("/b/x.fastq.gz"),
            ..file
        };
        let err = catalog.register_file(&moved).await.unwrap_err();
        assert!(matches!(err, CatalogError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_unknown_owner_and_file_type() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir).await;

        let err = catalog.register_result(&reads_result("ghost")).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { .. }));

        let err = catalog
            .register_file(&FileRecord::from_path("/x.bam", "bam"))
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::UnknownFileType(t) if t == "bam"));
    }

    #[tokio::test]
    async fn test_groups_keep_member_order() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir).await;
        catalog.register_result(&reads_result("s2")).await.unwrap();
        catalog
            .add_group("g1", &["s2".to_string(), "s1".to_string()])
            .await
            .unwrap();

        let groups = catalog.all_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_names(), vec!["s2", "s1"]);
        assert_eq!(groups[0].members[0].results.len(), 1);

        let err = catalog.groups(&["nope".to_string()]).await.unwrap_err();
        assert!(matches!(err, CatalogError::NotFound { kind: "Group", .. }));
    }

    #[tokio::test]
    async fn test_type_registration() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir).await;

        assert_eq!(
            catalog
                .add_file_type(&FileType::new("fastq", "fastq.gz"))
                .await
                .unwrap(),
            Registration::AlreadyPresent
        );
        assert!(catalog
            .add_file_type(&FileType::new("fastq", "fq"))
            .await
            .is_err());
        assert_eq!(
            catalog.file_type_extension("fastq").await.unwrap().as_deref(),
            Some("fastq.gz")
        );

        let mut files = BTreeMap::new();
        files.insert("read1".to_string(), "fastq".to_string());
        assert_eq!(
            catalog.add_result_schema("reads", &files).await.unwrap(),
            Registration::Created
        );
        assert_eq!(
            catalog.add_result_schema("reads", &files).await.unwrap(),
            Registration::AlreadyPresent
        );
    }

    #[tokio::test]
    async fn test_result_schema_file_set_follows_latest_registration() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir).await;

        let mut files = BTreeMap::new();
        files.insert("read1".to_string(), "fastq".to_string());
        catalog.add_result_schema("reads", &files).await.unwrap();

        files.insert("read2".to_string(), "fastq".to_string());
        assert_eq!(
            catalog.add_result_schema("reads", &files).await.unwrap(),
            Registration::Updated
        );
        assert_eq!(
            catalog.add_result_schema("reads", &files).await.unwrap(),
            Registration::AlreadyPresent
        );

        let stored: String = sqlx::query("SELECT files FROM result_schemas WHERE name = 'reads'")
            .fetch_one(&catalog.pool)
            .await
            .unwrap()
            .get("files");
        assert_eq!(stored, serde_json::to_string(&files).unwrap());
    }

    #[tokio::test]
    async fn test_failed_result_registration_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = open_catalog(&dir).await;
        catalog
            .register_file(&FileRecord::from_path("/a/s1.r2.fastq.gz", "fastq"))
            .await
            .unwrap();

        let mut result = reads_result("s1");
        result.files.insert(
            "read2".to_string(),
            FileRecord::from_path("/b/s1.r2.fastq.gz", "fastq"),
        );
        let err = catalog.register_result(&result).await.unwrap_err();
        assert!(matches!(err, CatalogError::Conflict { kind: "File", .. }));

        let files: i64 = sqlx::query("SELECT COUNT(*) AS n FROM files")
            .fetch_one(&catalog.pool)
            .await
            .unwrap()
            .get("n");
        assert_eq!(files, 1);
        let samples = catalog.samples(&["s1".to_string()]).await.unwrap();
        assert!(samples[0].results.is_empty());

        assert_eq!(
            catalog.register_result(&reads_result("s1")).await.unwrap(),
            Registration::Created
        );
    }
}
