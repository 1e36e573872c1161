//! Kinst persistence: SQLite history of installed manifests per component.
//! Keep code tiny and predictable.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Records kept per component; older ones are rotated out on insert.
pub const KEEP_PER_COMPONENT: usize = 3;

/// One successfully installed manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledRecord {
    /// Component identity, e.g. `Serving/knative-serving/knative-serving`.
    pub component: String,
    pub version: String,
    /// Manifest sources the install was built from.
    pub manifests: Vec<String>,
    pub ts: i64,
    /// Rendered manifest YAML, compressed when the `zstd` feature is on.
    pub yaml_zstd: Vec<u8>,
}

impl InstalledRecord {
    pub fn yaml(&self) -> String { maybe_decompress(&self.yaml_zstd) }
}

pub trait ManifestStore: Send + Sync {
    fn put_installed(&self, rec: InstalledRecord) -> Result<()>;
    /// Newest first.
    fn get_installed(&self, component: &str, limit: Option<usize>) -> Result<Vec<InstalledRecord>>;
    /// Drop every record of `component`; returns how many were removed.
    fn forget(&self, component: &str) -> Result<usize>;

    fn latest_installed(&self, component: &str) -> Result<Option<InstalledRecord>> {
        Ok(self.get_installed(component, Some(1))?.into_iter().next())
    }
}

/// SQLite-backed store. Simple, synchronous; reconcile passes are not latency sensitive here.
pub struct SqliteStore {
    db: std::sync::Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("KINST_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS installed (
                component TEXT NOT NULL,
                version   TEXT NOT NULL,
                manifests TEXT NOT NULL,
                ts        INTEGER NOT NULL,
                yaml      BLOB NOT NULL
            )",
            [],
        ).context("creating installed table")?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_installed_component_ts ON installed(component, ts DESC)",
            [],
        ).ok();
        let me = Self { db: std::sync::Mutex::new(db) };
        histogram!("kinst_persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path = %path, "installed store opened");
        Ok(me)
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
    }
}

impl ManifestStore for SqliteStore {
    fn put_installed(&self, rec: InstalledRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO installed(component, version, manifests, ts, yaml) VALUES (?1, ?2, ?3, ?4, ?5)",
            (
                &rec.component,
                &rec.version,
                rec.manifests.join("\n"),
                rec.ts,
                &rec.yaml_zstd,
            ),
        )?;
        // Keep the newest records per component (delete older rows by rowid)
        tx.execute(
            "DELETE FROM installed
             WHERE component = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM installed WHERE component = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&rec.component, KEEP_PER_COMPONENT as i64),
        )?;
        tx.commit()?;
        histogram!("kinst_persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("kinst_persist_put_total", 1u64);
        Ok(())
    }

    fn get_installed(&self, component: &str, limit: Option<usize>) -> Result<Vec<InstalledRecord>> {
        let started = std::time::Instant::now();
        let cap = limit.unwrap_or(KEEP_PER_COMPONENT);
        let db = self.conn()?;
        let mut stmt = db.prepare(
            "SELECT version, manifests, ts, yaml FROM installed WHERE component = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2",
        )?;
        let mut rows = stmt.query((component, cap as i64))?;
        let mut out: Vec<InstalledRecord> = Vec::new();
        while let Some(row) = rows.next()? {
            let version: String = row.get(0)?;
            let manifests: String = row.get(1)?;
            let ts: i64 = row.get(2)?;
            let yaml: Vec<u8> = row.get(3)?;
            out.push(InstalledRecord {
                component: component.to_string(),
                version,
                manifests: manifests.lines().filter(|l| !l.is_empty()).map(str::to_string).collect(),
                ts,
                yaml_zstd: yaml,
            });
        }
        histogram!("kinst_persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn forget(&self, component: &str) -> Result<usize> {
        let db = self.conn()?;
        let n = db.execute("DELETE FROM installed WHERE component = ?1", [component])?;
        debug!(component = %component, removed = n, "installed history forgotten");
        Ok(n)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".kinst");
        let _ = std::fs::create_dir_all(&p);
        p.push("kinst.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "kinst.db".to_string()
}

pub fn now_ts() -> i64 {
    // seconds since epoch
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(yaml: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("KINST_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(yaml.as_bytes(), lvl).unwrap_or_else(|_| yaml.as_bytes().to_vec());
    }
    #[cfg(not(feature = "zstd"))]
    yaml.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}
