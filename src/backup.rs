use anyhow::{anyhow, Context};
use chrono::Utc;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/examrec.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT_V1: &str = "examrec-workspace-v1";

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

/// Tables a database must carry before it is accepted as an
/// examination-records workspace.
const CORE_TABLES: [&str; 5] = ["sessions", "students", "courses", "results", "metrics"];

/// Record counts written into the bundle manifest and reported back to the
/// caller, so an operator can tell an empty backup from a full one without
/// restoring it.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStats {
    pub sessions: i64,
    pub students: i64,
    pub courses: i64,
    pub results: i64,
}

pub fn workspace_stats(conn: &Connection) -> rusqlite::Result<WorkspaceStats> {
    let count = |sql: &str| conn.query_row(sql, [], |r| r.get::<_, i64>(0));
    Ok(WorkspaceStats {
        sessions: count("SELECT COUNT(*) FROM sessions")?,
        students: count("SELECT COUNT(*) FROM students")?,
        courses: count("SELECT COUNT(*) FROM courses")?,
        results: count("SELECT COUNT(*) FROM results")?,
    })
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub contents: WorkspaceStats,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub contents: WorkspaceStats,
}

fn write_json_entry<W: Write + Seek>(
    zip: &mut ZipWriter<W>,
    opts: FileOptions,
    name: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start bundle entry {}", name))?;
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("failed to serialize bundle entry {}", name))?;
    zip.write_all(text.as_bytes())
        .with_context(|| format!("failed to write bundle entry {}", name))?;
    Ok(())
}

pub fn export_workspace_bundle(
    conn: &Connection,
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let db_path = workspace_path.join("examrec.sqlite3");
    if !db_path.is_file() {
        return Err(anyhow!(
            "workspace database not found: {}",
            db_path.to_string_lossy()
        ));
    }
    let contents = workspace_stats(conn).context("failed to count workspace records")?;

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.to_string_lossy()))?;
    }
    let out_file = File::create(out_path).with_context(|| {
        format!(
            "failed to create output file {}",
            out_path.to_string_lossy()
        )
    })?;
    let mut zip = ZipWriter::new(out_file);
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

    write_json_entry(
        &mut zip,
        opts,
        MANIFEST_ENTRY,
        &json!({
            "format": BUNDLE_FORMAT_V1,
            "version": 1,
            "appVersion": env!("CARGO_PKG_VERSION"),
            "exportedAt": Utc::now().to_rfc3339(),
            "contents": contents,
        }),
    )?;

    zip.start_file(DB_ENTRY, opts)
        .context("failed to start database entry")?;
    let mut db_file = File::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.to_string_lossy()))?;
    std::io::copy(&mut db_file, &mut zip).context("failed to write database entry")?;

    write_json_entry(
        &mut zip,
        opts,
        META_WORKSPACE_ENTRY,
        &json!({
            "sourceWorkspace": workspace_path.to_string_lossy(),
        }),
    )?;

    zip.finish().context("failed to finalize zip bundle")?;

    Ok(ExportSummary {
        bundle_format: BUNDLE_FORMAT_V1.to_string(),
        entry_count: 3,
        contents,
    })
}

/// Restores a workspace database from a bundle, or from a bare sqlite file
/// produced by the old copy-the-file backup scheme. The incoming database is
/// staged and validated first; the live database is only replaced once the
/// backup has proven to hold an examination-records schema.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    std::fs::create_dir_all(workspace_path).with_context(|| {
        format!(
            "failed to create workspace {}",
            workspace_path.to_string_lossy()
        )
    })?;
    let dst = workspace_path.join("examrec.sqlite3");
    let staged = workspace_path.join("examrec.sqlite3.importing");
    if staged.exists() {
        let _ = std::fs::remove_file(&staged);
    }

    let detected = if is_zip_file(in_path)? {
        extract_bundle_db(in_path, &staged)?;
        BUNDLE_FORMAT_V1.to_string()
    } else {
        std::fs::copy(in_path, &staged).with_context(|| {
            format!(
                "failed to copy bare sqlite backup from {}",
                in_path.to_string_lossy()
            )
        })?;
        "bare-sqlite3".to_string()
    };

    let contents = match validate_workspace_db(&staged) {
        Ok(stats) => stats,
        Err(e) => {
            let _ = std::fs::remove_file(&staged);
            return Err(e);
        }
    };

    if dst.exists() {
        std::fs::remove_file(&dst).with_context(|| {
            format!(
                "failed to remove existing database {}",
                dst.to_string_lossy()
            )
        })?;
    }
    std::fs::rename(&staged, &dst).with_context(|| {
        format!(
            "failed to move validated database to {}",
            dst.to_string_lossy()
        )
    })?;

    Ok(ImportSummary {
        bundle_format_detected: detected,
        contents,
    })
}

fn extract_bundle_db(in_path: &Path, staged: &Path) -> anyhow::Result<()> {
    let in_file = File::open(in_path)
        .with_context(|| format!("failed to open bundle {}", in_path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(in_file).context("invalid zip archive")?;

    let mut manifest_text = String::new();
    archive
        .by_name(MANIFEST_ENTRY)
        .context("bundle missing manifest.json")?
        .read_to_string(&mut manifest_text)
        .context("failed to read manifest.json")?;
    let manifest: serde_json::Value =
        serde_json::from_str(&manifest_text).context("manifest.json is invalid JSON")?;
    let format = manifest
        .get("format")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if format != BUNDLE_FORMAT_V1 {
        return Err(anyhow!("unsupported bundle format: {}", format));
    }

    let mut db_out = File::create(staged).with_context(|| {
        format!(
            "failed to create staging database {}",
            staged.to_string_lossy()
        )
    })?;
    {
        let mut db_entry = archive
            .by_name(DB_ENTRY)
            .context("bundle missing db/examrec.sqlite3")?;
        std::io::copy(&mut db_entry, &mut db_out).context("failed to extract database entry")?;
    }
    db_out
        .flush()
        .context("failed to flush extracted database")?;
    Ok(())
}

/// Opens the staged file read-only and checks that it actually is an
/// examination-records database.
fn validate_workspace_db(path: &Path) -> anyhow::Result<WorkspaceStats> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    for table in CORE_TABLES {
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?",
                [table],
                |r| r.get(0),
            )
            .optional()
            .context("backup is not a readable SQLite database")?;
        if found.is_none() {
            return Err(anyhow!(
                "backup is not an examination-records database (missing table {})",
                table
            ));
        }
    }
    workspace_stats(&conn).context("failed to count records in backup")
}

fn is_zip_file(path: &Path) -> anyhow::Result<bool> {
    let mut f = File::open(path)
        .with_context(|| format!("failed to open input file {}", path.to_string_lossy()))?;
    let mut sig = [0u8; 4];
    let read = f.read(&mut sig).context("failed to read file signature")?;
    Ok(read == 4 && sig == ZIP_MAGIC)
}
