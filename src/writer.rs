//! Migration Writer
//!
//! Serializes a plan into the next numbered `.sql` file of a directory.
//! Numbering is max + 1 over the files already there; a concurrent writer
//! that picks the same number is detected after the fact and reported,
//! never silently renumbered.

use crate::engine::MigrationPlan;
use crate::error::WriteError;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// A migration file that landed on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WrittenMigration {
    pub path: PathBuf,
    pub number: u32,
    pub prefix: Option<String>,
}

/// How a plan is written out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteOptions {
    /// Prepended to every file name, e.g. `app_`
    pub prefix: Option<String>,
    /// Let destructive operations through the safety gate
    pub allow_destructive: bool,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> WriteError + '_ {
    move |source| WriteError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Writes plans as numbered migration files
pub struct MigrationWriter {
    dir: PathBuf,
    prefix: String,
}

impl MigrationWriter {
    pub fn new(dir: impl Into<PathBuf>, prefix: Option<&str>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.unwrap_or_default().to_string(),
        }
    }

    /// Number of a `{prefix}{NNNN...}_{anything}.sql` file name; at least four digits
    fn migration_number(&self, name: &str) -> Option<u32> {
        let rest = name.strip_prefix(self.prefix.as_str())?;
        let digits = rest.len() - rest.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits < 4 {
            return None;
        }
        let (number, tail) = rest.split_at(digits);
        let tail = tail.strip_prefix('_')?;
        if !tail.ends_with(".sql") {
            return None;
        }
        number.parse().ok()
    }

    /// Migration numbers already present in the directory
    fn existing_numbers(&self) -> Result<Vec<u32>, WriteError> {
        let entries = fs::read_dir(&self.dir).map_err(io_error(&self.dir))?;
        let mut numbers = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_error(&self.dir))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(number) = self.migration_number(name) {
                numbers.push(number);
            }
        }
        Ok(numbers)
    }

    /// The number the next migration will get
    pub fn next_number(&self) -> Result<u32, WriteError> {
        Ok(self.existing_numbers()?.into_iter().max().map_or(1, |n| n + 1))
    }

    pub fn file_name(&self, number: u32, generated_at: DateTime<Utc>) -> String {
        format!("{}{:04}_{}.sql", self.prefix, number, generated_at.format("%Y%m%d%H%M%S"))
    }

    /// File contents: header block, then one statement per operation
    pub fn render(plan: &MigrationPlan, generated_at: DateTime<Utc>) -> String {
        let mut out = String::new();
        out.push_str("-- pgreconcile migration\n");
        out.push_str(&format!("-- schema_hash: {}\n", plan.schema_hash));
        out.push_str(&format!(
            "-- generated_at: {}\n",
            generated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        out.push_str(&format!("-- operations: {}\n", plan.operations.len()));
        for op in &plan.operations {
            out.push('\n');
            if op.destructive {
                out.push_str(&format!(
                    "-- destructive: {}\n",
                    op.destructive_reason().unwrap_or("destructive change")
                ));
            }
            out.push_str(&op.sql);
            out.push_str(";\n");
        }
        out
    }

    pub fn write(&self, plan: &MigrationPlan) -> Result<WrittenMigration, WriteError> {
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let number = self.next_number()?;
        let generated_at = Utc::now();
        let path = self.dir.join(self.file_name(number, generated_at));
        let contents = Self::render(plan, generated_at);

        // Stage under a private name, then link into place without clobbering
        let staging = self.dir.join(format!(".{}.sql.tmp", Uuid::new_v4()));
        let staged = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&staging)
            .and_then(|mut file| {
                file.write_all(contents.as_bytes())?;
                file.sync_all()
            });
        if let Err(source) = staged {
            let _ = fs::remove_file(&staging);
            return Err(WriteError::Io { path: staging, source });
        }
        let linked = fs::hard_link(&staging, &path);
        let _ = fs::remove_file(&staging);
        match linked {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                warn!("⚠️  {} already exists", path.display());
                return Err(WriteError::NumberCollision {
                    number,
                    dir: self.dir.clone(),
                });
            }
            Err(source) => return Err(WriteError::Io { path, source }),
        }

        let claims = self.existing_numbers()?.into_iter().filter(|n| *n == number).count();
        if claims > 1 {
            warn!("⚠️  Migration number {:04} was claimed twice, removing {}", number, path.display());
            let _ = fs::remove_file(&path);
            return Err(WriteError::NumberCollision {
                number,
                dir: self.dir.clone(),
            });
        }

        info!("📝 Wrote migration {} ({} operations)", path.display(), plan.operations.len());
        Ok(WrittenMigration {
            path,
            number,
            prefix: (!self.prefix.is_empty()).then(|| self.prefix.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::plan_schema;
    use crate::parser::parse_schema;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn drop_email_plan() -> MigrationPlan {
        let live = parse_schema("CREATE TABLE users (id int, email text);", "public").unwrap();
        plan_schema("CREATE TABLE users (id int, nickname text);", &live, &["public".to_string()]).unwrap()
    }

    #[test]
    fn test_numbering_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MigrationWriter::new(dir.path(), None);
        assert_eq!(writer.next_number().unwrap(), 1);
    }

    #[test]
    fn test_numbering_follows_highest_matching_file() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["0001_a.sql", "0007_b.sql", "app_0042_c.sql", "0009_notes.txt", "12_short.sql"] {
            fs::write(dir.path().join(name), "").unwrap();
        }
        assert_eq!(MigrationWriter::new(dir.path(), None).next_number().unwrap(), 8);
        assert_eq!(MigrationWriter::new(dir.path(), Some("app_")).next_number().unwrap(), 43);
        assert_eq!(MigrationWriter::new(dir.path(), Some("a.p")).next_number().unwrap(), 1);
    }

    #[test]
    fn test_numbering_continues_past_four_digits() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("9999_last.sql"), "").unwrap();
        let writer = MigrationWriter::new(dir.path(), None);
        assert_eq!(writer.next_number().unwrap(), 10000);

        let written = writer.write(&drop_email_plan()).unwrap();
        assert_eq!(written.number, 10000);
        assert!(written.path.file_name().unwrap().to_str().unwrap().starts_with("10000_"));
        assert_eq!(writer.next_number().unwrap(), 10001);
    }

    #[test]
    fn test_migration_number_shapes() {
        let writer = MigrationWriter::new("unused", Some("app_"));
        assert_eq!(writer.migration_number("app_0042_c.sql"), Some(42));
        assert_eq!(writer.migration_number("app_12345_c.sql"), Some(12345));
        assert_eq!(writer.migration_number("app_0042_.sql"), Some(42));
        assert_eq!(writer.migration_number("app_042_c.sql"), None);
        assert_eq!(writer.migration_number("app_0042c.sql"), None);
        assert_eq!(writer.migration_number("app_0042_c.sql.bak"), None);
        assert_eq!(writer.migration_number("0042_c.sql"), None);
    }

    #[test]
    fn test_render_marks_destructive_statements() {
        let plan = drop_email_plan();
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let text = MigrationWriter::render(&plan, at);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "-- pgreconcile migration");
        assert_eq!(lines[1], format!("-- schema_hash: {}", plan.schema_hash));
        assert_eq!(lines[2], "-- generated_at: 2024-05-01T12:30:00Z");
        assert_eq!(lines[3], "-- operations: 2");
        assert!(text.contains(
            "-- destructive: Dropping column public.users.email deletes its data\nALTER TABLE \"public\".\"users\" DROP COLUMN \"email\";\n"
        ));
        assert!(text.contains("\nALTER TABLE \"public\".\"users\" ADD COLUMN \"nickname\" text;\n"));
    }

    #[test]
    fn test_write_creates_numbered_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("0003_old.sql"), "").unwrap();
        let plan = drop_email_plan();

        let written = MigrationWriter::new(dir.path(), None).write(&plan).unwrap();
        assert_eq!(written.number, 4);
        let name = written.path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("0004_"));
        assert!(name.ends_with(".sql"));
        assert_eq!(name.len(), "0004_".len() + 14 + ".sql".len());

        let contents = fs::read_to_string(&written.path).unwrap();
        assert!(contents.starts_with("-- pgreconcile migration\n"));
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_write_into_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("migrations").join("db");
        let written = MigrationWriter::new(&nested, Some("core_")).write(&drop_email_plan()).unwrap();
        assert_eq!(written.number, 1);
        assert_eq!(written.prefix.as_deref(), Some("core_"));
        assert!(written.path.starts_with(&nested));
    }

    #[test]
    fn test_unreadable_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        fs::write(&file, "").unwrap();
        let err = MigrationWriter::new(&file, None).write(&drop_email_plan()).unwrap_err();
        assert!(matches!(err, WriteError::Io { .. }));
    }
}
