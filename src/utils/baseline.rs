use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};

use crate::errors::StoreError;
use crate::models::{CourseScore, GradeSet};

const STAMP_PREFIX: &str = "# generated_at: ";

/// Last notified grade set, kept in a small CSV file next to the process.
///
/// Layout: a `# generated_at: <rfc3339>` comment line, a `course,score,credit` header, then one
/// quoted row per course.
pub struct BaselineStore {
    path: PathBuf,
}

impl BaselineStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing or unreadable file is an empty baseline.
    pub fn load(&self) -> GradeSet {
        if !self.path.exists() {
            info!("No baseline at {}, starting empty", self.path.display());
            return GradeSet::new();
        }
        match self.read() {
            Ok(grades) => {
                match self.generated_at() {
                    Some(at) => info!("Loaded {} courses from {} (written {at})", grades.len(), self.path.display()),
                    None => info!("Loaded {} courses from {}", grades.len(), self.path.display()),
                }
                grades
            }
            Err(e) => {
                warn!("Ignoring unreadable baseline {}: {}", self.path.display(), e);
                GradeSet::new()
            }
        }
    }

    /// When the file was last written, if it carries a stamp.
    pub fn generated_at(&self) -> Option<DateTime<Utc>> {
        let file = fs::File::open(&self.path).ok()?;
        let mut first = String::new();
        BufReader::new(file).read_line(&mut first).ok()?;
        let stamp = first.trim_end().strip_prefix(STAMP_PREFIX)?;
        DateTime::parse_from_rfc3339(stamp).ok().map(|t| t.with_timezone(&Utc))
    }

    fn read(&self) -> Result<GradeSet, StoreError> {
        let mut reader = csv::ReaderBuilder::new()
            .comment(Some(b'#'))
            .from_path(&self.path)?;
        let mut grades = GradeSet::new();
        for row in reader.deserialize::<CourseScore>() {
            grades.push(row?);
        }
        Ok(grades)
    }

    /// Writes to a sibling temp file and renames it over the old baseline, so a crash leaves
    /// either the previous file or the new one.
    pub fn save(&self, grades: &GradeSet) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let tmp = self.tmp_path();
        let mut file = fs::File::create(&tmp)?;
        writeln!(file, "{STAMP_PREFIX}{}", Utc::now().to_rfc3339())?;

        // Quoting every field keeps a course named `#...` from reading back as a comment.
        let mut writer = csv::WriterBuilder::new()
            .quote_style(csv::QuoteStyle::Always)
            .from_writer(file);
        if grades.is_empty() {
            writer.write_record(["course", "score", "credit"])?;
        }
        for grade in grades {
            writer.serialize(grade)?;
        }
        let file = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
