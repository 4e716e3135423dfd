use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::error::Result;

/// Username/password pair for a portal or a relay mailbox.
///
/// `Debug` redacts the password so sessions can be logged freely.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Artifact formats the portals are known to export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    Csv,
    Xlsx,
    Zip,
}

/// In-flight browser temp files. These must never satisfy a format-filtered
/// wait: the browser renames them only once the download completes.
pub const PARTIAL_DOWNLOAD_SUFFIXES: &[&str] = &["part", "crdownload", "tmp"];

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Csv => "csv",
            ArtifactFormat::Xlsx => "xlsx",
            ArtifactFormat::Zip => "zip",
        }
    }

    /// Case-insensitive extension match. Legacy `.xls` exports count as xlsx
    /// because the meal portal still serves them for its no-header variant.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        match self {
            ArtifactFormat::Csv => ext == "csv",
            ArtifactFormat::Xlsx => ext == "xlsx" || ext == "xls",
            ArtifactFormat::Zip => ext == "zip",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        [ArtifactFormat::Csv, ArtifactFormat::Xlsx, ArtifactFormat::Zip]
            .into_iter()
            .find(|f| f.matches(path))
    }
}

/// Returns `true` for browser partial-download temp files.
pub fn is_partial_download(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| {
            let ext = ext.to_ascii_lowercase();
            PARTIAL_DOWNLOAD_SUFFIXES.contains(&ext.as_str())
        })
}

/// A file materialized by a portal's export mechanism.
///
/// Produced by the file waiter once a download completes. `format` is
/// `None` when the extension is unrecognized, which only happens on
/// unfiltered waits.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub format: Option<ArtifactFormat>,
    pub modified: SystemTime,
}

impl Artifact {
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let format = ArtifactFormat::from_path(&path);
        let modified = std::fs::metadata(&path)?
            .modified()
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(Self {
            path,
            format,
            modified,
        })
    }
}

/// The logical description of one report to fetch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportRequest {
    /// Path/query fragment or fully-qualified address of the report view.
    pub report_url: String,
    /// Named customization parameters applied before the export is triggered.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// Stateful context (school year, district profile) the portal must show
    /// before the report reflects the intended data.
    #[serde(default)]
    pub context: Option<String>,
    /// Where to keep the downloaded artifact. `None` means a disposable temp
    /// directory that is removed once the result has been extracted.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl ReportRequest {
    pub fn new(report_url: impl Into<String>) -> Self {
        Self {
            report_url: report_url.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

/// Parsed tabular output: ordered named columns plus data rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    /// Builds a table, padding short rows with empty cells and truncating
    /// long ones so every row matches the column count. Portal exports are
    /// ragged often enough that this is the default, not an option.
    pub fn new(columns: Vec<String>, mut rows: Vec<Vec<String>>) -> Self {
        let width = columns.len();
        for row in &mut rows {
            if row.len() < width {
                row.resize(width, String::new());
            } else {
                row.truncate(width);
            }
        }
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// True when the table carries a header but no data rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

/// Outcome of asking a portal to (re)generate a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// The generate action was clicked; a fresh run has started.
    Started,
    /// The portal reports a run already in progress; no new trigger issued.
    AlreadyRunning,
}
