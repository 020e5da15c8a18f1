//! Task descriptors: the queued unit of work linking a candidate to a build phase.
//!
//! A task file is a small JSON object dropped into the waiting queue by a
//! producer:
//!
//! ```json
//! { "candidate": "/work/search/outputs/s1/cand1", "phase": "classifier_definition" }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, Result};

/// Which kind of evaluation a task requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildPhase {
    /// The candidate defines feature extraction; a fixed classifier evaluates it.
    FeatureExtraction,
    /// The candidate defines a classifier trained and tested on prepared instances.
    ClassifierDefinition,
}

impl BuildPhase {
    pub const ALL: [BuildPhase; 2] = [BuildPhase::FeatureExtraction, BuildPhase::ClassifierDefinition];

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::FeatureExtraction => "feature_extraction",
            BuildPhase::ClassifierDefinition => "classifier_definition",
        }
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildPhase {
    type Err = BenchError;

    /// Accepts the snake_case names plus the upper-case tags older producers emit.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "feature_extraction" | "FEATURE_EXTRACTION" | "FeatureExtraction" => {
                Ok(BuildPhase::FeatureExtraction)
            }
            "classifier_definition" | "CLASSIFIER_DEF" | "ClassifierDefinition" => {
                Ok(BuildPhase::ClassifierDefinition)
            }
            other => Err(BenchError::UnknownPhase(other.to_string())),
        }
    }
}

/// On-disk shape of a task file. The phase stays a string so an unknown tag
/// surfaces as [`BenchError::UnknownPhase`] rather than a generic JSON error.
#[derive(Debug, Serialize, Deserialize)]
struct TaskFile {
    candidate: PathBuf,
    phase: String,
}

/// A parsed task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescriptor {
    /// Identifier derived from the queue filename (its stem).
    pub id: String,
    /// Full queue filename; this is the dedup key.
    pub file_name: String,
    /// Candidate folder the task refers to.
    pub candidate: PathBuf,
    /// Build phase to run.
    pub phase: BuildPhase,
    /// File the descriptor was read from.
    pub source: PathBuf,
}

impl TaskDescriptor {
    /// Parse a task file's contents. `path` is the file the contents came from;
    /// relative candidate paths are resolved against its directory.
    pub fn parse(path: &Path, content: &str) -> Result<Self> {
        let base = path.parent().unwrap_or(Path::new(""));
        Self::parse_relative_to(path, base, content)
    }

    /// Like [`TaskDescriptor::parse`], but relative candidate paths resolve
    /// against `base` instead of `path`'s directory. Used once a task file has
    /// been moved away from where its producer wrote it.
    pub fn parse_relative_to(path: &Path, base: &Path, content: &str) -> Result<Self> {
        let invalid = |reason: String| BenchError::Descriptor {
            path: path.to_path_buf(),
            reason,
        };

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| invalid("file name is not valid UTF-8".to_string()))?
            .to_string();
        let id = path
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or(&file_name)
            .to_string();

        let raw: TaskFile =
            serde_json::from_str(content).map_err(|e| invalid(format!("invalid JSON: {e}")))?;

        if raw.candidate.as_os_str().is_empty() {
            return Err(invalid("empty candidate path".to_string()));
        }
        let phase = raw.phase.parse::<BuildPhase>()?;

        let candidate = if raw.candidate.is_absolute() {
            raw.candidate
        } else {
            base.join(&raw.candidate)
        };

        Ok(Self {
            id,
            file_name,
            candidate,
            phase,
            source: path.to_path_buf(),
        })
    }

    /// Read and parse a task file from disk.
    pub fn read_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(path, &content)
    }

    /// Render the file contents a producer writes for a new task.
    pub fn render(candidate: &Path, phase: BuildPhase) -> String {
        let raw = TaskFile {
            candidate: candidate.to_path_buf(),
            phase: phase.as_str().to_string(),
        };
        // Serializing a path-and-string struct cannot fail.
        serde_json::to_string_pretty(&raw).unwrap_or_default()
    }

    /// Last path component of the candidate folder, used to name the sandbox.
    pub fn candidate_name(&self) -> String {
        self.candidate
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone())
    }
}
