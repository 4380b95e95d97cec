//! # Configuration
//!
//! TOML configuration for the server and the fixture gradebook.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8080
//!
//! [fetch]
//! latency_ms = 150
//! fail_keys = ["classes:9"]
//! max_age_ms = 30000
//!
//! [bus]
//! capacity = 64
//!
//! [[teachers]]
//! id = "1"
//! name = "Ada"
//! ```
//!
//! When no fixture tables are present the built-in demo gradebook is used.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use stagehand_core::{ChainOptions, DEFAULT_BUS_CAPACITY, StageOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "stagehand.toml";

// =============================================================================
// SECTIONS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl ServerConfig {
    /// `host:port` for binding.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Behavior of the simulated collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Delay added to every fetch.
    pub latency_ms: u64,
    /// `"<stage>:<key>"` pairs whose fetch fails with a network failure.
    pub fail_keys: Vec<String>,
    /// Serve cache entries younger than this without fetching.
    pub max_age_ms: Option<u64>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            latency_ms: 150,
            fail_keys: Vec::new(),
            max_age_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_BUS_CAPACITY,
        }
    }
}

// =============================================================================
// FIXTURE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeacherRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRecord {
    pub id: u64,
    pub name: String,
    pub teacher_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentRecord {
    pub id: u64,
    pub name: String,
    pub class_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: u64,
    pub title: String,
    pub class_id: u64,
}

/// A student's hand-in. `score` stays empty until graded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub assignment_id: u64,
    pub student_id: u64,
    #[serde(default)]
    pub score: Option<u32>,
}

/// The gradebook dataset, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fixture {
    #[serde(default)]
    pub teachers: Vec<TeacherRecord>,
    #[serde(default)]
    pub classes: Vec<ClassRecord>,
    #[serde(default)]
    pub students: Vec<StudentRecord>,
    #[serde(default)]
    pub assignments: Vec<AssignmentRecord>,
    #[serde(default)]
    pub submissions: Vec<SubmissionRecord>,
}

impl Fixture {
    /// Check if no table has rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.teachers.is_empty()
            && self.classes.is_empty()
            && self.students.is_empty()
            && self.assignments.is_empty()
            && self.submissions.is_empty()
    }

    /// Two teachers, three classes. Student 100 completed 4 of the 5 Algebra
    /// assignments (80%), student 101 completed 2 (40%).
    #[must_use]
    pub fn demo() -> Self {
        let teacher = |id: &str, name: &str| TeacherRecord {
            id: id.to_string(),
            name: name.to_string(),
        };
        let class = |id: u64, name: &str, teacher_id: &str| ClassRecord {
            id,
            name: name.to_string(),
            teacher_id: teacher_id.to_string(),
        };
        let student = |id: u64, name: &str, class_id: u64| StudentRecord {
            id,
            name: name.to_string(),
            class_id,
        };
        let assignment = |id: u64, title: &str, class_id: u64| AssignmentRecord {
            id,
            title: title.to_string(),
            class_id,
        };
        let submission = |assignment_id: u64, student_id: u64, score: Option<u32>| {
            SubmissionRecord {
                assignment_id,
                student_id,
                score,
            }
        };

        Self {
            teachers: vec![teacher("1", "Ada"), teacher("2", "Grace")],
            classes: vec![
                class(10, "Algebra A", "1"),
                class(11, "Biology B", "1"),
                class(12, "Chemistry C", "2"),
            ],
            students: vec![
                student(100, "Alice", 10),
                student(101, "Bob", 10),
                student(110, "Carol", 11),
                student(120, "Dave", 12),
            ],
            assignments: vec![
                assignment(1000, "Linear equations", 10),
                assignment(1001, "Quadratics", 10),
                assignment(1002, "Inequalities", 10),
                assignment(1003, "Functions", 10),
                assignment(1004, "Proofs", 10),
                assignment(1100, "Cells", 11),
                assignment(1200, "Titration", 12),
            ],
            submissions: vec![
                submission(1000, 100, Some(90)),
                submission(1001, 100, Some(85)),
                submission(1002, 100, Some(70)),
                submission(1003, 100, None),
                submission(1000, 101, Some(60)),
                submission(1001, 101, Some(75)),
                submission(1100, 110, Some(95)),
            ],
        }
    }
}

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub fetch: FetchConfig,
    pub bus: BusConfig,
    #[serde(flatten)]
    pub fixture: Fixture,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            fetch: FetchConfig::default(),
            bus: BusConfig::default(),
            fixture: Fixture::demo(),
        }
    }
}

impl Config {
    /// Parse a TOML document.
    pub fn from_toml(text: &str, origin: &Path) -> Result<Self, AppError> {
        let mut config: Config = toml::from_str(text).map_err(|e| AppError::ConfigParse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })?;
        if config.fixture.is_empty() {
            config.fixture = Fixture::demo();
        }
        Ok(config)
    }

    /// Load configuration.
    ///
    /// An explicit path must exist. Without one, `stagehand.toml` is read if
    /// present, otherwise defaults apply.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        if !required && !path.exists() {
            tracing::info!("No {} found, using built-in defaults", DEFAULT_CONFIG_PATH);
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|e| AppError::ConfigRead {
            path: path.clone(),
            message: e.to_string(),
        })?;
        let config = Self::from_toml(&text, &path)?;
        tracing::info!(path = %path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Chain options for every screen.
    #[must_use]
    pub fn chain_options(&self) -> ChainOptions {
        ChainOptions {
            bus_capacity: self.bus.capacity,
        }
    }

    /// Stage options for every stage.
    #[must_use]
    pub fn stage_options(&self) -> StageOptions {
        StageOptions {
            max_age: self.fetch.max_age_ms.map(Duration::from_millis),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
