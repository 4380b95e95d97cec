//! # Gradebook
//!
//! The fixture-backed stand-in for the remote school API. Each method is the
//! fetcher of one stage; every call waits the configured latency and fails
//! with `NetworkFailure` when its `"<stage>:<key>"` is listed in
//! `fetch.fail_keys`.

use crate::config::{Config, FetchConfig, Fixture, StudentRecord};
use serde::{Deserialize, Serialize};
use stagehand_core::{FetchError, StageId};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

// =============================================================================
// STAGE IDS
// =============================================================================

pub const CLASSES: StageId = StageId::new("classes");
pub const STUDENTS: StageId = StageId::new("students");
pub const STATISTICS: StageId = StageId::new("statistics");
pub const PERSONAL_ASSIGNMENTS: StageId = StageId::new("personal-assignments");
pub const ASSIGNMENT_STATISTICS: StageId = StageId::new("personal-assignment-stats");
pub const PROFILE: StageId = StageId::new("profile");

// =============================================================================
// RESOURCES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSummary {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentSummary {
    pub id: u64,
    pub name: String,
}

/// Completion of one student across the assignments of their class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentStatistics {
    pub assigned: u32,
    pub submitted: u32,
    /// Integer percentage of assignments submitted.
    pub completion_rate: u32,
}

pub type StatisticsMap = BTreeMap<u64, StudentStatistics>;

/// One student's copy of an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonalAssignment {
    pub assignment_id: u64,
    pub student_id: u64,
    pub student_name: String,
    pub submitted: bool,
    pub score: Option<u32>,
}

/// Key of the assignment statistics stage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssignmentStatsKey {
    pub assignment_id: u64,
    pub student_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentStatistics {
    pub assignment_id: u64,
    pub students: u32,
    pub submitted: u32,
    pub graded: u32,
    /// Integer mean of graded scores, if any were graded.
    pub average_score: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub id: u64,
    pub name: String,
    pub class_id: u64,
    pub class_name: String,
    pub teacher_id: String,
    pub completion_rate: u32,
}

// =============================================================================
// GRADEBOOK
// =============================================================================

#[derive(Debug, Clone)]
pub struct Gradebook {
    fixture: Fixture,
    latency: Duration,
    fail_keys: BTreeSet<String>,
}

impl Gradebook {
    #[must_use]
    pub fn new(fixture: Fixture, fetch: &FetchConfig) -> Self {
        Self {
            fixture,
            latency: Duration::from_millis(fetch.latency_ms),
            fail_keys: fetch.fail_keys.iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.fixture.clone(), &config.fetch)
    }

    #[must_use]
    pub fn fixture(&self) -> &Fixture {
        &self.fixture
    }

    async fn respond(&self, stage: StageId, key: &str) -> Result<(), FetchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail_keys.contains(&format!("{stage}:{key}")) {
            tracing::debug!(%stage, key, "injected failure");
            return Err(FetchError::NetworkFailure(format!(
                "{stage} {key} unreachable"
            )));
        }
        Ok(())
    }

    /// Classes taught by `teacher_id`.
    pub async fn classes(&self, teacher_id: String) -> Result<Vec<ClassSummary>, FetchError> {
        self.respond(CLASSES, &teacher_id).await?;
        if !self.fixture.teachers.iter().any(|t| t.id == teacher_id) {
            return Err(FetchError::NotFound(format!("teacher {teacher_id}")));
        }
        Ok(self
            .fixture
            .classes
            .iter()
            .filter(|c| c.teacher_id == teacher_id)
            .map(|c| ClassSummary {
                id: c.id,
                name: c.name.clone(),
            })
            .collect())
    }

    /// Students enrolled in `class_id`.
    pub async fn students(&self, class_id: u64) -> Result<Vec<StudentSummary>, FetchError> {
        self.respond(STUDENTS, &class_id.to_string()).await?;
        if !self.fixture.classes.iter().any(|c| c.id == class_id) {
            return Err(FetchError::NotFound(format!("class {class_id}")));
        }
        Ok(self
            .fixture
            .students
            .iter()
            .filter(|s| s.class_id == class_id)
            .map(|s| StudentSummary {
                id: s.id,
                name: s.name.clone(),
            })
            .collect())
    }

    /// Completion statistics for each of `student_ids`.
    pub async fn statistics(&self, student_ids: Vec<u64>) -> Result<StatisticsMap, FetchError> {
        let key = join_ids(&student_ids);
        self.respond(STATISTICS, &key).await?;
        student_ids
            .iter()
            .map(|id| {
                let student = self.student(*id)?;
                Ok((*id, self.completion(student)))
            })
            .collect()
    }

    /// Every student's copy of `assignment_id`, in enrollment order.
    pub async fn personal_assignments(
        &self,
        assignment_id: u64,
    ) -> Result<Vec<PersonalAssignment>, FetchError> {
        self.respond(PERSONAL_ASSIGNMENTS, &assignment_id.to_string())
            .await?;
        let assignment = self
            .fixture
            .assignments
            .iter()
            .find(|a| a.id == assignment_id)
            .ok_or_else(|| FetchError::NotFound(format!("assignment {assignment_id}")))?;

        Ok(self
            .fixture
            .students
            .iter()
            .filter(|s| s.class_id == assignment.class_id)
            .map(|s| {
                let submission = self
                    .fixture
                    .submissions
                    .iter()
                    .find(|sub| sub.assignment_id == assignment_id && sub.student_id == s.id);
                PersonalAssignment {
                    assignment_id,
                    student_id: s.id,
                    student_name: s.name.clone(),
                    submitted: submission.is_some(),
                    score: submission.and_then(|sub| sub.score),
                }
            })
            .collect())
    }

    /// Submission summary of one assignment over the given students.
    pub async fn assignment_statistics(
        &self,
        key: AssignmentStatsKey,
    ) -> Result<AssignmentStatistics, FetchError> {
        self.respond(ASSIGNMENT_STATISTICS, &key.assignment_id.to_string())
            .await?;
        let submissions: Vec<_> = self
            .fixture
            .submissions
            .iter()
            .filter(|s| s.assignment_id == key.assignment_id && key.student_ids.contains(&s.student_id))
            .collect();
        let scores: Vec<u32> = submissions.iter().filter_map(|s| s.score).collect();
        let graded = count(scores.len());
        let total: u64 = scores.iter().map(|score| u64::from(*score)).sum();
        let average_score = (graded > 0)
            .then(|| u32::try_from(total / u64::from(graded)).unwrap_or(u32::MAX));

        Ok(AssignmentStatistics {
            assignment_id: key.assignment_id,
            students: count(key.student_ids.len()),
            submitted: count(submissions.len()),
            graded,
            average_score,
        })
    }

    /// Profile of one student.
    pub async fn profile(&self, student_id: u64) -> Result<StudentProfile, FetchError> {
        self.respond(PROFILE, &student_id.to_string()).await?;
        let student = self.student(student_id)?;
        let class = self
            .fixture
            .classes
            .iter()
            .find(|c| c.id == student.class_id)
            .ok_or_else(|| FetchError::NotFound(format!("class {}", student.class_id)))?;

        Ok(StudentProfile {
            id: student.id,
            name: student.name.clone(),
            class_id: class.id,
            class_name: class.name.clone(),
            teacher_id: class.teacher_id.clone(),
            completion_rate: self.completion(student).completion_rate,
        })
    }

    fn student(&self, student_id: u64) -> Result<&StudentRecord, FetchError> {
        self.fixture
            .students
            .iter()
            .find(|s| s.id == student_id)
            .ok_or_else(|| FetchError::NotFound(format!("student {student_id}")))
    }

    fn completion(&self, student: &StudentRecord) -> StudentStatistics {
        let assigned: Vec<u64> = self
            .fixture
            .assignments
            .iter()
            .filter(|a| a.class_id == student.class_id)
            .map(|a| a.id)
            .collect();
        let submitted = self
            .fixture
            .submissions
            .iter()
            .filter(|s| s.student_id == student.id && assigned.contains(&s.assignment_id))
            .count();

        let assigned = count(assigned.len());
        let submitted = count(submitted);
        let completion_rate = if assigned == 0 {
            0
        } else {
            submitted.saturating_mul(100) / assigned
        };
        StudentStatistics {
            assigned,
            submitted,
            completion_rate,
        }
    }
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

fn join_ids(ids: &[u64]) -> String {
    ids.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// TESTS
// =============================================================================
