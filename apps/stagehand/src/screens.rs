//! # Screens
//!
//! Each screen is one chain over the gradebook. All screens opened through
//! the same [`ScreenContext`] share its registry, so two screens showing the
//! same class load it once.
//!
//! | Screen | Root key | Stages |
//! |--------|----------|--------|
//! | Roster | teacher id | classes → students (auto-selected class) → statistics |
//! | Assignment | assignment id | personal-assignments → personal-assignment-stats |
//! | Profile | student id | profile |

use crate::config::Config;
use crate::error::AppError;
use crate::gradebook::{
    ASSIGNMENT_STATISTICS, AssignmentStatistics, AssignmentStatsKey, CLASSES, ClassSummary,
    Gradebook, PERSONAL_ASSIGNMENTS, PROFILE, PersonalAssignment, STATISTICS, STUDENTS,
    StatisticsMap, StudentProfile, StudentSummary,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use stagehand_core::{
    AutoSelect, Chain, ChainOptions, FetchError, Fetcher, Key, Registry, Stage, StageId,
    StageOptions, StageSpec, Status, Value,
};
use std::future::Future;
use std::sync::Arc;

// =============================================================================
// CONTEXT
// =============================================================================

/// What every screen is built from.
#[derive(Debug, Clone)]
pub struct ScreenContext {
    registry: Arc<Registry>,
    gradebook: Arc<Gradebook>,
    chain_options: ChainOptions,
    stage_options: StageOptions,
}

impl ScreenContext {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        gradebook: Arc<Gradebook>,
        chain_options: ChainOptions,
        stage_options: StageOptions,
    ) -> Self {
        Self {
            registry,
            gradebook,
            chain_options,
            stage_options,
        }
    }

    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Arc::new(Registry::new()),
            Arc::new(Gradebook::from_config(config)),
            config.chain_options(),
            config.stage_options(),
        )
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    #[must_use]
    pub fn gradebook(&self) -> &Arc<Gradebook> {
        &self.gradebook
    }

    fn chain(&self, name: &str) -> Result<Chain, AppError> {
        Ok(Chain::with_options(
            name,
            Arc::clone(&self.registry),
            self.chain_options,
        )?)
    }

    /// Declare a stage whose fetcher calls into the gradebook.
    fn spec<K, T, F, Fut>(&self, id: StageId, call: F) -> StageSpec<K, T>
    where
        K: Key,
        T: Value,
        F: Fn(Arc<Gradebook>, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        StageSpec::new(id, gradebook_fetcher(&self.gradebook, call)).with_options(self.stage_options)
    }
}

fn gradebook_fetcher<K, T, F, Fut>(gradebook: &Arc<Gradebook>, call: F) -> impl Fetcher<K, T> + 'static
where
    K: Key,
    T: Value,
    F: Fn(Arc<Gradebook>, K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    let gradebook = Arc::clone(gradebook);
    move |key: K| call(Arc::clone(&gradebook), key)
}

// =============================================================================
// ROSTER
// =============================================================================

/// Teacher → classes → students of the selected class → their statistics.
pub struct RosterScreen {
    chain: Chain,
    classes: Stage<String, Vec<ClassSummary>>,
    students: Stage<u64, Vec<StudentSummary>>,
    statistics: Stage<Vec<u64>, StatisticsMap>,
}

impl RosterScreen {
    pub fn open(ctx: &ScreenContext) -> Result<Self, AppError> {
        let mut chain = ctx.chain("roster")?;
        let classes = chain.root(ctx.spec(CLASSES, |gb, teacher: String| async move {
            gb.classes(teacher).await
        }))?;
        let students = chain.then_select(
            &classes,
            ctx.spec(STUDENTS, |gb, class_id: u64| async move {
                gb.students(class_id).await
            }),
            AutoSelect::new(|class: &ClassSummary| class.id),
        )?;
        let statistics = chain.then(
            &students,
            ctx.spec(STATISTICS, |gb, ids: Vec<u64>| async move {
                gb.statistics(ids).await
            }),
            |students: &Vec<StudentSummary>| {
                (!students.is_empty()).then(|| students.iter().map(|s| s.id).collect())
            },
        )?;
        Ok(Self {
            chain,
            classes,
            students,
            statistics,
        })
    }

    #[must_use]
    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    #[must_use]
    pub fn classes(&self) -> &Stage<String, Vec<ClassSummary>> {
        &self.classes
    }

    #[must_use]
    pub fn students(&self) -> &Stage<u64, Vec<StudentSummary>> {
        &self.students
    }

    #[must_use]
    pub fn statistics(&self) -> &Stage<Vec<u64>, StatisticsMap> {
        &self.statistics
    }

    pub fn set_teacher(&self, teacher_id: Option<String>) -> Result<(), AppError> {
        Ok(self.classes.set_key(teacher_id)?)
    }

    /// Pin a class, or return to the first class with `None`.
    pub fn select_class(&self, class_id: Option<u64>) -> Result<(), AppError> {
        match class_id {
            Some(id) => self.students.pin(id)?,
            None => self.students.unpin()?,
        }
        Ok(())
    }

    fn views(&self) -> Vec<StageView> {
        vec![
            StageView::of(&self.classes),
            StageView::of(&self.students),
            StageView::of(&self.statistics),
        ]
    }
}

// =============================================================================
// ASSIGNMENT
// =============================================================================

/// Assignment → every student's copy → submission summary.
pub struct AssignmentScreen {
    chain: Chain,
    personal: Stage<u64, Vec<PersonalAssignment>>,
    statistics: Stage<AssignmentStatsKey, AssignmentStatistics>,
}

impl AssignmentScreen {
    pub fn open(ctx: &ScreenContext) -> Result<Self, AppError> {
        let mut chain = ctx.chain("assignment")?;
        let personal = chain.root(ctx.spec(PERSONAL_ASSIGNMENTS, |gb, id: u64| async move {
            gb.personal_assignments(id).await
        }))?;
        let statistics = chain.then(
            &personal,
            ctx.spec(ASSIGNMENT_STATISTICS, |gb, key: AssignmentStatsKey| async move {
                gb.assignment_statistics(key).await
            }),
            |personal: &Vec<PersonalAssignment>| {
                personal.first().map(|first| AssignmentStatsKey {
                    assignment_id: first.assignment_id,
                    student_ids: personal.iter().map(|p| p.student_id).collect(),
                })
            },
        )?;
        Ok(Self {
            chain,
            personal,
            statistics,
        })
    }

    #[must_use]
    pub fn personal(&self) -> &Stage<u64, Vec<PersonalAssignment>> {
        &self.personal
    }

    #[must_use]
    pub fn statistics(&self) -> &Stage<AssignmentStatsKey, AssignmentStatistics> {
        &self.statistics
    }

    fn views(&self) -> Vec<StageView> {
        vec![
            StageView::of(&self.personal),
            StageView::of(&self.statistics),
        ]
    }
}

// =============================================================================
// PROFILE
// =============================================================================

/// One student's profile.
pub struct ProfileScreen {
    chain: Chain,
    profile: Stage<u64, StudentProfile>,
}

impl ProfileScreen {
    pub fn open(ctx: &ScreenContext) -> Result<Self, AppError> {
        let mut chain = ctx.chain("profile")?;
        let profile = chain.root(ctx.spec(PROFILE, |gb, id: u64| async move {
            gb.profile(id).await
        }))?;
        Ok(Self { chain, profile })
    }

    #[must_use]
    pub fn profile(&self) -> &Stage<u64, StudentProfile> {
        &self.profile
    }
}

// =============================================================================
// SCREEN
// =============================================================================

pub enum Screen {
    Roster(RosterScreen),
    Assignment(AssignmentScreen),
    Profile(ProfileScreen),
}

impl Screen {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Screen::Roster(_) => "roster",
            Screen::Assignment(_) => "assignment",
            Screen::Profile(_) => "profile",
        }
    }

    #[must_use]
    pub fn chain(&self) -> &Chain {
        match self {
            Screen::Roster(s) => &s.chain,
            Screen::Assignment(s) => &s.chain,
            Screen::Profile(s) => &s.chain,
        }
    }

    /// Set the root key from JSON; `null` clears the screen.
    pub fn set_root(&self, key: Json) -> Result<(), AppError> {
        match self {
            Screen::Roster(s) => s.set_teacher(parse_key(CLASSES, key)?),
            Screen::Assignment(s) => Ok(s.personal.set_key(parse_key(PERSONAL_ASSIGNMENTS, key)?)?),
            Screen::Profile(s) => Ok(s.profile.set_key(parse_key(PROFILE, key)?)?),
        }
    }

    /// Pin the selection from JSON; `null` unpins.
    pub fn select(&self, key: Json) -> Result<(), AppError> {
        match self {
            Screen::Roster(s) => s.select_class(parse_key(STUDENTS, key)?),
            other => Err(AppError::NoSelection(other.kind())),
        }
    }

    /// Re-fetch the root. Stages below reload in chain order from the new
    /// value, served from the cache when `max_age` is set and the entry is
    /// still fresh.
    pub fn refresh(&self) -> Result<(), AppError> {
        match self {
            Screen::Roster(s) => s.classes.refresh()?,
            Screen::Assignment(s) => s.personal.refresh()?,
            Screen::Profile(s) => s.profile.refresh()?,
        }
        Ok(())
    }

    #[must_use]
    pub fn view(&self, screen_id: u64) -> ScreenView {
        let stages = match self {
            Screen::Roster(s) => s.views(),
            Screen::Assignment(s) => s.views(),
            Screen::Profile(s) => vec![StageView::of(&s.profile)],
        };
        ScreenView {
            screen_id,
            kind: self.kind().to_string(),
            settled: self.chain().is_settled(),
            stages,
        }
    }
}

fn parse_key<K: DeserializeOwned>(stage: StageId, key: Json) -> Result<Option<K>, AppError> {
    serde_json::from_value(key).map_err(|e| AppError::InvalidKey {
        stage: stage.to_string(),
        message: e.to_string(),
    })
}

// =============================================================================
// VIEWS
// =============================================================================

/// JSON rendering of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageView {
    pub stage: String,
    pub status: Status,
    pub key: Json,
    pub version: u64,
    pub value: Json,
    pub error: Option<FetchError>,
    pub stale: bool,
}

impl StageView {
    #[must_use]
    pub fn of<K, T>(stage: &Stage<K, T>) -> Self
    where
        K: Key + Serialize,
        T: Value + Serialize,
    {
        let state = stage.state();
        Self {
            stage: stage.id().to_string(),
            status: state.status,
            key: serde_json::to_value(&state.key).unwrap_or_default(),
            version: state.version,
            value: serde_json::to_value(state.value.as_deref()).unwrap_or_default(),
            error: state.error.clone(),
            stale: state.is_stale(),
        }
    }
}

/// JSON rendering of a whole screen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenView {
    pub screen_id: u64,
    pub kind: String,
    pub settled: bool,
    pub stages: Vec<StageView>,
}

impl ScreenView {
    /// The view of `stage`, if the screen has it.
    #[must_use]
    pub fn stage(&self, stage: StageId) -> Option<&StageView> {
        self.stages.iter().find(|s| s.stage == stage.as_str())
    }
}

// =============================================================================
// REGISTRY ACCESS
// =============================================================================

/// Drop the cached entry for `key` of the gradebook stage named `stage`.
pub fn invalidate(registry: &Registry, stage: &str, key: Json) -> Result<bool, AppError> {
    match stage {
        "classes" => drop_entry::<String, Vec<ClassSummary>>(registry, CLASSES, key),
        "students" => drop_entry::<u64, Vec<StudentSummary>>(registry, STUDENTS, key),
        "statistics" => drop_entry::<Vec<u64>, StatisticsMap>(registry, STATISTICS, key),
        "personal-assignments" => {
            drop_entry::<u64, Vec<PersonalAssignment>>(registry, PERSONAL_ASSIGNMENTS, key)
        }
        "personal-assignment-stats" => drop_entry::<AssignmentStatsKey, AssignmentStatistics>(
            registry,
            ASSIGNMENT_STATISTICS,
            key,
        ),
        "profile" => drop_entry::<u64, StudentProfile>(registry, PROFILE, key),
        other => Err(AppError::UnknownStage(other.to_string())),
    }
}

fn drop_entry<K, T>(registry: &Registry, stage: StageId, key: Json) -> Result<bool, AppError>
where
    K: Key + DeserializeOwned,
    T: Value,
{
    let key: K = serde_json::from_value(key).map_err(|e| AppError::InvalidKey {
        stage: stage.to_string(),
        message: e.to_string(),
    })?;
    let removed = registry.invalidate::<K, T>(stage, &key)?;
    tracing::info!(%stage, ?key, removed, "registry entry invalidated");
    Ok(removed)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FetchConfig, Fixture};
    use std::time::Duration;

    fn context(fail_keys: &[&str]) -> ScreenContext {
        let fetch = FetchConfig {
            latency_ms: 0,
            fail_keys: fail_keys.iter().map(|k| k.to_string()).collect(),
            max_age_ms: None,
        };
        ScreenContext::new(
            Arc::new(Registry::new()),
            Arc::new(Gradebook::new(Fixture::demo(), &fetch)),
            ChainOptions::default(),
            StageOptions::default(),
        )
    }

    async fn settled(chain: &Chain) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !chain.is_settled() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("screen settles");
    }

    #[tokio::test]
    async fn roster_reaches_statistics() {
        let screen = RosterScreen::open(&context(&[])).expect("open");
        screen.set_teacher(Some("1".into())).expect("set teacher");
        settled(screen.chain()).await;

        let stats = screen.statistics().state();
        assert_eq!(stats.key, Some(vec![100, 101]));
        let rates: Vec<u32> = stats
            .value
            .as_deref()
            .map(|m| m.values().map(|s| s.completion_rate).collect())
            .unwrap_or_default();
        assert_eq!(rates, vec![80, 40]);
    }

    #[tokio::test]
    async fn refresh_serves_fresh_downstream_from_cache() {
        let fetch = FetchConfig {
            latency_ms: 0,
            fail_keys: Vec::new(),
            max_age_ms: Some(60_000),
        };
        let ctx = ScreenContext::new(
            Arc::new(Registry::new()),
            Arc::new(Gradebook::new(Fixture::demo(), &fetch)),
            ChainOptions::default(),
            StageOptions::fresh_for(Duration::from_secs(60)),
        );
        let screen = Screen::Roster(RosterScreen::open(&ctx).expect("open"));
        screen.set_root(serde_json::json!("1")).expect("set root");
        settled(screen.chain()).await;

        screen.refresh().expect("refresh");
        settled(screen.chain()).await;

        let fetches = |stage: StageId| {
            ctx.registry()
                .stats()
                .into_iter()
                .find(|t| t.stage == stage)
                .map(|t| t.fetches)
        };
        assert_eq!(fetches(CLASSES), Some(2));
        assert_eq!(fetches(STUDENTS), Some(1));
        assert_eq!(fetches(STATISTICS), Some(1));
        assert_eq!(
            screen.view(1).stage(STATISTICS).map(|s| s.status),
            Some(Status::Ready)
        );
    }

    #[tokio::test]
    async fn roster_selection_pins_class() {
        let screen = RosterScreen::open(&context(&[])).expect("open");
        screen.set_teacher(Some("1".into())).expect("set teacher");
        settled(screen.chain()).await;

        screen.select_class(Some(11)).expect("select");
        settled(screen.chain()).await;
        assert_eq!(screen.students().state().key, Some(11));
        assert_eq!(screen.statistics().state().key, Some(vec![110]));

        screen.select_class(None).expect("unpin");
        assert_eq!(screen.students().state().key, Some(10));
    }

    #[tokio::test]
    async fn assignment_screen_summarizes_submissions() {
        let ctx = context(&[]);
        let screen = Screen::Assignment(AssignmentScreen::open(&ctx).expect("open"));
        screen.set_root(serde_json::json!(1000)).expect("set root");
        settled(screen.chain()).await;

        let view = screen.view(1);
        let stats = view.stage(ASSIGNMENT_STATISTICS).expect("stats stage");
        assert_eq!(stats.status, Status::Ready);
        assert_eq!(stats.value["average_score"], serde_json::json!(75));
    }

    #[tokio::test]
    async fn failing_stage_is_reported_in_view() {
        let screen = Screen::Profile(ProfileScreen::open(&context(&["profile:100"])).expect("open"));
        screen.set_root(serde_json::json!(100)).expect("set root");
        settled(screen.chain()).await;

        let view = screen.view(7);
        let profile = view.stage(PROFILE).expect("profile stage");
        assert_eq!(profile.status, Status::Failed);
        assert!(matches!(profile.error, Some(FetchError::NetworkFailure(_))));
        assert!(view.settled);
    }

    #[tokio::test]
    async fn wrong_key_type_is_rejected() {
        let screen = Screen::Profile(ProfileScreen::open(&context(&[])).expect("open"));
        let err = screen.set_root(serde_json::json!("abc")).err();
        assert!(matches!(err, Some(AppError::InvalidKey { .. })));
        let err = screen.select(serde_json::json!(1)).err();
        assert!(matches!(err, Some(AppError::NoSelection("profile"))));
    }

    #[tokio::test]
    async fn invalidate_by_stage_name() {
        let ctx = context(&[]);
        let screen = RosterScreen::open(&ctx).expect("open");
        screen.set_teacher(Some("1".into())).expect("set teacher");
        settled(screen.chain()).await;

        let removed = invalidate(ctx.registry(), "students", serde_json::json!(10)).expect("ok");
        assert!(removed);
        assert!(screen.students().cached(&10).is_none());
        assert!(matches!(
            invalidate(ctx.registry(), "grades", serde_json::json!(1)),
            Err(AppError::UnknownStage(_))
        ));
    }
}
