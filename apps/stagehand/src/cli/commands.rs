//! # CLI Command Implementations
//!
//! This module contains the actual implementations of CLI commands.

use stagehand::api::{self, AppState};
use stagehand::config::Config;
use stagehand::error::AppError;
use stagehand::gradebook::CLASSES;
use stagehand::screens::{RosterScreen, Screen, ScreenContext, ScreenView};
use stagehand_core::{Chain, ChainEvent, StageId, Status};
use std::collections::BTreeMap;
use std::time::Duration;

/// How long `watch` waits for the next transition before giving up.
const WATCH_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// SERVE COMMAND
// =============================================================================

/// Start the HTTP server.
pub async fn cmd_serve(
    mut config: Config,
    host: Option<String>,
    port: Option<u16>,
) -> Result<(), AppError> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = config.server.addr();

    println!("Stagehand Gradebook Server Starting...");
    println!();
    println!("Configuration:");
    println!("  Address:      {}", addr);
    println!("  Latency:      {} ms", config.fetch.latency_ms);
    println!("  Fail keys:    {}", config.fetch.fail_keys.len());
    match config.fetch.max_age_ms {
        Some(ms) => println!("  Cache max age: {} ms", ms),
        None => println!("  Cache max age: none (always re-fetch)"),
    }
    println!();
    println!("Endpoints:");
    println!("  POST   /screens/{{roster,assignment,profile}} - Open a screen");
    println!("  GET    /screens/{{id}}            - Screen state");
    println!("  PUT    /screens/{{id}}/root       - Set root key");
    println!("  PUT    /screens/{{id}}/selection  - Pin selection");
    println!("  POST   /screens/{{id}}/refresh    - Re-fetch root, reload below");
    println!("  DELETE /screens/{{id}}            - Close screen");
    println!("  POST   /invalidate              - Drop a cached entry");
    println!("  GET    /registry                - Registry counters");
    println!("  GET    /health                  - Health check");
    println!();
    println!("Press Ctrl+C to stop");
    println!();

    let state = AppState::from_config(&config);
    api::run_server(&addr, state).await
}

// =============================================================================
// WATCH COMMAND
// =============================================================================

/// Open a roster screen for `teacher`, print every transition, and print the
/// settled screen. With `switch_to`, the teacher is switched as soon as the
/// first classes settle, superseding whatever was loading below them.
pub async fn cmd_watch(
    config: &Config,
    json_mode: bool,
    verbose: bool,
    teacher: String,
    switch_to: Option<String>,
) -> Result<(), AppError> {
    let ctx = ScreenContext::from_config(config);
    let roster = RosterScreen::open(&ctx)?;
    let mut events = roster.chain().events();
    let mut pending_switch = switch_to;
    let mut seen: BTreeMap<StageId, (Status, u64)> = BTreeMap::new();

    roster.set_teacher(Some(teacher))?;

    loop {
        let event = match tokio::time::timeout(WATCH_IDLE_TIMEOUT, events.next()).await {
            Ok(Some(event)) => event,
            Ok(None) => break,
            Err(_) => {
                tracing::warn!("no transition for {:?}, giving up", WATCH_IDLE_TIMEOUT);
                break;
            }
        };
        print_event(&event, json_mode);
        seen.insert(event.stage, (event.status, event.version));

        if event.stage == CLASSES && matches!(event.status, Status::Ready | Status::Failed) {
            if let Some(next) = pending_switch.take() {
                tracing::info!(teacher = %next, "switching teacher");
                roster.set_teacher(Some(next))?;
            }
        }
        if pending_switch.is_none() && caught_up(roster.chain(), &seen) {
            break;
        }
    }

    let view = Screen::Roster(roster).view(0);
    print_view(&view, json_mode, verbose);
    Ok(())
}

/// Check if the chain is settled and every stage's latest transition has
/// been printed.
fn caught_up(chain: &Chain, seen: &BTreeMap<StageId, (Status, u64)>) -> bool {
    chain.snapshot().iter().all(|summary| {
        summary.status.is_settled()
            && (summary.version == 0
                || seen.get(&summary.stage) == Some(&(summary.status, summary.version)))
    })
}

fn print_event(event: &ChainEvent, json_mode: bool) {
    if json_mode {
        println!("{}", serde_json::to_string(event).unwrap_or_default());
        return;
    }
    println!(
        "#{:<4} {:<28} {:<8} v{}",
        event.seq, event.stage, event.status, event.version
    );
}

fn print_view(view: &ScreenView, json_mode: bool, verbose: bool) {
    if json_mode {
        println!("{}", serde_json::to_string(view).unwrap_or_default());
        return;
    }

    println!();
    println!("Final {} screen (settled: {})", view.kind, view.settled);
    println!("==============================");
    for stage in &view.stages {
        let stale = if stage.stale { " (stale)" } else { "" };
        println!(
            "{:<28} {:<8} v{:<4} key={}{}",
            stage.stage, stage.status, stage.version, stage.key, stale
        );
        if let Some(error) = &stage.error {
            println!("  error: {}", error);
        }
        if verbose && !stage.value.is_null() {
            println!(
                "  value: {}",
                serde_json::to_string_pretty(&stage.value).unwrap_or_default()
            );
        }
    }
}

// =============================================================================
// FIXTURE COMMAND
// =============================================================================

/// Summarize the configured gradebook fixture.
pub fn cmd_fixture(config: &Config, json_mode: bool) {
    let fixture = &config.fixture;

    if json_mode {
        let output = serde_json::json!({
            "teachers": fixture.teachers.len(),
            "classes": fixture.classes.len(),
            "students": fixture.students.len(),
            "assignments": fixture.assignments.len(),
            "submissions": fixture.submissions.len(),
            "fail_keys": config.fetch.fail_keys,
            "latency_ms": config.fetch.latency_ms,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&output).unwrap_or_default()
        );
        return;
    }

    println!("Stagehand Gradebook Fixture");
    println!("===========================");
    println!("Teachers:    {}", fixture.teachers.len());
    println!("Classes:     {}", fixture.classes.len());
    println!("Students:    {}", fixture.students.len());
    println!("Assignments: {}", fixture.assignments.len());
    println!("Submissions: {}", fixture.submissions.len());
    println!();

    for teacher in &fixture.teachers {
        println!("{} ({})", teacher.name, teacher.id);
        for class in fixture.classes.iter().filter(|c| c.teacher_id == teacher.id) {
            let enrolled = fixture
                .students
                .iter()
                .filter(|s| s.class_id == class.id)
                .count();
            println!("  {} {} - {} students", class.id, class.name, enrolled);
        }
    }
}
