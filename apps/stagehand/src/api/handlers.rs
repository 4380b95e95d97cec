//! # API Endpoint Handlers
//!
//! This module implements the actual HTTP endpoint handlers. Handlers only
//! ever set keys and read states; all loading happens in the screen chains.

use super::{
    AppState,
    types::{
        HealthResponse, InvalidateRequest, InvalidateResponse, KeyRequest, OpenAssignmentRequest,
        OpenProfileRequest, OpenRosterRequest, OpenScreenResponse, RegistryResponse,
    },
};
use crate::error::AppError;
use crate::screens::{self, AssignmentScreen, ProfileScreen, RosterScreen, Screen, ScreenView};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};

// =============================================================================
// HEALTH HANDLER
// =============================================================================

/// Health check endpoint.
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse::ok(state.screen_count().await))
}

// =============================================================================
// OPEN HANDLERS
// =============================================================================

async fn open(state: &AppState, screen: Screen) -> (StatusCode, Json<OpenScreenResponse>) {
    let kind = screen.kind().to_string();
    let screen_id = state.insert(screen).await;
    tracing::info!(screen_id, kind = %kind, "screen opened");
    (
        StatusCode::CREATED,
        Json(OpenScreenResponse { screen_id, kind }),
    )
}

/// Open a roster screen.
pub async fn open_roster_handler(
    State(state): State<AppState>,
    Json(request): Json<OpenRosterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let screen = RosterScreen::open(state.context())?;
    if request.teacher_id.is_some() {
        screen.set_teacher(request.teacher_id)?;
    }
    Ok(open(&state, Screen::Roster(screen)).await)
}

/// Open an assignment screen.
pub async fn open_assignment_handler(
    State(state): State<AppState>,
    Json(request): Json<OpenAssignmentRequest>,
) -> Result<impl IntoResponse, AppError> {
    let screen = AssignmentScreen::open(state.context())?;
    if request.assignment_id.is_some() {
        screen.personal().set_key(request.assignment_id)?;
    }
    Ok(open(&state, Screen::Assignment(screen)).await)
}

/// Open a profile screen.
pub async fn open_profile_handler(
    State(state): State<AppState>,
    Json(request): Json<OpenProfileRequest>,
) -> Result<impl IntoResponse, AppError> {
    let screen = ProfileScreen::open(state.context())?;
    if request.student_id.is_some() {
        screen.profile().set_key(request.student_id)?;
    }
    Ok(open(&state, Screen::Profile(screen)).await)
}

// =============================================================================
// SCREEN HANDLERS
// =============================================================================

/// Current state of every stage of a screen.
pub async fn get_screen_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ScreenView>, AppError> {
    let screen = state.screen(id).await?;
    Ok(Json(screen.view(id)))
}

/// Set (or clear, with `null`) the root key.
pub async fn set_root_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<KeyRequest>,
) -> Result<Json<ScreenView>, AppError> {
    let screen = state.screen(id).await?;
    screen.set_root(request.key)?;
    Ok(Json(screen.view(id)))
}

/// Pin (or unpin, with `null`) the screen's selection.
pub async fn set_selection_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
    Json(request): Json<KeyRequest>,
) -> Result<Json<ScreenView>, AppError> {
    let screen = state.screen(id).await?;
    screen.select(request.key)?;
    Ok(Json(screen.view(id)))
}

/// Re-fetch the screen from its root down.
pub async fn refresh_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<Json<ScreenView>, AppError> {
    let screen = state.screen(id).await?;
    screen.refresh()?;
    Ok(Json(screen.view(id)))
}

/// Dispose a screen's chain and forget the screen.
pub async fn close_screen_handler(
    State(state): State<AppState>,
    Path(id): Path<u64>,
) -> Result<StatusCode, AppError> {
    let screen = state.remove(id).await?;
    screen.chain().dispose();
    tracing::info!(screen_id = id, kind = screen.kind(), "screen closed");
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// REGISTRY HANDLERS
// =============================================================================

/// Invalidate one registry entry.
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Json(request): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, AppError> {
    let removed = screens::invalidate(state.context().registry(), &request.stage, request.key)?;
    Ok(Json(InvalidateResponse { removed }))
}

/// Cache and in-flight counters per stage.
pub async fn registry_handler(State(state): State<AppState>) -> Json<RegistryResponse> {
    Json(RegistryResponse {
        tables: state.context().registry().stats(),
    })
}
