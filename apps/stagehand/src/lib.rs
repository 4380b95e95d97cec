//! # Stagehand
//!
//! The gradebook backend built on [`stagehand_core`]. Every screen a client
//! opens is one chain of dependent stages; all screens share one registry,
//! so the same class or student list is fetched once no matter how many
//! screens show it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    apps/stagehand (THE BINARY)                  │
//! │                                                                 │
//! │  ┌─────────────┐    ┌─────────────┐    ┌──────────────────┐     │
//! │  │   CLI       │    │   HTTP API  │    │    Gradebook     │     │
//! │  │  (clap)     │    │   (axum)    │    │ (fixture fetch)  │     │
//! │  └──────┬──────┘    └──────┬──────┘    └────────┬─────────┘     │
//! │         │                  │                    │               │
//! │         └──────────► screens ◄──────────────────┘               │
//! │                            ▼                                    │
//! │                    ┌────────────────┐                           │
//! │                    │ stagehand-core │                           │
//! │                    │  (THE LOGIC)   │                           │
//! │                    └────────────────┘                           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod gradebook;
pub mod screens;
