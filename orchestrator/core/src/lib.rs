// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Mindr Runtime Core
//!
//! Runs one isolated container per agent, tracks its status, samples its
//! resource usage and stops it when it exceeds the configured limits.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Agent container runtime

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use application::{ContainerOrchestrator, OrchestratorError, StopOptions};
pub use domain::*;
