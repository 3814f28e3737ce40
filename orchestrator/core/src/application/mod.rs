// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod orchestrator;
mod monitor;
mod registry;

pub use orchestrator::{ContainerOrchestrator, OrchestratorError, StopOptions};
