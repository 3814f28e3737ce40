// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod runtime;
pub mod telemetry;

pub use event_bus::{EventBus, EventBusError};
pub use runtime::DockerEngine;
