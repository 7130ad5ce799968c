// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod audit;
pub mod consensus;
mod deadline;
pub mod facade;
pub mod lifecycle;
pub mod memory_trace;

pub use audit::AuditTraceEngine;
pub use consensus::{CastVote, ConsensusEngine, ConsensusReaper, ProposeRequest};
pub use lifecycle::{AgentLifecycleManager, ExecuteRequest};
pub use memory_trace::MemoryTraceStore;
