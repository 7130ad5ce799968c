// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Covenant Core
//!
//! Orchestration core of the agent platform: lifecycle management, quorum
//! consensus with verifiable commitments, hash-linked per-agent memory and a
//! global tamper-evident audit chain, all coordinated over an in-process
//! event bus.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Entry point; [`application::facade::CovenantCore`] exposes
//!   every operation

pub mod domain;
pub mod application;
pub mod infrastructure;

pub use application::facade::{CovenantCore, CovenantCoreBuilder};
pub use domain::error::{CoreError, CoreResult, ResourceKind};
