// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain Layer
//!
//! Aggregates, value objects and collaborator contracts of the orchestration
//! core. Nothing here spawns tasks or holds locks across `.await`.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Agent, memory, consensus and trace models plus the
//!   kernel, sandbox, policy and proof contracts

pub mod agent;
pub mod agreement;
pub mod clock;
pub mod config;
pub mod consensus;
pub mod error;
pub mod events;
pub mod hashing;
pub mod kernel;
pub mod memory;
pub mod proof;
pub mod trace;
