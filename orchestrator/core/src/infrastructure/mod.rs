// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod kernel;
pub mod policy;
pub mod proof;
pub mod telemetry;
pub mod trace_store;

pub use event_bus::{EventBus, EventHandler, SubscriptionId};
pub use kernel::{InMemoryKernel, InMemoryPluginSandbox};
pub use policy::AgreementRegistry;
pub use proof::{Ed25519ProofSystem, HmacProofSystem};
pub use trace_store::{InMemoryTraceStore, SledTraceStore};
