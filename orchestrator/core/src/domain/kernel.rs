// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Contracts of the native execution kernel and the plugin sandbox.
//!
//! Both collaborators are potentially slow. Callers must never hold a lock
//! across any of these calls.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::agent::{AgentConstraints, KernelHandle, KernelSnapshotRef, PluginId};
use crate::domain::error::CoreError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Failed to spawn agent: {0}")]
    SpawnFailed(String),
    #[error("Failed to execute intent: {0}")]
    ExecutionFailed(String),
    #[error("Failed to snapshot agent: {0}")]
    SnapshotFailed(String),
    #[error("Failed to recover snapshot: {0}")]
    RecoverFailed(String),
    #[error("Failed to terminate agent: {0}")]
    TerminationFailed(String),
    #[error("Kernel handle not found: {0}")]
    HandleNotFound(String),
    #[error("Kernel unreachable: {0}")]
    Unreachable(String),
}

impl From<KernelError> for CoreError {
    fn from(err: KernelError) -> Self {
        CoreError::ConstraintViolation(format!("kernel: {err}"))
    }
}

#[async_trait]
pub trait ExecutionKernel: Send + Sync {
    async fn spawn(&self, constraints: &AgentConstraints) -> Result<KernelHandle, KernelError>;

    async fn execute(
        &self,
        handle: &KernelHandle,
        intent: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, KernelError>;

    async fn snapshot(&self, handle: &KernelHandle) -> Result<KernelSnapshotRef, KernelError>;

    async fn recover(&self, snapshot: &KernelSnapshotRef) -> Result<KernelHandle, KernelError>;

    async fn terminate(&self, handle: &KernelHandle) -> Result<(), KernelError>;
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Plugin not found: {0}")]
    PluginNotFound(PluginId),
    #[error("Plugin rejected: {0}")]
    Rejected(String),
    #[error("Sandbox unavailable: {0}")]
    Unavailable(String),
}

impl From<SandboxError> for CoreError {
    fn from(err: SandboxError) -> Self {
        CoreError::ConstraintViolation(format!("sandbox: {err}"))
    }
}

/// Opaque capability list the sandbox grants for an attached plugin.
pub type PluginCapabilities = Vec<String>;

#[async_trait]
pub trait PluginSandbox: Send + Sync {
    async fn attach(
        &self,
        handle: &KernelHandle,
        plugin_id: &PluginId,
    ) -> Result<PluginCapabilities, SandboxError>;
}
