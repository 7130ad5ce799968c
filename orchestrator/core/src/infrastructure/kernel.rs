// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-process Kernel and Sandbox Adapters
//
// Stand-ins for the native execution kernel and the plugin sandbox, used for
// development and tests. The kernel keeps one record per handle and echoes
// intents back as results; optional latency and an outage switch exercise
// the core's timeout and failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::domain::agent::{AgentConstraints, KernelHandle, KernelSnapshotRef, PluginId};
use crate::domain::kernel::{
    ExecutionKernel, KernelError, PluginCapabilities, PluginSandbox, SandboxError,
};

#[derive(Debug, Clone)]
struct KernelInstance {
    constraints: AgentConstraints,
    executions: u64,
}

#[derive(Default)]
pub struct InMemoryKernel {
    instances: DashMap<KernelHandle, KernelInstance>,
    snapshots: DashMap<KernelSnapshotRef, KernelInstance>,
    execute_delay: Option<Duration>,
    unreachable: AtomicBool,
    total_executions: AtomicU64,
}

impl InMemoryKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `execute` sleeps this long before answering.
    pub fn with_execute_delay(mut self, delay: Duration) -> Self {
        self.execute_delay = Some(delay);
        self
    }

    /// Simulates a kernel outage: every call fails with `Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn is_running(&self, handle: &KernelHandle) -> bool {
        self.instances.contains_key(handle)
    }

    pub fn running_count(&self) -> usize {
        self.instances.len()
    }

    pub fn total_executions(&self) -> u64 {
        self.total_executions.load(Ordering::SeqCst)
    }

    fn ensure_reachable(&self) -> Result<(), KernelError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(KernelError::Unreachable("in-memory kernel is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionKernel for InMemoryKernel {
    async fn spawn(&self, constraints: &AgentConstraints) -> Result<KernelHandle, KernelError> {
        self.ensure_reachable()?;
        let handle = KernelHandle::new(format!("kernel-{}", Uuid::new_v4()));
        self.instances.insert(
            handle.clone(),
            KernelInstance {
                constraints: constraints.clone(),
                executions: 0,
            },
        );
        debug!(handle = %handle.as_str(), "Kernel instance spawned");
        Ok(handle)
    }

    async fn execute(
        &self,
        handle: &KernelHandle,
        intent: &str,
        params: &serde_json::Value,
    ) -> Result<serde_json::Value, KernelError> {
        self.ensure_reachable()?;
        if let Some(delay) = self.execute_delay {
            tokio::time::sleep(delay).await;
        }
        let sequence = {
            let mut instance = self
                .instances
                .get_mut(handle)
                .ok_or_else(|| KernelError::HandleNotFound(handle.as_str().to_string()))?;
            instance.executions += 1;
            instance.executions
        };
        self.total_executions.fetch_add(1, Ordering::SeqCst);
        Ok(json!({
            "handle": handle.as_str(),
            "intent": intent,
            "params": params,
            "sequence": sequence,
        }))
    }

    async fn snapshot(&self, handle: &KernelHandle) -> Result<KernelSnapshotRef, KernelError> {
        self.ensure_reachable()?;
        let instance = self
            .instances
            .get(handle)
            .map(|i| i.clone())
            .ok_or_else(|| KernelError::HandleNotFound(handle.as_str().to_string()))?;
        let snapshot = KernelSnapshotRef(format!("ksnap-{}", Uuid::new_v4()));
        self.snapshots.insert(snapshot.clone(), instance);
        Ok(snapshot)
    }

    async fn recover(&self, snapshot: &KernelSnapshotRef) -> Result<KernelHandle, KernelError> {
        self.ensure_reachable()?;
        let instance = self
            .snapshots
            .get(snapshot)
            .map(|i| i.clone())
            .ok_or_else(|| KernelError::RecoverFailed(format!("unknown snapshot {}", snapshot.0)))?;
        let handle = KernelHandle::new(format!("kernel-{}", Uuid::new_v4()));
        debug!(
            handle = %handle.as_str(),
            snapshot = %snapshot.0,
            memory_mb = ?instance.constraints.memory_mb,
            "Kernel instance recovered"
        );
        self.instances.insert(handle.clone(), instance);
        Ok(handle)
    }

    async fn terminate(&self, handle: &KernelHandle) -> Result<(), KernelError> {
        self.ensure_reachable()?;
        self.instances
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| KernelError::HandleNotFound(handle.as_str().to_string()))
    }
}

/// Plugin registry: attaching succeeds only for registered plugins, which
/// receive their registered capability list.
#[derive(Default)]
pub struct InMemoryPluginSandbox {
    plugins: DashMap<PluginId, PluginCapabilities>,
    attachments: DashMap<KernelHandle, Vec<PluginId>>,
}

impl InMemoryPluginSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plugins(plugins: HashMap<PluginId, PluginCapabilities>) -> Self {
        let sandbox = Self::default();
        for (id, caps) in plugins {
            sandbox.register(id, caps);
        }
        sandbox
    }

    pub fn register(&self, plugin_id: PluginId, capabilities: PluginCapabilities) {
        self.plugins.insert(plugin_id, capabilities);
    }

    pub fn attached(&self, handle: &KernelHandle) -> Vec<PluginId> {
        self.attachments
            .get(handle)
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PluginSandbox for InMemoryPluginSandbox {
    async fn attach(
        &self,
        handle: &KernelHandle,
        plugin_id: &PluginId,
    ) -> Result<PluginCapabilities, SandboxError> {
        let capabilities = self
            .plugins
            .get(plugin_id)
            .map(|c| c.clone())
            .ok_or_else(|| SandboxError::PluginNotFound(plugin_id.clone()))?;
        let mut attached = self.attachments.entry(handle.clone()).or_default();
        if !attached.contains(plugin_id) {
            attached.push(plugin_id.clone());
        }
        Ok(capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_kernel_spawn_execute_terminate() {
        let kernel = InMemoryKernel::new();
        let handle = kernel.spawn(&AgentConstraints::default()).await.unwrap();
        let result = kernel
            .execute(&handle, "summarize", &json!({ "doc": 1 }))
            .await
            .unwrap();
        assert_eq!(result["intent"], json!("summarize"));
        assert_eq!(result["sequence"], json!(1));

        kernel.terminate(&handle).await.unwrap();
        assert!(matches!(
            kernel.execute(&handle, "x", &json!(null)).await,
            Err(KernelError::HandleNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_kernel_snapshot_recover_yields_new_handle() {
        let kernel = InMemoryKernel::new();
        let handle = kernel.spawn(&AgentConstraints::default()).await.unwrap();
        kernel.execute(&handle, "a", &json!(null)).await.unwrap();
        let snap = kernel.snapshot(&handle).await.unwrap();
        let recovered = kernel.recover(&snap).await.unwrap();
        assert_ne!(recovered, handle);
        let result = kernel.execute(&recovered, "b", &json!(null)).await.unwrap();
        assert_eq!(result["sequence"], json!(2));
    }

    #[tokio::test]
    async fn test_kernel_outage() {
        let kernel = InMemoryKernel::new();
        kernel.set_unreachable(true);
        assert!(matches!(
            kernel.spawn(&AgentConstraints::default()).await,
            Err(KernelError::Unreachable(_))
        ));
    }

    #[tokio::test]
    async fn test_sandbox_attach() {
        let sandbox = InMemoryPluginSandbox::new();
        sandbox.register(PluginId::new("search"), vec!["net.read".to_string()]);
        let handle = KernelHandle::new("k");
        let caps = sandbox.attach(&handle, &PluginId::new("search")).await.unwrap();
        assert_eq!(caps, vec!["net.read".to_string()]);
        sandbox.attach(&handle, &PluginId::new("search")).await.unwrap();
        assert_eq!(sandbox.attached(&handle).len(), 1);
        assert!(matches!(
            sandbox.attach(&handle, &PluginId::new("ghost")).await,
            Err(SandboxError::PluginNotFound(_))
        ));
    }
}
