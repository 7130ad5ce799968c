// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::future::Future;

use tokio::time::Instant;

use crate::domain::error::{CoreError, CoreResult};

/// Runs `work` against an optional caller deadline. On expiry the future is
/// dropped and `Timeout` is returned; callers apply their mutation only
/// after this returns `Ok`.
pub(crate) async fn within_deadline<T, F>(
    deadline: Option<Instant>,
    operation: &str,
    work: F,
) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    match deadline {
        None => work.await,
        Some(deadline) => {
            if Instant::now() >= deadline {
                return Err(CoreError::Timeout(format!(
                    "{operation}: deadline already passed"
                )));
            }
            tokio::time::timeout_at(deadline, work)
                .await
                .map_err(|_| CoreError::Timeout(format!("{operation}: deadline exceeded")))?
        }
    }
}
