//! Administrative operations behind the CLI: manage channel policies and run
//! passes on demand.

use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::retention::{DeletionOutcome, RetentionEnforcer, RetentionPolicy};
use crate::store::ControlRequest;

pub struct PolicyAdmin {
    enforcer: Arc<RetentionEnforcer>,
}

impl PolicyAdmin {
    pub fn new(enforcer: Arc<RetentionEnforcer>) -> Self {
        Self { enforcer }
    }

    /// Save the policy, then run the initial cleanup against it.
    pub async fn configure(
        &self,
        server_id: &str,
        channel_id: &str,
        max_messages: u32,
        keep_pinned: bool,
    ) -> Result<(RetentionPolicy, DeletionOutcome)> {
        let policy = RetentionPolicy::new(server_id, channel_id, max_messages, keep_pinned)?;
        let outcome = self.configure_policy(&policy).await?;
        Ok((policy, outcome))
    }

    async fn configure_policy(&self, policy: &RetentionPolicy) -> Result<DeletionOutcome> {
        self.enforcer
            .services()
            .policies
            .save_policy(policy)
            .await
            .with_context(|| format!("save policy for channel {}", policy.channel_id))?;
        tracing::info!(
            server_id = %policy.server_id,
            channel_id = %policy.channel_id,
            max_messages = policy.max_messages,
            keep_pinned = policy.keep_pinned,
            "channel configured; starting initial cleanup"
        );

        Ok(self.enforcer.reconfigure(policy).await)
    }

    /// Carry out a request queued by a CLI command.
    pub async fn apply(&self, request: ControlRequest) -> Result<()> {
        match request {
            ControlRequest::Configure(policy) => {
                let outcome = self.configure_policy(&policy).await?;
                tracing::info!(
                    channel_id = %policy.channel_id,
                    "queued configure applied: {}",
                    outcome.summary()
                );
            }
            ControlRequest::Remove {
                server_id,
                channel_id,
            } => {
                let removed = self.remove(&server_id, &channel_id).await?;
                tracing::info!(%channel_id, removed, "queued remove applied");
            }
            ControlRequest::Enforce {
                server_id,
                channel_id,
            } => match self.enforce(&server_id, &channel_id).await? {
                Some(outcome) => {
                    tracing::info!(%channel_id, "queued enforce applied: {}", outcome.summary());
                }
                None => tracing::warn!(%channel_id, "queued enforce for unmanaged channel"),
            },
        }
        Ok(())
    }

    /// Stop managing a channel. Returns whether it was managed.
    pub async fn remove(&self, server_id: &str, channel_id: &str) -> Result<bool> {
        let removed = self
            .enforcer
            .services()
            .policies
            .remove_policy(server_id, channel_id)
            .await
            .with_context(|| format!("remove policy for channel {channel_id}"))?;
        self.enforcer.forget_channel(channel_id);
        Ok(removed)
    }

    pub async fn list(&self, server_id: &str) -> Result<Vec<RetentionPolicy>> {
        self.enforcer
            .services()
            .policies
            .list_policies(server_id)
            .await
            .with_context(|| format!("list policies for server {server_id}"))
    }

    /// One pass against the stored policy. `None` when the channel is not
    /// managed.
    pub async fn enforce(
        &self,
        server_id: &str,
        channel_id: &str,
    ) -> Result<Option<DeletionOutcome>> {
        let policy = self
            .enforcer
            .services()
            .policies
            .get_policy(server_id, channel_id)
            .await
            .with_context(|| format!("load policy for channel {channel_id}"))?;
        match policy {
            Some(policy) => Ok(Some(self.enforcer.enforce(&policy).await)),
            None => Ok(None),
        }
    }
}

pub fn render_policy_list(policies: &[RetentionPolicy]) -> String {
    if policies.is_empty() {
        return "No channels are currently being managed.".to_string();
    }

    let mut out = String::from("Managed channels:\n");
    for policy in policies {
        let _ = writeln!(
            out,
            "• {}: Max messages: {}, Keep pinned: {}",
            policy.channel_id,
            policy.max_messages,
            if policy.keep_pinned { "Yes" } else { "No" }
        );
    }
    out
}
