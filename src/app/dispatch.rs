use anyhow::{Result, bail};
use std::sync::Arc;

use servermaid::Config;
use servermaid::admin::{PolicyAdmin, render_policy_list};
use servermaid::daemon;
use servermaid::retention::{ChatPlatform, DeletionOutcome, RetentionEnforcer, RetentionPolicy};
use servermaid::store::{ControlRequest, ControlStore, PolicyStore, SqlitePolicyStore};

use crate::cli::Commands;

async fn admin(config: &Config) -> Result<PolicyAdmin> {
    let platform: Arc<dyn ChatPlatform> = Arc::new(daemon::discord_client(config)?);
    let policies: Arc<dyn PolicyStore> = Arc::new(daemon::open_policy_store(config).await?);
    let services = daemon::retention_services(config, platform, policies);
    let enforcer = RetentionEnforcer::new(services, daemon::enforcer_settings(config));
    Ok(PolicyAdmin::new(Arc::new(enforcer)))
}

fn print_outcome(outcome: &DeletionOutcome) {
    println!("Cleanup finished: {}", outcome.summary());
}

pub async fn dispatch(command: Commands, config: Arc<Config>) -> Result<()> {
    match command {
        Commands::Run => daemon::run(config).await,
        Commands::Configure {
            server,
            channel,
            max_messages,
            keep_pinned,
        } => {
            let policy = RetentionPolicy::new(server, channel, max_messages, keep_pinned)?;
            run_or_hand_off(&config, ControlRequest::Configure(policy)).await
        }
        Commands::Remove { server, channel } => {
            let request = ControlRequest::Remove {
                server_id: server,
                channel_id: channel,
            };
            run_or_hand_off(&config, request).await
        }
        Commands::List { server } => {
            let store = SqlitePolicyStore::open(&config.db_path()).await?;
            let policies = store.list_policies(&server).await?;
            println!("{}", render_policy_list(&policies));
            Ok(())
        }
        Commands::Enforce { server, channel } => {
            let request = ControlRequest::Enforce {
                server_id: server,
                channel_id: channel,
            };
            run_or_hand_off(&config, request).await
        }
    }
}

/// Run `request` here while holding the instance lease, or queue it for the
/// running bot.
async fn run_or_hand_off(config: &Config, request: ControlRequest) -> Result<()> {
    let control = Arc::new(ControlStore::open(&config.db_path()).await?);
    let holder = daemon::lease_holder_id("cli");

    if !control.try_acquire_lease(&holder, daemon::LEASE_TTL).await? {
        let current = control.lease_holder().await?.map(|(name, _)| name);
        if let Some(name) = current.as_deref()
            && name.starts_with("cli:")
        {
            bail!("another ServerMaid command is running; try again when it finishes");
        }
        control.enqueue(&request).await?;
        println!("ServerMaid is running; the request was handed to it (see its log for results).");
        return Ok(());
    }

    let keeper = daemon::spawn_lease_keeper(Arc::clone(&control), holder.clone());
    let result = run_locally(config, request).await;
    keeper.abort();
    let _ = keeper.await;
    if let Err(e) = control.release_lease(&holder).await {
        tracing::warn!("failed to release instance lease: {e:#}");
    }
    result
}

async fn run_locally(config: &Config, request: ControlRequest) -> Result<()> {
    let admin = admin(config).await?;
    match request {
        ControlRequest::Configure(policy) => {
            println!(
                "Channel {} configured with max messages: {}, keep pinned: {}",
                policy.channel_id, policy.max_messages, policy.keep_pinned
            );
            println!("Starting initial cleanup...");
            let (_, outcome) = admin
                .configure(
                    &policy.server_id,
                    &policy.channel_id,
                    policy.max_messages,
                    policy.keep_pinned,
                )
                .await?;
            print_outcome(&outcome);
        }
        ControlRequest::Remove {
            server_id,
            channel_id,
        } => {
            if admin.remove(&server_id, &channel_id).await? {
                println!("Channel {channel_id} removed from management");
            } else {
                println!("Channel {channel_id} was not being managed");
            }
        }
        ControlRequest::Enforce {
            server_id,
            channel_id,
        } => match admin.enforce(&server_id, &channel_id).await? {
            Some(outcome) => print_outcome(&outcome),
            None => println!("Channel {channel_id} is not managed"),
        },
    }
    Ok(())
}
