//! Daemon lifecycle: bootstrap the group, then serve peers until shutdown.

use crate::channel::{ChannelFactory, ConnectOptions, FactoryRegistry};
use crate::config::Config;
use crate::error::ConfigError;
use crate::handshake::{request_group, GroupService, HandshakeError};
use crate::membership::MembershipService;
use crate::params::{ChannelPurpose, InstanceContext, InstanceParams};
use crate::store::{HexFileStore, SnapshotStore};
use anyhow::{bail, Context, Result};
use repgroup_shared::{GroupMembership, NodeDescriptor};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Build the configured factory for `purpose`.
pub fn build_factory(
    config: &Config,
    purpose: ChannelPurpose,
    registry: &FactoryRegistry,
) -> Result<Arc<dyn ChannelFactory>, ConfigError> {
    let context = InstanceContext::new(purpose, Arc::new(config.channel.clone()));
    let params = InstanceParams::new(context, config.channel.factory_params.clone());
    registry.build(&config.channel.factory, &params)
}

/// Descriptor this node announces for itself
pub fn local_node(config: &Config) -> NodeDescriptor {
    NodeDescriptor::new(
        config.node.name.clone(),
        config.node.node_type,
        config.node.advertise_host(),
        config.node.listen.port(),
    )
    .with_software_version(env!("CARGO_PKG_VERSION"))
}

/// Ask each helper in turn to admit this node and return the group.
async fn fetch_from_helpers(config: &Config, factory: &dyn ChannelFactory) -> Result<Option<GroupMembership>> {
    let options = ConnectOptions::from_config(&config.channel);
    let node = local_node(config);
    for helper in &config.node.helpers {
        let channel = match factory.connect(helper, &options).await {
            Ok(channel) => channel,
            Err(e) => {
                warn!("helper {} unreachable: {}", helper, e);
                continue;
            }
        };
        let result = request_group(channel.clone(), config.membership.stream_version, &node).await;
        let _ = channel.close().await;
        match result {
            Ok(group) => {
                info!("✓ Fetched group {} from helper {}", group.name(), helper);
                return Ok(Some(group));
            }
            // version mismatches need an operator, not another helper
            Err(e @ HandshakeError::Refused { .. }) => {
                return Err(e).with_context(|| format!("helper {} refused to share the group", helper));
            }
            Err(e) => warn!("helper {} failed: {}", helper, e),
        }
    }
    Ok(None)
}

/// Stored group, else one fetched from a helper, else a new group.
pub async fn bootstrap_group(
    config: &Config,
    factory: &dyn ChannelFactory,
    store: Arc<dyn SnapshotStore>,
) -> Result<MembershipService> {
    let group = match store.load().context("failed to load stored group")? {
        Some(group) => {
            if group.name() != config.node.group {
                bail!(
                    "stored group is {} but this node is configured for {}",
                    group.name(),
                    config.node.group
                );
            }
            info!("✓ Loaded group {} (change {})", group.name(), group.change_version());
            group
        }
        None => match fetch_from_helpers(config, factory).await? {
            Some(group) => {
                store.save(&group).context("failed to store fetched group")?;
                group
            }
            None if !config.node.helpers.is_empty() => {
                bail!("no helper could provide group {}", config.node.group)
            }
            None => {
                info!("Creating new group {}", config.node.group);
                GroupMembership::new(config.node.group.clone(), config.membership.format_version)
            }
        },
    };

    let service = MembershipService::new(group, store);

    if service.snapshot().format_version() != config.membership.format_version {
        service
            .set_format_version(config.membership.format_version)
            .context("cannot convert group to the configured format version")?;
    }
    if service.snapshot().get(&config.node.name).is_none() {
        service
            .add_node(local_node(config))
            .context("failed to add local node to the group")?;
    }
    Ok(service)
}

/// Accept peers until `shutdown` resolves, one task per connection.
pub async fn serve<F>(
    listener: TcpListener,
    factory: Arc<dyn ChannelFactory>,
    service: Arc<GroupService>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        continue;
                    }
                };
                let factory = factory.clone();
                let service = service.clone();
                tokio::spawn(async move {
                    let channel = match factory.accept_channel(stream).await {
                        Ok(channel) => channel,
                        Err(e) => {
                            warn!("✗ Connection from {} refused: {}", addr, e);
                            return;
                        }
                    };
                    if let Err(e) = service.serve(channel).await {
                        debug!("session with {} ended: {}", addr, e);
                    }
                });
            }
            _ = &mut shutdown => {
                info!("Shutting down listener");
                return Ok(());
            }
        }
    }
}

pub async fn run(config: Config) -> Result<()> {
    let registry = FactoryRegistry::with_builtins();
    let factory = build_factory(&config, ChannelPurpose::GroupService, &registry)
        .context("failed to build channel factory")?;

    let store: Arc<dyn SnapshotStore> = Arc::new(HexFileStore::new(&config.node.data_dir));
    let membership = Arc::new(bootstrap_group(&config, factory.as_ref(), store).await?);
    let group = membership.snapshot();
    info!(
        "✓ Group {} ready: {} members, format {}",
        group.name(),
        group.members().count(),
        group.format_version()
    );

    let service = Arc::new(GroupService::new(membership, config.membership.require_trusted_peers));
    let listener = TcpListener::bind(config.node.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.node.listen))?;
    info!("✓ Listening on {} ({} channels)", config.node.listen, factory.name());

    serve(listener, factory, service, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {}", e);
        }
    })
    .await
}
