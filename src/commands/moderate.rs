use anyhow::Result;
use tracing::info;

use crate::cli::{BlockArgs, ChannelArgs, DenyArgs, HostArgs};
use crate::commands::{acquire_admin_lock, open_stores, resolve_paths};
use crate::pipeline::moderation::{allow_host, block_channel, deny_host, purge_host, unblock_channel};

/// Denylists a host. Its rows leave production at the next merge, or right
/// away with `--purge`.
pub fn deny(args: DenyArgs) -> Result<()> {
    let paths = resolve_paths(&args.store);
    let mut stores = open_stores(&paths)?;
    deny_host(&stores.connection, &args.host, args.reason.as_deref())?;

    if args.purge {
        let lock = acquire_admin_lock(&paths, args.lock_path.as_ref(), "deny")?;
        let counts = purge_host(&mut stores, &args.host)?;
        lock.release()?;
        info!(host = %args.host, rows = counts.total(), "denied host purged");
    } else {
        info!(host = %args.host, "denied host will be purged by the next run");
    }
    Ok(())
}

pub fn allow(args: HostArgs) -> Result<()> {
    let stores = open_stores(&resolve_paths(&args.store))?;
    if allow_host(&stores.connection, &args.host)? {
        info!(host = %args.host, "host removed from denylist");
    }
    Ok(())
}

pub fn block(args: BlockArgs) -> Result<()> {
    let stores = open_stores(&resolve_paths(&args.store))?;
    block_channel(&stores.connection, &args.channel_id, args.reason.as_deref())?;
    Ok(())
}

pub fn unblock(args: ChannelArgs) -> Result<()> {
    let stores = open_stores(&resolve_paths(&args.store))?;
    if unblock_channel(&stores.connection, &args.channel_id)? {
        info!(channel_id = %args.channel_id, "channel unblocked");
    }
    Ok(())
}
