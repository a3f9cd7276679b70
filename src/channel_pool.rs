//! Pooled publish channels, scoped to one connection epoch.
//!
//! The facade builds a fresh pool every time it dials, so the pool's
//! lifetime is the connection's lifetime. Channels come up with
//! publisher confirms selected, which lets confirm-mode publishes await
//! the broker ack on whichever channel they were handed. Before a
//! checked-in channel is handed out again it is vetted against both its
//! own state and the connection's: after a broker failure a channel can
//! still claim to be connected while the socket underneath it is gone,
//! and those must not leak back into circulation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use deadpool::managed;
use lapin::options::ConfirmSelectOptions;
use tracing::debug;

use crate::error::Error;

/// A channel checked out of the pool; returned on drop. Derefs to
/// [`lapin::Channel`].
pub(crate) type PooledChannel = managed::Object<ChannelManager>;

/// Pool of confirm-capable channels for declarations and publishes.
#[derive(Debug, Clone)]
pub(crate) struct ChannelPool {
    pool: managed::Pool<ChannelManager>,
}

impl ChannelPool {
    /// Builds the pool for one freshly dialed connection.
    pub fn new(conn: Arc<lapin::Connection>) -> Result<Self, Error> {
        let manager = ChannelManager {
            conn,
            opened: AtomicUsize::new(0),
        };
        let pool = managed::Pool::builder(manager)
            .build()
            .map_err(|err| Error::Connection(err.into()))?;
        Ok(Self { pool })
    }

    /// Checks out a channel, opening a new one when none is idle.
    pub async fn get(&self) -> Result<PooledChannel, Error> {
        self.pool
            .get()
            .await
            .map_err(|err| Error::Connection(anyhow::anyhow!("no usable channel: {err}")))
    }
}

/// Opens and vets channels on behalf of the pool.
#[derive(Debug)]
pub(crate) struct ChannelManager {
    conn: Arc<lapin::Connection>,
    /// Channels opened over this epoch, for lifecycle debugging.
    opened: AtomicUsize,
}

#[async_trait]
impl managed::Manager for ChannelManager {
    type Type = lapin::Channel;
    type Error = lapin::Error;

    async fn create(&self) -> Result<lapin::Channel, lapin::Error> {
        let channel = self.conn.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        let opened = self.opened.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(id = channel.id(), opened, "opened publish channel");
        Ok(channel)
    }

    async fn recycle(
        &self,
        channel: &mut lapin::Channel,
    ) -> Result<(), managed::RecycleError<lapin::Error>> {
        if !self.conn.status().connected() {
            return Err(managed::RecycleError::StaticMessage(
                "connection is no longer usable",
            ));
        }
        match channel.status().state() {
            lapin::ChannelState::Connected => Ok(()),
            state => Err(managed::RecycleError::Message(format!(
                "channel is {state:?}, discarding"
            ))),
        }
    }
}
