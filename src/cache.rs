//! One native channel per PV name.
//!
//! Every [`Channel`](crate::Channel) for the same name shares the native channel
//! held here. Each holder takes a reference with [`NativeChannelCache::get_channel`]
//! and gives it back with [`NativeChannelCache::release`]; the native channel is
//! destroyed when the last holder releases it, and a later request creates a
//! fresh one.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex},
};

use tracing::{debug, trace};

use crate::{
    error::ConnectionError,
    transport::{NativeChannel, Transport},
    utils::lock,
};

struct CacheEntry {
    channel: Arc<dyn NativeChannel>,
    holders: usize,
}

pub struct NativeChannelCache {
    transport: Arc<dyn Transport>,
    channels: Mutex<HashMap<String, CacheEntry>>,
}

impl NativeChannelCache {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        NativeChannelCache {
            transport,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// The live native channel for `name`, created if there is none
    pub fn get_channel(&self, name: &str) -> Result<Arc<dyn NativeChannel>, ConnectionError> {
        let mut channels = lock(&self.channels);
        if let Some(entry) = channels.get_mut(name) {
            entry.holders += 1;
            trace!("Reusing native channel for {name} ({} holders)", entry.holders);
            return Ok(entry.channel.clone());
        }
        let channel =
            self.transport
                .create_channel(name)
                .map_err(|condition| ConnectionError::CreateFailed {
                    name: name.to_owned(),
                    condition,
                })?;
        debug!("Created native channel for {name}");
        channels.insert(
            name.to_owned(),
            CacheEntry {
                channel: channel.clone(),
                holders: 1,
            },
        );
        Ok(channel)
    }

    /// Give back one reference. The last release destroys the native channel.
    pub fn release(&self, name: &str) {
        let released = {
            let mut channels = lock(&self.channels);
            let Some(entry) = channels.get_mut(name) else {
                return;
            };
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders > 0 {
                return;
            }
            channels.remove(name)
        };
        if let Some(entry) = released {
            debug!("Destroying native channel for {name}");
            entry.channel.destroy();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.channels).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.channels).contains_key(name)
    }

    /// Destroy every native channel, whoever holds it
    pub fn clear(&self) {
        let drained: Vec<_> = lock(&self.channels).drain().collect();
        for (name, entry) in drained {
            trace!("Destroying native channel for {name}");
            entry.channel.destroy();
        }
    }
}

impl fmt::Debug for NativeChannelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeChannelCache")
            .field("transport", &self.transport.name())
            .field("channels", &self.len())
            .finish()
    }
}
