//! Hands out one shared [`Channel`] per PV name.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use tracing::trace;

use crate::{
    channel::Channel,
    context::{Context, ContextConfig},
    utils::lock,
};

#[derive(Debug)]
pub struct ChannelFactory {
    context: Context,
    channels: Mutex<HashMap<String, Arc<Channel>>>,
}

impl ChannelFactory {
    pub fn new(context: Context) -> Self {
        ChannelFactory {
            context,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// A factory on a fresh context configured from the environment
    pub fn from_env() -> Self {
        Self::new(Context::new(ContextConfig::from_env()))
    }

    /// The channel for `name`. Asking twice for the same name gives the
    /// same channel.
    pub fn channel_for(&self, name: &str) -> Arc<Channel> {
        lock(&self.channels)
            .entry(name.to_owned())
            .or_insert_with(|| {
                trace!("Factory creating channel for {name}");
                Channel::new(name, &self.context)
            })
            .clone()
    }

    /// Start the context and check that it answers
    pub fn init(&self) -> bool {
        self.context.init()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{InprocBus, InprocTransport};

    #[test]
    fn same_name_same_channel() {
        let factory = ChannelFactory::new(Context::with_transport(
            Arc::new(InprocTransport::new(InprocBus::new())),
            ContextConfig::from_env(),
        ));
        let a = factory.channel_for("PV:A");
        let b = factory.channel_for("PV:A");
        let c = factory.channel_for("PV:B");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.channel_count(), 2);
        assert_eq!(factory.context().ref_count(), 2);
        assert!(factory.init());
    }
}
