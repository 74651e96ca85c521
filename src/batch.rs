//! Fetch the current record of many channels at once.
//!
//! A [`BatchGetRequest`] issues one get per channel as soon as that channel
//! is connected, without blocking on any single one, then waits once for all
//! of them. Every channel ends up with either a record or an error: channels
//! still outstanding when the wait times out are reported as timed out.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, PoisonError, Weak},
    time::Duration,
};

use tracing::{debug, trace};

use crate::{
    channel::{Channel, ConnectionEvent, GetListener},
    error::GetError,
    pending::on_transport_thread,
    records::{ChannelRecord, ChannelTimeRecord},
    transport::ListenerId,
    utils::lock,
};

/// A record flavor that a batch can fetch
pub trait BatchRecord: Clone + Send + 'static {
    /// Issue an asynchronous get on a connected channel
    fn request(channel: &Channel, listener: GetListener<Self>) -> Result<(), GetError>;
}

impl BatchRecord for ChannelRecord {
    fn request(channel: &Channel, listener: GetListener<Self>) -> Result<(), GetError> {
        channel.get_value_callback(Some(listener))
    }
}

impl BatchRecord for ChannelTimeRecord {
    fn request(channel: &Channel, listener: GetListener<Self>) -> Result<(), GetError> {
        channel.get_value_time_callback(Some(listener))
    }
}

struct Progress<R> {
    /// Bumped by every submit and timeout, so that late results are ignored
    generation: u64,
    /// Outstanding channels, and whether their get has been issued
    pending: HashMap<String, bool>,
    records: HashMap<String, R>,
    errors: HashMap<String, GetError>,
}

struct Shared<R> {
    progress: Mutex<Progress<R>>,
    complete: Condvar,
}

impl<R: BatchRecord> Shared<R> {
    fn finish(&self, generation: u64, name: &str, result: Result<R, GetError>) {
        let mut progress = lock(&self.progress);
        if progress.generation != generation || progress.pending.remove(name).is_none() {
            trace!("{name}: ignoring stale batch result");
            return;
        }
        match result {
            Ok(record) => {
                progress.records.insert(name.to_owned(), record);
            }
            Err(e) => {
                debug!("{name}: batch get failed: {e}");
                progress.errors.insert(name.to_owned(), e);
            }
        }
        if progress.pending.is_empty() {
            self.complete.notify_all();
        }
    }

    /// Issue the get for `channel` unless it has already been issued
    fn issue(self: &Arc<Self>, channel: &Channel, generation: u64) {
        let name = channel.channel_name().to_owned();
        {
            let mut progress = lock(&self.progress);
            if progress.generation != generation {
                return;
            }
            match progress.pending.get_mut(&name) {
                Some(issued) if !*issued => *issued = true,
                _ => return,
            }
        }
        let shared = self.clone();
        let listener: GetListener<R> = {
            let name = name.clone();
            Box::new(move |result| shared.finish(generation, &name, result))
        };
        if let Err(e) = R::request(channel, listener) {
            self.finish(generation, &name, Err(e));
        }
    }
}

/// A get of the same record flavor across many channels
///
/// Channels are keyed by name; adding a second channel with a name already
/// in the batch does nothing.
pub struct BatchGetRequest<R: BatchRecord = ChannelRecord> {
    channels: Vec<Arc<Channel>>,
    shared: Arc<Shared<R>>,
    listeners: Mutex<Vec<(Arc<Channel>, ListenerId)>>,
}

impl<R: BatchRecord> BatchGetRequest<R> {
    pub fn new(channels: &[Arc<Channel>]) -> Self {
        let mut batch = BatchGetRequest {
            channels: Vec::with_capacity(channels.len()),
            shared: Arc::new(Shared {
                progress: Mutex::new(Progress {
                    generation: 0,
                    pending: HashMap::new(),
                    records: HashMap::new(),
                    errors: HashMap::new(),
                }),
                complete: Condvar::new(),
            }),
            listeners: Mutex::new(Vec::new()),
        };
        for channel in channels {
            batch.add_channel(channel.clone());
        }
        batch
    }

    pub fn add_channel(&mut self, channel: Arc<Channel>) {
        if !self
            .channels
            .iter()
            .any(|c| c.channel_name() == channel.channel_name())
        {
            self.channels.push(channel);
        }
    }

    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    fn detach_listeners(&self) {
        for (channel, id) in lock(&self.listeners).drain(..) {
            channel.remove_connection_listener(id);
        }
    }

    /// Start fetching. Connected channels are requested immediately and the
    /// rest as soon as they connect. Results of an earlier submit are
    /// discarded.
    pub fn submit(&self) {
        self.detach_listeners();
        let generation = {
            let mut progress = lock(&self.shared.progress);
            progress.generation += 1;
            progress.records.clear();
            progress.errors.clear();
            progress.pending = self
                .channels
                .iter()
                .map(|c| (c.channel_name().to_owned(), false))
                .collect();
            progress.generation
        };
        debug!("Submitting batch get over {} channels", self.channels.len());

        for channel in &self.channels {
            let weak: Weak<Channel> = Arc::downgrade(channel);
            let shared = self.shared.clone();
            // Fires straight away for channels that are already connected
            let id = channel.add_connection_listener(move |event| {
                if event == ConnectionEvent::Made
                    && let Some(channel) = weak.upgrade()
                {
                    shared.issue(&channel, generation);
                }
            });
            lock(&self.listeners).push((channel.clone(), id));
            if !channel.is_connected()
                && let Err(e) = channel.request_connection()
            {
                self.shared
                    .finish(generation, channel.channel_name(), Err(e.into()));
            }
        }
        if self.shared.complete_now() {
            self.detach_listeners();
        }
    }

    /// Wait until every channel has a record or an error.
    ///
    /// On timeout the channels still outstanding are recorded as
    /// [`GetError::Timeout`] and false is returned. Waiting is refused on
    /// transport threads.
    pub fn wait_for_completion(&self, timeout: Duration) -> bool {
        if on_transport_thread() {
            return self.is_complete();
        }
        let progress = lock(&self.shared.progress);
        let (mut progress, _) = self
            .shared
            .complete
            .wait_timeout_while(progress, timeout, |p| !p.pending.is_empty())
            .unwrap_or_else(PoisonError::into_inner);
        let completed = progress.pending.is_empty();
        if !completed {
            progress.generation += 1;
            let timed_out: Vec<String> = progress.pending.drain().map(|(name, _)| name).collect();
            debug!("Batch get timed out on {} channels", timed_out.len());
            for name in timed_out {
                progress
                    .errors
                    .insert(name.clone(), GetError::Timeout { name });
            }
        }
        drop(progress);
        self.detach_listeners();
        completed
    }

    /// [`BatchGetRequest::submit`], then [`BatchGetRequest::wait_for_completion`]
    pub fn submit_and_wait(&self, timeout: Duration) -> bool {
        self.submit();
        self.wait_for_completion(timeout)
    }

    pub fn is_complete(&self) -> bool {
        lock(&self.shared.progress).pending.is_empty()
    }

    pub fn record(&self, name: &str) -> Option<R> {
        lock(&self.shared.progress).records.get(name).cloned()
    }

    pub fn error(&self, name: &str) -> Option<GetError> {
        lock(&self.shared.progress).errors.get(name).cloned()
    }

    pub fn record_count(&self) -> usize {
        lock(&self.shared.progress).records.len()
    }

    pub fn error_count(&self) -> usize {
        lock(&self.shared.progress).errors.len()
    }

    pub fn has_errors(&self) -> bool {
        self.error_count() > 0
    }

    /// Names of channels that produced a record, sorted
    pub fn result_channels(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.shared.progress).records.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of channels that failed, sorted
    pub fn failed_channels(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.shared.progress).errors.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<R> Shared<R> {
    fn complete_now(&self) -> bool {
        lock(&self.progress).pending.is_empty()
    }
}

impl<R: BatchRecord> Drop for BatchGetRequest<R> {
    fn drop(&mut self) {
        self.detach_listeners();
    }
}

impl<R: BatchRecord> std::fmt::Debug for BatchGetRequest<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let progress = lock(&self.shared.progress);
        f.debug_struct("BatchGetRequest")
            .field("channels", &self.channels.len())
            .field("pending", &progress.pending.len())
            .field("records", &progress.records.len())
            .field("errors", &progress.errors.len())
            .finish()
    }
}
