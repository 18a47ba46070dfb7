//! Discovery listener — turns a local-network discovery transport into a
//! lazy, cancellable sequence of membership events.
//!
//! The listener filters self-sightings, suppresses repeats of an unchanged
//! descriptor, and reopens the transport with bounded backoff after errors.
//! It only ends when the shutdown channel fires.
//!
//! "Unchanged" is judged against the listener's own memory of what it last
//! emitted, or, once `track_membership` is set, against what the membership
//! holds right now. `reconcile` uses the latter, so an entry changed behind
//! the listener's back (a join, a `remove`) is corrected by the next
//! announcement.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast;

use cairn_core::{InstanceId, NodeIdentity, PeerDescriptor};

use crate::backoff::Backoff;
use crate::connection::ConnectionFactory;
use crate::registry::{PeerRegistry, UpsertOutcome};

/// One thing discovery learned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer announced itself at this address.
    Sighted(PeerDescriptor),
    /// A peer announced it is leaving. `instance` identifies the process
    /// that said goodbye, when the transport knows it.
    Departed {
        name: String,
        instance: Option<InstanceId>,
    },
}

/// Current membership entry for a name, as seen by whoever consumes events.
type MembershipLookup = Box<dyn Fn(&str) -> Option<PeerDescriptor> + Send + Sync>;

/// Source of raw discovery events, already scoped to our service tag.
///
/// `recv` errors are treated as transient: the listener waits out a backoff
/// delay and calls `open` again before the next `recv`.
pub trait DiscoveryTransport: Send + 'static {
    fn open(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    fn recv(&mut self) -> impl Future<Output = io::Result<DiscoveryEvent>> + Send;
}

pub struct DiscoveryListener<T: DiscoveryTransport> {
    transport: T,
    local: Arc<NodeIdentity>,
    backoff: Backoff,
    shutdown: broadcast::Receiver<()>,
    /// Last descriptor emitted per name.
    known: HashMap<String, PeerDescriptor>,
    membership: Option<MembershipLookup>,
    open: bool,
    stopped: bool,
}

impl<T: DiscoveryTransport> DiscoveryListener<T> {
    pub fn new(
        transport: T,
        local: Arc<NodeIdentity>,
        backoff: Backoff,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            transport,
            local,
            backoff,
            shutdown,
            known: HashMap::new(),
            membership: None,
            open: false,
            stopped: false,
        }
    }

    /// Judge repeats against `lookup` instead of the listener's own memory.
    pub fn track_membership<L>(mut self, lookup: L) -> Self
    where
        L: Fn(&str) -> Option<PeerDescriptor> + Send + Sync + 'static,
    {
        self.membership = Some(Box::new(lookup));
        self
    }

    /// Next event worth reporting. `None` once shutdown has been signalled.
    pub async fn next(&mut self) -> Option<DiscoveryEvent> {
        loop {
            if self.stopped {
                return None;
            }

            if !self.open {
                let opened = tokio::select! {
                    _ = self.shutdown.recv() => {
                        self.stop();
                        return None;
                    }
                    result = self.transport.open() => result,
                };
                match opened {
                    Ok(()) => {
                        self.open = true;
                        tracing::info!(
                            failures = self.backoff.failures(),
                            "discovery transport open"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "discovery open failed");
                        self.pause().await;
                        continue;
                    }
                }
            }

            let received = tokio::select! {
                _ = self.shutdown.recv() => {
                    self.stop();
                    return None;
                }
                result = self.transport.recv() => result,
            };

            match received {
                Ok(event) => {
                    self.backoff.reset();
                    if let Some(event) = self.filter(event) {
                        return Some(event);
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "discovery receive failed, restarting");
                    self.open = false;
                    self.pause().await;
                }
            }
        }
    }

    /// The same sequence as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = DiscoveryEvent> + Send {
        futures::stream::unfold(self, |mut listener| async move {
            listener.next().await.map(|event| (event, listener))
        })
    }

    fn filter(&mut self, event: DiscoveryEvent) -> Option<DiscoveryEvent> {
        match event {
            DiscoveryEvent::Sighted(peer) => {
                if self.local.is_self(&peer) {
                    tracing::trace!(peer = %peer.name, "own announcement");
                    return None;
                }
                if self.last_known(&peer.name).as_ref() == Some(&peer) {
                    return None;
                }
                tracing::debug!(peer = %peer.name, addr = %peer.addr, "peer sighted");
                self.known.insert(peer.name.clone(), peer.clone());
                Some(DiscoveryEvent::Sighted(peer))
            }
            DiscoveryEvent::Departed { name, instance } => {
                if name == self.local.name() {
                    return None;
                }
                let registered = self.last_known(&name).and_then(|p| p.instance);
                if let (Some(registered), Some(leaving)) = (registered, instance) {
                    if registered != leaving {
                        tracing::debug!(peer = %name, "departure from a previous instance");
                        return None;
                    }
                }
                self.known.remove(&name);
                tracing::debug!(peer = %name, "peer departing");
                Some(DiscoveryEvent::Departed { name, instance })
            }
        }
    }

    fn last_known(&self, name: &str) -> Option<PeerDescriptor> {
        match &self.membership {
            Some(lookup) => lookup(name),
            None => self.known.get(name).cloned(),
        }
    }

    /// Sleep out the next backoff delay, or stop early on shutdown.
    async fn pause(&mut self) {
        let delay = self.backoff.next_delay();
        tokio::select! {
            _ = self.shutdown.recv() => self.stop(),
            _ = tokio::time::sleep(delay) => {}
        }
    }

    fn stop(&mut self) {
        if !self.stopped {
            tracing::info!("discovery listener stopping");
        }
        self.stopped = true;
    }
}

/// Feed every discovery event into the registry until the listener stops.
pub async fn reconcile<T, F>(listener: DiscoveryListener<T>, registry: Arc<PeerRegistry<F>>)
where
    T: DiscoveryTransport,
    F: ConnectionFactory,
{
    let mut listener = {
        let registry = registry.clone();
        listener.track_membership(move |name| registry.get(name).map(|p| p.descriptor()))
    };

    while let Some(event) = listener.next().await {
        match event {
            DiscoveryEvent::Sighted(peer) => {
                let name = peer.name.clone();
                if registry.upsert(peer).await == UpsertOutcome::Ignored {
                    tracing::debug!(peer = %name, "sighting ignored by registry");
                }
            }
            DiscoveryEvent::Departed { name, instance } => {
                registry.depart(&name, instance).await;
            }
        }
    }
}
