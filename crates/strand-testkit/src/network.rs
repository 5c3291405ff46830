//! In-memory peer network
//!
//! Routes envelopes between nodes in one process. Delivery is immediate:
//! `send_envelope` returns after the receiving node has processed the
//! envelope. Tests steer delivery by holding a party's inbound traffic,
//! releasing it one envelope or one sender at a time, detaching a crashed node and
//! re-delivering envelopes to provoke duplicates.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use strand_core::{
    Envelope, EnvelopeHandler, IdentityEffects, IdentityError, NetworkIdentity, PartyName,
    TransportEffects, TransportError,
};

/// One envelope handed to the network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEnvelope {
    /// Destination party
    pub to: PartyName,
    /// The envelope as handed off
    pub envelope: Envelope,
}

#[derive(Default)]
struct NetworkState {
    handlers: HashMap<PartyName, Weak<dyn EnvelopeHandler>>,
    known: HashSet<PartyName>,
    held: HashSet<PartyName>,
    queued: HashMap<PartyName, VecDeque<Envelope>>,
    sent: Vec<SentEnvelope>,
}

/// Shared in-memory network
///
/// Cloning yields another handle to the same network.
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    /// Empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `party` addressable before any node is attached for it
    pub fn register(&self, party: impl Into<PartyName>) {
        self.state.lock().known.insert(party.into());
    }

    /// Route envelopes addressed to `party` to `handler`
    ///
    /// Replaces a previous attachment. Only a weak reference is kept, so
    /// dropping the node detaches it implicitly.
    pub fn attach(&self, party: impl Into<PartyName>, handler: &Arc<dyn EnvelopeHandler>) {
        let party = party.into();
        let mut state = self.state.lock();
        state.known.insert(party.clone());
        state.handlers.insert(party, Arc::downgrade(handler));
    }

    /// Stop delivering to `party`; envelopes queue until it is re-attached
    /// and [`release`](Self::release)d
    pub fn detach(&self, party: &PartyName) {
        self.state.lock().handlers.remove(party);
    }

    /// Queue envelopes addressed to `party` instead of delivering them
    pub fn hold(&self, party: impl Into<PartyName>) {
        self.state.lock().held.insert(party.into());
    }

    /// Deliver the oldest queued envelope for `party` and return a copy
    ///
    /// Returns `None` when nothing is queued or no node is attached.
    pub async fn release_next(&self, party: &PartyName) -> Option<Envelope> {
        let (handler, envelope) = {
            let mut state = self.state.lock();
            let handler = state.handlers.get(party).and_then(Weak::upgrade)?;
            let envelope = state.queued.get_mut(party).and_then(VecDeque::pop_front)?;
            (handler, envelope)
        };
        handler.deliver(envelope.clone()).await;
        Some(envelope)
    }

    /// Stop holding `party` and deliver everything queued for it, in order
    ///
    /// Returns the number of envelopes delivered.
    pub async fn release(&self, party: &PartyName) -> usize {
        self.state.lock().held.remove(party);
        let mut delivered = 0;
        while self.release_next(party).await.is_some() {
            delivered += 1;
        }
        delivered
    }

    /// Deliver, in order, only the queued envelopes `sender` sent to `party`
    ///
    /// Envelopes from other senders stay queued. Returns the number
    /// delivered.
    pub async fn release_from(&self, party: &PartyName, sender: &PartyName) -> usize {
        let (handler, selected) = {
            let mut state = self.state.lock();
            let Some(handler) = state.handlers.get(party).and_then(Weak::upgrade) else {
                return 0;
            };
            let Some(queue) = state.queued.get_mut(party) else {
                return 0;
            };
            let (selected, rest): (VecDeque<Envelope>, VecDeque<Envelope>) =
                queue.drain(..).partition(|e| &e.sender == sender);
            *queue = rest;
            (handler, selected)
        };
        let delivered = selected.len();
        for envelope in selected {
            handler.deliver(envelope).await;
        }
        delivered
    }

    /// Envelopes waiting for `party`
    pub fn queued(&self, party: &PartyName) -> usize {
        self.state
            .lock()
            .queued
            .get(party)
            .map_or(0, VecDeque::len)
    }

    /// Every envelope handed to the network so far
    pub fn sent(&self) -> Vec<SentEnvelope> {
        self.state.lock().sent.clone()
    }

    /// Envelopes handed to the network for `party`
    pub fn sent_to(&self, party: &PartyName) -> Vec<Envelope> {
        self.state
            .lock()
            .sent
            .iter()
            .filter(|sent| &sent.to == party)
            .map(|sent| sent.envelope.clone())
            .collect()
    }

    /// Deliver `envelope` to `party` again, bypassing holds
    pub async fn redeliver(&self, party: &PartyName, envelope: Envelope) -> bool {
        let handler = self.state.lock().handlers.get(party).and_then(Weak::upgrade);
        match handler {
            Some(handler) => {
                handler.deliver(envelope).await;
                true
            }
            None => false,
        }
    }

    /// Transport handle for nodes on this network
    pub fn transport(&self) -> Arc<dyn TransportEffects> {
        Arc::new(self.clone())
    }

    /// Address book resolving every party known to this network
    pub fn directory(&self) -> Arc<dyn IdentityEffects> {
        Arc::new(self.clone())
    }

    async fn route(&self, to: &PartyName, envelope: Envelope) -> Result<(), TransportError> {
        let handler = {
            let mut state = self.state.lock();
            if !state.known.contains(to) {
                return Err(TransportError::Unreachable {
                    peer: to.to_string(),
                });
            }
            state.sent.push(SentEnvelope {
                to: to.clone(),
                envelope: envelope.clone(),
            });
            let handler = if state.held.contains(to) {
                None
            } else {
                state.handlers.get(to).and_then(Weak::upgrade)
            };
            if handler.is_none() {
                state
                    .queued
                    .entry(to.clone())
                    .or_default()
                    .push_back(envelope.clone());
                tracing::trace!(%to, sequence = envelope.sequence, "Envelope queued");
            }
            handler
        };
        if let Some(handler) = handler {
            handler.deliver(envelope).await;
        }
        Ok(())
    }
}

#[async_trait]
impl TransportEffects for InMemoryNetwork {
    async fn send_envelope(
        &self,
        to: &NetworkIdentity,
        envelope: Envelope,
    ) -> Result<(), TransportError> {
        self.route(&to.party, envelope).await
    }
}

impl IdentityEffects for InMemoryNetwork {
    fn resolve(&self, party: &PartyName) -> Result<NetworkIdentity, IdentityError> {
        if self.state.lock().known.contains(party) {
            Ok(NetworkIdentity::new(party.clone(), format!("memory://{party}")))
        } else {
            Err(IdentityError::UnknownParty {
                party: party.clone(),
            })
        }
    }
}

impl std::fmt::Debug for InMemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryNetwork")
            .field("parties", &state.known)
            .field("held", &state.held)
            .field("sent", &state.sent.len())
            .finish_non_exhaustive()
    }
}
