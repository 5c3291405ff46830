//! Flow type registration
//!
//! Checkpoints carry only a flow name and serialized state. The registry
//! maps names back to decoders for recovery, and protocol names to the
//! responder flows started by incoming session requests.

use crate::logic::{decode_logic, DynFlowLogic, FlowLogic, ResponderFlow, SessionRef};
use std::collections::HashMap;
use strand_core::{FlowError, FlowResult, PartyName, ProtocolDescriptor};

type LogicDecoder = fn(&[u8]) -> FlowResult<Box<dyn DynFlowLogic>>;
type ResponderFactory = fn(SessionRef, PartyName) -> Box<dyn DynFlowLogic>;

fn construct_responder<F: ResponderFlow>(
    session: SessionRef,
    counterparty: PartyName,
) -> Box<dyn DynFlowLogic> {
    Box::new(F::respond_to(session, counterparty))
}

/// A responder flow registered for a protocol
#[derive(Clone)]
pub struct RegisteredResponder {
    /// Protocol versions the responder accepts
    pub protocol: ProtocolDescriptor,
    /// Flow name of the responder
    pub flow_name: &'static str,
    factory: ResponderFactory,
}

impl RegisteredResponder {
    /// Construct a responder for an accepted session
    pub fn instantiate(&self, session: SessionRef, counterparty: PartyName) -> Box<dyn DynFlowLogic> {
        (self.factory)(session, counterparty)
    }
}

impl std::fmt::Debug for RegisteredResponder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredResponder")
            .field("protocol", &self.protocol)
            .field("flow_name", &self.flow_name)
            .finish()
    }
}

/// Known flow types of a node
#[derive(Default)]
pub struct FlowRegistry {
    decoders: HashMap<&'static str, LogicDecoder>,
    responders: HashMap<String, RegisteredResponder>,
}

impl FlowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `F` recoverable from checkpoints
    pub fn register<F: FlowLogic>(&mut self) -> &mut Self {
        self.decoders.insert(F::NAME, decode_logic::<F>);
        self
    }

    /// Register `F` as the responder for its protocol
    pub fn register_responder<F: ResponderFlow>(&mut self) -> &mut Self {
        self.register::<F>();
        let protocol = F::initiated_by();
        self.responders.insert(
            protocol.name.clone(),
            RegisteredResponder {
                protocol,
                flow_name: F::NAME,
                factory: construct_responder::<F>,
            },
        );
        self
    }

    /// Whether a flow name is known
    pub fn contains(&self, flow_name: &str) -> bool {
        self.decoders.contains_key(flow_name)
    }

    /// Rehydrate checkpointed logic
    pub fn decode(&self, flow_name: &str, state: &[u8]) -> FlowResult<Box<dyn DynFlowLogic>> {
        let decoder = self
            .decoders
            .get(flow_name)
            .ok_or_else(|| FlowError::internal(format!("unknown flow {flow_name}")))?;
        decoder(state)
    }

    /// Responder registered for `protocol`
    pub fn responder(&self, protocol: &str) -> Option<&RegisteredResponder> {
        self.responders.get(protocol)
    }
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut flows: Vec<&str> = self.decoders.keys().copied().collect();
        flows.sort_unstable();
        f.debug_struct("FlowRegistry")
            .field("flows", &flows)
            .field("responders", &self.responders.len())
            .finish()
    }
}
