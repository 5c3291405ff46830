//! Business-logic contract
//!
//! A flow is an explicit, serializable state value. The machine calls
//! [`FlowLogic::step`] with whatever resumed it; the step runs to its next
//! suspension point without blocking and returns either the wait it
//! suspends on or the flow's output. Because the state value is the whole
//! continuation, checkpointing a flow is serializing it.
//!
//! Steps must be deterministic given `(state, resume)`: after a crash the
//! last step is re-run from the previous checkpoint and must produce the
//! same sends with the same sequence numbers.

use crate::context::FlowContext;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use strand_core::{
    FlowError, FlowInfo, FlowResult, MessagePayload, PartyName, Payload, PayloadTag,
    ProtocolDescriptor, SessionId, TxHash, UntrustworthyPayload,
};

/// Handle to a session owned by the running flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionRef(pub SessionId);

impl SessionRef {
    /// Underlying session id
    pub fn id(&self) -> SessionId {
        self.0
    }
}

impl fmt::Display for SessionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// What a step suspends on
#[derive(Debug, Clone)]
pub enum Wait {
    /// Next message on a session
    Receive {
        /// Awaited session
        session: SessionRef,
        /// Expected payload type
        expected: PayloadTag,
    },
    /// Send, then wait for the reply on the same session
    SendAndReceive {
        /// Session
        session: SessionRef,
        /// Payload to send
        payload: Payload,
        /// Expected reply type
        expected: PayloadTag,
        /// Replay the send after a crash until the reply is received
        retry_send: bool,
    },
    /// One message on each listed session, delivered together
    ReceiveAll {
        /// Session to expected type
        expected: BTreeMap<SessionRef, PayloadTag>,
    },
    /// Finality of a ledger transaction
    LedgerCommit {
        /// Awaited transaction
        hash: TxHash,
    },
    /// Handshake completion on a session
    Handshake {
        /// Awaited session
        session: SessionRef,
    },
}

impl Wait {
    /// Wait for a `T` on `session`
    pub fn receive<T: MessagePayload>(session: SessionRef) -> Self {
        Wait::Receive {
            session,
            expected: PayloadTag::of::<T>(),
        }
    }

    /// Send `payload` on `session`, then wait for an `R`
    pub fn send_and_receive<S: MessagePayload, R: MessagePayload>(
        session: SessionRef,
        payload: &S,
        retry_send: bool,
    ) -> FlowResult<Self> {
        Ok(Wait::SendAndReceive {
            session,
            payload: Payload::encode(payload)?,
            expected: PayloadTag::of::<R>(),
            retry_send,
        })
    }

    /// Wait for one message per session with individually declared types
    pub fn receive_all(expected: impl IntoIterator<Item = (SessionRef, PayloadTag)>) -> Self {
        Wait::ReceiveAll {
            expected: expected.into_iter().collect(),
        }
    }

    /// Wait for a `T` on every listed session
    pub fn receive_all_of<T: MessagePayload>(sessions: impl IntoIterator<Item = SessionRef>) -> Self {
        Self::receive_all(sessions.into_iter().map(|s| (s, PayloadTag::of::<T>())))
    }

    /// Wait for the finality signal of `hash`
    pub fn ledger_commit(hash: TxHash) -> Self {
        Wait::LedgerCommit { hash }
    }

    /// Wait for the session handshake to complete
    pub fn flow_info(session: SessionRef) -> Self {
        Wait::Handshake { session }
    }
}

/// Result of one step
#[derive(Debug)]
pub enum Step<T> {
    /// Suspend on a wait
    Await(Wait),
    /// Resolve with the flow's output
    Done(T),
}

/// What resumed a step
#[derive(Debug)]
pub enum Resume {
    /// First step of a new flow
    Start,
    /// A message satisfied a receive
    Received {
        /// Session it arrived on
        session: SessionRef,
        /// Unvalidated contents
        data: UntrustworthyPayload,
    },
    /// Every session of a `receive_all` produced its message
    ReceivedAll(BTreeMap<SessionRef, UntrustworthyPayload>),
    /// The awaited transaction committed
    Committed {
        /// Committed transaction
        hash: TxHash,
    },
    /// The awaited handshake completed
    FlowInfo {
        /// Session
        session: SessionRef,
        /// Negotiated protocol information
        info: FlowInfo,
    },
}

impl Resume {
    fn mismatch(&self, wanted: &str) -> FlowError {
        FlowError::internal(format!("resumed with {} where {wanted} was expected", self.kind()))
    }

    /// Short name for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            Resume::Start => "start",
            Resume::Received { .. } => "received",
            Resume::ReceivedAll(_) => "received-all",
            Resume::Committed { .. } => "committed",
            Resume::FlowInfo { .. } => "flow-info",
        }
    }

    /// The received message narrowed to `T`
    pub fn received<T: MessagePayload>(self) -> FlowResult<UntrustworthyPayload<T>> {
        match self {
            Resume::Received { data, .. } => data.cast::<T>(),
            other => Err(other.mismatch("received")),
        }
    }

    /// Messages delivered by `receive_all`
    pub fn received_all(self) -> FlowResult<BTreeMap<SessionRef, UntrustworthyPayload>> {
        match self {
            Resume::ReceivedAll(all) => Ok(all),
            other => Err(other.mismatch("received-all")),
        }
    }

    /// Committed transaction hash
    pub fn committed(self) -> FlowResult<TxHash> {
        match self {
            Resume::Committed { hash } => Ok(hash),
            other => Err(other.mismatch("committed")),
        }
    }

    /// Negotiated protocol information
    pub fn flow_info(self) -> FlowResult<FlowInfo> {
        match self {
            Resume::FlowInfo { info, .. } => Ok(info),
            other => Err(other.mismatch("flow-info")),
        }
    }
}

/// A durable business protocol
pub trait FlowLogic: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable registration name, persisted in checkpoints
    const NAME: &'static str;

    /// Value the flow resolves with
    type Output: MessagePayload;

    /// Protocol announced when this flow initiates sessions
    fn protocol() -> ProtocolDescriptor {
        ProtocolDescriptor::new(Self::NAME, 1)
    }

    /// Run until the next suspension point
    fn step(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<Self::Output>>;

    /// Label of the current suspension point, shown in stack snapshots
    fn step_label(&self) -> String {
        Self::NAME.to_string()
    }
}

/// A flow started by an incoming session request
pub trait ResponderFlow: FlowLogic {
    /// Protocol (name and accepted versions) this flow answers
    fn initiated_by() -> ProtocolDescriptor;

    /// Construct the responder for a freshly accepted session
    fn respond_to(session: SessionRef, counterparty: PartyName) -> Self;
}

/// Object-safe view of a [`FlowLogic`] used by the state machine
pub trait DynFlowLogic: Send + Sync {
    /// Registration name
    fn flow_name(&self) -> &'static str;

    /// Protocol announced on initiated sessions
    fn announced_protocol(&self) -> ProtocolDescriptor;

    /// Run one step, encoding the output
    fn step_dyn(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<Payload>>;

    /// Current suspension point label
    fn current_label(&self) -> String;

    /// Serialize the logic state
    fn encode_state(&self) -> FlowResult<Vec<u8>>;
}

impl<F: FlowLogic> DynFlowLogic for F {
    fn flow_name(&self) -> &'static str {
        F::NAME
    }

    fn announced_protocol(&self) -> ProtocolDescriptor {
        <F as FlowLogic>::protocol()
    }

    fn step_dyn(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<Payload>> {
        match self.step(ctx, resume)? {
            Step::Await(wait) => Ok(Step::Await(wait)),
            Step::Done(output) => Ok(Step::Done(Payload::encode(&output)?)),
        }
    }

    fn current_label(&self) -> String {
        self.step_label()
    }

    fn encode_state(&self) -> FlowResult<Vec<u8>> {
        serde_cbor::to_vec(self)
            .map_err(|e| FlowError::internal(format!("encode {} state: {e}", F::NAME)))
    }
}

/// Rehydrate a flow of type `F` from checkpointed state
pub fn decode_logic<F: FlowLogic>(bytes: &[u8]) -> FlowResult<Box<dyn DynFlowLogic>> {
    let logic: F = serde_cbor::from_slice(bytes)
        .map_err(|e| FlowError::internal(format!("decode {} state: {e}", F::NAME)))?;
    Ok(Box::new(logic))
}
