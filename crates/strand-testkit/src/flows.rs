//! Sample protocols exercising the flow engine end to end
//!
//! - offer: two-party offer, acknowledgement and ledger settlement
//! - quote: one buyer gathering quotes from several sellers with a single
//!   `receive_all`
//! - guarded issue and guarded settlement: permission-gated flows, the
//!   latter checking only after it resumes from a ledger wait
//! - probes: handshake-only flows at different protocol versions

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strand_core::{
    FlowError, FlowResult, MessagePayload, PartyName, ProtocolDescriptor, TxHash,
};
use strand_flow::{FlowContext, FlowLogic, ResponderFlow, Resume, SessionRef, Step, Wait};

/// Protocol name shared by [`OfferFlow`] and [`OfferResponder`]
pub const OFFER_PROTOCOL: &str = "demo.offer";

/// Protocol name shared by [`QuoteGathering`] and the seller responders
pub const QUOTE_PROTOCOL: &str = "demo.quote";

/// Protocol name of the version probes
pub const PROBE_PROTOCOL: &str = "demo.probe";

/// Permission checked by [`GuardedIssue`]
pub const ISSUE_PERMISSION: &str = "StartFlow.GuardedIssue";

/// Permission checked by [`GuardedSettlement`] once its transaction is final
pub const SETTLE_PERMISSION: &str = "Settle.GuardedSettlement";

/// Proposal sent by the offering party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    /// Business reference
    pub reference: String,
    /// Offered amount
    pub amount: u64,
}

impl MessagePayload for Offer {
    const TYPE_TAG: &'static str = "demo.offer.offer";
}

/// Answer to an [`Offer`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// Reference of the answered offer
    pub reference: String,
    /// Whether the offer was accepted
    pub accepted: bool,
}

impl MessagePayload for Ack {
    const TYPE_TAG: &'static str = "demo.offer.ack";
}

/// Proof of settlement sent once the transaction is final
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Committed transaction
    pub hash: TxHash,
}

impl MessagePayload for Receipt {
    const TYPE_TAG: &'static str = "demo.offer.receipt";
}

/// Output of a settled offer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    /// Committed transaction
    pub hash: TxHash,
    /// Settled amount
    pub amount: u64,
}

impl MessagePayload for Settlement {
    const TYPE_TAG: &'static str = "demo.offer.settlement";
}

/// Transaction a settled offer commits
pub fn settlement_hash(reference: &str, amount: u64) -> TxHash {
    TxHash::of(format!("{reference}:{amount}").as_bytes())
}

/// Offers an amount to a counterparty and settles it on the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OfferFlow {
    /// Not yet started
    Start {
        /// Receiving party
        counterparty: PartyName,
        /// Business reference
        reference: String,
        /// Offered amount
        amount: u64,
    },
    /// Offer sent, waiting for the acknowledgement
    AwaitAck {
        /// Offer session
        session: SessionRef,
        /// Business reference
        reference: String,
        /// Offered amount
        amount: u64,
    },
    /// Waiting for ledger finality
    AwaitCommit {
        /// Offer session
        session: SessionRef,
        /// Settled amount
        amount: u64,
        /// Transaction being committed
        hash: TxHash,
    },
}

impl OfferFlow {
    /// Offer `amount` to `counterparty`
    pub fn new(counterparty: impl Into<PartyName>, reference: impl Into<String>, amount: u64) -> Self {
        OfferFlow::Start {
            counterparty: counterparty.into(),
            reference: reference.into(),
            amount,
        }
    }
}

impl FlowLogic for OfferFlow {
    const NAME: &'static str = "demo.offer";
    type Output = Settlement;

    fn protocol() -> ProtocolDescriptor {
        ProtocolDescriptor::new(OFFER_PROTOCOL, 1)
    }

    fn step(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<Settlement>> {
        match self {
            OfferFlow::Start {
                counterparty,
                reference,
                amount,
            } => {
                let session = ctx.initiate_flow(counterparty.clone())?;
                let offer = Offer {
                    reference: reference.clone(),
                    amount: *amount,
                };
                let wait = Wait::send_and_receive::<Offer, Ack>(session, &offer, true)?;
                *self = OfferFlow::AwaitAck {
                    session,
                    reference: offer.reference,
                    amount: offer.amount,
                };
                Ok(Step::Await(wait))
            }
            OfferFlow::AwaitAck {
                session,
                reference,
                amount,
            } => {
                let expected = reference.clone();
                resume.received::<Ack>()?.unwrap(|ack| {
                    if ack.reference != expected {
                        return Err(FlowError::validation(format!(
                            "ack for {} answers offer {expected}",
                            ack.reference
                        )));
                    }
                    if !ack.accepted {
                        return Err(FlowError::validation(format!("offer {expected} declined")));
                    }
                    Ok(())
                })?;

                let hash = settlement_hash(reference, *amount);
                ctx.record_audit_event(
                    "offer.accepted",
                    "Counterparty accepted the offer",
                    BTreeMap::from([("hash".to_string(), hash.to_hex())]),
                );
                *self = OfferFlow::AwaitCommit {
                    session: *session,
                    amount: *amount,
                    hash,
                };
                Ok(Step::Await(Wait::ledger_commit(hash)))
            }
            OfferFlow::AwaitCommit {
                session, amount, ..
            } => {
                let hash = resume.committed()?;
                ctx.send(*session, &Receipt { hash })?;
                Ok(Step::Done(Settlement {
                    hash,
                    amount: *amount,
                }))
            }
        }
    }

    fn step_label(&self) -> String {
        match self {
            OfferFlow::Start { .. } => "offer.start",
            OfferFlow::AwaitAck { .. } => "offer.await-ack",
            OfferFlow::AwaitCommit { .. } => "offer.await-commit",
        }
        .to_string()
    }
}

/// Answers [`OfferFlow`]: accepts any positive offer and waits for the
/// settlement receipt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OfferResponder {
    /// Session accepted, nothing received yet
    Accepted {
        /// Offer session
        session: SessionRef,
    },
    /// Waiting for the offer
    AwaitOffer {
        /// Offer session
        session: SessionRef,
    },
    /// Offer acknowledged, waiting for the receipt
    AwaitReceipt {
        /// Expected settlement
        hash: TxHash,
    },
}

impl FlowLogic for OfferResponder {
    const NAME: &'static str = "demo.offer-responder";
    type Output = Receipt;

    fn step(&mut self, _ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<Receipt>> {
        match self {
            OfferResponder::Accepted { session } => {
                let session = *session;
                *self = OfferResponder::AwaitOffer { session };
                Ok(Step::Await(Wait::receive::<Offer>(session)))
            }
            OfferResponder::AwaitOffer { session } => {
                let offer = resume.received::<Offer>()?.unwrap(|offer| {
                    if offer.amount == 0 {
                        Err(FlowError::validation("zero-amount offer"))
                    } else {
                        Ok(offer)
                    }
                })?;
                let ack = Ack {
                    reference: offer.reference.clone(),
                    accepted: true,
                };
                let wait = Wait::send_and_receive::<Ack, Receipt>(*session, &ack, false)?;
                *self = OfferResponder::AwaitReceipt {
                    hash: settlement_hash(&offer.reference, offer.amount),
                };
                Ok(Step::Await(wait))
            }
            OfferResponder::AwaitReceipt { hash } => {
                let expected = *hash;
                let receipt = resume.received::<Receipt>()?.unwrap(|receipt| {
                    if receipt.hash == expected {
                        Ok(receipt)
                    } else {
                        Err(FlowError::validation("receipt for a different transaction"))
                    }
                })?;
                Ok(Step::Done(receipt))
            }
        }
    }
}

impl ResponderFlow for OfferResponder {
    fn initiated_by() -> ProtocolDescriptor {
        ProtocolDescriptor::new(OFFER_PROTOCOL, 1)
    }

    fn respond_to(session: SessionRef, _counterparty: PartyName) -> Self {
        OfferResponder::Accepted { session }
    }
}

/// Request for a price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteRequest {
    /// Item to price
    pub item: String,
}

impl MessagePayload for QuoteRequest {
    const TYPE_TAG: &'static str = "demo.quote.request";
}

/// A seller's price
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Quoting seller
    pub seller: PartyName,
    /// Quoted price
    pub price: u64,
}

impl MessagePayload for Quote {
    const TYPE_TAG: &'static str = "demo.quote.quote";
}

/// Cheapest quote of a gathering round
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BestQuote {
    /// Winning quote
    pub best: Quote,
    /// Number of quotes compared
    pub compared: usize,
}

impl MessagePayload for BestQuote {
    const TYPE_TAG: &'static str = "demo.quote.best";
}

/// Price `seller` quotes for `item`
pub fn quoted_price(seller: &PartyName, item: &str) -> u64 {
    let digest = TxHash::of(format!("{seller}/{item}").as_bytes());
    u64::from(digest.as_bytes()[0]) + 1
}

/// Asks every seller for a quote and picks the cheapest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QuoteGathering {
    /// Not yet started
    Start {
        /// Item to price
        item: String,
        /// Parties asked
        sellers: Vec<PartyName>,
    },
    /// Requests sent, waiting for every quote
    Collect {
        /// One session per seller
        sessions: Vec<SessionRef>,
    },
}

impl QuoteGathering {
    /// Ask `sellers` for the price of `item`
    pub fn new(item: impl Into<String>, sellers: Vec<PartyName>) -> Self {
        QuoteGathering::Start {
            item: item.into(),
            sellers,
        }
    }
}

impl FlowLogic for QuoteGathering {
    const NAME: &'static str = "demo.quote-gathering";
    type Output = BestQuote;

    fn protocol() -> ProtocolDescriptor {
        ProtocolDescriptor::new(QUOTE_PROTOCOL, 1)
    }

    fn step(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<BestQuote>> {
        match self {
            QuoteGathering::Start { item, sellers } => {
                if sellers.is_empty() {
                    return Err(FlowError::validation("no sellers to ask"));
                }
                let request = QuoteRequest { item: item.clone() };
                let mut sessions = Vec::with_capacity(sellers.len());
                for seller in sellers.iter() {
                    let session = ctx.initiate_flow(seller.clone())?;
                    ctx.send(session, &request)?;
                    sessions.push(session);
                }
                let wait = Wait::receive_all_of::<Quote>(sessions.iter().copied());
                *self = QuoteGathering::Collect { sessions };
                Ok(Step::Await(wait))
            }
            QuoteGathering::Collect { sessions } => {
                let received = resume.received_all()?;
                let mut quotes = Vec::with_capacity(sessions.len());
                for (session, data) in received {
                    let seller = ctx.counterparty(session)?;
                    let quote = data.unwrap_as(|quote: Quote| {
                        if quote.seller != seller {
                            Err(FlowError::validation(format!(
                                "{seller} quoted on behalf of {}",
                                quote.seller
                            )))
                        } else {
                            Ok(quote)
                        }
                    })?;
                    quotes.push(quote);
                }
                let compared = quotes.len();
                let best = quotes
                    .into_iter()
                    .min_by(|a, b| a.price.cmp(&b.price).then_with(|| a.seller.cmp(&b.seller)))
                    .ok_or_else(|| FlowError::internal("receive_all delivered no quotes"))?;
                Ok(Step::Done(BestQuote { best, compared }))
            }
        }
    }
}

/// Seller answering [`QuoteGathering`] with [`quoted_price`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QuoteResponder {
    /// Session accepted
    Accepted {
        /// Quote session
        session: SessionRef,
    },
    /// Waiting for the request
    AwaitRequest {
        /// Quote session
        session: SessionRef,
    },
}

impl FlowLogic for QuoteResponder {
    const NAME: &'static str = "demo.quote-responder";
    type Output = Quote;

    fn step(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<Quote>> {
        match self {
            QuoteResponder::Accepted { session } => {
                let session = *session;
                *self = QuoteResponder::AwaitRequest { session };
                Ok(Step::Await(Wait::receive::<QuoteRequest>(session)))
            }
            QuoteResponder::AwaitRequest { session } => {
                let request = resume.received::<QuoteRequest>()?.unwrap(Ok)?;
                let seller = ctx.our_identity().clone();
                let quote = Quote {
                    price: quoted_price(&seller, &request.item),
                    seller,
                };
                ctx.send(*session, &quote)?;
                Ok(Step::Done(quote))
            }
        }
    }
}

impl ResponderFlow for QuoteResponder {
    fn initiated_by() -> ProtocolDescriptor {
        ProtocolDescriptor::new(QUOTE_PROTOCOL, 1)
    }

    fn respond_to(session: SessionRef, _counterparty: PartyName) -> Self {
        QuoteResponder::Accepted { session }
    }
}

/// Seller that answers quote requests with free text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RefusingSeller {
    /// Session accepted
    Accepted {
        /// Quote session
        session: SessionRef,
    },
    /// Waiting for the request
    AwaitRequest {
        /// Quote session
        session: SessionRef,
    },
}

impl FlowLogic for RefusingSeller {
    const NAME: &'static str = "demo.refusing-seller";
    type Output = ();

    fn step(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<()>> {
        match self {
            RefusingSeller::Accepted { session } => {
                let session = *session;
                *self = RefusingSeller::AwaitRequest { session };
                Ok(Step::Await(Wait::receive::<QuoteRequest>(session)))
            }
            RefusingSeller::AwaitRequest { session } => {
                resume.received::<QuoteRequest>()?.unwrap(|_| Ok(()))?;
                ctx.send(*session, &"sold out".to_string())?;
                Ok(Step::Done(()))
            }
        }
    }
}

impl ResponderFlow for RefusingSeller {
    fn initiated_by() -> ProtocolDescriptor {
        ProtocolDescriptor::new(QUOTE_PROTOCOL, 1)
    }

    fn respond_to(session: SessionRef, _counterparty: PartyName) -> Self {
        RefusingSeller::Accepted { session }
    }
}

/// Issues an amount after checking [`ISSUE_PERMISSION`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardedIssue {
    /// Amount to issue
    pub amount: u64,
}

impl FlowLogic for GuardedIssue {
    const NAME: &'static str = "demo.guarded-issue";
    type Output = u64;

    fn step(&mut self, ctx: &mut FlowContext<'_>, _resume: Resume) -> FlowResult<Step<u64>> {
        ctx.check_flow_permission(
            ISSUE_PERMISSION,
            BTreeMap::from([("amount".to_string(), self.amount.to_string())]),
        )?;
        Ok(Step::Done(self.amount))
    }
}

/// Waits for a transaction, then checks [`SETTLE_PERMISSION`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardedSettlement {
    /// Awaited transaction
    pub hash: TxHash,
    /// Whether the wait has been armed
    pub waiting: bool,
}

impl GuardedSettlement {
    /// Settlement of `hash`, not yet waiting
    pub fn new(hash: TxHash) -> Self {
        Self {
            hash,
            waiting: false,
        }
    }
}

impl FlowLogic for GuardedSettlement {
    const NAME: &'static str = "demo.guarded-settlement";
    type Output = String;

    fn step(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<String>> {
        if !self.waiting {
            self.waiting = true;
            return Ok(Step::Await(Wait::ledger_commit(self.hash)));
        }
        let hash = resume.committed()?;
        ctx.check_flow_permission(
            SETTLE_PERMISSION,
            BTreeMap::from([("hash".to_string(), hash.to_hex())]),
        )?;
        Ok(Step::Done(hash.to_hex()))
    }
}

/// Waits for a transaction, then persists a stack snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotAfterCommit {
    /// Awaited transaction
    pub hash: TxHash,
    /// Whether the wait has been armed
    pub waiting: bool,
}

impl FlowLogic for SnapshotAfterCommit {
    const NAME: &'static str = "demo.snapshot-after-commit";
    type Output = String;

    fn step(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<String>> {
        if !self.waiting {
            self.waiting = true;
            return Ok(Step::Await(Wait::ledger_commit(self.hash)));
        }
        let hash = resume.committed()?;
        ctx.persist_flow_stack_snapshot();
        Ok(Step::Done(hash.to_hex()))
    }

    fn step_label(&self) -> String {
        if self.waiting {
            "snapshot.await-commit".to_string()
        } else {
            "snapshot.start".to_string()
        }
    }
}

/// Protocol version agreed by a probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedVersion {
    /// Protocol name
    pub protocol: String,
    /// Agreed version
    pub version: u32,
}

impl MessagePayload for NegotiatedVersion {
    const TYPE_TAG: &'static str = "demo.probe.negotiated";
}

/// Handshake-only initiator state shared by the probes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProbeState {
    /// Not yet started
    Start {
        /// Probed party
        counterparty: PartyName,
    },
    /// Waiting for the handshake
    AwaitHandshake {
        /// Probe session
        session: SessionRef,
    },
}

impl ProbeState {
    fn advance(
        &mut self,
        ctx: &mut FlowContext<'_>,
        resume: Resume,
    ) -> FlowResult<Step<NegotiatedVersion>> {
        match self {
            ProbeState::Start { counterparty } => {
                let session = ctx.initiate_flow(counterparty.clone())?;
                *self = ProbeState::AwaitHandshake { session };
                Ok(Step::Await(Wait::flow_info(session)))
            }
            ProbeState::AwaitHandshake { .. } => {
                let info = resume.flow_info()?;
                Ok(Step::Done(NegotiatedVersion {
                    protocol: info.protocol,
                    version: info.version,
                }))
            }
        }
    }
}

macro_rules! probe_flow {
    ($(#[$doc:meta])* $name:ident, $flow:literal, $protocol:expr, $version:literal, $min:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Serialize, Deserialize)]
        pub struct $name(pub ProbeState);

        impl $name {
            /// Probe `counterparty`
            pub fn new(counterparty: impl Into<PartyName>) -> Self {
                Self(ProbeState::Start {
                    counterparty: counterparty.into(),
                })
            }
        }

        impl FlowLogic for $name {
            const NAME: &'static str = $flow;
            type Output = NegotiatedVersion;

            fn protocol() -> ProtocolDescriptor {
                ProtocolDescriptor::new($protocol, $version).with_min_version($min)
            }

            fn step(
                &mut self,
                ctx: &mut FlowContext<'_>,
                resume: Resume,
            ) -> FlowResult<Step<NegotiatedVersion>> {
                self.0.advance(ctx, resume)
            }
        }
    };
}

probe_flow!(
    /// Speaks only version 1 of the probe protocol
    ProbeV1, "demo.probe-v1", PROBE_PROTOCOL, 1, 1
);
probe_flow!(
    /// Speaks versions 1 through 3 of the probe protocol
    ProbeV3, "demo.probe-v3", PROBE_PROTOCOL, 3, 1
);
probe_flow!(
    /// Refuses anything older than version 3
    StrictProbe, "demo.probe-strict", PROBE_PROTOCOL, 3, 3
);
probe_flow!(
    /// Announces a protocol nobody answers
    UnansweredProbe, "demo.probe-unanswered", "demo.unanswered", 1, 1
);

/// Answers probes announcing version 2 or later at version 2, then ends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponder {
    /// Probe session
    pub session: SessionRef,
}

impl FlowLogic for ProbeResponder {
    const NAME: &'static str = "demo.probe-responder";
    type Output = ();

    fn step(&mut self, _ctx: &mut FlowContext<'_>, _resume: Resume) -> FlowResult<Step<()>> {
        Ok(Step::Done(()))
    }
}

impl ResponderFlow for ProbeResponder {
    fn initiated_by() -> ProtocolDescriptor {
        ProtocolDescriptor::new(PROBE_PROTOCOL, 2).with_min_version(2)
    }

    fn respond_to(session: SessionRef, _counterparty: PartyName) -> Self {
        ProbeResponder { session }
    }
}
