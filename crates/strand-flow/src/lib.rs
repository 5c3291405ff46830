//! # Strand Flow
//!
//! The durable flow state machine.
//!
//! Business protocols implement [`FlowLogic`]: an explicit, serializable
//! state value advanced one [`Step`] at a time. Each step ends by
//! suspending on a [`Wait`] or returning the flow's output. The
//! [`FlowStateMachine`] persists a checkpoint at every suspension, hands
//! queued sends to the transport only after the checkpoint is durable, and
//! resolves a [`FlowHandle`] exactly once when the flow finishes.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! enum Offer { Start { to: PartyName }, AwaitAck { session: SessionRef } }
//!
//! impl FlowLogic for Offer {
//!     const NAME: &'static str = "example.offer";
//!     type Output = Ack;
//!
//!     fn step(&mut self, ctx: &mut FlowContext<'_>, resume: Resume) -> FlowResult<Step<Ack>> {
//!         match self {
//!             Offer::Start { to } => {
//!                 let session = ctx.initiate_flow(to.clone())?;
//!                 ctx.send(session, &Proposal { amount: 100 })?;
//!                 *self = Offer::AwaitAck { session };
//!                 Ok(Step::Await(Wait::receive::<Ack>(session)))
//!             }
//!             Offer::AwaitAck { .. } => {
//!                 let ack = resume.received::<Ack>()?.unwrap(validate_ack)?;
//!                 Ok(Step::Done(ack))
//!             }
//!         }
//!     }
//! }
//! ```

pub mod context;
pub mod finality;
pub mod logic;
pub mod machine;
pub mod registry;
pub mod result;
pub mod services;
mod session;
pub mod table;

pub use context::FlowContext;
pub use finality::{FinalityTracker, FINALITY_MEMORY};
pub use logic::{decode_logic, DynFlowLogic, FlowLogic, ResponderFlow, Resume, SessionRef, Step, Wait};
pub use machine::{Activation, FlowStateMachine};
pub use registry::{FlowRegistry, RegisteredResponder};
pub use result::{result_channel, FlowHandle, FlowOutcome, ResultSlot};
pub use services::FlowServices;
pub use table::{FlowStatus, FlowTable};
