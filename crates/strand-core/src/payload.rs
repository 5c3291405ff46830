//! Tagged payload model
//!
//! Every message a flow exchanges declares a stable type tag. Receivers
//! compare the tag with the type they wait for before any decoding happens,
//! so a mismatched message never reaches business logic.

use crate::errors::{FlowError, FlowResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;

/// Declared type discriminant of a payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PayloadTag(String);

impl PayloadTag {
    /// Create a tag from its string form
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// Tag of a message type
    pub fn of<T: MessagePayload>() -> Self {
        Self(T::TYPE_TAG.to_string())
    }

    /// Tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PayloadTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message type that can travel in a flow session
///
/// `TYPE_TAG` must be unique per message type and stable across releases:
/// it is persisted in checkpoints and compared on every receive.
pub trait MessagePayload: Serialize + DeserializeOwned + Send + 'static {
    /// Stable type discriminant
    const TYPE_TAG: &'static str;
}

impl MessagePayload for () {
    const TYPE_TAG: &'static str = "unit";
}

impl MessagePayload for String {
    const TYPE_TAG: &'static str = "string";
}

impl MessagePayload for u64 {
    const TYPE_TAG: &'static str = "u64";
}

/// Encoded payload with its declared type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    tag: PayloadTag,
    #[serde(with = "serde_bytes")]
    body: Vec<u8>,
}

impl Payload {
    /// Encode a message
    pub fn encode<T: MessagePayload>(value: &T) -> FlowResult<Self> {
        let body = serde_cbor::to_vec(value)
            .map_err(|e| FlowError::payload(format!("encode {}: {e}", T::TYPE_TAG)))?;
        Ok(Self {
            tag: PayloadTag::of::<T>(),
            body,
        })
    }

    /// Assemble a payload from an already-encoded body
    pub fn from_parts(tag: PayloadTag, body: Vec<u8>) -> Self {
        Self { tag, body }
    }

    /// Declared type
    pub fn tag(&self) -> &PayloadTag {
        &self.tag
    }

    /// Encoded body
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Whether the declared type is `T`
    pub fn is<T: MessagePayload>(&self) -> bool {
        self.tag.as_str() == T::TYPE_TAG
    }

    /// Decode into `T`, refusing a payload declared as another type
    pub fn decode<T: MessagePayload>(&self) -> FlowResult<T> {
        if !self.is::<T>() {
            return Err(FlowError::payload(format!(
                "declared type {} cannot be decoded as {}",
                self.tag,
                T::TYPE_TAG
            )));
        }
        serde_cbor::from_slice(&self.body)
            .map_err(|e| FlowError::payload(format!("decode {}: {e}", T::TYPE_TAG)))
    }
}

/// Received data that must be validated before use
///
/// The only way to the contents is [`UntrustworthyPayload::unwrap`], which
/// runs a validator supplied by the receiving flow. A counterparty may send
/// subtly corrupted data to exploit the receiver, so the validator should
/// check every expectation the flow relies on.
///
/// `UntrustworthyPayload` without a type parameter is the raw form handed to
/// flows on resume; [`UntrustworthyPayload::cast`] narrows it to a message
/// type without exposing the contents.
pub struct UntrustworthyPayload<T = Payload> {
    payload: Payload,
    _type: PhantomData<fn() -> T>,
}

impl<T> UntrustworthyPayload<T> {
    /// Declared type of the wrapped data
    pub fn declared_type(&self) -> &PayloadTag {
        &self.payload.tag
    }
}

impl UntrustworthyPayload<Payload> {
    /// Wrap a received payload
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            _type: PhantomData,
        }
    }

    /// Narrow to message type `T` if the declared type matches
    pub fn cast<T: MessagePayload>(self) -> FlowResult<UntrustworthyPayload<T>> {
        if !self.payload.is::<T>() {
            return Err(FlowError::payload(format!(
                "received {} where {} was expected",
                self.payload.tag,
                T::TYPE_TAG
            )));
        }
        Ok(UntrustworthyPayload {
            payload: self.payload,
            _type: PhantomData,
        })
    }

    /// Decode as `T` and validate in one call
    pub fn unwrap_as<T, R, F>(self, validator: F) -> FlowResult<R>
    where
        T: MessagePayload,
        F: FnOnce(T) -> FlowResult<R>,
    {
        self.cast::<T>()?.unwrap(validator)
    }
}

impl<T: MessagePayload> UntrustworthyPayload<T> {
    /// Decode and hand the value to `validator`; its result is the only
    /// route to the contents
    pub fn unwrap<R, F>(self, validator: F) -> FlowResult<R>
    where
        F: FnOnce(T) -> FlowResult<R>,
    {
        let value = self.payload.decode::<T>()?;
        validator(value)
    }
}

impl<T> fmt::Debug for UntrustworthyPayload<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UntrustworthyPayload")
            .field("declared_type", &self.payload.tag)
            .field("len", &self.payload.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Offer {
        amount: u64,
    }

    impl MessagePayload for Offer {
        const TYPE_TAG: &'static str = "test.offer";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Ack;

    impl MessagePayload for Ack {
        const TYPE_TAG: &'static str = "test.ack";
    }

    #[test]
    fn decode_checks_declared_type() {
        let payload = Payload::encode(&Offer { amount: 5 }).unwrap();
        assert!(payload.is::<Offer>());
        assert_eq!(payload.decode::<Offer>().unwrap(), Offer { amount: 5 });
        assert!(payload.decode::<Ack>().is_err());
    }

    #[test]
    fn unwrap_runs_validator() {
        let payload = Payload::encode(&Offer { amount: 0 }).unwrap();
        let rejected = UntrustworthyPayload::new(payload.clone()).unwrap_as(|offer: Offer| {
            if offer.amount == 0 {
                Err(FlowError::validation("zero offer"))
            } else {
                Ok(offer.amount)
            }
        });
        assert!(matches!(rejected, Err(FlowError::Validation { .. })));

        let accepted = UntrustworthyPayload::new(payload)
            .cast::<Offer>()
            .unwrap()
            .unwrap(|offer| Ok(offer.amount + 1))
            .unwrap();
        assert_eq!(accepted, 1);
    }

    #[test]
    fn cast_refuses_other_types() {
        let payload = Payload::encode(&Ack).unwrap();
        let data = UntrustworthyPayload::new(payload);
        assert_eq!(data.declared_type().as_str(), "test.ack");
        assert!(data.cast::<Offer>().is_err());
    }
}
