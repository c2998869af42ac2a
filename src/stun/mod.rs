//! Classic (pre-RFC5389) STUN message codec and NAT behavior classification.

mod classify;
mod message;

pub use classify::{Classification, Classifier, NatType};
pub use message::{StunAddress, StunAttr, StunMessage};
pub use message::{
    ATTR_CHANGED_ADDRESS, ATTR_CHANGE_REQUEST, ATTR_MAPPED_ADDRESS, ATTR_SOURCE_ADDRESS,
    BIND_REQUEST, BIND_RESPONSE, CHANGE_IP, CHANGE_PORT,
};
