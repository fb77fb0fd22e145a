//! Core domain types and deterministic identifier derivation.

pub mod alias;
pub mod id;
pub mod membership;

pub use alias::room_alias;
pub use id::{event_id, room_id};
pub use membership::MembershipState;
