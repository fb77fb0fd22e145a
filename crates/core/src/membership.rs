//! Room membership state machine.
//!
//! The state is an explicit enum rather than a nullable column: a missing
//! value meaning "joined" makes the state machine impossible to read off the
//! data. `Invite` and `Ban` are carried for forward compatibility but no
//! transition in this server produces them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipState {
    Join,
    Leave,
    Invite,
    Ban,
}

#[derive(Debug, Error)]
#[error("unknown membership state '{0}'")]
pub struct UnknownMembershipState(String);

impl MembershipState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipState::Join => "join",
            MembershipState::Leave => "leave",
            MembershipState::Invite => "invite",
            MembershipState::Ban => "ban",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, UnknownMembershipState> {
        match raw {
            "join" => Ok(MembershipState::Join),
            "leave" => Ok(MembershipState::Leave),
            "invite" => Ok(MembershipState::Invite),
            "ban" => Ok(MembershipState::Ban),
            other => Err(UnknownMembershipState(other.to_string())),
        }
    }

    pub fn is_joined(&self) -> bool {
        matches!(self, MembershipState::Join)
    }
}

impl Default for MembershipState {
    fn default() -> Self {
        MembershipState::Join
    }
}

impl std::str::FromStr for MembershipState {
    type Err = UnknownMembershipState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for MembershipState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_text() {
        for state in [
            MembershipState::Join,
            MembershipState::Leave,
            MembershipState::Invite,
            MembershipState::Ban,
        ] {
            assert_eq!(MembershipState::parse(state.as_str()).unwrap(), state);
        }
    }

    #[test]
    fn rejects_unknown_states() {
        assert!(MembershipState::parse("knocked").is_err());
    }

    #[test]
    fn default_is_joined() {
        assert!(MembershipState::default().is_joined());
        assert!(!MembershipState::Leave.is_joined());
    }
}
