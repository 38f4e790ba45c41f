//! Wire messages.
//!
//! The pull side (dialer) speaks [`Presentation`]s; the push side (listener)
//! speaks [`DataMessage`]s. Both are decoded once at the session boundary
//! into the strict [`SyncMessage`] variant type.

use crate::clock::VectorClock;
use crate::delta::{DeltaRecord, NamedState};
use crate::id::ReplicaId;

/// Sent by the pull side to announce its clock and steer the push mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Presentation {
    /// The sender's clock (full clock or a diff), if it changed.
    pub clock: Option<VectorClock>,
    /// Ask the remote push side to switch to lazy mode.
    pub start_lazy: bool,
    /// Ask the remote push side to switch to eager mode.
    pub start_eager: bool,
    /// Whether the sender is a pinner; `None` leaves the flag unchanged.
    pub is_pinner: Option<bool>,
}

impl Presentation {
    /// First message of a pull session.
    #[must_use]
    pub fn init(clock: VectorClock, is_pinner: bool) -> Self {
        Self {
            clock: Some(clock),
            is_pinner: Some(is_pinner),
            ..Self::default()
        }
    }

    /// Announce a new local clock.
    #[must_use]
    pub fn clock(clock: VectorClock) -> Self {
        Self {
            clock: Some(clock),
            ..Self::default()
        }
    }

    /// Request lazy mode.
    #[must_use]
    pub fn lazy() -> Self {
        Self {
            start_lazy: true,
            ..Self::default()
        }
    }

    /// Request eager mode.
    #[must_use]
    pub fn eager() -> Self {
        Self {
            start_eager: true,
            ..Self::default()
        }
    }
}

/// Clock plus optional full states.
///
/// `states == None` is a clock-only notification from a lazy push side.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NewStates {
    /// Clock the states correspond to (or the clock diff when lazy).
    pub clock: VectorClock,
    /// Root state first by convention, then sub-collaboration states.
    pub states: Option<Vec<NamedState>>,
}

/// Information the push side volunteers about itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PeerInfo {
    /// The sender replicates everything eagerly elsewhere.
    pub is_pinner: bool,
}

/// Sent by the push side.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DataMessage {
    /// A single delta.
    pub delta: Option<DeltaRecord>,
    /// A full state push or a clock-only notification.
    pub new_states: Option<NewStates>,
    /// Session-opening self description.
    pub peer_info: Option<PeerInfo>,
}

impl DataMessage {
    /// First message of a push session.
    #[must_use]
    pub fn peer_info(is_pinner: bool) -> Self {
        Self {
            peer_info: Some(PeerInfo { is_pinner }),
            ..Self::default()
        }
    }

    /// Push one delta.
    #[must_use]
    pub fn delta(record: DeltaRecord) -> Self {
        Self {
            delta: Some(record),
            ..Self::default()
        }
    }

    /// Push full states with their clock.
    #[must_use]
    pub fn states(clock: VectorClock, states: Vec<NamedState>) -> Self {
        Self {
            new_states: Some(NewStates {
                clock,
                states: Some(states),
            }),
            ..Self::default()
        }
    }

    /// Clock-only notification (lazy mode).
    #[must_use]
    pub fn clock_only(clock: VectorClock) -> Self {
        Self {
            new_states: Some(NewStates {
                clock,
                states: None,
            }),
            ..Self::default()
        }
    }
}

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SyncMessage {
    /// Pull side to push side.
    Presentation(Presentation),
    /// Push side to pull side.
    Data(DataMessage),
}

impl SyncMessage {
    /// Static label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Presentation(p) if p.start_lazy => "start_lazy",
            Self::Presentation(p) if p.start_eager => "start_eager",
            Self::Presentation(_) => "presentation",
            Self::Data(d) if d.delta.is_some() => "delta",
            Self::Data(DataMessage {
                new_states: Some(NewStates { states: Some(_), .. }),
                ..
            }) => "state",
            Self::Data(DataMessage {
                new_states: Some(_),
                ..
            }) => "clock",
            Self::Data(_) => "peer_info",
        }
    }
}

/// A message addressed to one collaboration of a multiplexed connection.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    /// Collaboration path, e.g. `doc` or `doc/comments`.
    pub collaboration: String,
    /// The message.
    pub message: SyncMessage,
}

impl Envelope {
    /// Address a message to a collaboration.
    pub fn new(collaboration: impl Into<String>, message: SyncMessage) -> Self {
        Self {
            collaboration: collaboration.into(),
            message,
        }
    }
}

/// First frame on a stream transport: who is dialing, and for which protocol.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Hello {
    /// The dialer.
    pub from: ReplicaId,
    /// Protocol name the dialer wants to speak.
    pub protocol: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_labels() {
        assert_eq!(SyncMessage::Presentation(Presentation::lazy()).kind(), "start_lazy");
        assert_eq!(SyncMessage::Presentation(Presentation::eager()).kind(), "start_eager");
        assert_eq!(
            SyncMessage::Presentation(Presentation::clock(VectorClock::new())).kind(),
            "presentation"
        );
        assert_eq!(SyncMessage::Data(DataMessage::peer_info(true)).kind(), "peer_info");
        assert_eq!(SyncMessage::Data(DataMessage::clock_only(VectorClock::new())).kind(), "clock");
        assert_eq!(
            SyncMessage::Data(DataMessage::states(VectorClock::new(), vec![])).kind(),
            "state"
        );
    }

    #[test]
    fn test_presentation_json_shape() {
        let p = Presentation::init([("a", 1)].into_iter().collect(), true);
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["clock"]["a"], 1);
        assert_eq!(json["is_pinner"], true);
        assert_eq!(json["start_lazy"], false);
    }
}
