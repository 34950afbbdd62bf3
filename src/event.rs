//! Events published to consumers as mapping state changes.

use crate::mapping::{PeerMapping, PortMapping};

/// A state transition observed by the client.
///
/// Events are delivered in order on the channel returned at construction.
/// Every mapping event is published after the corresponding store update,
/// so a consumer can immediately query a consistent entry.
#[derive(Debug, Clone, PartialEq, derive_more::Display)]
pub enum Event {
    /// The gateway answered an announce, or announced itself unsolicited.
    #[display("received announce")]
    ReceivedAnnounce,
    /// A map response was reconciled with the store.
    #[display("received mapping")]
    ReceivedMapping(PortMapping),
    /// A peer response was reconciled with the store.
    #[display("received peer")]
    ReceivedPeer(PeerMapping),
    /// The client shut down. This is the last event on the channel.
    #[display("close")]
    Close,
}
