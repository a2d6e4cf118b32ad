//! Events a room session raises for the UI layer.

use huddle_shared::{Message, MessageId, UserId};

use crate::membership::MembershipChange;
use crate::subscription::SubscriptionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// A new timeline entry, optimistic, confirmed or system.
    MessageAdded(Message),
    /// The optimistic entry `local_id` became `message`.
    MessageReconciled {
        local_id: MessageId,
        message: Message,
    },
    MessageRemoved(MessageId),
    /// Render cue: scroll the list to its end.
    ScrollToEnd,
    MembershipChanged(MembershipChange),
    /// The current user was kicked; leave the room view.
    RemovedFromRoom { kicked_by: UserId },
    StateChanged(SubscriptionState),
}
