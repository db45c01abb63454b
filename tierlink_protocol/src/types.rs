// Core ID types for the tiered relay protocol.
//
// Lightweight newtypes shared by `message.rs`, the client crate, and the
// loopback backend in `multiplayer_tests`. Actor ids are assigned by the game
// tier when a participant enters a room (monotonically, starting at 1). View
// ids are derived from the owning actor so any client can mint new ones
// without coordination: `view_id = actor * MAX_VIEW_IDS + sub_id`.

use serde::{Deserialize, Serialize};

/// Number of view ids reserved per actor. Sub-id 0 is never handed out, so
/// the usable range per actor is `1..MAX_VIEW_IDS`.
pub const MAX_VIEW_IDS: i32 = 1000;

/// Room-scoped participant number. `ActorId::NONE` (-1) means "not assigned
/// yet"; `ActorId::SCENE` (0) is the pseudo-owner of scene objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub i32);

impl ActorId {
    pub const NONE: ActorId = ActorId(-1);
    pub const SCENE: ActorId = ActorId(0);

    /// True for ids handed out by the backend (strictly positive).
    pub fn is_assigned(self) -> bool {
        self.0 > 0
    }
}

/// Globally unique id of a networked object (view).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ViewId(pub i32);

impl ViewId {
    /// Compose a view id from an actor and its per-actor sub-id.
    pub fn compose(actor: ActorId, sub_id: i32) -> Self {
        ViewId(actor.0 * MAX_VIEW_IDS + sub_id)
    }

    /// The actor whose id range contains this view id. Scene views map to
    /// `ActorId::SCENE`.
    pub fn owner_actor(self) -> ActorId {
        ActorId(self.0 / MAX_VIEW_IDS)
    }

    pub fn sub_id(self) -> i32 {
        self.0 % MAX_VIEW_IDS
    }
}

/// The three roles a relay endpoint can play. A client talks to exactly one
/// tier at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerTier {
    /// Discovery: region list and master-tier address lookup.
    NameServer,
    /// Matchmaking: lobbies and room placement.
    MasterServer,
    /// Per-room session host.
    GameServer,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_id_encodes_owner() {
        let id = ViewId::compose(ActorId(7), 12);
        assert_eq!(id, ViewId(7012));
        assert_eq!(id.owner_actor(), ActorId(7));
        assert_eq!(id.sub_id(), 12);
    }

    #[test]
    fn scene_views_belong_to_actor_zero() {
        assert_eq!(ViewId(999).owner_actor(), ActorId::SCENE);
        assert!(!ActorId::SCENE.is_assigned());
        assert!(!ActorId::NONE.is_assigned());
        assert!(ActorId(1).is_assigned());
    }
}
