// Room and roster.
//
// `Room` exists only while the local client is inside a room on the game
// tier. It owns the roster (`BTreeMap<ActorId, Player>`, ordered so the
// lowest id is always the first key), the room's property cache, and the
// master-client id. All mutation happens from the peer's dispatch path.
//
// Master election: the actor with the numerically lowest id among those
// present becomes master. Election runs when the room is entered (unless the
// backend manages mastership) and whenever the leaving actor was the master
// or no master is assigned. `elect_master` reports a change only when the
// master actually changed, so callers notify exactly once per switch.

use std::collections::BTreeMap;

use log::debug;
use tierlink_protocol::{ActorId, Properties, Value, props};

/// One room member.
#[derive(Clone, Debug, PartialEq)]
pub struct Player {
    pub id: ActorId,
    pub nick_name: String,
    pub properties: Properties,
    pub is_local: bool,
    /// Temporarily disconnected but kept in the roster.
    pub is_inactive: bool,
}

impl Player {
    pub fn new(id: ActorId, is_local: bool) -> Self {
        Self {
            id,
            nick_name: String::new(),
            properties: Properties::new(),
            is_local,
            is_inactive: false,
        }
    }

    /// Merge changed properties. A `Null` value removes the key.
    pub fn merge_properties(&mut self, changed: &Properties) {
        merge(&mut self.properties, changed);
        if let Some(name) = changed.get(props::NICK_NAME).and_then(Value::as_str) {
            self.nick_name = name.to_owned();
        }
    }
}

/// A master change produced by `Room::elect_master`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MasterChange {
    pub previous: ActorId,
    pub current: ActorId,
}

/// The joined room.
#[derive(Clone, Debug, PartialEq)]
pub struct Room {
    pub name: String,
    pub properties: Properties,
    pub master_client_id: ActorId,
    pub is_open: bool,
    pub is_visible: bool,
    pub max_players: u8,
    /// Leaver's objects are destroyed and their cached events purged.
    pub auto_cleanup: bool,
    /// The backend assigns the master itself (via the master-client
    /// property); local election is skipped.
    pub server_side_master: bool,
    local: ActorId,
    players: BTreeMap<ActorId, Player>,
}

impl Room {
    pub fn new(name: impl Into<String>, local: ActorId, auto_cleanup: bool) -> Self {
        let mut players = BTreeMap::new();
        if local.is_assigned() {
            players.insert(local, Player::new(local, true));
        }
        Self {
            name: name.into(),
            properties: Properties::new(),
            master_client_id: ActorId::NONE,
            is_open: true,
            is_visible: true,
            max_players: 0,
            auto_cleanup,
            server_side_master: false,
            local,
            players,
        }
    }

    pub fn local_actor(&self) -> ActorId {
        self.local
    }

    pub fn local_player(&self) -> Option<&Player> {
        self.players.get(&self.local)
    }

    pub fn player(&self, id: ActorId) -> Option<&Player> {
        self.players.get(&id)
    }

    pub fn player_mut(&mut self, id: ActorId) -> Option<&mut Player> {
        self.players.get_mut(&id)
    }

    pub fn players(&self) -> impl Iterator<Item = &Player> {
        self.players.values()
    }

    pub fn actor_ids(&self) -> impl Iterator<Item = ActorId> + '_ {
        self.players.keys().copied()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    pub fn contains(&self, id: ActorId) -> bool {
        self.players.contains_key(&id)
    }

    pub fn is_master(&self, id: ActorId) -> bool {
        self.master_client_id == id
    }

    pub fn local_is_master(&self) -> bool {
        self.is_master(self.local)
    }

    /// True if the actor is present and active.
    pub fn is_active(&self, id: ActorId) -> bool {
        self.players.get(&id).is_some_and(|p| !p.is_inactive)
    }

    /// Insert a player; returns false if the id was already present.
    pub fn add_player(&mut self, player: Player) -> bool {
        if self.players.contains_key(&player.id) {
            return false;
        }
        self.players.insert(player.id, player);
        true
    }

    pub fn remove_player(&mut self, id: ActorId) -> Option<Player> {
        self.players.remove(&id)
    }

    /// Add placeholder entries for listed actors not yet known.
    pub fn seed_actors(&mut self, ids: impl IntoIterator<Item = ActorId>) {
        for id in ids {
            if id.is_assigned() && !self.players.contains_key(&id) {
                self.players.insert(id, Player::new(id, id == self.local));
            }
        }
    }

    /// Re-key the local player under the id the game tier assigned.
    pub fn change_local_id(&mut self, new_id: ActorId) {
        if new_id == self.local {
            return;
        }
        let mut local = self
            .players
            .remove(&self.local)
            .unwrap_or_else(|| Player::new(new_id, true));
        if let Some(existing) = self.players.remove(&new_id) {
            // A placeholder seeded from the actor list; keep its properties.
            local.properties.extend(existing.properties);
        }
        local.id = new_id;
        local.is_local = true;
        self.players.insert(new_id, local);
        self.local = new_id;
    }

    /// Run master election. `leaving` is the actor being removed, if any; it
    /// is excluded from the candidates. Returns the change, if the master
    /// changed.
    pub fn elect_master(&mut self, leaving: Option<ActorId>) -> Option<MasterChange> {
        let previous = self.master_client_id;
        let needed = !previous.is_assigned()
            || leaving == Some(previous)
            || !self.players.contains_key(&previous);
        if !needed {
            return None;
        }
        let candidates = self.players.keys().copied().filter(|id| Some(*id) != leaving);
        let current = if self.players.len() <= 1 && self.local.is_assigned() {
            self.local
        } else {
            candidates.min().unwrap_or(ActorId::NONE)
        };
        self.set_master(current)
    }

    /// Force the master id (assign-master event or backend property).
    pub fn set_master(&mut self, current: ActorId) -> Option<MasterChange> {
        let previous = self.master_client_id;
        if previous == current {
            return None;
        }
        debug!("master client {previous:?} -> {current:?}");
        self.master_client_id = current;
        Some(MasterChange { previous, current })
    }

    /// Merge room properties and mirror the well-known keys into fields.
    /// Returns a master change if the properties carried one.
    pub fn merge_properties(&mut self, changed: &Properties) -> Option<MasterChange> {
        merge(&mut self.properties, changed);
        if let Some(open) = changed.get(props::IS_OPEN).and_then(Value::as_bool) {
            self.is_open = open;
        }
        if let Some(visible) = changed.get(props::IS_VISIBLE).and_then(Value::as_bool) {
            self.is_visible = visible;
        }
        if let Some(max) = changed.get(props::MAX_PLAYERS).and_then(Value::as_i64) {
            self.max_players = u8::try_from(max).unwrap_or(u8::MAX);
        }
        if let Some(cleanup) = changed
            .get(props::CLEANUP_CACHE_ON_LEAVE)
            .and_then(Value::as_bool)
        {
            self.auto_cleanup = cleanup;
        }
        match changed.get(props::MASTER_CLIENT_ID).and_then(Value::as_actor) {
            Some(master) if master.is_assigned() => {
                self.server_side_master = true;
                self.set_master(master)
            }
            _ => None,
        }
    }
}

fn merge(target: &mut Properties, changed: &Properties) {
    for (key, value) in changed {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}
