// Networked objects ("views") and their registry.
//
// A `View` is the unit of synchronized state: it has an owner (the actor
// allowed to write its state), a creator, an ownership policy, a sync mode,
// an interest group, its RPC table, and the `Observed` component that reads
// and writes its state in a fixed order. Views are created by local or
// remote instantiation, or attached directly by the host for scene objects.
//
// View ids encode the allocating actor (`actor * MAX_VIEW_IDS + sub_id`), so
// any client can mint ids without coordination. `ViewRegistry::allocate`
// hands out the next free sub-id for an actor, wrapping around and skipping
// ids still in use, so an id is never reused while its view exists.

use std::collections::BTreeMap;
use std::fmt;

use tierlink_protocol::{ActorId, MAX_VIEW_IDS, Value, ViewId};

use crate::error::{ClientError, Result};
use crate::lifecycle::ObjectHandle;
use crate::rpc::{MessageInfo, RpcTable};
use crate::sync::{SyncMode, SyncState};

/// How a view's ownership may change.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OwnershipPolicy {
    /// Never transfers; requests are ignored.
    #[default]
    Fixed,
    /// Any request naming the current owner succeeds immediately.
    Takeover,
    /// The owner (or the master, for an absent owner) decides.
    Request,
}

/// The component whose state a view synchronizes. Values are written and
/// read in the same order.
pub trait Observed {
    fn write_state(&mut self, out: &mut Vec<Value>);
    fn read_state(&mut self, values: &[Value], info: &MessageInfo);
}

pub struct View {
    pub id: ViewId,
    pub owner: ActorId,
    pub creator: ActorId,
    /// Id of the instantiation that created this view (the first view id of
    /// that object). `None` for host-attached views.
    pub instantiation_id: Option<ViewId>,
    pub prefix: i16,
    pub group: u8,
    pub sync: SyncMode,
    pub ownership: OwnershipPolicy,
    pub is_scene: bool,
    pub handle: Option<ObjectHandle>,
    pub rpcs: RpcTable,
    pub(crate) observed: Option<Box<dyn Observed>>,
    pub(crate) state: SyncState,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("creator", &self.creator)
            .field("instantiation_id", &self.instantiation_id)
            .field("prefix", &self.prefix)
            .field("group", &self.group)
            .field("sync", &self.sync)
            .field("ownership", &self.ownership)
            .field("is_scene", &self.is_scene)
            .field("rpcs", &self.rpcs)
            .finish_non_exhaustive()
    }
}

impl View {
    /// A view owned and created by `owner`, not synchronized.
    pub fn new(id: ViewId, owner: ActorId) -> Self {
        Self {
            id,
            owner,
            creator: owner,
            instantiation_id: None,
            prefix: 0,
            group: 0,
            sync: SyncMode::Off,
            ownership: OwnershipPolicy::Fixed,
            is_scene: false,
            handle: None,
            rpcs: RpcTable::new(),
            observed: None,
            state: SyncState::default(),
        }
    }

    /// A scene object: owned by `ActorId::SCENE`, written by the master.
    pub fn scene(id: ViewId) -> Self {
        Self {
            is_scene: true,
            ..Self::new(id, ActorId::SCENE)
        }
    }

    pub fn with_sync(mut self, mode: SyncMode, observed: impl Observed + 'static) -> Self {
        self.sync = mode;
        self.observed = Some(Box::new(observed));
        self
    }

    pub fn with_ownership(mut self, policy: OwnershipPolicy) -> Self {
        self.ownership = policy;
        self
    }

    pub fn with_group(mut self, group: u8) -> Self {
        self.group = group;
        self
    }

    pub fn with_rpcs(mut self, rpcs: RpcTable) -> Self {
        self.rpcs = rpcs;
        self
    }

    /// True if this client writes the view's state.
    pub fn is_mine(&self, local: ActorId, local_is_master: bool) -> bool {
        self.owner == local || (self.is_scene && self.owner == ActorId::SCENE && local_is_master)
    }

    pub fn sync_state(&self) -> &SyncState {
        &self.state
    }

    /// Collect current state from the observed component.
    pub(crate) fn write_state(&mut self) -> Option<Vec<Value>> {
        let observed = self.observed.as_mut()?;
        let mut out = Vec::new();
        observed.write_state(&mut out);
        Some(out)
    }

    pub(crate) fn read_state(&mut self, values: &[Value], info: &MessageInfo) {
        if let Some(observed) = self.observed.as_mut() {
            observed.read_state(values, info);
        }
    }
}

/// All live views, keyed by id.
#[derive(Debug, Default)]
pub struct ViewRegistry {
    views: BTreeMap<ViewId, View>,
    last_sub_id: BTreeMap<ActorId, i32>,
}

impl ViewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next free view id in `actor`'s range.
    pub fn allocate(&mut self, actor: ActorId) -> Result<ViewId> {
        let last = self.last_sub_id.get(&actor).copied().unwrap_or(0);
        for step in 1..MAX_VIEW_IDS {
            let sub = (last + step - 1) % (MAX_VIEW_IDS - 1) + 1;
            let id = ViewId::compose(actor, sub);
            if !self.views.contains_key(&id) {
                self.last_sub_id.insert(actor, sub);
                return Ok(id);
            }
        }
        Err(ClientError::ViewIdsExhausted(actor))
    }

    /// Allocate `count` distinct ids. Ids are reserved only once views are
    /// inserted, so the batch is checked against itself.
    pub fn allocate_many(&mut self, actor: ActorId, count: usize) -> Result<Vec<ViewId>> {
        let mut ids = Vec::with_capacity(count);
        while ids.len() < count {
            let id = self.allocate(actor)?;
            if ids.contains(&id) {
                return Err(ClientError::ViewIdsExhausted(actor));
            }
            ids.push(id);
        }
        Ok(ids)
    }

    /// Insert a view; returns false (and drops `view`) if the id is taken.
    pub fn insert(&mut self, view: View) -> bool {
        if self.views.contains_key(&view.id) {
            return false;
        }
        self.views.insert(view.id, view);
        true
    }

    pub fn remove(&mut self, id: ViewId) -> Option<View> {
        self.views.remove(&id)
    }

    pub fn get(&self, id: ViewId) -> Option<&View> {
        self.views.get(&id)
    }

    pub fn get_mut(&mut self, id: ViewId) -> Option<&mut View> {
        self.views.get_mut(&id)
    }

    pub fn contains(&self, id: ViewId) -> bool {
        self.views.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut View> {
        self.views.values_mut()
    }

    /// Ids of every view belonging to one instantiation.
    pub fn instantiation_members(&self, instantiation: ViewId) -> Vec<ViewId> {
        self.views
            .values()
            .filter(|v| v.instantiation_id == Some(instantiation))
            .map(|v| v.id)
            .collect()
    }

    /// Distinct instantiation ids of the non-scene objects `creator`
    /// instantiated.
    pub fn instantiations_by(&self, creator: ActorId) -> Vec<ViewId> {
        let mut ids: Vec<ViewId> = self
            .views
            .values()
            .filter(|v| v.creator == creator && !v.is_scene)
            .filter_map(|v| v.instantiation_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn reset_outgoing_baselines(&mut self) {
        for view in self.views.values_mut() {
            view.state.reset_outgoing();
        }
    }
}
