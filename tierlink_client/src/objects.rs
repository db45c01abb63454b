// Instantiation and destruction of represented objects.
//
// A local `instantiate` reserves view ids in the caller's range, asks the
// `ObjectHost` to build the object, registers the resulting views, and
// raises a cached instantiation event so present and late-joining
// participants build the same object. Scene objects use actor 0's id range,
// are owned by the room rather than a participant, and are cached globally
// so they outlive their creator.
//
// Destruction always purges the backend cache first (the instantiation event
// and any RPCs buffered for the object's views), then broadcasts the destroy
// event, then tears the object down locally. Remote destroys only do the
// last step.

use std::collections::BTreeSet;

use log::{debug, info, warn};
use tierlink_protocol::{ActorId, CachingOption, EventCode, Params, Value, ViewId};

use crate::error::{ClientError, Result};
use crate::lifecycle::{
    self, INSTANTIATION_ID_FIELD, InstantiateRequest, InstantiationEvent, ObjectHandle,
};
use crate::operations::RaiseEventOptions;
use crate::peer::Peer;
use crate::rpc::RPC_VIEW_FIELD;
use crate::transport::{Delivery, Transport};
use crate::view::View;

/// Placement and payload of a new object.
#[derive(Clone, Debug, PartialEq)]
pub struct Spawn {
    pub template: String,
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub group: u8,
    pub data: Vec<Value>,
    /// Number of views the object carries (at least one).
    pub view_count: usize,
}

impl Spawn {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            position: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            group: 0,
            data: Vec::new(),
            view_count: 1,
        }
    }

    pub fn at(mut self, position: [f32; 3], rotation: [f32; 4]) -> Self {
        self.position = position;
        self.rotation = rotation;
        self
    }

    pub fn in_group(mut self, group: u8) -> Self {
        self.group = group;
        self
    }

    pub fn with_data(mut self, data: Vec<Value>) -> Self {
        self.data = data;
        self
    }

    pub fn with_views(mut self, count: usize) -> Self {
        self.view_count = count;
        self
    }
}

impl<T: Transport> Peer<T> {
    /// Instantiate an object owned by the local participant. Returns its
    /// instantiation id (the id of its first view).
    pub fn instantiate(&mut self, spawn: Spawn) -> Result<ViewId> {
        self.require_room()?;
        self.instantiate_as(spawn, false)
    }

    /// Instantiate an object owned by the room. Master only; the object
    /// survives its creator leaving.
    pub fn instantiate_scene_object(&mut self, spawn: Spawn) -> Result<ViewId> {
        if !self.require_room()?.local_is_master() {
            return Err(ClientError::NotMasterClient);
        }
        self.instantiate_as(spawn, true)
    }

    fn instantiate_as(&mut self, spawn: Spawn, is_scene: bool) -> Result<ViewId> {
        let range = if is_scene {
            ActorId::SCENE
        } else {
            self.local_actor
        };
        let view_ids = self.views.allocate_many(range, spawn.view_count.max(1))?;
        let instantiation_id = view_ids[0];
        let request = InstantiateRequest {
            template: spawn.template,
            position: spawn.position,
            rotation: spawn.rotation,
            group: spawn.group,
            view_ids,
            data: spawn.data,
            creator: self.local_actor,
            is_scene,
            timestamp: self.server_timestamp(),
        };
        self.spawn_views(&request, self.level_prefix)?;

        let event = InstantiationEvent {
            request,
            instantiation_id,
            prefix: self.level_prefix,
        };
        let options = RaiseEventOptions {
            caching: if is_scene {
                CachingOption::AddToRoomCacheGlobal
            } else {
                CachingOption::AddToRoomCache
            },
            ..Default::default()
        };
        self.send_event(
            EventCode::Instantiation,
            event.encode(),
            &options,
            Delivery::Reliable,
        )?;
        info!(
            "instantiated {} as {instantiation_id:?}",
            event.request.template
        );
        Ok(instantiation_id)
    }

    fn spawn_views(&mut self, request: &InstantiateRequest, prefix: i16) -> Result<()> {
        let spawned = self
            .host
            .instantiate(request)
            .map_err(|reason| ClientError::Instantiate {
                template: request.template.clone(),
                reason,
            })?;
        for view in lifecycle::build_views(request, spawned, prefix) {
            let id = view.id;
            if !self.views.insert(view) {
                warn!("view {id:?} already exists; keeping the existing one");
            }
        }
        Ok(())
    }

    /// Destroy one instantiated object everywhere. Allowed for the object's
    /// owner, and for the master.
    pub fn destroy(&mut self, instantiation_id: ViewId) -> Result<()> {
        let room = self.require_room()?;
        let local_is_master = room.local_is_master();
        let members = self.views.instantiation_members(instantiation_id);
        let view = members
            .first()
            .and_then(|id| self.views.get(*id))
            .ok_or(ClientError::UnknownView(instantiation_id))?;
        if !view.is_mine(self.local_actor, local_is_master) && !local_is_master {
            return Err(ClientError::NotOwner(instantiation_id));
        }
        let creator = (!view.is_scene).then_some(view.creator);

        let filter = Value::Table(Params::from([(
            INSTANTIATION_ID_FIELD,
            Value::from(instantiation_id),
        )]));
        self.purge_cached(EventCode::Instantiation, filter, creator)?;
        for id in &members {
            let filter = Value::Table(Params::from([(RPC_VIEW_FIELD, Value::from(*id))]));
            self.purge_cached(EventCode::Rpc, filter, None)?;
        }
        self.send_event(
            EventCode::Destroy,
            lifecycle::single_id(instantiation_id.0),
            &RaiseEventOptions::default(),
            Delivery::Reliable,
        )?;
        self.destroy_local(instantiation_id);
        Ok(())
    }

    /// Destroy everything `actor` instantiated and purge their cached
    /// instantiations and RPCs. Allowed for the actor itself and the master.
    pub fn destroy_player_objects(&mut self, actor: ActorId) -> Result<()> {
        let room = self.require_room()?;
        if actor != self.local_actor && !room.local_is_master() {
            return Err(ClientError::NotMasterClient);
        }
        self.purge_cached(EventCode::Instantiation, Value::Null, Some(actor))?;
        self.purge_cached(EventCode::Rpc, Value::Null, Some(actor))?;
        self.send_event(
            EventCode::DestroyPlayer,
            lifecycle::single_id(actor.0),
            &RaiseEventOptions::default(),
            Delivery::Reliable,
        )?;
        self.cleanup_actor_objects(actor);
        Ok(())
    }

    /// Remove an instantiation's views and destroy its host object. Returns
    /// false if nothing was registered under that id.
    pub(crate) fn destroy_local(&mut self, instantiation_id: ViewId) -> bool {
        let members = self.views.instantiation_members(instantiation_id);
        if members.is_empty() {
            return false;
        }
        let handles: BTreeSet<ObjectHandle> = members
            .into_iter()
            .filter_map(|id| self.views.remove(id))
            .filter_map(|view| view.handle)
            .collect();
        for handle in handles {
            self.host.destroy(handle);
        }
        debug!("destroyed {instantiation_id:?}");
        true
    }

    /// Local cleanup after `actor` left or was purged: destroy the non-scene
    /// objects they created, hand views they merely owned back.
    pub(crate) fn cleanup_actor_objects(&mut self, actor: ActorId) {
        for id in self.views.instantiations_by(actor) {
            self.destroy_local(id);
        }
        for view in self.views.iter_mut() {
            if view.owner == actor {
                view.owner = if view.is_scene {
                    ActorId::SCENE
                } else {
                    view.creator
                };
                view.state.reset_outgoing();
            }
        }
    }

    /// Destroy every instantiated object; host-attached views stay.
    pub(crate) fn destroy_all_instantiated(&mut self) {
        let mut ids: Vec<ViewId> = self
            .views
            .iter()
            .filter_map(|v| v.instantiation_id)
            .collect();
        ids.sort();
        ids.dedup();
        for id in ids {
            self.destroy_local(id);
        }
    }

    pub(crate) fn on_instantiation(&mut self, sender: ActorId, data: &Value) {
        let event = match InstantiationEvent::decode(data, sender) {
            Ok(event) => event,
            Err(fault) => {
                warn!("instantiation from {sender:?}: {fault}");
                return;
            }
        };
        if self.views.contains(event.instantiation_id) {
            debug!("{:?} already instantiated", event.instantiation_id);
            return;
        }
        if let Err(e) = self.spawn_views(&event.request, event.prefix) {
            warn!("cannot build remote object: {e}");
        }
    }

    pub(crate) fn on_destroy(&mut self, sender: ActorId, data: &Value) {
        let Some(id) = lifecycle::read_single_id(data) else {
            warn!("malformed destroy event from {sender:?}");
            return;
        };
        if !self.destroy_local(ViewId(id)) {
            debug!("destroy of unknown object {id} from {sender:?}");
        }
    }

    pub(crate) fn on_destroy_player(&mut self, sender: ActorId, data: &Value) {
        let Some(actor) = lifecycle::read_single_id(data).map(ActorId) else {
            warn!("malformed destroy-player event from {sender:?}");
            return;
        };
        self.cleanup_actor_objects(actor);
    }

    /// Register a host-built view (typically a scene object placed by the
    /// level). Returns false if the id is already taken.
    pub fn attach_view(&mut self, mut view: View) -> bool {
        if view.prefix == 0 {
            view.prefix = self.level_prefix;
        }
        self.views.insert(view)
    }

    /// Reserve a free id in the local participant's range for a host-built
    /// view.
    pub fn allocate_view_id(&mut self) -> Result<ViewId> {
        self.views.allocate(self.local_actor)
    }

    /// Unregister a host-attached view without network traffic.
    pub fn detach_view(&mut self, id: ViewId) -> Option<View> {
        self.views.remove(id)
    }
}
