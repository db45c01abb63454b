// Object-lifecycle boundary and the instantiation event.
//
// The client never builds represented objects itself. On a local or remote
// instantiation it hands the host an `InstantiateRequest` (template id,
// placement, interest group, init data, and the view ids already reserved
// for the object) and receives a `SpawnedObject`: a handle plus one
// `ViewSetup` per view id describing how each view synchronizes and which
// RPCs it exposes. Destruction goes back through `ObjectHost::destroy`.
//
// Instantiation event (`DATA` of `EventCode::Instantiation`), positional:
//   0: template, 1: position, 2: rotation, 3: group, 4: view ids,
//   5: init data (omitted when empty), 6: timestamp, 7: instantiation id,
//   8: level prefix (only when > 0).
// Destroy event: { 0: instantiation id }. Destroy-player event: { 0: actor }.

use tierlink_protocol::{ActorId, Params, ParamsExt, Value, ViewId};

use crate::error::DispatchFault;
use crate::rpc::RpcTable;
use crate::sync::SyncMode;
use crate::view::{Observed, OwnershipPolicy, View};

/// Host-side identity of a represented object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectHandle(pub u64);

/// Everything the host needs to build one object.
#[derive(Clone, Debug, PartialEq)]
pub struct InstantiateRequest {
    pub template: String,
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub group: u8,
    pub view_ids: Vec<ViewId>,
    pub data: Vec<Value>,
    pub creator: ActorId,
    pub is_scene: bool,
    pub timestamp: i64,
}

/// Per-view behavior supplied by the host.
#[derive(Default)]
pub struct ViewSetup {
    pub sync: SyncMode,
    pub ownership: OwnershipPolicy,
    pub observed: Option<Box<dyn Observed>>,
    pub rpcs: RpcTable,
}

pub struct SpawnedObject {
    pub handle: ObjectHandle,
    /// One entry per requested view id, in order. Missing entries get a
    /// default (unsynchronized, fixed ownership) setup.
    pub views: Vec<ViewSetup>,
}

pub trait ObjectHost {
    fn instantiate(&mut self, request: &InstantiateRequest) -> Result<SpawnedObject, String>;
    fn destroy(&mut self, handle: ObjectHandle);
}

/// Host that builds nothing but still hands out handles. Useful for
/// headless clients that only relay events.
#[derive(Debug, Default)]
pub struct NullHost {
    next: u64,
}

impl ObjectHost for NullHost {
    fn instantiate(&mut self, _request: &InstantiateRequest) -> Result<SpawnedObject, String> {
        self.next += 1;
        Ok(SpawnedObject {
            handle: ObjectHandle(self.next),
            views: Vec::new(),
        })
    }

    fn destroy(&mut self, _handle: ObjectHandle) {}
}

/// Build the views of a spawned object.
pub(crate) fn build_views(
    request: &InstantiateRequest,
    spawned: SpawnedObject,
    prefix: i16,
) -> Vec<View> {
    let owner = if request.is_scene {
        ActorId::SCENE
    } else {
        request.creator
    };
    let mut setups = spawned.views.into_iter();
    request
        .view_ids
        .iter()
        .map(|id| {
            let setup = setups.next().unwrap_or_default();
            View {
                creator: request.creator,
                instantiation_id: request.view_ids.first().copied(),
                prefix,
                group: request.group,
                sync: setup.sync,
                ownership: setup.ownership,
                is_scene: request.is_scene,
                handle: Some(spawned.handle),
                rpcs: setup.rpcs,
                observed: setup.observed,
                ..View::new(*id, owner)
            }
        })
        .collect()
}

/// Decoded instantiation event.
#[derive(Clone, Debug, PartialEq)]
pub struct InstantiationEvent {
    pub request: InstantiateRequest,
    pub instantiation_id: ViewId,
    pub prefix: i16,
}

mod field {
    pub const TEMPLATE: u8 = 0;
    pub const POSITION: u8 = 1;
    pub const ROTATION: u8 = 2;
    pub const GROUP: u8 = 3;
    pub const VIEW_IDS: u8 = 4;
    pub const DATA: u8 = 5;
    pub const TIMESTAMP: u8 = 6;
    pub const INSTANTIATION_ID: u8 = 7;
    pub const PREFIX: u8 = 8;
}

/// Key of the instantiation id; used as the cache-removal filter on destroy.
pub const INSTANTIATION_ID_FIELD: u8 = field::INSTANTIATION_ID;

impl InstantiationEvent {
    pub fn encode(&self) -> Value {
        let r = &self.request;
        let mut table = Params::new();
        table.insert(field::TEMPLATE, Value::from(r.template.as_str()));
        table.insert(field::POSITION, Value::Vector3(r.position));
        table.insert(field::ROTATION, Value::Quaternion(r.rotation));
        table.insert(field::GROUP, Value::from(i64::from(r.group)));
        table.insert(
            field::VIEW_IDS,
            Value::Array(r.view_ids.iter().map(|id| Value::from(*id)).collect()),
        );
        if !r.data.is_empty() {
            table.insert(field::DATA, Value::Array(r.data.clone()));
        }
        table.insert(field::TIMESTAMP, Value::from(r.timestamp));
        table.insert(field::INSTANTIATION_ID, Value::from(self.instantiation_id));
        if self.prefix > 0 {
            table.insert(field::PREFIX, Value::from(i64::from(self.prefix)));
        }
        Value::Table(table)
    }

    /// `sender` is the creator; `is_scene` is inferred from the view ids
    /// (scene objects use actor 0's range).
    pub fn decode(data: &Value, sender: ActorId) -> Result<Self, DispatchFault> {
        let table = data
            .as_table()
            .ok_or(DispatchFault::Malformed("instantiation event"))?;
        let template = table
            .string(field::TEMPLATE)
            .ok_or(DispatchFault::Malformed("instantiation template"))?
            .to_owned();
        let view_ids: Vec<ViewId> = table
            .array(field::VIEW_IDS)
            .ok_or(DispatchFault::Malformed("instantiation view ids"))?
            .iter()
            .filter_map(Value::as_view)
            .collect();
        let first = *view_ids
            .first()
            .ok_or(DispatchFault::Malformed("instantiation without views"))?;
        let position = match table.value(field::POSITION) {
            Some(Value::Vector3(p)) => *p,
            _ => [0.0; 3],
        };
        let rotation = match table.value(field::ROTATION) {
            Some(Value::Quaternion(q)) => *q,
            _ => [0.0, 0.0, 0.0, 1.0],
        };
        Ok(Self {
            request: InstantiateRequest {
                template,
                position,
                rotation,
                group: table
                    .int(field::GROUP)
                    .and_then(|g| u8::try_from(g).ok())
                    .unwrap_or(0),
                is_scene: first.owner_actor() == ActorId::SCENE,
                view_ids,
                data: table.array(field::DATA).map(<[Value]>::to_vec).unwrap_or_default(),
                creator: sender,
                timestamp: table.int(field::TIMESTAMP).unwrap_or(0),
            },
            instantiation_id: table
                .int32(field::INSTANTIATION_ID)
                .map(ViewId)
                .unwrap_or(first),
            prefix: table
                .int(field::PREFIX)
                .and_then(|p| i16::try_from(p).ok())
                .unwrap_or(0),
        })
    }
}

/// `{ 0: id }`, the payload of destroy and destroy-player events.
pub(crate) fn single_id(id: i32) -> Value {
    Value::Table(Params::from([(0, Value::from(id))]))
}

pub(crate) fn read_single_id(data: &Value) -> Option<i32> {
    data.as_table().and_then(|t| t.int32(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InstantiateRequest {
        InstantiateRequest {
            template: "Elf".into(),
            position: [1.0, 2.0, 3.0],
            rotation: [0.0, 0.0, 0.0, 1.0],
            group: 2,
            view_ids: vec![ViewId(3001), ViewId(3002)],
            data: vec![Value::from("green")],
            creator: ActorId(3),
            is_scene: false,
            timestamp: 1234,
        }
    }

    #[test]
    fn event_decodes_with_sender_as_creator() {
        let event = InstantiationEvent {
            request: request(),
            instantiation_id: ViewId(3001),
            prefix: 0,
        };
        let decoded = InstantiationEvent::decode(&event.encode(), ActorId(3)).unwrap();
        assert_eq!(decoded, event);
        assert!(!decoded.request.is_scene);
    }

    #[test]
    fn missing_template_is_malformed() {
        let data = Value::Table(Params::from([(field::VIEW_IDS, Value::Array(vec![Value::from(5)]))]));
        match InstantiationEvent::decode(&data, ActorId(1)) {
            Err(DispatchFault::Malformed(what)) => assert_eq!(what, "instantiation template"),
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn views_share_the_handle_and_instantiation_id() {
        let mut host = NullHost::default();
        let req = request();
        let spawned = host.instantiate(&req).unwrap();
        let views = build_views(&req, spawned, 4);
        assert_eq!(views.len(), 2);
        for view in &views {
            assert_eq!(view.handle, Some(ObjectHandle(1)));
            assert_eq!(view.instantiation_id, Some(ViewId(3001)));
            assert_eq!(view.owner, ActorId(3));
            assert_eq!(view.group, 2);
            assert_eq!(view.prefix, 4);
        }
    }
}
