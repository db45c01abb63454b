// Test harness for multi-client integration tests.
//
// `TestWorld` runs several real `Peer`s against one `LoopbackBackend`
// (see `backend.rs`), all on the test thread. Each client talks to the
// backend through a `MemoryTransport`, so every byte of client logic (the
// tier hops, the room mirror, the event dispatch, sync, RPC, ownership)
// runs exactly as it would against a hosted deployment. The only
// test-specific code is the backend and the tick loop that interleaves
// client service calls with backend pumps.
//
// Each client gets a `TestHost` as its object host. The host knows one
// template, `"avatar"`: one view per requested view id, reliable delta
// compressed sync of a shared value list, takeover ownership, and a
// `"Hit"(Int, Info)` RPC. Everything the host does is appended to a log the
// tests can inspect.
//
// See also: `tests/full_pipeline.rs` for the scenarios.

pub mod backend;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use tierlink_client::{
    ArgKind, ClientConfig, ClientState, InstantiateRequest, MemoryTransport, MessageInfo,
    Notification, ObjectHandle, ObjectHost, Observed, OwnershipPolicy, ParamSpec, Peer,
    RoomOptions, RpcTable, SpawnedObject, SyncMode, ViewSetup,
};
use tierlink_protocol::{ActorId, Value, ViewId};

pub use backend::{GAME_ADDRESS, LoopbackBackend, MASTER_ADDRESS, NAME_ADDRESS};

/// Upper bound for `run_until`; every scenario settles well before this.
const MAX_TICKS: usize = 200;

/// Ticks to run when waiting for something that should NOT happen.
const SETTLE_TICKS: usize = 10;

pub const AVATAR: &str = "avatar";

// ---------------------------------------------------------------------------
// Object host
// ---------------------------------------------------------------------------

/// What a `TestHost` did, in order.
#[derive(Clone, Debug, PartialEq)]
pub enum HostEvent {
    Spawned {
        template: String,
        creator: ActorId,
        view: ViewId,
    },
    Destroyed(ObjectHandle),
    Hit {
        view: ViewId,
        amount: i64,
        sender: ActorId,
    },
}

pub type HostLog = Rc<RefCell<Vec<HostEvent>>>;
pub type AvatarStates = Rc<RefCell<BTreeMap<ViewId, Vec<Value>>>>;

/// Synchronized state of one avatar view, stored outside the view so the
/// test can read and write it.
struct AvatarState {
    view: ViewId,
    states: AvatarStates,
}

impl Observed for AvatarState {
    fn write_state(&mut self, out: &mut Vec<Value>) {
        if let Some(values) = self.states.borrow().get(&self.view) {
            out.extend(values.iter().cloned());
        }
    }

    fn read_state(&mut self, values: &[Value], _info: &MessageInfo) {
        self.states.borrow_mut().insert(self.view, values.to_vec());
    }
}

pub struct TestHost {
    log: HostLog,
    states: AvatarStates,
    next_handle: u64,
}

impl TestHost {
    pub fn new(log: HostLog, states: AvatarStates) -> Self {
        Self {
            log,
            states,
            next_handle: 0,
        }
    }

    fn avatar_view(&self, view: ViewId, position: [f32; 3]) -> ViewSetup {
        self.states
            .borrow_mut()
            .entry(view)
            .or_insert_with(|| vec![Value::Vector3(position), Value::Int(100)]);
        let log = Rc::clone(&self.log);
        let mut rpcs = RpcTable::new();
        rpcs.register(
            "Health",
            "Hit",
            vec![ParamSpec::Value(ArgKind::Int), ParamSpec::Info],
            move |args: &[Value], info: &MessageInfo| {
                log.borrow_mut().push(HostEvent::Hit {
                    view,
                    amount: args.first().and_then(Value::as_i64).unwrap_or(0),
                    sender: info.sender,
                });
            },
        );
        ViewSetup {
            sync: SyncMode::ReliableDeltaCompressed,
            ownership: OwnershipPolicy::Takeover,
            observed: Some(Box::new(AvatarState {
                view,
                states: Rc::clone(&self.states),
            })),
            rpcs,
        }
    }
}

impl ObjectHost for TestHost {
    fn instantiate(&mut self, request: &InstantiateRequest) -> Result<SpawnedObject, String> {
        if request.template != AVATAR {
            return Err(format!("unknown template {:?}", request.template));
        }
        self.next_handle += 1;
        let views = request
            .view_ids
            .iter()
            .map(|id| self.avatar_view(*id, request.position))
            .collect();
        if let Some(first) = request.view_ids.first() {
            self.log.borrow_mut().push(HostEvent::Spawned {
                template: request.template.clone(),
                creator: request.creator,
                view: *first,
            });
        }
        Ok(SpawnedObject {
            handle: ObjectHandle(self.next_handle),
            views,
        })
    }

    fn destroy(&mut self, handle: ObjectHandle) {
        self.log.borrow_mut().push(HostEvent::Destroyed(handle));
    }
}

// ---------------------------------------------------------------------------
// Clients and world
// ---------------------------------------------------------------------------

pub struct TestClient {
    pub name: String,
    pub peer: Peer<MemoryTransport>,
    notifications: Rc<RefCell<Vec<Notification>>>,
    log: HostLog,
    states: AvatarStates,
}

impl TestClient {
    pub fn actor(&self) -> ActorId {
        self.peer.local_actor()
    }

    pub fn state(&self) -> ClientState {
        self.peer.state()
    }

    /// Every notification so far except state changes.
    pub fn notifications(&self) -> Vec<Notification> {
        self.notifications.borrow().clone()
    }

    pub fn clear_notifications(&self) {
        self.notifications.borrow_mut().clear();
    }

    pub fn saw(&self, wanted: &Notification) -> bool {
        self.notifications.borrow().contains(wanted)
    }

    pub fn host_log(&self) -> Vec<HostEvent> {
        self.log.borrow().clone()
    }

    pub fn avatar_state(&self, view: ViewId) -> Option<Vec<Value>> {
        self.states.borrow().get(&view).cloned()
    }

    pub fn set_avatar_state(&self, view: ViewId, values: Vec<Value>) {
        self.states.borrow_mut().insert(view, values);
    }

    /// Master of the local room mirror, if in a room.
    pub fn master(&self) -> Option<ActorId> {
        self.peer.room().map(|r| r.master_client_id)
    }

    pub fn room_actors(&self) -> Vec<ActorId> {
        self.peer
            .room()
            .map(|r| r.actor_ids().collect())
            .unwrap_or_default()
    }
}

pub struct TestWorld {
    pub backend: LoopbackBackend,
    clients: Vec<TestClient>,
}

impl Default for TestWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl TestWorld {
    pub fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        Self {
            backend: LoopbackBackend::new(),
            clients: Vec::new(),
        }
    }

    /// Client config pointing at the loopback name tier, region "eu".
    pub fn config_for(name: &str) -> ClientConfig {
        ClientConfig {
            app_id: "loopback".into(),
            nick_name: name.into(),
            user_id: Some(name.into()),
            name_server_address: NAME_ADDRESS.into(),
            region: Some("eu".into()),
            ..ClientConfig::default()
        }
    }

    /// Add a client with `config`, not yet connected. Returns its index.
    pub fn add_client_with(&mut self, name: &str, config: ClientConfig) -> usize {
        let (transport, remote) = MemoryTransport::pair();
        self.backend.attach(remote, name);
        let log = HostLog::default();
        let states = AvatarStates::default();
        let mut peer = Peer::new(config, transport)
            .with_host(TestHost::new(Rc::clone(&log), Rc::clone(&states)));
        let notifications = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&notifications);
        peer.subscribe(move |n: &Notification| {
            if !matches!(n, Notification::StateChanged { .. }) {
                sink.borrow_mut().push(n.clone());
            }
        });
        self.clients.push(TestClient {
            name: name.into(),
            peer,
            notifications,
            log,
            states,
        });
        self.clients.len() - 1
    }

    /// Add a client and connect it all the way to the master tier.
    pub fn add_client(&mut self, name: &str) -> usize {
        let i = self.add_client_with(name, Self::config_for(name));
        self.clients[i]
            .peer
            .connect_using_settings()
            .expect("connect_using_settings failed");
        self.run_until(&format!("{name} on the master tier"), |w| {
            w.client(i).state() == ClientState::JoinedLobby
        });
        i
    }

    /// Add a client and put it in `room` (creating the room if needed).
    pub fn add_client_in_room(&mut self, name: &str, room: &str) -> usize {
        let i = self.add_client(name);
        self.clients[i]
            .peer
            .join_or_create_room(room, RoomOptions::default())
            .expect("join_or_create_room failed");
        self.run_until(&format!("{name} in {room}"), |w| {
            w.client(i).state() == ClientState::Joined
        });
        i
    }

    pub fn client(&self, i: usize) -> &TestClient {
        &self.clients[i]
    }

    pub fn peer(&mut self, i: usize) -> &mut Peer<MemoryTransport> {
        &mut self.clients[i].peer
    }

    /// One round: every client services once, then the backend answers.
    pub fn tick(&mut self) {
        for client in &mut self.clients {
            client.peer.service();
        }
        self.backend.pump();
    }

    /// Tick until `done` holds. Panics after `MAX_TICKS`.
    pub fn run_until(&mut self, what: &str, mut done: impl FnMut(&TestWorld) -> bool) {
        for _ in 0..MAX_TICKS {
            if done(self) {
                return;
            }
            self.tick();
        }
        panic!("timed out waiting for {what}");
    }

    /// Tick a fixed number of rounds, for checks that something did not
    /// happen.
    pub fn settle(&mut self) {
        for _ in 0..SETTLE_TICKS {
            self.tick();
        }
    }
}
