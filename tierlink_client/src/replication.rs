// Remote invocation and state replication.
//
// Outbound RPCs are encoded as `RpcFrame`s inside an `EventCode::Rpc` event.
// The `RpcTarget` decides the receiver group, whether the backend buffers
// the call for late joiners, and whether the caller runs it immediately
// rather than waiting for the relay's echo.
//
// The sync pass (`send_view_updates`) runs once per service call. It walks
// every view this client controls, asks `sync::outgoing` what (if anything)
// to send under the view's mode, and batches the results per
// `(interest group, reliable)` pair, so reliable and unreliable states never
// share a message and each group gets at most two messages per tick.
//
// Inbound RPCs and batches are dropped, never failed: a missing view is the
// normal aftermath of a destroy, and a stale level prefix means the frame
// belongs to a scene the receiver already left.
//
// See also: `rpc.rs` (method tables, frame codec), `sync.rs` (comparison,
// delta compression, batch codec).

use log::{debug, trace, warn};
use tierlink_protocol::{ActorId, CachingOption, EventCode, Params, ReceiverGroup, Value, ViewId};

use crate::error::{ClientError, DispatchFault, Result};
use crate::operations::RaiseEventOptions;
use crate::peer::Peer;
use crate::rpc::{MessageInfo, RPC_VIEW_FIELD, RpcFrame, RpcTarget};
use crate::sync::{self, Batches, ReceivedBatch, SyncMode};
use crate::transport::{Delivery, Transport};

impl<T: Transport> Peer<T> {
    /// Call `method` on view `view` for the participants `target` names.
    pub fn rpc(
        &mut self,
        view: ViewId,
        method: &str,
        target: RpcTarget,
        args: Vec<Value>,
    ) -> Result<()> {
        let Some((data, group)) = self.prepare_rpc(view, method, &args)? else {
            return Ok(());
        };
        let mut options = RaiseEventOptions {
            interest_group: group,
            ..Default::default()
        };
        if target.is_buffered() {
            options.caching = CachingOption::AddToRoomCache;
        }
        let mut run_locally = target.runs_locally_now();
        match target {
            RpcTarget::All | RpcTarget::Others | RpcTarget::AllBuffered | RpcTarget::OthersBuffered => {}
            RpcTarget::AllViaServer | RpcTarget::AllBufferedViaServer => {
                options.receivers = ReceiverGroup::All;
            }
            RpcTarget::MasterClient => {
                if self.is_master_client() {
                    run_locally = true;
                } else {
                    options.receivers = ReceiverGroup::MasterClient;
                }
            }
        }
        if !(run_locally && target == RpcTarget::MasterClient) {
            self.send_event(EventCode::Rpc, data, &options, Delivery::Reliable)?;
        }
        if run_locally {
            self.invoke_local(view, method, &args);
        }
        Ok(())
    }

    /// Call `method` on view `view` for one participant only.
    pub fn rpc_to_player(
        &mut self,
        view: ViewId,
        method: &str,
        actor: ActorId,
        args: Vec<Value>,
    ) -> Result<()> {
        let Some((data, group)) = self.prepare_rpc(view, method, &args)? else {
            return Ok(());
        };
        if actor == self.local_actor {
            self.invoke_local(view, method, &args);
            return Ok(());
        }
        if !self.require_room()?.contains(actor) {
            return Err(ClientError::UnknownActor(actor));
        }
        let options = RaiseEventOptions {
            target_actors: vec![actor],
            interest_group: group,
            ..Default::default()
        };
        self.send_event(EventCode::Rpc, data, &options, Delivery::Reliable)
    }

    /// Encoded frame plus the view's group; `None` if the group's sends are
    /// blocked.
    fn prepare_rpc(
        &self,
        view: ViewId,
        method: &str,
        args: &[Value],
    ) -> Result<Option<(Value, u8)>> {
        self.require_room()?;
        let v = self.views.get(view).ok_or(ClientError::UnknownView(view))?;
        if self.blocked_send_groups.contains(&v.group) {
            debug!("rpc {method} on {view:?} suppressed: group {} blocked", v.group);
            return Ok(None);
        }
        let frame = RpcFrame {
            view,
            prefix: v.prefix,
            timestamp: self.server_timestamp(),
            method: method.to_owned(),
            args: args.to_vec(),
        };
        Ok(Some((frame.encode(&self.config.rpc_shortcuts), v.group)))
    }

    fn invoke_local(&mut self, view: ViewId, method: &str, args: &[Value]) {
        let info = MessageInfo {
            sender: self.local_actor,
            timestamp: self.server_timestamp(),
            view,
        };
        let result = match self.views.get_mut(view) {
            Some(v) => v.rpcs.invoke(method, args, &info),
            None => Err(DispatchFault::MissingView(view)),
        };
        if let Err(fault) = result {
            warn!("local rpc {method}: {fault}");
        }
    }

    /// Purge the RPCs `actor` buffered in the room cache. Only the master
    /// may purge another participant's calls.
    pub fn remove_rpcs(&mut self, actor: ActorId) -> Result<()> {
        let room = self.require_room()?;
        if actor != self.local_actor && !room.local_is_master() {
            return Err(ClientError::NotMasterClient);
        }
        self.purge_cached(EventCode::Rpc, Value::Null, Some(actor))
    }

    /// Purge buffered RPCs targeting one view.
    pub fn remove_rpcs_for_view(&mut self, view: ViewId) -> Result<()> {
        self.require_room()?;
        let filter = Value::Table(Params::from([(RPC_VIEW_FIELD, Value::from(view))]));
        self.purge_cached(EventCode::Rpc, filter, None)
    }

    /// Remove cached events of `code` whose data matches `filter`, sent by
    /// `sender` (any sender when `None`).
    pub(crate) fn purge_cached(
        &mut self,
        code: EventCode,
        filter: Value,
        sender: Option<ActorId>,
    ) -> Result<()> {
        let options = RaiseEventOptions {
            caching: CachingOption::RemoveFromRoomCache,
            target_actors: sender.into_iter().collect(),
            ..Default::default()
        };
        self.send_event(code, filter, &options, Delivery::Reliable)
    }

    pub(crate) fn on_rpc(&mut self, sender: ActorId, data: &Value) {
        let frame = match RpcFrame::decode(data, &self.config.rpc_shortcuts) {
            Ok(frame) => frame,
            Err(fault) => {
                warn!("rpc from {sender:?}: {fault}");
                return;
            }
        };
        match self.execute_rpc(sender, frame) {
            Ok(()) => {}
            Err(fault @ DispatchFault::MissingView(_)) => debug!("rpc from {sender:?}: {fault}"),
            Err(fault) => warn!("rpc from {sender:?}: {fault}"),
        }
    }

    fn execute_rpc(&mut self, sender: ActorId, frame: RpcFrame) -> std::result::Result<(), DispatchFault> {
        let view = self
            .views
            .get_mut(frame.view)
            .ok_or(DispatchFault::MissingView(frame.view))?;
        if view.prefix > 0 && frame.prefix != view.prefix {
            return Err(DispatchFault::PrefixMismatch {
                view: frame.view,
                expected: view.prefix,
                received: frame.prefix,
            });
        }
        let info = MessageInfo {
            sender,
            timestamp: frame.timestamp,
            view: frame.view,
        };
        view.rpcs.invoke(&frame.method, &frame.args, &info)
    }

    // -----------------------------------------------------------------------
    // Synchronization
    // -----------------------------------------------------------------------

    /// Send this tick's state for every view this client controls.
    pub(crate) fn send_view_updates(&mut self) {
        let Some(room) = self.room.as_ref() else {
            return;
        };
        if room.player_count() <= 1 || !self.in_room() {
            return;
        }
        let local = self.local_actor;
        let local_is_master = room.local_is_master();

        let mut batches = Batches::new();
        for view in self.views.iter_mut() {
            if view.sync == SyncMode::Off
                || !view.is_mine(local, local_is_master)
                || self.blocked_send_groups.contains(&view.group)
            {
                continue;
            }
            let Some(current) = view.write_state() else {
                continue;
            };
            if let Some(out) = sync::outgoing(view.sync, current, &mut view.state, &self.precision) {
                batches
                    .entry((view.group, out.reliable))
                    .or_default()
                    .entries
                    .push((view.id, out.state));
            }
        }

        let timestamp = self.server_timestamp();
        for ((group, reliable), batch) in batches {
            let (code, delivery) = if reliable {
                (EventCode::SendSerializeReliable, Delivery::Reliable)
            } else {
                (EventCode::SendSerialize, Delivery::Unreliable)
            };
            trace!("sync {} view(s) in group {group} (reliable: {reliable})", batch.entries.len());
            let options = RaiseEventOptions {
                interest_group: group,
                ..Default::default()
            };
            let data = batch.encode(timestamp, self.level_prefix);
            if let Err(e) = self.send_event(code, data, &options, delivery) {
                warn!("failed to send sync batch for group {group}: {e}");
            }
        }
    }

    pub(crate) fn on_sync_batch(&mut self, sender: ActorId, data: &Value) {
        let batch = match ReceivedBatch::decode(data) {
            Ok(batch) => batch,
            Err(fault) => {
                warn!("sync batch from {sender:?}: {fault}");
                return;
            }
        };
        let master = self
            .room
            .as_ref()
            .map_or(ActorId::NONE, |r| r.master_client_id);
        for (id, wire) in batch.entries {
            let Some(view) = self.views.get_mut(id) else {
                debug!("{}", DispatchFault::MissingView(id));
                continue;
            };
            if view.prefix > 0 && batch.prefix != view.prefix {
                debug!(
                    "{}",
                    DispatchFault::PrefixMismatch {
                        view: id,
                        expected: view.prefix,
                        received: batch.prefix,
                    }
                );
                continue;
            }
            if view.group != 0 && !self.receive_groups.contains(&view.group) {
                trace!("view {id:?} is in unsubscribed group {}", view.group);
                continue;
            }
            let Some(values) = sync::decompress(wire, &mut view.state.last_received) else {
                debug!("{}", DispatchFault::MissingBaseline(id));
                continue;
            };
            // Whoever writes a view's state owns it, except the master
            // writing a scene view.
            if view.owner != sender && !(view.is_scene && sender == master) {
                debug!("{id:?} owner {:?} -> {sender:?} (from sync)", view.owner);
                view.owner = sender;
            }
            let info = MessageInfo {
                sender,
                timestamp: batch.timestamp,
                view: id,
            };
            view.read_state(&values, &info);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use tierlink_protocol::{ClientMessage, ParamsExt, keys};

    use super::*;
    use crate::peer::testing::joined_peer;
    use crate::rpc::{ArgKind, ParamSpec, RpcTable};
    use crate::sync::{Batch, WireState};
    use crate::transport::WireAction;
    use crate::view::{Observed, View};

    type Seen = Rc<RefCell<Vec<Vec<Value>>>>;

    /// Writes a fixed state and records every state it is given.
    struct Fixed {
        values: Vec<Value>,
        seen: Seen,
    }

    impl Observed for Fixed {
        fn write_state(&mut self, out: &mut Vec<Value>) {
            out.extend(self.values.iter().cloned());
        }

        fn read_state(&mut self, values: &[Value], _info: &MessageInfo) {
            self.seen.borrow_mut().push(values.to_vec());
        }
    }

    fn synced(id: i32, owner: i32, mode: SyncMode, seen: &Seen) -> View {
        View::new(ViewId(id), ActorId(owner)).with_sync(
            mode,
            Fixed {
                values: vec![Value::from(id)],
                seen: Rc::clone(seen),
            },
        )
    }

    fn batch_from(view: i32, prefix: i16, value: i64) -> Value {
        let batch = Batch {
            entries: vec![(
                ViewId(view),
                WireState {
                    values: vec![Value::from(value)],
                    compressed: false,
                    null_indices: Vec::new(),
                },
            )],
        };
        batch.encode(10, prefix)
    }

    #[test]
    fn rpc_for_another_level_prefix_is_dropped() {
        let (mut peer, _remote) = joined_peer(1, &[2]);
        let hits = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&hits);
        let mut rpcs = RpcTable::new();
        rpcs.register(
            "Health",
            "Hit",
            vec![ParamSpec::Value(ArgKind::Int)],
            move |args: &[Value], _info: &MessageInfo| {
                sink.borrow_mut().push(args[0].clone());
            },
        );
        let mut view = View::new(ViewId(2001), ActorId(2)).with_rpcs(rpcs);
        view.prefix = 3;
        peer.views.insert(view);

        let frame = |prefix: i16, amount: i64| RpcFrame {
            view: ViewId(2001),
            prefix,
            timestamp: 0,
            method: "Hit".into(),
            args: vec![Value::from(amount)],
        };
        let stale = frame(1, 10).encode(&peer.config.rpc_shortcuts);
        peer.on_rpc(ActorId(2), &stale);
        assert!(hits.borrow().is_empty());

        let current = frame(3, 20).encode(&peer.config.rpc_shortcuts);
        peer.on_rpc(ActorId(2), &current);
        assert_eq!(*hits.borrow(), vec![Value::from(20)]);
    }

    #[test]
    fn sync_entry_for_another_level_prefix_is_dropped() {
        let (mut peer, _remote) = joined_peer(1, &[2]);
        let seen = Seen::default();
        let mut view = synced(2001, 2, SyncMode::Unreliable, &seen);
        view.prefix = 3;
        peer.views.insert(view);

        peer.on_sync_batch(ActorId(2), &batch_from(2001, 1, 7));
        assert!(seen.borrow().is_empty());

        peer.on_sync_batch(ActorId(2), &batch_from(2001, 3, 8));
        assert_eq!(*seen.borrow(), vec![vec![Value::from(8)]]);
    }

    #[test]
    fn repeated_sync_batch_is_applied_the_same_way() {
        let (mut peer, _remote) = joined_peer(1, &[2]);
        let seen = Seen::default();
        peer.views.insert(synced(2001, 2, SyncMode::Unreliable, &seen));

        let batch = batch_from(2001, 0, 4);
        peer.on_sync_batch(ActorId(2), &batch);
        peer.on_sync_batch(ActorId(2), &batch);
        assert_eq!(
            *seen.borrow(),
            vec![vec![Value::from(4)], vec![Value::from(4)]]
        );
        let view = peer.view(ViewId(2001)).unwrap();
        assert_eq!(view.owner, ActorId(2));
        assert_eq!(view.sync_state().last_received, Some(vec![Value::from(4)]));
    }

    #[test]
    fn updates_are_batched_per_group_and_reliability() {
        let (mut peer, remote) = joined_peer(1, &[2]);
        let seen = Seen::default();
        peer.views.insert(synced(1001, 1, SyncMode::Unreliable, &seen));
        peer.views.insert(synced(1002, 1, SyncMode::ReliableDeltaCompressed, &seen));
        peer.views.insert(synced(1003, 1, SyncMode::Unreliable, &seen));
        peer.views.insert(synced(1004, 1, SyncMode::ReliableDeltaCompressed, &seen).with_group(5));
        // Someone else's view is never written.
        peer.views.insert(synced(2001, 2, SyncMode::Unreliable, &seen));

        peer.send_view_updates();
        let sent: Vec<_> = remote
            .drain()
            .into_iter()
            .filter_map(|action| match action {
                WireAction::Sent {
                    message: ClientMessage::Operation(op),
                    delivery,
                } => {
                    let batch = ReceivedBatch::decode(op.params.get(&keys::DATA)?).ok()?;
                    let ids: Vec<ViewId> = batch.entries.iter().map(|(id, _)| *id).collect();
                    Some((
                        op.params.int(keys::EVENT_CODE)?,
                        op.params.int(keys::INTEREST_GROUP).unwrap_or(0),
                        delivery,
                        ids,
                    ))
                }
                _ => None,
            })
            .collect();

        let unreliable = i64::from(EventCode::SendSerialize.to_byte());
        let reliable = i64::from(EventCode::SendSerializeReliable.to_byte());
        assert_eq!(
            sent,
            vec![
                (
                    unreliable,
                    0,
                    Delivery::Unreliable,
                    vec![ViewId(1001), ViewId(1003)]
                ),
                (reliable, 0, Delivery::Reliable, vec![ViewId(1002)]),
                (reliable, 5, Delivery::Reliable, vec![ViewId(1004)]),
            ]
        );
    }
}
