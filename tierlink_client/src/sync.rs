// Synchronization engine: value comparison, delta compression, and the
// per-tick batch format.
//
// Each tick, every view this client controls writes its state as a flat
// `Vec<Value>` in an order it owns. What happens next depends on the view's
// `SyncMode`:
// - `Unreliable`: the full list is sent unreliably every tick.
// - `UnreliableOnChange`: changed lists are sent unreliably. The first tick
//   that finds the list unchanged re-sends it once reliably, then the view
//   stays silent until it changes again.
// - `ReliableDeltaCompressed`: positions approximately equal to the last
//   sent value are replaced by `Null`; if anything was omitted the update is
//   marked compressed and lists the positions that really became `Null`.
//   When every position is omitted, nothing is sent.
//
// Both baselines hold the last full, uncompressed list: the sender's is what
// the view wrote on its previous tick (sent or not), never the `Null`
// placeholders of the wire form. The receiver rebuilds omitted positions
// from its own baseline and skips a compressed update if it has none yet.
//
// Batches: one message per (interest group, reliability) per tick.
// Batch layout (the event's `DATA`, a positional table):
//   0: timestamp, 1: level prefix (only when > 0), 2: array of view entries.
// View entry (an array): [view id, compressed flag, changed-to-null indices
// or Null, value 0, value 1, ...].
//
// See also: `view.rs` (per-view `SyncState`), `peer.rs` (tick driver).

use std::collections::BTreeMap;

use tierlink_protocol::{Params, ParamsExt, Value, ViewId};

use crate::config::ClientConfig;
use crate::error::DispatchFault;

/// Index of the first state value inside a view entry.
pub const SYNC_FIRST_VALUE: usize = 3;

/// How a view's state travels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    #[default]
    Off,
    Unreliable,
    UnreliableOnChange,
    ReliableDeltaCompressed,
}

/// Equality tolerances.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Precision {
    pub vector: f32,
    pub quaternion_degrees: f32,
    pub float: f32,
}

impl Default for Precision {
    fn default() -> Self {
        Self {
            vector: 0.000_1,
            quaternion_degrees: 1.0,
            float: 0.01,
        }
    }
}

impl From<&ClientConfig> for Precision {
    fn from(config: &ClientConfig) -> Self {
        Self {
            vector: config.vector_precision,
            quaternion_degrees: config.quaternion_precision_degrees,
            float: config.float_precision,
        }
    }
}

/// Tolerant equality: floats, vectors, and quaternions within `precision`,
/// everything else exactly. `Null` equals only `Null`.
pub fn almost_equal(a: &Value, b: &Value, precision: &Precision) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => (x - y).abs() <= f64::from(precision.float),
        (Value::Vector2(x), Value::Vector2(y)) => within(x, y, precision.vector),
        (Value::Vector3(x), Value::Vector3(y)) => within(x, y, precision.vector),
        (Value::Quaternion(x), Value::Quaternion(y)) => {
            quaternion_angle_degrees(x, y) <= precision.quaternion_degrees
        }
        (Value::Array(x), Value::Array(y)) => lists_equal(x, y, precision),
        _ => a == b,
    }
}

pub fn lists_equal(a: &[Value], b: &[Value], precision: &Precision) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| almost_equal(x, y, precision))
}

fn within<const N: usize>(a: &[f32; N], b: &[f32; N], tolerance: f32) -> bool {
    a.iter().zip(b).all(|(x, y)| (x - y).abs() <= tolerance)
}

fn quaternion_angle_degrees(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let clamped = dot.abs().min(1.0);
    (clamped.acos() * 2.0).to_degrees()
}

/// One view's state as it travels.
#[derive(Clone, Debug, PartialEq)]
pub struct WireState {
    pub values: Vec<Value>,
    pub compressed: bool,
    /// Positions that changed to a real `Null` (compressed updates only).
    pub null_indices: Vec<usize>,
}

impl WireState {
    fn full(values: Vec<Value>) -> Self {
        Self {
            values,
            compressed: false,
            null_indices: Vec::new(),
        }
    }
}

/// Compress `current` against `baseline`, then make `current` the new
/// baseline. `None` means every position was unchanged and nothing should be
/// sent.
pub fn compress(
    current: Vec<Value>,
    baseline: &mut Option<Vec<Value>>,
    precision: &Precision,
) -> Option<WireState> {
    let previous = match baseline.replace(current.clone()) {
        Some(previous) if previous.len() == current.len() => previous,
        _ => return Some(WireState::full(current)),
    };
    let mut values = Vec::with_capacity(current.len());
    let mut null_indices = Vec::new();
    let mut omitted = 0;
    for (i, (value, before)) in current.into_iter().zip(&previous).enumerate() {
        if almost_equal(&value, before, precision) {
            omitted += 1;
            values.push(Value::Null);
        } else {
            if value.is_null() {
                null_indices.push(i);
            }
            values.push(value);
        }
    }
    if omitted == values.len() {
        return None;
    }
    Some(WireState {
        values,
        compressed: omitted > 0,
        null_indices,
    })
}

/// Rebuild a received update against the receiver's baseline and advance
/// it. `None` for a compressed update with no usable baseline.
pub fn decompress(wire: WireState, baseline: &mut Option<Vec<Value>>) -> Option<Vec<Value>> {
    if !wire.compressed {
        *baseline = Some(wire.values.clone());
        return Some(wire.values);
    }
    let previous = baseline.as_ref().filter(|p| p.len() == wire.values.len())?;
    let rebuilt: Vec<Value> = wire
        .values
        .into_iter()
        .enumerate()
        .map(|(i, value)| {
            if value.is_null() && !wire.null_indices.contains(&i) {
                previous[i].clone()
            } else {
                value
            }
        })
        .collect();
    *baseline = Some(rebuilt.clone());
    Some(rebuilt)
}

/// Per-view synchronization bookkeeping.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncState {
    pub last_sent: Option<Vec<Value>>,
    pub last_received: Option<Vec<Value>>,
    /// `UnreliableOnChange` already re-sent the unchanged state reliably.
    pub resent_reliably: bool,
}

impl SyncState {
    /// Forget the send baseline so the next tick sends full state.
    pub fn reset_outgoing(&mut self) {
        self.last_sent = None;
        self.resent_reliably = false;
    }
}

/// What to send for one view this tick.
#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    pub reliable: bool,
    pub state: WireState,
}

/// Apply the view's mode to freshly written state.
pub fn outgoing(
    mode: SyncMode,
    current: Vec<Value>,
    state: &mut SyncState,
    precision: &Precision,
) -> Option<Outgoing> {
    match mode {
        SyncMode::Off => None,
        SyncMode::Unreliable => Some(Outgoing {
            reliable: false,
            state: WireState::full(current),
        }),
        SyncMode::UnreliableOnChange => {
            let unchanged = state
                .last_sent
                .as_deref()
                .is_some_and(|prev| lists_equal(prev, &current, precision));
            if unchanged {
                if state.resent_reliably {
                    return None;
                }
                state.resent_reliably = true;
            } else {
                state.resent_reliably = false;
            }
            state.last_sent = Some(current.clone());
            Some(Outgoing {
                reliable: state.resent_reliably,
                state: WireState::full(current),
            })
        }
        SyncMode::ReliableDeltaCompressed => {
            compress(current, &mut state.last_sent, precision).map(|state| Outgoing {
                reliable: true,
                state,
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Batch encoding
// ---------------------------------------------------------------------------

mod field {
    pub const TIMESTAMP: u8 = 0;
    pub const PREFIX: u8 = 1;
    pub const VIEWS: u8 = 2;
}

/// Views of one group and reliability collected during a tick.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Batch {
    pub entries: Vec<(ViewId, WireState)>,
}

/// Batches keyed by `(group, reliable)`.
pub type Batches = BTreeMap<(u8, bool), Batch>;

impl Batch {
    pub fn encode(&self, timestamp: i64, prefix: i16) -> Value {
        let mut table = Params::new();
        table.insert(field::TIMESTAMP, Value::from(timestamp));
        if prefix > 0 {
            table.insert(field::PREFIX, Value::from(i64::from(prefix)));
        }
        let views = self
            .entries
            .iter()
            .map(|(id, wire)| {
                let mut entry = Vec::with_capacity(SYNC_FIRST_VALUE + wire.values.len());
                entry.push(Value::from(*id));
                entry.push(Value::Bool(wire.compressed));
                entry.push(if wire.null_indices.is_empty() {
                    Value::Null
                } else {
                    Value::Array(wire.null_indices.iter().map(|i| Value::Int(*i as i64)).collect())
                });
                entry.extend(wire.values.iter().cloned());
                Value::Array(entry)
            })
            .collect();
        table.insert(field::VIEWS, Value::Array(views));
        Value::Table(table)
    }
}

/// A received batch.
#[derive(Clone, Debug, PartialEq)]
pub struct ReceivedBatch {
    pub timestamp: i64,
    pub prefix: i16,
    pub entries: Vec<(ViewId, WireState)>,
}

impl ReceivedBatch {
    pub fn decode(data: &Value) -> Result<Self, DispatchFault> {
        let table = data.as_table().ok_or(DispatchFault::Malformed("sync batch"))?;
        let views = table
            .array(field::VIEWS)
            .ok_or(DispatchFault::Malformed("sync batch views"))?;
        let entries = views
            .iter()
            .map(decode_entry)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            timestamp: table.int(field::TIMESTAMP).unwrap_or(0),
            prefix: table
                .int(field::PREFIX)
                .and_then(|p| i16::try_from(p).ok())
                .unwrap_or(0),
            entries,
        })
    }
}

fn decode_entry(entry: &Value) -> Result<(ViewId, WireState), DispatchFault> {
    let items = entry
        .as_array()
        .filter(|items| items.len() >= SYNC_FIRST_VALUE)
        .ok_or(DispatchFault::Malformed("sync view entry"))?;
    let id = items[0]
        .as_view()
        .ok_or(DispatchFault::Malformed("sync view id"))?;
    let compressed = items[1].as_bool().unwrap_or(false);
    let null_indices = items[2]
        .as_array()
        .map(|indices| {
            indices
                .iter()
                .filter_map(|i| i.as_i64().and_then(|i| usize::try_from(i).ok()))
                .collect()
        })
        .unwrap_or_default();
    Ok((
        id,
        WireState {
            values: items[SYNC_FIRST_VALUE..].to_vec(),
            compressed,
            null_indices,
        },
    ))
}
