// Remote invocation: method registration, resolution, and the RPC frame.
//
// Each view carries an `RpcTable`: the methods its components registered at
// construction, each with a declared parameter list. There is no runtime
// introspection; resolving an inbound call is a scan of that table.
//
// A method is a candidate for `(name, args)` when its name matches and
// either:
//   (a) it declares exactly `args.len()` value parameters and each argument
//       is accepted by its parameter kind (a `Null` argument fits any kind),
//   (b) it declares `args.len() + 1` parameters, the first `args.len()`
//       accept the arguments, and the last is `ParamSpec::Info`, or
//   (c) it declares a single `ParamSpec::AllArgs` parameter.
// Exactly one candidate across all components must exist. Zero candidates
// and several candidates are both dispatch faults: logged by the caller,
// never invoked, never fatal.
//
// Wire frame (the `DATA` of an `EventCode::Rpc` event), positional:
//   0: view id, 1: level prefix (only when > 0), 2: timestamp,
//   3: method name, 4: arguments (omitted when empty),
//   5: shortcut index (replaces 3 when the name is in the shared table).

use std::fmt;

use tierlink_protocol::{ActorId, Params, ParamsExt, Value, ViewId};

use crate::error::DispatchFault;

/// Accepted kind of one RPC argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Any,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    Vector2,
    Vector3,
    Quaternion,
    Array,
    Map,
    Table,
}

impl ArgKind {
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (ArgKind::Any, _) | (_, Value::Null) => true,
            (ArgKind::Bool, Value::Bool(_))
            | (ArgKind::Int, Value::Int(_))
            | (ArgKind::Float, Value::Float(_))
            | (ArgKind::Str, Value::Str(_))
            | (ArgKind::Bytes, Value::Bytes(_))
            | (ArgKind::Vector2, Value::Vector2(_))
            | (ArgKind::Vector3, Value::Vector3(_))
            | (ArgKind::Quaternion, Value::Quaternion(_))
            | (ArgKind::Array, Value::Array(_))
            | (ArgKind::Map, Value::Map(_))
            | (ArgKind::Table, Value::Table(_)) => true,
            _ => false,
        }
    }
}

/// One declared parameter of a registered method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamSpec {
    Value(ArgKind),
    /// Trailing parameter receiving `MessageInfo`.
    Info,
    /// Sole parameter receiving the whole argument list.
    AllArgs,
}

/// Call metadata handed to every invoked method.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageInfo {
    pub sender: ActorId,
    pub timestamp: i64,
    pub view: ViewId,
}

pub type RpcHandler = Box<dyn FnMut(&[Value], &MessageInfo)>;

struct RpcMethod {
    component: String,
    name: String,
    params: Vec<ParamSpec>,
    handler: RpcHandler,
}

impl RpcMethod {
    fn matches(&self, args: &[Value]) -> bool {
        let fits = |specs: &[ParamSpec]| {
            specs.iter().zip(args).all(|(spec, arg)| match spec {
                ParamSpec::Value(kind) => kind.accepts(arg),
                ParamSpec::Info | ParamSpec::AllArgs => false,
            })
        };
        match self.params.as_slice() {
            [ParamSpec::AllArgs] => true,
            params if params.len() == args.len() => fits(params),
            [rest @ .., ParamSpec::Info] if rest.len() == args.len() => fits(rest),
            _ => false,
        }
    }
}

/// Methods registered on one view, across all of its components.
#[derive(Default)]
pub struct RpcTable {
    methods: Vec<RpcMethod>,
}

impl fmt::Debug for RpcTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.methods
                    .iter()
                    .map(|m| format!("{}::{}/{}", m.component, m.name, m.params.len())),
            )
            .finish()
    }
}

impl RpcTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `component::name` with its declared parameters.
    pub fn register(
        &mut self,
        component: impl Into<String>,
        name: impl Into<String>,
        params: Vec<ParamSpec>,
        handler: impl FnMut(&[Value], &MessageInfo) + 'static,
    ) -> &mut Self {
        self.methods.push(RpcMethod {
            component: component.into(),
            name: name.into(),
            params,
            handler: Box::new(handler),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Index of the single method accepting `(name, args)`.
    pub fn resolve(&self, view: ViewId, name: &str, args: &[Value]) -> Result<usize, DispatchFault> {
        let mut named = 0;
        let mut found = Vec::new();
        for (i, method) in self.methods.iter().enumerate() {
            if method.name != name {
                continue;
            }
            named += 1;
            if method.matches(args) {
                found.push(i);
            }
        }
        match found.as_slice() {
            [only] => Ok(*only),
            [] if named == 0 => Err(DispatchFault::NoMethod {
                view,
                name: name.to_owned(),
            }),
            [] => Err(DispatchFault::NoMatchingSignature {
                view,
                name: name.to_owned(),
                arg_count: args.len(),
            }),
            many => Err(DispatchFault::Ambiguous {
                view,
                name: name.to_owned(),
                count: many.len(),
            }),
        }
    }

    /// Resolve and call. Nothing is invoked unless exactly one method fits.
    pub fn invoke(&mut self, name: &str, args: &[Value], info: &MessageInfo) -> Result<(), DispatchFault> {
        let index = self.resolve(info.view, name, args)?;
        (self.methods[index].handler)(args, info);
        Ok(())
    }
}

/// Who receives an RPC, and whether the backend buffers it for late joiners.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcTarget {
    /// Others via the backend; executed locally right away.
    All,
    Others,
    MasterClient,
    AllBuffered,
    OthersBuffered,
    /// Everyone, including the sender, via the backend echo.
    AllViaServer,
    AllBufferedViaServer,
}

impl RpcTarget {
    pub fn is_buffered(self) -> bool {
        matches!(
            self,
            RpcTarget::AllBuffered | RpcTarget::OthersBuffered | RpcTarget::AllBufferedViaServer
        )
    }

    /// The sender runs the method immediately instead of waiting for an echo.
    pub fn runs_locally_now(self) -> bool {
        matches!(self, RpcTarget::All | RpcTarget::AllBuffered)
    }
}

/// A decoded RPC frame.
#[derive(Clone, Debug, PartialEq)]
pub struct RpcFrame {
    pub view: ViewId,
    pub prefix: i16,
    pub timestamp: i64,
    pub method: String,
    pub args: Vec<Value>,
}

mod field {
    pub const VIEW: u8 = 0;
    pub const PREFIX: u8 = 1;
    pub const TIMESTAMP: u8 = 2;
    pub const NAME: u8 = 3;
    pub const ARGS: u8 = 4;
    pub const SHORTCUT: u8 = 5;
}

/// Key of the view id inside an RPC frame; used as the cache-removal filter.
pub const RPC_VIEW_FIELD: u8 = field::VIEW;

impl RpcFrame {
    pub fn encode(&self, shortcuts: &[String]) -> Value {
        let mut table = Params::new();
        table.insert(field::VIEW, Value::from(self.view));
        if self.prefix > 0 {
            table.insert(field::PREFIX, Value::from(i64::from(self.prefix)));
        }
        table.insert(field::TIMESTAMP, Value::from(self.timestamp));
        match shortcuts.iter().position(|s| *s == self.method) {
            Some(index) => {
                table.insert(field::SHORTCUT, Value::Int(index as i64));
            }
            None => {
                table.insert(field::NAME, Value::from(self.method.as_str()));
            }
        }
        if !self.args.is_empty() {
            table.insert(field::ARGS, Value::Array(self.args.clone()));
        }
        Value::Table(table)
    }

    pub fn decode(data: &Value, shortcuts: &[String]) -> Result<Self, DispatchFault> {
        let table = data.as_table().ok_or(DispatchFault::Malformed("rpc frame"))?;
        let view = table
            .int32(field::VIEW)
            .map(ViewId)
            .ok_or(DispatchFault::Malformed("rpc view id"))?;
        let method = match (table.string(field::NAME), table.int(field::SHORTCUT)) {
            (Some(name), _) => name.to_owned(),
            (None, Some(index)) => usize::try_from(index)
                .ok()
                .and_then(|i| shortcuts.get(i))
                .cloned()
                .ok_or(DispatchFault::UnknownShortcut(index))?,
            (None, None) => return Err(DispatchFault::Malformed("rpc method")),
        };
        Ok(Self {
            view,
            prefix: table
                .int(field::PREFIX)
                .and_then(|p| i16::try_from(p).ok())
                .unwrap_or(0),
            timestamp: table.int(field::TIMESTAMP).unwrap_or(0),
            method,
            args: table.array(field::ARGS).map(<[Value]>::to_vec).unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn info() -> MessageInfo {
        MessageInfo {
            sender: ActorId(2),
            timestamp: 77,
            view: ViewId(1001),
        }
    }

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&'static str) -> RpcHandler) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        let make = move |tag: &'static str| -> RpcHandler {
            let sink = sink.clone();
            Box::new(move |args: &[Value], _: &MessageInfo| {
                sink.borrow_mut().push(format!("{tag}:{}", args.len()))
            })
        };
        (log, make)
    }

    #[test]
    fn exact_arity_and_kinds_match() {
        let (log, make) = recorder();
        let mut table = RpcTable::new();
        table.register("Health", "Hit", vec![ParamSpec::Value(ArgKind::Int)], make("int"));
        table.register("Health", "Hit", vec![ParamSpec::Value(ArgKind::Str)], make("str"));

        table.invoke("Hit", &[Value::from(5)], &info()).unwrap();
        table.invoke("Hit", &[Value::from("crit")], &info()).unwrap();
        assert_eq!(*log.borrow(), vec!["int:1", "str:1"]);
    }

    #[test]
    fn trailing_info_parameter_counts_as_one_extra() {
        let got = Rc::new(RefCell::new(None));
        let sink = got.clone();
        let mut table = RpcTable::new();
        table.register(
            "Chat",
            "Say",
            vec![ParamSpec::Value(ArgKind::Str), ParamSpec::Info],
            move |_: &[Value], info: &MessageInfo| *sink.borrow_mut() = Some(info.sender),
        );
        table.invoke("Say", &[Value::from("hi")], &info()).unwrap();
        assert_eq!(*got.borrow(), Some(ActorId(2)));
    }

    #[test]
    fn aggregate_parameter_takes_any_arguments() {
        let (log, make) = recorder();
        let mut table = RpcTable::new();
        table.register("Log", "Trace", vec![ParamSpec::AllArgs], make("all"));
        table
            .invoke("Trace", &[Value::from(1), Value::from(true), Value::Null], &info())
            .unwrap();
        assert_eq!(*log.borrow(), vec!["all:3"]);
    }

    #[test]
    fn null_argument_fits_any_kind() {
        let mut table = RpcTable::new();
        table.register("A", "Set", vec![ParamSpec::Value(ArgKind::Vector3)], |_: &[Value], _: &MessageInfo| {});
        assert!(table.resolve(ViewId(1), "Set", &[Value::Null]).is_ok());
    }

    #[test]
    fn missing_name_and_wrong_signature_are_distinguished() {
        let mut table = RpcTable::new();
        table.register("A", "Jump", vec![ParamSpec::Value(ArgKind::Float)], |_: &[Value], _: &MessageInfo| {});

        match table.resolve(ViewId(1), "Fly", &[]) {
            Err(DispatchFault::NoMethod { name, .. }) => assert_eq!(name, "Fly"),
            other => panic!("expected NoMethod, got {other:?}"),
        }
        match table.resolve(ViewId(1), "Jump", &[Value::from("high")]) {
            Err(DispatchFault::NoMatchingSignature { arg_count, .. }) => assert_eq!(arg_count, 1),
            other => panic!("expected NoMatchingSignature, got {other:?}"),
        }
    }

    #[test]
    fn two_matches_invoke_nothing() {
        let (log, make) = recorder();
        let mut table = RpcTable::new();
        table.register("A", "Ping", vec![ParamSpec::Value(ArgKind::Any)], make("a"));
        table.register("B", "Ping", vec![ParamSpec::Value(ArgKind::Int)], make("b"));

        match table.invoke("Ping", &[Value::from(3)], &info()) {
            Err(DispatchFault::Ambiguous { count, .. }) => assert_eq!(count, 2),
            other => panic!("expected Ambiguous, got {other:?}"),
        }
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn shortcut_replaces_the_name_on_the_wire() {
        let shortcuts = vec!["Fire".to_string(), "Reload".to_string()];
        let frame = RpcFrame {
            view: ViewId(2001),
            prefix: 0,
            timestamp: 10,
            method: "Reload".into(),
            args: vec![],
        };
        let wire = frame.encode(&shortcuts);
        let table = wire.as_table().unwrap();
        assert_eq!(table.int(field::SHORTCUT), Some(1));
        assert!(!table.contains_key(&field::NAME));
        assert!(!table.contains_key(&field::PREFIX));
        assert_eq!(RpcFrame::decode(&wire, &shortcuts).unwrap(), frame);

        match RpcFrame::decode(&wire, &shortcuts[..1]) {
            Err(DispatchFault::UnknownShortcut(1)) => {}
            other => panic!("expected UnknownShortcut, got {other:?}"),
        }
    }
}
