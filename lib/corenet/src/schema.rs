//! Wire identity: opcodes, the Message/Service traits, and the process-wide opcode table
//! (spec §3 "Wire identity", §4.2, §9, §4.7).
//!
//! The concrete message schema (what fields a `PlayerMove` or `ChatLine` actually carries)
//! is explicitly out of scope (spec §1) — that's the "schema provider" external
//! collaborator of spec §6. What lives here is the seam that collaborator plugs into: a
//! `WireMessage`/`WireService` pair per opcode, the table that assigns opcodes
//! deterministically and links a Message's opcode to its inverse Service's, and the
//! `DispatchService` lifecycle (`prepare`/`validate`/`run`/`getSpeed`/`errorOnLimit`) every
//! registered Service implements so `dispatch` can drive it without knowing the concrete
//! type — `prepare`/`validate`/`run`/`getSpeed` may each suspend any number of times
//! (spec §5), so this is an `async_trait(?Send)` trait rather than a plain one.
use crate::codec::{Reader, Writer};
use crate::error::{CoreError, CoreResult};
use crate::session::Session;
use std::cell::Cell;
use std::collections::HashMap;

/// Describes one field's shape for introspection (the JSON opcode-table document pushed to
/// stream clients on open, spec §4.4). Purely metadata — encoding/decoding is done by each
/// type's own `encode_body`/`decode_body` using `codec::Writer`/`Reader`, not by walking
/// this description at runtime.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "kind")]
pub enum FieldKind {
    I32,
    I64,
    U32,
    U64,
    F32,
    F64,
    Bool,
    Str,
    Enum { variants: Vec<String> },
    Array { element: Box<FieldKind> },
    Vector { arity: usize },
    Nested { type_name: &'static str },
}

/// A value only constructible through a type's `create(...)` factory. Carrying a bare `T`
/// through `Session::send` or `Dispatcher::run` isn't possible — callers must go through
/// `Created::new`, which only the factory function calls — enforcing spec §3's "a value may
/// only be sent/dispatched if it was obtained via `create()`" at the type level instead of
/// with a runtime flag check.
pub struct Created<T> {
    value: T,
}

impl<T> Created<T> {
    /// Called by a type's `create(...)` factory only.
    pub fn new(value: T) -> Created<T> {
        Created { value }
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> std::ops::Deref for Created<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> std::ops::DerefMut for Created<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// A server-to-client wire unit (spec GLOSSARY). `encode_body` writes everything after the
/// opcode byte.
pub trait WireMessage {
    fn type_name() -> &'static str
    where
        Self: Sized;
    fn fields() -> Vec<FieldKind>
    where
        Self: Sized;
    fn encode_body(&self, out: &mut Writer);
}

/// A client-to-server wire unit bound to a handler (spec GLOSSARY). `decode_body` populates
/// fields in schema order from the bytes following the opcode; `Service::type_name()` must
/// match the paired `Message::type_name()` exactly — the table uses this name to pair them.
pub trait WireService {
    fn type_name() -> &'static str
    where
        Self: Sized;
    fn fields() -> Vec<FieldKind>
    where
        Self: Sized;
    fn decode_body(input: &mut Reader) -> CoreResult<Self>
    where
        Self: Sized;
}

/// Per-class dispatch configuration, merged over built-in global defaults (spec §4.7 step 2,
/// "select effective options by merging class defaults over global defaults" — a Service
/// that doesn't override `options()` gets the global defaults, `ServiceOptions::default()`,
/// untouched).
#[derive(Debug, Clone, Copy)]
pub struct ServiceOptions {
    /// Whether this class opts into ordered delivery (spec §4.3 "Delivery and ordering",
    /// §4.7 step 3, GLOSSARY "Ordered / unordered service"). Default `false`: invoked on
    /// first reassembly (the datagram path's immediate, `correctOrder == false` delivery).
    /// `true` means the handler only runs once strict in-order delivery catches up
    /// (`correctOrder == true`). The gate is skipped entirely when the caller's
    /// `correctOrder` is undefined (the stream path, spec §4.4: "matches Services
    /// regardless of their ordering option").
    pub correct_order: bool,
    /// A fixed rate-limit period in milliseconds, used when `get_speed` returns `None`
    /// (spec §4.7 step 4).
    pub limit_millis: Option<i64>,
    /// Use the strict (reject-and-notify) rate limiter instead of the soft
    /// (delay-and-coalesce) one (spec §4.6, §4.7 step 5).
    pub error_on_limit: bool,
    /// Skip the non-reentrancy lock for this class (spec §4.7 step 6).
    pub allow_simultaneously: bool,
    /// Call `updateLastTime` even when the service reported no changes (spec §4.7 step 9).
    pub limit_always: bool,
}

impl Default for ServiceOptions {
    fn default() -> ServiceOptions {
        ServiceOptions {
            correct_order: false,
            limit_millis: None,
            error_on_limit: false,
            allow_simultaneously: false,
            limit_always: false,
        }
    }
}

/// The scoped "currently running service" context (spec §4.7 step 7): passed into `run()` so
/// `trackChange()` (spec §4.7 "Change tracking") has something concrete to set, instead of
/// thread-local state that single-threaded cooperative tasks don't need.
pub struct DispatchContext<'a> {
    session: &'a Session,
    modified: Cell<bool>,
}

impl<'a> DispatchContext<'a> {
    pub fn new(session: &'a Session) -> DispatchContext<'a> {
        DispatchContext { session, modified: Cell::new(false) }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    /// Marks this dispatch as having modified entities, so step 9 calls `updateLastTime`
    /// even when the class doesn't set `limit_always`.
    pub fn track_change(&self) {
        self.modified.set(true);
    }

    pub fn has_modified_entities(&self) -> bool {
        self.modified.get()
    }
}

/// Lifecycle every registered Service implements so `dispatch` can drive it without knowing
/// the concrete type (spec §4.7). `prepare`/`validate`/`run`/`get_speed` may each suspend any
/// number of times (spec §5), hence `async_trait(?Send)` rather than a plain trait — the
/// runtime is single-threaded, so no `Send` bound is needed or wanted.
#[async_trait::async_trait(?Send)]
pub trait DispatchService {
    fn service_type_name(&self) -> &'static str;

    fn options(&self) -> ServiceOptions {
        ServiceOptions::default()
    }

    /// `getSpeed()` (spec §4.6): when it returns `Some`, its tiles/second overrides
    /// `options().limit_millis` for this dispatch's rate-limit period.
    async fn get_speed(&self) -> Option<f64> {
        None
    }

    /// Any of `prepare`/`validate`/`run` returning `Err` is spec §4.7 step 7's "any thrown
    /// failure is logged" — the dispatch pipeline logs it at the boundary and moves on, per
    /// spec §7's "log and swallow" policy; it never propagates past a single dispatch.
    async fn prepare(&mut self, _ctx: &DispatchContext<'_>) -> CoreResult<()> {
        Ok(())
    }

    async fn validate(&mut self, _ctx: &DispatchContext<'_>) -> CoreResult<bool> {
        Ok(true)
    }

    async fn run(&mut self, ctx: &DispatchContext<'_>) -> CoreResult<()>;

    /// Invoked instead of `run` when the strict rate limiter rejects the call
    /// (spec §4.6 "Strict variant").
    async fn error_on_limit(&mut self, _wait_millis: i64, _ctx: &DispatchContext<'_>) {}
}

type ServiceDecoder = Box<dyn Fn(&mut Reader) -> CoreResult<Box<dyn DispatchService>>>;

/// Assigns every registered Message/Service pair a distinct opcode, deterministically from
/// the sorted list of registered type names (spec §3, §4.2) so both peers agree without
/// negotiation. Fixed at initialization and immutable thereafter (spec §9).
pub struct OpcodeTable {
    name_to_opcode: HashMap<&'static str, u8>,
    opcode_to_name: HashMap<u8, &'static str>,
    decoders: HashMap<u8, ServiceDecoder>,
    schemas: HashMap<&'static str, Vec<FieldKind>>,
}

/// Builds an `OpcodeTable` from the full set of registered type names before any opcode is
/// handed out, so assignment is always a pure function of the sorted name list.
#[derive(Default)]
pub struct OpcodeTableBuilder {
    names: Vec<&'static str>,
    decoders: HashMap<&'static str, ServiceDecoder>,
    schemas: HashMap<&'static str, Vec<FieldKind>>,
}

impl OpcodeTableBuilder {
    pub fn new() -> OpcodeTableBuilder {
        OpcodeTableBuilder::default()
    }

    /// Registers a Message/Service pair sharing `M::type_name() == S::type_name()`. Opcode
    /// 0 is reserved (spec §3); registration order here doesn't matter, final assignment is
    /// by sorted name.
    pub fn register<M, S>(&mut self)
    where
        M: WireMessage,
        S: WireService + DispatchService + 'static,
    {
        let name = M::type_name();
        assert_eq!(
            name,
            S::type_name(),
            "Message/Service pair must share a type name"
        );
        self.names.push(name);
        self.schemas.insert(name, M::fields());
        self.decoders.insert(
            name,
            Box::new(|reader| S::decode_body(reader).map(|svc| Box::new(svc) as Box<dyn DispatchService>)),
        );
    }

    pub fn build(mut self) -> OpcodeTable {
        self.names.sort_unstable();
        self.names.dedup();

        let mut name_to_opcode = HashMap::new();
        let mut opcode_to_name = HashMap::new();
        let mut decoders = HashMap::new();

        // Opcode 0 is reserved for handshake/ack/error (spec §3), so assignment starts at 1.
        for (index, name) in self.names.iter().enumerate() {
            let opcode = (index + 1) as u8;
            assert!(index < 255, "opcode space exhausted");
            name_to_opcode.insert(*name, opcode);
            opcode_to_name.insert(opcode, *name);
            if let Some(decoder) = self.decoders.remove(name) {
                decoders.insert(opcode, decoder);
            }
        }

        OpcodeTable {
            name_to_opcode,
            opcode_to_name,
            decoders,
            schemas: self.schemas,
        }
    }
}

impl OpcodeTable {
    pub fn opcode_of<M: WireMessage>(&self) -> Option<u8> {
        self.name_to_opcode.get(M::type_name()).copied()
    }

    pub fn opcode_of_name(&self, name: &str) -> Option<u8> {
        self.name_to_opcode.get(name).copied()
    }

    /// Encodes a created message, returning `opcode || encoded body`.
    pub fn encode<M: WireMessage>(&self, message: &Created<M>) -> CoreResult<Vec<u8>> {
        let opcode = self
            .opcode_of::<M>()
            .ok_or_else(|| CoreError::UnknownOpcode(0))?;
        let mut writer = Writer::new();
        message.encode_body(&mut writer);
        let mut bytes = Vec::with_capacity(writer.len() + 1);
        bytes.push(opcode);
        bytes.extend(writer.into_bytes());
        Ok(bytes)
    }

    /// Decodes a frame's opcode and body into a boxed Service instance. Unknown opcode or
    /// truncated input both return an error; callers drop the frame and log, per spec
    /// §4.2's "logs a warning and returns 'no service'".
    pub fn decode(&self, opcode: u8, body: &[u8]) -> CoreResult<Box<dyn DispatchService>> {
        let decoder = self
            .decoders
            .get(&opcode)
            .ok_or(CoreError::UnknownOpcode(opcode))?;
        let mut reader = Reader::new(body);
        decoder(&mut reader)
    }

    pub fn name_of(&self, opcode: u8) -> Option<&'static str> {
        self.opcode_to_name.get(&opcode).copied()
    }

    /// The JSON document pushed to stream clients on open (spec §4.4): opcode plus the
    /// field shape of every registered type.
    pub fn describe(&self) -> serde_json::Value {
        let mut entries = Vec::new();
        let mut opcodes: Vec<_> = self.opcode_to_name.iter().collect();
        opcodes.sort_by_key(|(opcode, _)| **opcode);

        for (opcode, name) in opcodes {
            entries.push(serde_json::json!({
                "opcode": opcode,
                "name": name,
                "fields": self.schemas.get(name),
            }));
        }
        serde_json::json!({ "types": entries })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    struct Ping;
    struct PingAck;

    impl WireMessage for Ping {
        fn type_name() -> &'static str {
            "Ping"
        }
        fn fields() -> Vec<FieldKind> {
            vec![]
        }
        fn encode_body(&self, _out: &mut Writer) {}
    }

    impl WireService for PingAck {
        fn type_name() -> &'static str {
            "Ping"
        }
        fn fields() -> Vec<FieldKind> {
            vec![]
        }
        fn decode_body(_input: &mut Reader) -> CoreResult<Self> {
            Ok(PingAck)
        }
    }

    #[async_trait::async_trait(?Send)]
    impl DispatchService for PingAck {
        fn service_type_name(&self) -> &'static str {
            "Ping"
        }
        async fn run(&mut self, _ctx: &DispatchContext<'_>) -> CoreResult<()> { Ok(()) }
    }

    #[test]
    fn opcode_zero_is_reserved() {
        let mut builder = OpcodeTableBuilder::new();
        builder.register::<Ping, PingAck>();
        let table = builder.build();
        assert_eq!(table.opcode_of::<Ping>(), Some(1));
    }

    #[test]
    fn assignment_is_deterministic_from_sorted_names() {
        struct A;
        struct AS;
        struct B;
        struct BS;
        impl WireMessage for A {
            fn type_name() -> &'static str { "Bravo" }
            fn fields() -> Vec<FieldKind> { vec![] }
            fn encode_body(&self, _out: &mut Writer) {}
        }
        impl WireService for AS {
            fn type_name() -> &'static str { "Bravo" }
            fn fields() -> Vec<FieldKind> { vec![] }
            fn decode_body(_input: &mut Reader) -> CoreResult<Self> { Ok(AS) }
        }
        impl WireMessage for B {
            fn type_name() -> &'static str { "Alpha" }
            fn fields() -> Vec<FieldKind> { vec![] }
            fn encode_body(&self, _out: &mut Writer) {}
        }
        impl WireService for BS {
            fn type_name() -> &'static str { "Alpha" }
            fn fields() -> Vec<FieldKind> { vec![] }
            fn decode_body(_input: &mut Reader) -> CoreResult<Self> { Ok(BS) }
        }
        #[async_trait::async_trait(?Send)]
        impl DispatchService for AS {
            fn service_type_name(&self) -> &'static str { "Bravo" }
            async fn run(&mut self, _ctx: &DispatchContext<'_>) -> CoreResult<()> { Ok(()) }
        }
        #[async_trait::async_trait(?Send)]
        impl DispatchService for BS {
            fn service_type_name(&self) -> &'static str { "Alpha" }
            async fn run(&mut self, _ctx: &DispatchContext<'_>) -> CoreResult<()> { Ok(()) }
        }

        let mut builder = OpcodeTableBuilder::new();
        builder.register::<A, AS>();
        builder.register::<B, BS>();
        let table = builder.build();

        // "Alpha" sorts before "Bravo", so it gets the lower opcode regardless of
        // registration order.
        assert_eq!(table.opcode_of_name("Alpha"), Some(1));
        assert_eq!(table.opcode_of_name("Bravo"), Some(2));
    }
}
