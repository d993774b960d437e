use hashbrown::HashSet;

use crate::{
    common::options::Options,
    gc::{ExternalRoots, GcFlags, GcPtr, Heap, ObjectId},
};

use super::{
    coroutine::{Coroutine, StackListener, StackReallocation},
    error::LuaError,
    state::FinalizerHook,
    string::LuaString,
    string_table::StringTable,
    table::Table,
    tag_method::TagMethod,
    userdata::Userdata,
    value::{Value, ValueKind},
};

/// Called with an error that escaped every protected boundary, right before the runtime panics.
pub type PanicFunction = fn(&LuaError);

/// State shared by every coroutine of a runtime instance
pub struct GlobalState {
    pub(crate) heap: Heap,
    pub(crate) strings: StringTable,
    /// Table for embedder data, always reachable
    pub(crate) registry: Value,
    pub(crate) main_thread: GcPtr<Coroutine>,
    /// Metatables for values of every basic type other than tables and userdata
    pub(crate) type_metatables: [Option<GcPtr<Table>>; ValueKind::COUNT],
    /// Interned metamethod names, indexed by [`TagMethod`]
    pub(crate) tag_method_names: Vec<GcPtr<LuaString>>,
    /// Every open upvalue of every coroutine
    pub(crate) open_upvalues: HashSet<ObjectId>,
    /// Objects kept alive for the duration of a runtime call
    pub(crate) pinned: Vec<ObjectId>,
    pub(crate) external_roots: Option<Box<dyn ExternalRoots>>,
    pub(crate) finalizer: Option<Box<dyn FinalizerHook>>,
    pub(crate) stack_listener: Option<StackListener>,
    pub(crate) panic: Option<PanicFunction>,
    pub(crate) options: Options,
    /// Set while the collector is doing work, blocks reentrant collection
    pub(crate) gc_running: bool,
    /// Set while a finalizer runs
    pub(crate) in_finalizer: bool,
    /// Set once all objects have been released
    pub(crate) closed: bool,
}

impl GlobalState {
    pub(crate) fn new(
        heap: Heap,
        strings: StringTable,
        main_thread: GcPtr<Coroutine>,
        options: Options,
    ) -> GlobalState {
        GlobalState {
            heap,
            strings,
            registry: Value::Nil,
            main_thread,
            type_metatables: [None; ValueKind::COUNT],
            tag_method_names: Vec::with_capacity(TagMethod::COUNT),
            open_upvalues: HashSet::new(),
            pinned: Vec::new(),
            external_roots: None,
            finalizer: None,
            stack_listener: None,
            panic: None,
            options,
            gc_running: false,
            in_finalizer: false,
            closed: false,
        }
    }

    /// Register a userdata whose metatable has a `__gc` field. A userdata is finalized at most
    /// once, even if it gets a finalizer again after being finalized.
    pub(crate) fn register_finalizer(&mut self, userdata: ObjectId) {
        let flags = self.heap.flags(userdata);
        if flags.intersects(GcFlags::FINALIZABLE | GcFlags::FINALIZED) {
            return;
        }

        if let Some(header) = self.heap.header_mut(userdata) {
            header.set_flags(GcFlags::FINALIZABLE, true);
            self.heap.finalizable.push(userdata);
        }
    }

    /// The `__gc` field of a userdata's metatable
    pub(crate) fn gc_metamethod(&self, userdata: ObjectId) -> Value {
        let Some(name) = self.tag_method_names.get(TagMethod::Gc as usize) else {
            return Value::Nil;
        };

        self.heap
            .get(GcPtr::<Userdata>::from_id(userdata))
            .and_then(Userdata::metatable)
            .and_then(|metatable| self.heap.get(metatable))
            .map(|metatable| metatable.get(&Value::String(*name)))
            .unwrap_or_default()
    }

    pub(crate) fn notify_stack_reallocated(&mut self, reallocation: StackReallocation) {
        if let Some(listener) = self.stack_listener.as_mut() {
            listener(reallocation);
        }
    }

    /// Report an unrecoverable error to the panic function and abort
    pub(crate) fn raise_panic(&self, error: &LuaError) -> ! {
        if let Some(panic) = self.panic {
            panic(error);
        }

        panic!("unprotected error: {error}");
    }
}
