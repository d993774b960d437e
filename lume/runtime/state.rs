//! The runtime instance
//!
//! A [`Lua`] owns the global state and, through it, every heap object. Objects are referred to
//! by [`GcPtr`] handles. A handle stays valid as long as the object is reachable from a root:
//! the main thread, the registry, the type metatables, a pinned value or an external root.
//! Objects returned by an allocating call must be stored somewhere reachable (for example pushed
//! on a coroutine stack) before the next allocating call, which may run the collector.

use std::{any::Any, mem::size_of};

use log::debug;

use crate::{
    common::{constants::MIN_STRING_TABLE_SIZE, options::Options},
    gc::{
        ExternalRoots, GcColor, GcHeader, GcPtr, Heap, MemoryHook, ObjectId, SystemAllocator,
    },
};

use super::{
    coroutine::{Coroutine, StackListener, StackReallocation},
    error::{LuaError, LuaResult},
    function::{Closure, LuaClosure, NativeClosure, NativeFunction, Proto},
    global_state::{GlobalState, PanicFunction},
    object::HeapItem,
    string::{hash_bytes, LuaString},
    string_table::StringTable,
    table::{Table, TableKey, SLOT_SIZE},
    tag_method::TagMethod,
    upvalue::UpVal,
    userdata::Userdata,
    value::Value,
};

/// Runs the `__gc` metamethod of an unreachable userdata.
///
/// The runtime does not call functions itself, so invoking `method` is up to the embedder.
/// Collection is disabled while a finalizer runs.
pub trait FinalizerHook: Send {
    fn finalize(&mut self, lua: &mut Lua, userdata: GcPtr<Userdata>, method: Value);
}

impl<F> FinalizerHook for F
where
    F: FnMut(&mut Lua, GcPtr<Userdata>, Value) + Send,
{
    fn finalize(&mut self, lua: &mut Lua, userdata: GcPtr<Userdata>, method: Value) {
        self(lua, userdata, method)
    }
}

/// Abort on a handle whose object has been collected
#[cold]
pub(crate) fn dangling(id: ObjectId) -> ! {
    panic!("use of collected object {id:?}")
}

#[cfg(feature = "alloc_error")]
#[cold]
fn out_of_memory() -> LuaResult<()> {
    Err(LuaError::OutOfMemory)
}

#[cfg(not(feature = "alloc_error"))]
#[cold]
fn out_of_memory() -> LuaResult<()> {
    panic!("Ran out of heap memory")
}

macro_rules! object_accessors {
    ($get:ident, $get_mut:ident, $ty:ty) => {
        #[inline]
        pub fn $get(&self, ptr: GcPtr<$ty>) -> &$ty {
            self.g.heap.get(ptr).unwrap_or_else(|| dangling(ptr.id()))
        }

        #[inline]
        pub fn $get_mut(&mut self, ptr: GcPtr<$ty>) -> &mut $ty {
            self.g.heap.get_mut(ptr).unwrap_or_else(|| dangling(ptr.id()))
        }
    };
}

/// An independent runtime instance
pub struct Lua {
    pub(crate) g: GlobalState,
}

impl Lua {
    pub fn new() -> LuaResult<Lua> {
        Lua::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> LuaResult<Lua> {
        Lua::with_memory_hook(options, Box::new(SystemAllocator))
    }

    /// Create a runtime whose memory is accounted through `hook`
    pub fn with_memory_hook(options: Options, hook: Box<dyn MemoryHook>) -> LuaResult<Lua> {
        let mut heap = Heap::with_memory_hook(hook);
        heap.pause = options.gc_pause;
        heap.step_multiplier = options.gc_step_multiplier;

        let string_table_size = options
            .initial_string_table_size
            .max(MIN_STRING_TABLE_SIZE)
            .next_power_of_two();
        heap.realloc(0, size_of::<GlobalState>() + StringTable::bytes_for_size(string_table_size))?;
        let strings = StringTable::new(string_table_size);

        let main_thread = Coroutine::new(Value::Nil);
        let main_thread_size = main_thread.heap_size();
        heap.realloc(0, main_thread_size)?;
        let main_thread_id = heap.insert(main_thread.into_object(), main_thread_size);
        heap.fix(main_thread_id);

        // The collector stays off until the instance is fully built
        let gc_stress_test = options.gc_stress_test;
        let options = Options { gc_stress_test: false, ..options };

        let mut lua = Lua {
            g: GlobalState::new(heap, strings, GcPtr::from_id(main_thread_id), options),
        };

        let globals = lua.new_table(0, 2)?;
        let main_thread = lua.g.main_thread;
        lua.thread_mut(main_thread).globals = Value::Table(globals);

        let registry = lua.new_table(0, 2)?;
        lua.g.registry = Value::Table(registry);

        for method in TagMethod::ALL {
            let name = lua.intern(method.name().as_bytes())?;
            lua.g.heap.fix(name.id());
            lua.g.tag_method_names.push(name);
        }

        lua.g.options.gc_stress_test = gc_stress_test;
        lua.g.heap.threshold = 4 * lua.g.heap.total_bytes;

        debug!("created runtime, {} bytes in use", lua.g.heap.total_bytes);

        Ok(lua)
    }

    #[inline]
    pub fn main_thread(&self) -> GcPtr<Coroutine> {
        self.g.main_thread
    }

    #[inline]
    pub fn registry(&self) -> Value {
        self.g.registry
    }

    #[inline]
    pub fn options(&self) -> &Options {
        &self.g.options
    }

    // ========================================================================
    // Object access
    // ========================================================================

    object_accessors!(thread, thread_mut, Coroutine);
    object_accessors!(table, table_mut, Table);
    object_accessors!(userdata, userdata_mut, Userdata);
    object_accessors!(closure, closure_mut, Closure);
    object_accessors!(proto, proto_mut, Proto);
    object_accessors!(upvalue, upvalue_mut, UpVal);

    #[inline]
    pub fn string(&self, ptr: GcPtr<LuaString>) -> &LuaString {
        self.g.heap.get(ptr).unwrap_or_else(|| dangling(ptr.id()))
    }

    /// Whether the object behind a handle has not been freed
    #[inline]
    pub fn is_alive(&self, id: ObjectId) -> bool {
        self.g.heap.contains(id)
    }

    #[inline]
    pub fn object_color(&self, id: ObjectId) -> Option<GcColor> {
        self.g.heap.color(id)
    }

    // ========================================================================
    // Strings
    // ========================================================================

    /// The unique string with the given contents
    pub fn intern(&mut self, bytes: &[u8]) -> LuaResult<GcPtr<LuaString>> {
        let hash = hash_bytes(bytes);
        if let Some(string) = self.g.strings.find(&self.g.heap, hash, bytes) {
            // Dead but not yet swept
            if self.g.heap.is_dead(string.id()) {
                self.g.heap.make_white(string.id());
            }
            return Ok(string);
        }

        self.check_gc();

        let size = self.g.strings.size();
        if self.g.strings.len() >= size && size <= usize::MAX / 4 {
            // Running with a crowded table is fine if it cannot grow
            self.g.resize_string_table(size * 2);
        }

        let string = self.alloc(LuaString::new(bytes))?;
        self.g.strings.insert(string, hash);

        Ok(string)
    }

    pub fn new_string(&mut self, string: &str) -> LuaResult<GcPtr<LuaString>> {
        self.intern(string.as_bytes())
    }

    // ========================================================================
    // Tables
    // ========================================================================

    /// Create a table with room for `narr` array entries and `nrec` other entries
    pub fn new_table(&mut self, narr: usize, nrec: usize) -> LuaResult<GcPtr<Table>> {
        self.check_gc();
        self.alloc(Table::with_capacity(narr, nrec))
    }

    /// Raw table read
    pub fn table_get(&self, table: GcPtr<Table>, key: &Value) -> Value {
        self.table(table).get(key)
    }

    /// Raw table write, with write barrier
    pub fn table_set(&mut self, table: GcPtr<Table>, key: Value, value: Value) -> LuaResult<()> {
        TableKey::new(key)?;

        let object = self.table(table);
        if object.is_new_slot(&key, &value) {
            let new_size = object.heap_size() + SLOT_SIZE;
            self.with_pinned(&[key, value], |lua| lua.resize_object(table.id(), new_size))?;
        }

        self.table_mut(table).set(key, value)?;

        // Removing an entry gives back its slot
        let size = self.table(table).heap_size();
        let _ = self.g.heap.resize(table.id(), size);

        self.g.barrier(table.id(), &key);
        self.g.barrier(table.id(), &value);

        Ok(())
    }

    pub fn table_length(&self, table: GcPtr<Table>) -> usize {
        self.table(table).length()
    }

    // ========================================================================
    // Userdata
    // ========================================================================

    pub fn new_userdata<T: Any + Send>(&mut self, payload: T) -> LuaResult<GcPtr<Userdata>> {
        self.check_gc();
        self.alloc(Userdata::new(payload))
    }

    pub fn userdata_payload<T: Any>(&self, userdata: GcPtr<Userdata>) -> Option<&T> {
        self.userdata(userdata).payload()
    }

    pub fn set_userdata_env(&mut self, userdata: GcPtr<Userdata>, env: Value) {
        self.userdata_mut(userdata).set_env(env);
        self.g.barrier(userdata.id(), &env);
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Move a prototype onto the heap. Everything it refers to is kept alive while it is
    /// allocated.
    pub fn new_proto(&mut self, proto: Proto) -> LuaResult<GcPtr<Proto>> {
        let mut referenced = Vec::new();
        proto.visit_pointers(&mut referenced);

        self.with_pinned_ids(referenced, |lua| {
            lua.check_gc();
            lua.alloc(proto)
        })
    }

    pub fn proto_add_constant(&mut self, proto: GcPtr<Proto>, constant: Value) -> LuaResult<usize> {
        let new_size = self.proto(proto).heap_size() + size_of::<Value>();
        self.with_pinned(&[constant], |lua| lua.resize_object(proto.id(), new_size))?;

        let constants = &mut self.proto_mut(proto).constants;
        constants.push(constant);
        let index = constants.len() - 1;
        self.g.barrier(proto.id(), &constant);

        Ok(index)
    }

    pub fn proto_add_child(&mut self, proto: GcPtr<Proto>, child: GcPtr<Proto>) -> LuaResult<usize> {
        let new_size = self.proto(proto).heap_size() + size_of::<GcPtr<Proto>>();
        self.with_pinned_ids([child.id()], |lua| lua.resize_object(proto.id(), new_size))?;

        let protos = &mut self.proto_mut(proto).protos;
        protos.push(child);
        let index = protos.len() - 1;
        self.g.barrier_object(proto.id(), child.id());

        Ok(index)
    }

    pub fn new_lua_closure(
        &mut self,
        proto: GcPtr<Proto>,
        upvalues: Vec<GcPtr<UpVal>>,
        env: Value,
    ) -> LuaResult<GcPtr<Closure>> {
        let mut pinned = vec![proto.id()];
        pinned.extend(upvalues.iter().map(|upvalue| upvalue.id()));
        pinned.extend(env.object_id());

        self.with_pinned_ids(pinned, |lua| {
            lua.check_gc();
            lua.alloc(Closure::Lua(LuaClosure { proto, upvalues, env }))
        })
    }

    pub fn new_native_closure(
        &mut self,
        function: NativeFunction,
        upvalues: Vec<Value>,
        env: Value,
    ) -> LuaResult<GcPtr<Closure>> {
        let mut pinned: Vec<ObjectId> = upvalues.iter().filter_map(Value::object_id).collect();
        pinned.extend(env.object_id());

        self.with_pinned_ids(pinned, |lua| {
            lua.check_gc();
            lua.alloc(Closure::Native(NativeClosure { function, upvalues, env }))
        })
    }

    /// Value of upvalue `index` of a closure
    pub fn closure_upvalue(&self, closure: GcPtr<Closure>, index: usize) -> Option<Value> {
        match self.closure(closure) {
            Closure::Lua(closure) => closure
                .upvalues
                .get(index)
                .map(|upvalue| self.upvalue_get(*upvalue)),
            Closure::Native(closure) => closure.upvalues.get(index).copied(),
        }
    }

    /// Assign upvalue `index` of a closure. Returns false if there is no such upvalue.
    pub fn set_closure_upvalue(&mut self, closure: GcPtr<Closure>, index: usize, value: Value) -> bool {
        match self.closure_mut(closure) {
            Closure::Lua(object) => {
                let Some(upvalue) = object.upvalues.get(index).copied() else {
                    return false;
                };
                self.upvalue_set(upvalue, value);
            }
            Closure::Native(object) => {
                let Some(slot) = object.upvalues.get_mut(index) else {
                    return false;
                };
                *slot = value;
                self.g.barrier(closure.id(), &value);
            }
        }

        true
    }

    pub fn set_closure_env(&mut self, closure: GcPtr<Closure>, env: Value) {
        self.closure_mut(closure).set_env(env);
        self.g.barrier(closure.id(), &env);
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Account for and insert a new object. Objects it refers to must be reachable or pinned.
    pub(crate) fn alloc<T: HeapItem>(&mut self, item: T) -> LuaResult<GcPtr<T>> {
        let object = item.into_object();
        let size = object.heap_size();
        self.reserve(0, size)?;

        let id = self.g.heap.insert(object, size);
        Ok(GcPtr::from_id(id))
    }

    /// Account for a block changing size from `old_size` to `new_size`, collecting once and
    /// retrying if the memory hook refuses.
    fn reserve(&mut self, old_size: usize, new_size: usize) -> LuaResult<()> {
        if self.g.heap.realloc(old_size, new_size).is_ok() {
            return Ok(());
        }

        if self.emergency_gc(new_size) && self.g.heap.realloc(old_size, new_size).is_ok() {
            return Ok(());
        }

        out_of_memory()
    }

    /// Change the bytes accounted to a live object, which is kept alive meanwhile. Growing an
    /// object pays allocation debt like creating one does.
    pub(crate) fn resize_object(&mut self, id: ObjectId, new_size: usize) -> LuaResult<()> {
        let old_size = self.g.heap.header(id).map_or(0, GcHeader::alloc_size);

        if self.g.heap.resize(id, new_size).is_err() {
            let collected = self.with_pinned_ids([id], |lua| lua.emergency_gc(new_size));
            if !collected || self.g.heap.resize(id, new_size).is_err() {
                return out_of_memory();
            }
        }

        if new_size > old_size {
            self.with_pinned_ids([id], Lua::check_gc);
        }

        Ok(())
    }

    /// Run `f` with `values` treated as roots
    pub fn with_pinned<R>(&mut self, values: &[Value], f: impl FnOnce(&mut Lua) -> R) -> R {
        let ids: Vec<ObjectId> = values.iter().filter_map(Value::object_id).collect();
        self.with_pinned_ids(ids, f)
    }

    pub(crate) fn with_pinned_ids<R>(
        &mut self,
        ids: impl IntoIterator<Item = ObjectId>,
        f: impl FnOnce(&mut Lua) -> R,
    ) -> R {
        let len = self.g.pinned.len();
        self.g.pinned.extend(ids);
        let result = f(self);
        self.g.pinned.truncate(len);
        result
    }

    // ========================================================================
    // Embedder hooks
    // ========================================================================

    /// Install the hook that runs `__gc` metamethods, returning the previous one
    pub fn set_finalizer(
        &mut self,
        finalizer: impl FinalizerHook + 'static,
    ) -> Option<Box<dyn FinalizerHook>> {
        self.g.finalizer.replace(Box::new(finalizer))
    }

    pub fn set_external_roots(
        &mut self,
        roots: Option<Box<dyn ExternalRoots>>,
    ) -> Option<Box<dyn ExternalRoots>> {
        std::mem::replace(&mut self.g.external_roots, roots)
    }

    /// Install a listener notified whenever a coroutine stack is reallocated
    pub fn set_stack_listener(
        &mut self,
        listener: impl FnMut(StackReallocation) + Send + 'static,
    ) -> Option<StackListener> {
        self.g.stack_listener.replace(Box::new(listener))
    }

    pub fn set_panic(&mut self, panic: Option<PanicFunction>) -> Option<PanicFunction> {
        std::mem::replace(&mut self.g.panic, panic)
    }

    /// Report an unrecoverable error to the panic function, then panic
    pub fn panic(&self, error: &LuaError) -> ! {
        self.g.raise_panic(error)
    }

    /// Replace the memory hook, returning the previous one
    pub fn set_memory_hook(&mut self, hook: Box<dyn MemoryHook>) -> Box<dyn MemoryHook> {
        self.g.heap.set_memory_hook(hook)
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Close the instance: close every upvalue, run every pending finalizer and free every
    /// object. Dropping a `Lua` does the same.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.g.closed {
            return;
        }

        let main_thread = self.g.main_thread;
        if self.g.heap.contains(main_thread.id()) {
            self.close_upvalues(main_thread, 0);
        }

        // Finalizers may create more userdata with finalizers
        loop {
            self.g.separate_finalizable(true);
            if self.g.heap.to_finalize.is_empty() {
                break;
            }
            self.run_pending_finalizers();
        }

        self.g.closed = true;
        self.g.free_all();

        let remaining = self.g.heap.total_bytes;
        let _ = self.g.heap.realloc(remaining, 0);

        debug!("closed runtime after {} collection cycles", self.g.heap.cycles);
    }
}

impl Drop for Lua {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Collects the handles an object refers to
impl crate::gc::GcVisitor for Vec<ObjectId> {
    fn visit_object(&mut self, id: ObjectId) {
        self.push(id);
    }
}
