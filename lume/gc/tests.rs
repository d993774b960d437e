//! GC Tests
//!
//! Collector scenarios driven through the runtime: reachability, barriers, weak tables,
//! finalizers, pacing, stacks and upvalues.

use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    common::options::{Options, OptionsBuilder},
    runtime::{
        Coroutine, Lua, LuaError, LuaResult, Proto, StackReallocation, Table, TagMethod, Userdata,
        Value, MULTIPLE_RESULTS,
    },
};

use super::{ExternalRoots, GcColor, GcCommand, GcPhase, GcPtr, GcVisitor, LimitedAllocator, MemoryHook};

fn options() -> Options {
    OptionsBuilder::new().verify_heap(true).gc_stress_test(false).build()
}

fn new_lua() -> Lua {
    Lua::with_options(options()).unwrap()
}

/// Keep a value alive by pushing it on the main thread's stack
fn root(lua: &mut Lua, value: Value) {
    let main = lua.main_thread();
    lua.push(main, value).unwrap();
}

fn num(n: usize) -> Value {
    Value::Number(n as f64)
}

fn finish_cycle(lua: &mut Lua) -> usize {
    let mut steps = 0;
    while lua.gc_stats().phase != GcPhase::Pause {
        lua.gc_single_step();
        steps += 1;
    }
    steps
}

/// Run collector steps until `id` has been traversed
fn step_until_black(lua: &mut Lua, table: GcPtr<Table>) {
    for _ in 0..1000 {
        if lua.object_color(table.id()) == Some(GcColor::Black) {
            return;
        }
        lua.gc_single_step();
        assert_eq!(lua.gc_stats().phase, GcPhase::Propagate);
    }
    panic!("table was never marked");
}

fn noop(_: &mut Lua, _: GcPtr<Coroutine>) -> LuaResult<usize> {
    Ok(0)
}

// ============================================================================
// Basic allocation and collection tests
// ============================================================================

#[test]
fn test_startup_state() {
    let lua = new_lua();
    let stats = lua.gc_stats();

    assert_eq!(stats.phase, GcPhase::Pause);
    assert_eq!(stats.threshold, 4 * stats.total_bytes);
    assert_eq!(stats.num_strings, TagMethod::COUNT);
    assert!(lua.registry().as_table().is_some());
    assert!(lua.globals(lua.main_thread()).as_table().is_some());
    assert!(lua.verify_heap().is_ok());
}

#[test]
fn test_collect_unreachable() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);
    let before = lua.gc_stats().num_objects;

    let tables: Vec<_> = (0..10).map(|_| lua.new_table(0, 0).unwrap()).collect();
    assert_eq!(lua.gc_stats().num_objects, before + 10);

    lua.gc(GcCommand::Collect);

    assert_eq!(lua.gc_stats().num_objects, before);
    assert!(tables.iter().all(|table| !lua.is_alive(table.id())));
}

#[test]
fn test_collect_rooted() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);
    let before = lua.gc_stats().num_objects;

    let kept = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(kept));
    let value = lua.new_string("kept").unwrap();
    lua.table_set(kept, num(1), Value::String(value)).unwrap();

    for _ in 0..10 {
        lua.new_table(0, 0).unwrap();
    }

    lua.gc(GcCommand::Collect);

    assert_eq!(lua.gc_stats().num_objects, before + 2);
    assert!(lua.is_alive(kept.id()));
    assert_eq!(lua.string(value).as_bytes(), b"kept");
}

#[test]
fn test_cycle_collected() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let a = lua.new_table(0, 0).unwrap();
    let b = lua.new_table(0, 0).unwrap();
    lua.table_set(a, num(1), Value::Table(b)).unwrap();
    lua.table_set(b, num(1), Value::Table(a)).unwrap();
    lua.table_set(a, num(2), Value::Table(a)).unwrap();

    lua.gc(GcCommand::Collect);

    assert!(!lua.is_alive(a.id()));
    assert!(!lua.is_alive(b.id()));
}

#[test]
fn test_collect_twice() {
    let mut lua = new_lua();
    let kept = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(kept));

    lua.gc(GcCommand::Collect);
    let after_first = lua.gc_stats();
    lua.gc(GcCommand::Collect);
    let after_second = lua.gc_stats();

    assert_eq!(after_second.cycles, after_first.cycles + 1);
    assert_eq!(after_second.num_objects, after_first.num_objects);
    assert_eq!(after_second.total_bytes, after_first.total_bytes);
}

#[test]
fn test_registry_is_a_root() {
    let mut lua = new_lua();
    let registry = lua.registry().as_table().unwrap();

    let kept = lua.new_table(0, 0).unwrap();
    lua.table_set(registry, Value::Boolean(true), Value::Table(kept)).unwrap();
    lua.gc(GcCommand::Collect);

    assert!(lua.is_alive(kept.id()));
}

#[test]
fn test_invalid_keys_rejected() {
    let mut lua = new_lua();
    let table = lua.new_table(0, 0).unwrap();

    assert!(matches!(lua.table_set(table, Value::Nil, num(1)), Err(LuaError::InvalidKey(_))));
    assert!(matches!(
        lua.table_set(table, Value::Number(f64::NAN), num(1)),
        Err(LuaError::InvalidKey(_))
    ));
}

// ============================================================================
// Incremental GC and barrier tests
// ============================================================================

#[test]
fn test_backward_barrier_on_table() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let holder = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(holder));
    lua.gc_single_step();
    step_until_black(&mut lua, holder);

    let fresh = lua.new_table(0, 0).unwrap();
    assert!(lua.object_color(fresh.id()).is_some_and(GcColor::is_white));

    lua.table_set(holder, num(1), Value::Table(fresh)).unwrap();
    assert_eq!(lua.object_color(holder.id()), Some(GcColor::Gray));
    assert!(lua.verify_heap().is_ok());

    finish_cycle(&mut lua);

    assert!(lua.is_alive(fresh.id()));
    assert_eq!(lua.table_get(holder, &num(1)), Value::Table(fresh));
}

#[test]
fn test_forward_barrier_on_closure() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let closure = lua.new_native_closure(noop, vec![Value::Nil], Value::Nil).unwrap();
    root(&mut lua, Value::Function(closure));
    let marker = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(marker));

    // The closure is pushed first and traversed after the marker table
    lua.gc_single_step();
    step_until_black(&mut lua, marker);
    while lua.object_color(closure.id()) != Some(GcColor::Black) {
        lua.gc_single_step();
    }

    let env = lua.new_table(0, 0).unwrap();
    lua.set_closure_env(closure, Value::Table(env));
    assert_eq!(lua.object_color(closure.id()), Some(GcColor::Black));
    assert_eq!(lua.object_color(env.id()), Some(GcColor::Gray));

    let upvalue = lua.new_string("upvalue").unwrap();
    assert!(lua.set_closure_upvalue(closure, 0, Value::String(upvalue)));
    assert_eq!(lua.object_color(upvalue.id()), Some(GcColor::Black));
    assert!(!lua.set_closure_upvalue(closure, 1, Value::Nil));
    assert!(lua.verify_heap().is_ok());

    finish_cycle(&mut lua);

    assert!(lua.is_alive(env.id()));
    assert_eq!(lua.closure_upvalue(closure, 0), Some(Value::String(upvalue)));
}

#[test]
fn test_missing_barrier_detected() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let holder = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(holder));
    lua.gc_single_step();
    step_until_black(&mut lua, holder);

    // Store without going through the barrier
    let fresh = lua.new_table(0, 0).unwrap();
    lua.table_mut(holder).set(num(1), Value::Table(fresh)).unwrap();

    let error = lua.verify_heap().unwrap_err();
    assert!(matches!(
        error,
        LuaError::CollectorInvariantViolation { color: GcColor::Black, child_color, .. }
            if child_color.is_white()
    ));
}

#[test]
fn test_allocation_during_sweep_survives() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    lua.gc_single_step();
    while lua.gc_stats().phase != GcPhase::SweepObjects {
        lua.gc_single_step();
    }

    // Unreachable, but allocated after marking finished
    let late = lua.new_table(0, 0).unwrap();
    finish_cycle(&mut lua);
    assert!(lua.is_alive(late.id()));

    lua.gc(GcCommand::Collect);
    assert!(!lua.is_alive(late.id()));
}

#[test]
fn test_full_gc_abandons_incremental_cycle() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let kept = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(kept));
    let garbage = lua.new_table(0, 0).unwrap();

    lua.gc_single_step();
    step_until_black(&mut lua, kept);

    lua.gc(GcCommand::Collect);

    assert_eq!(lua.gc_stats().phase, GcPhase::Pause);
    assert!(lua.is_alive(kept.id()));
    assert!(!lua.is_alive(garbage.id()));
    assert!(lua.verify_heap().is_ok());
}

// ============================================================================
// Weak table tests
// ============================================================================

fn weak_table(lua: &mut Lua, mode: &str) -> GcPtr<Table> {
    let table = lua.new_table(0, 0).unwrap();
    root(lua, Value::Table(table));

    let metatable = lua.new_table(0, 1).unwrap();
    lua.set_metatable(&Value::Table(table), Some(metatable));

    let mode_key = Value::String(lua.tag_method_name(TagMethod::Mode));
    let mode = lua.new_string(mode).unwrap();
    lua.table_set(metatable, mode_key, Value::String(mode)).unwrap();

    table
}

#[test]
fn test_weak_values_cleared() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let weak = weak_table(&mut lua, "v");
    let strong = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(strong));

    let garbage = lua.new_table(0, 0).unwrap();
    lua.table_set(weak, num(1), Value::Table(garbage)).unwrap();
    let string = lua.new_string("strings are values").unwrap();
    lua.table_set(weak, num(2), Value::String(string)).unwrap();
    lua.table_set(weak, num(3), Value::Table(strong)).unwrap();
    let key = lua.new_string("key").unwrap();
    let garbage_in_hash = lua.new_table(0, 0).unwrap();
    lua.table_set(weak, Value::String(key), Value::Table(garbage_in_hash)).unwrap();

    lua.gc(GcCommand::Collect);

    assert_eq!(lua.table_get(weak, &num(1)), Value::Nil);
    assert_eq!(lua.table_get(weak, &num(2)), Value::String(string));
    assert_eq!(lua.table_get(weak, &num(3)), Value::Table(strong));
    assert_eq!(lua.table_get(weak, &Value::String(key)), Value::Nil);
    assert!(!lua.is_alive(garbage.id()));
    assert!(!lua.is_alive(garbage_in_hash.id()));
    assert!(lua.is_alive(string.id()));
}

#[test]
fn test_weak_keys_cleared() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let weak = weak_table(&mut lua, "k");
    let strong = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(strong));

    let garbage = lua.new_table(0, 0).unwrap();
    lua.table_set(weak, Value::Table(garbage), num(1)).unwrap();
    lua.table_set(weak, Value::Table(strong), num(2)).unwrap();
    lua.table_set(weak, Value::Boolean(true), num(3)).unwrap();

    lua.gc(GcCommand::Collect);

    assert_eq!(lua.table(weak).count(), 2);
    assert_eq!(lua.table_get(weak, &Value::Table(strong)), num(2));
    assert_eq!(lua.table_get(weak, &Value::Boolean(true)), num(3));
    assert!(!lua.is_alive(garbage.id()));
}

#[test]
fn test_weak_mode_removed() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let table = weak_table(&mut lua, "kv");
    lua.set_metatable(&Value::Table(table), None);

    let value = lua.new_table(0, 0).unwrap();
    lua.table_set(table, num(1), Value::Table(value)).unwrap();
    lua.gc(GcCommand::Collect);

    assert!(lua.is_alive(value.id()));
}

// ============================================================================
// Finalizer tests
// ============================================================================

fn finalizer_metatable(lua: &mut Lua) -> GcPtr<Table> {
    let metatable = lua.new_table(0, 1).unwrap();
    root(lua, Value::Table(metatable));
    let gc_key = Value::String(lua.tag_method_name(TagMethod::Gc));
    lua.table_set(metatable, gc_key, Value::Boolean(true)).unwrap();
    metatable
}

#[test]
fn test_finalizer_runs_once_then_freed() {
    let mut lua = new_lua();
    let finalized = Arc::new(Mutex::new(Vec::new()));

    let seen = finalized.clone();
    lua.set_finalizer(move |lua: &mut Lua, userdata: GcPtr<Userdata>, method: Value| {
        assert_eq!(method, Value::Boolean(true));
        let payload = lua.userdata_payload::<u32>(userdata).copied();
        seen.lock().push(payload);
    });

    let metatable = finalizer_metatable(&mut lua);
    let userdata = lua.new_userdata(42u32).unwrap();
    lua.set_metatable(&Value::Userdata(userdata), Some(metatable));

    lua.gc(GcCommand::Collect);
    assert_eq!(*finalized.lock(), vec![Some(42)]);
    // Kept for the finalizer, freed by the next cycle
    assert!(lua.is_alive(userdata.id()));

    lua.gc(GcCommand::Collect);
    assert_eq!(finalized.lock().len(), 1);
    assert!(!lua.is_alive(userdata.id()));
}

#[test]
fn test_finalizer_keeps_referenced_objects() {
    let mut lua = new_lua();
    let metatable = finalizer_metatable(&mut lua);

    let userdata = lua.new_userdata(()).unwrap();
    root(&mut lua, Value::Userdata(userdata));
    let env = lua.new_table(0, 0).unwrap();
    lua.set_userdata_env(userdata, Value::Table(env));
    lua.set_metatable(&Value::Userdata(userdata), Some(metatable));

    let main = lua.main_thread();
    lua.set_top(main, 2).unwrap();
    lua.gc(GcCommand::Collect);

    // Resurrected along with everything it refers to
    assert!(lua.is_alive(userdata.id()));
    assert!(lua.is_alive(env.id()));
    assert!(lua.verify_heap().is_ok());

    lua.gc(GcCommand::Collect);
    assert!(!lua.is_alive(userdata.id()));
    assert!(!lua.is_alive(env.id()));
}

#[test]
fn test_finalizer_freed_userdata_cleared_from_weak_values() {
    let mut lua = new_lua();
    let metatable = finalizer_metatable(&mut lua);
    let weak = weak_table(&mut lua, "v");

    let userdata = lua.new_userdata(7u8).unwrap();
    lua.set_metatable(&Value::Userdata(userdata), Some(metatable));
    lua.table_set(weak, num(1), Value::Userdata(userdata)).unwrap();

    lua.gc(GcCommand::Collect);

    assert!(lua.is_alive(userdata.id()));
    assert_eq!(lua.table_get(weak, &num(1)), Value::Nil);
}

#[test]
fn test_finalized_userdata_kept_in_weak_keys_array() {
    let mut lua = new_lua();
    let metatable = finalizer_metatable(&mut lua);
    let weak = weak_table(&mut lua, "k");

    let userdata = lua.new_userdata(3u8).unwrap();
    lua.set_metatable(&Value::Userdata(userdata), Some(metatable));
    lua.gc(GcCommand::Collect);
    assert!(lua.is_alive(userdata.id()));

    // Array values of a table with weak keys only are strong
    lua.table_set(weak, num(1), Value::Userdata(userdata)).unwrap();
    lua.gc(GcCommand::Collect);

    assert!(lua.is_alive(userdata.id()));
    assert_eq!(lua.table_get(weak, &num(1)), Value::Userdata(userdata));
}

#[test]
fn test_finalizers_run_on_close() {
    let count = Arc::new(AtomicUsize::new(0));

    {
        let mut lua = new_lua();
        let counter = count.clone();
        lua.set_finalizer(move |_: &mut Lua, _: GcPtr<Userdata>, _: Value| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let metatable = finalizer_metatable(&mut lua);
        for i in 0..5 {
            let userdata = lua.new_userdata(i).unwrap();
            root(&mut lua, Value::Userdata(userdata));
            lua.set_metatable(&Value::Userdata(userdata), Some(metatable));
        }

        lua.gc(GcCommand::Collect);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    assert_eq!(count.load(Ordering::SeqCst), 5);
}

// ============================================================================
// String interning tests
// ============================================================================

#[test]
fn test_interning_across_resizes() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let mut sizes = vec![lua.gc_stats().string_table_size];
    let mut strings = Vec::new();
    for i in 0..600 {
        strings.push(lua.new_string(&format!("string {i}")).unwrap());
        let size = lua.gc_stats().string_table_size;
        if sizes.last() != Some(&size) {
            sizes.push(size);
        }
    }

    assert!(sizes.len() >= 4, "expected at least 3 resizes, got {sizes:?}");
    assert!(sizes.windows(2).all(|pair| pair[1] == 2 * pair[0]));

    for (i, string) in strings.iter().enumerate() {
        let again = lua.new_string(&format!("string {i}")).unwrap();
        assert_eq!(again, *string);
        assert_eq!(lua.string(again).as_bytes(), format!("string {i}").as_bytes());
    }

    // The table shrinks once most strings are gone
    let peak = lua.gc_stats().string_table_size;
    lua.gc(GcCommand::Collect);
    assert!(lua.gc_stats().string_table_size < peak);
    assert_eq!(lua.gc_stats().num_strings, TagMethod::COUNT);
}

#[test]
fn test_dead_string_resurrected() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);

    let ghost = lua.new_string("ghost").unwrap();
    lua.gc_single_step();
    while lua.gc_stats().phase != GcPhase::SweepStrings {
        lua.gc_single_step();
    }

    let again = lua.new_string("ghost").unwrap();
    assert_eq!(again, ghost);
    root(&mut lua, Value::String(again));

    finish_cycle(&mut lua);
    assert!(lua.is_alive(ghost.id()));
    assert_eq!(lua.string(ghost).as_bytes(), b"ghost");
}

// ============================================================================
// Upvalue tests
// ============================================================================

#[test]
fn test_upvalue_closed_on_pop_frame() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);
    let main = lua.main_thread();

    lua.push(main, Value::Boolean(true)).unwrap();
    lua.push_frame(main, 1, 3, 1).unwrap();
    lua.push(main, num(7)).unwrap();

    let upvalue = lua.find_upvalue(main, 2).unwrap();
    assert_eq!(lua.find_upvalue(main, 2).unwrap(), upvalue);
    assert!(lua.upvalue(upvalue).is_open());
    assert_eq!(lua.num_open_upvalues(), 1);
    assert_eq!(lua.upvalue_get(upvalue), num(7));

    lua.upvalue_set(upvalue, num(8));
    assert_eq!(lua.stack_get(main, 2), num(8));

    lua.push(main, num(99)).unwrap();
    assert_eq!(lua.pop_frame(main, 1).unwrap(), 1);

    assert!(!lua.upvalue(upvalue).is_open());
    assert_eq!(lua.upvalue_get(upvalue), num(8));
    assert_eq!(lua.num_open_upvalues(), 0);
    assert_eq!(lua.stack_get(main, 1), num(99));
    assert_eq!(lua.top(main), 2);
}

#[test]
fn test_upvalue_outlives_thread() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);
    let main = lua.main_thread();

    let thread = lua.new_thread(main).unwrap();
    lua.push(thread, num(5)).unwrap();
    let upvalue = lua.find_upvalue(thread, 1).unwrap();

    let proto = lua.new_proto(Proto::new()).unwrap();
    let closure = lua.new_lua_closure(proto, vec![upvalue], Value::Nil).unwrap();
    root(&mut lua, Value::Function(closure));

    lua.gc(GcCommand::Collect);

    assert!(!lua.is_alive(thread.id()));
    assert!(lua.is_alive(upvalue.id()));
    assert!(lua.is_alive(proto.id()));
    assert!(!lua.upvalue(upvalue).is_open());
    assert_eq!(lua.upvalue_get(upvalue), num(5));
    assert_eq!(lua.closure_upvalue(closure, 0), Some(num(5)));
    assert_eq!(lua.num_open_upvalues(), 0);
}

#[test]
fn test_open_upvalue_keeps_stack_value() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);
    let main = lua.main_thread();

    let thread = lua.new_thread(main).unwrap();
    root(&mut lua, Value::Thread(thread));
    let value = lua.new_table(0, 0).unwrap();
    lua.push(thread, Value::Table(value)).unwrap();
    let upvalue = lua.find_upvalue(thread, 1).unwrap();

    let closure = lua.new_native_closure(noop, Vec::new(), Value::Nil).unwrap();
    root(&mut lua, Value::Function(closure));
    lua.gc(GcCommand::Collect);

    assert!(lua.is_alive(upvalue.id()));
    assert!(lua.is_alive(value.id()));
    assert_eq!(lua.upvalue_get(upvalue), Value::Table(value));
}

#[test]
fn test_open_upvalue_above_top_survives_shrink() {
    let mut lua = new_lua();
    let main = lua.main_thread();
    let thread = lua.new_thread(main).unwrap();
    root(&mut lua, Value::Thread(thread));

    lua.check_stack(thread, 2000).unwrap();
    lua.set_top(thread, 1500).unwrap();
    let upvalue = lua.find_upvalue(thread, 1400).unwrap();
    lua.set_top(thread, 1).unwrap();

    let value = lua.new_table(0, 0).unwrap();
    lua.upvalue_set(upvalue, Value::Table(value));

    lua.gc(GcCommand::Collect);

    assert!(lua.stack_size(thread) > 1400);
    assert!(lua.is_alive(value.id()));
    assert_eq!(lua.upvalue_get(upvalue), Value::Table(value));
}

// ============================================================================
// Stack and frame tests
// ============================================================================

#[test]
fn test_frames_survive_growth() {
    let mut lua = new_lua();
    let main = lua.main_thread();

    let reallocations = Arc::new(Mutex::new(Vec::new()));
    let seen = reallocations.clone();
    lua.set_stack_listener(move |reallocation: StackReallocation| {
        seen.lock().push(reallocation.new_size);
    });

    lua.push(main, Value::Boolean(true)).unwrap();
    let first = lua.push_frame(main, 1, 2, MULTIPLE_RESULTS).unwrap();

    for _ in 0..100 {
        let func = lua.top(main);
        lua.push(main, Value::Boolean(true)).unwrap();
        lua.push_frame(main, func, 2, MULTIPLE_RESULTS).unwrap();
    }

    let frames = lua.thread(main).frames();
    assert_eq!(frames.len(), 102);
    assert!(frames.capacity() >= 128);
    assert_eq!(lua.frame(main, first).map(|frame| frame.base), Some(2));
    assert_eq!(first.depth(), 1);

    let sizes = reallocations.lock().clone();
    assert!(sizes.len() >= 2, "expected two stack growths, got {sizes:?}");
    assert!(sizes.windows(2).all(|pair| pair[0] < pair[1]));

    for _ in 0..101 {
        assert_eq!(lua.pop_frame(main, 0).unwrap(), 0);
    }
    assert_eq!(lua.thread(main).frames().len(), 1);
    assert_eq!(lua.top(main), 1);
}

#[test]
fn test_tail_call_reuses_frame() {
    let mut lua = new_lua();
    let main = lua.main_thread();

    lua.push(main, Value::Boolean(true)).unwrap();
    let frame = lua.push_frame(main, 1, 4, MULTIPLE_RESULTS).unwrap();
    lua.push(main, Value::Boolean(false)).unwrap();
    lua.push(main, num(1)).unwrap();

    let tail = lua.tail_call(main, 2, 4).unwrap();

    assert_eq!(tail, frame);
    assert_eq!(lua.thread(main).frames().len(), 2);
    assert_eq!(lua.thread(main).frames().logical_depth(), 3);
    assert_eq!(lua.stack_get(main, 1), Value::Boolean(false));
    assert_eq!(lua.stack_get(main, 2), num(1));
    assert_eq!(lua.top(main), 3);
}

#[test]
fn test_call_depth_overflow() {
    let options = OptionsBuilder::new().verify_heap(true).gc_stress_test(false).max_call_depth(40).build();
    let mut lua = Lua::with_options(options).unwrap();
    let main = lua.main_thread();

    let mut errors = Vec::new();
    for _ in 0..200 {
        let func = lua.top(main);
        lua.push(main, Value::Boolean(true)).unwrap();
        if let Err(error) = lua.push_frame(main, func, 1, 0) {
            errors.push(error);
            if errors.len() == 2 {
                break;
            }
        }
    }

    assert_eq!(errors, vec![LuaError::StackOverflow, LuaError::ErrorHandlerOverflow]);
}

#[test]
fn test_value_stack_overflow() {
    let options = OptionsBuilder::new().verify_heap(true).gc_stress_test(false).max_stack_size(100).build();
    let mut lua = Lua::with_options(options).unwrap();
    let main = lua.main_thread();

    assert_eq!(lua.check_stack(main, 200), Err(LuaError::StackOverflow));
    assert!(lua.check_stack(main, 20).is_ok());
}

#[test]
fn test_huge_stack_request_overflows() {
    let mut lua = new_lua();
    let main = lua.main_thread();

    assert_eq!(lua.check_stack(main, usize::MAX), Err(LuaError::StackOverflow));
    assert_eq!(lua.check_stack(main, usize::MAX - 10), Err(LuaError::StackOverflow));
    assert!(lua.push(main, num(1)).is_ok());
}

#[test]
fn test_native_call_limit() {
    let mut lua = new_lua();
    let main = lua.main_thread();
    let max = lua.options().max_native_calls;

    for _ in 1..max {
        lua.enter_native_call(main).unwrap();
    }
    assert_eq!(lua.enter_native_call(main), Err(LuaError::NativeCallOverflow));

    let mut result = Ok(());
    while result.is_ok() {
        result = lua.enter_native_call(main);
    }
    assert_eq!(result, Err(LuaError::ErrorHandlerOverflow));

    lua.restore_native_calls(main, 0);
    assert!(lua.enter_native_call(main).is_ok());
}

#[test]
fn test_xmove_between_threads() {
    let mut lua = new_lua();
    let main = lua.main_thread();
    let thread = lua.new_thread(main).unwrap();
    root(&mut lua, Value::Thread(thread));

    lua.push(main, num(1)).unwrap();
    lua.push(main, num(2)).unwrap();
    lua.xmove(main, thread, 2).unwrap();

    assert_eq!(lua.top(main), 2);
    assert_eq!(lua.pop(thread), num(2));
    assert_eq!(lua.pop(thread), num(1));
    assert_eq!(lua.globals(thread), lua.globals(main));
}

#[test]
fn test_dead_stack_shrunk_by_sweep() {
    let mut lua = new_lua();
    let main = lua.main_thread();

    lua.check_stack(main, 2000).unwrap();
    let grown = lua.stack_size(main);
    let total = lua.gc_stats().total_bytes;
    lua.gc(GcCommand::Collect);

    assert!(lua.stack_size(main) < grown);
    assert!(lua.gc_stats().total_bytes < total);
    assert!(lua.verify_heap().is_ok());
}

// ============================================================================
// Pacing tests
// ============================================================================

#[test]
fn test_threshold_follows_pause() {
    let mut lua = new_lua();

    assert_eq!(lua.gc(GcCommand::SetPause(100)), 200);
    lua.gc(GcCommand::Collect);
    let low = lua.gc_stats();
    assert_eq!(low.threshold, low.estimate / 100 * 100);

    lua.gc(GcCommand::SetPause(400));
    lua.gc(GcCommand::Collect);
    let high = lua.gc_stats();
    assert_eq!(high.threshold, high.estimate / 100 * 400);
    assert!(high.threshold > low.threshold);
}

#[test]
fn test_garbage_churn_bounded() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Collect);
    let baseline = lua.gc_stats();

    let mut peak = 0;
    for _ in 0..20_000 {
        lua.new_table(0, 0).unwrap();
        peak = peak.max(lua.gc_stats().total_bytes);
    }

    let stats = lua.gc_stats();
    assert!(stats.cycles > baseline.cycles);
    assert!(peak < 8 * baseline.total_bytes, "peak {peak} for baseline {}", baseline.total_bytes);
}

#[test]
fn test_table_growth_paces_collector() {
    let mut lua = new_lua();
    let holder = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(holder));
    lua.gc(GcCommand::Collect);
    let before = lua.gc_stats().cycles;

    // Only an existing table grows, no new objects are created
    for i in 0..20_000 {
        let key = Value::Number(-(i as f64) - 0.5);
        lua.table_set(holder, key, num(i)).unwrap();
    }

    assert!(lua.gc_stats().cycles > before);
    assert_eq!(lua.table(holder).count(), 20_000);
    assert!(lua.verify_heap().is_ok());
}

#[test]
fn test_stack_growth_paces_collector() {
    let mut lua = new_lua();
    let main = lua.main_thread();
    lua.gc(GcCommand::Collect);
    let before = lua.gc_stats();

    for i in 0..100_000 {
        lua.push(main, num(i)).unwrap();
    }

    let after = lua.gc_stats();
    assert!(after.cycles > before.cycles || after.phase != GcPhase::Pause);
    assert_eq!(lua.top(main), 100_001);
    assert_eq!(lua.stack_get(main, 100_000), num(99_999));
}

#[test]
fn test_stop_and_restart() {
    let mut lua = new_lua();
    lua.gc(GcCommand::Stop);
    let cycles = lua.gc_stats().cycles;

    for _ in 0..5000 {
        lua.new_table(0, 0).unwrap();
    }
    assert_eq!(lua.gc_stats().cycles, cycles);
    assert_eq!(lua.gc_stats().phase, GcPhase::Pause);

    lua.gc(GcCommand::Restart);
    lua.new_table(0, 0).unwrap();
    assert_ne!(lua.gc_stats().phase, GcPhase::Pause);
}

#[test]
fn test_step_command_finishes_cycle() {
    let mut lua = new_lua();
    let cycles = lua.gc_stats().cycles;

    let finished = (0..1000).any(|_| lua.gc(GcCommand::Step(0)) == 1);

    assert!(finished);
    assert_eq!(lua.gc_stats().cycles, cycles + 1);
    assert_eq!(lua.gc_stats().phase, GcPhase::Pause);
}

#[test]
fn test_count_commands() {
    let mut lua = new_lua();
    let total = lua.gc_stats().total_bytes;

    assert_eq!(lua.gc(GcCommand::Count), total >> 10);
    assert_eq!(lua.gc(GcCommand::CountBytes), total & 0x3ff);
    assert_eq!(lua.gc(GcCommand::SetStepMultiplier(400)), 200);
    assert_eq!(lua.gc(GcCommand::SetStepMultiplier(200)), 400);
}

#[test]
fn test_stress_mode_keeps_rooted_objects() {
    let options = OptionsBuilder::new().verify_heap(true).gc_stress_test(true).build();
    let mut lua = Lua::with_options(options).unwrap();
    let start = lua.gc_stats().cycles;

    let mut tables = Vec::new();
    for i in 0..20 {
        let table = lua.new_table(0, 0).unwrap();
        root(&mut lua, Value::Table(table));
        let string = lua.new_string(&format!("value {i}")).unwrap();
        lua.table_set(table, num(1), Value::String(string)).unwrap();
        tables.push(table);
    }

    assert!(lua.gc_stats().cycles >= start + 40);
    for (i, table) in tables.iter().enumerate() {
        let value = lua.table_get(*table, &num(1));
        let string = value.as_string().unwrap();
        assert_eq!(lua.string(string).as_bytes(), format!("value {i}").as_bytes());
    }
}

// ============================================================================
// Memory hook tests
// ============================================================================

fn fill(lua: &mut Lua, holder: GcPtr<Table>, index: usize) -> LuaResult<()> {
    let table = lua.new_table(0, 0)?;
    lua.table_set(holder, num(index), Value::Table(table))
}

#[cfg(feature = "alloc_error")]
#[test]
fn test_out_of_memory_reported() {
    let hook = Box::new(LimitedAllocator::new(64 * 1024));
    let mut lua = Lua::with_memory_hook(options(), hook).unwrap();
    let holder = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(holder));

    let error = (1..100_000).find_map(|i| fill(&mut lua, holder, i).err());
    assert_eq!(error, Some(LuaError::OutOfMemory));
    assert!(lua.verify_heap().is_ok());

    // Dropping the only reference makes room again
    let main = lua.main_thread();
    lua.pop(main);
    lua.gc(GcCommand::Collect);
    let registry = lua.registry().as_table().unwrap();
    assert!(fill(&mut lua, registry, 1).is_ok());
}

#[test]
fn test_out_of_memory_at_startup() {
    let hook = Box::new(LimitedAllocator::new(64));
    assert!(Lua::with_memory_hook(options(), hook).is_err());
}

struct CountingHook(Arc<Mutex<usize>>);

impl MemoryHook for CountingHook {
    fn realloc(&mut self, old_size: usize, new_size: usize) -> bool {
        let mut used = self.0.lock();
        *used = used.saturating_sub(old_size) + new_size;
        true
    }
}

#[test]
fn test_close_releases_everything() {
    let used = Arc::new(Mutex::new(0));
    let mut lua = Lua::with_memory_hook(options(), Box::new(CountingHook(used.clone()))).unwrap();

    let holder = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(holder));
    for i in 1..200 {
        fill(&mut lua, holder, i).unwrap();
    }
    let main = lua.main_thread();
    lua.check_stack(main, 500).unwrap();

    assert_eq!(*used.lock(), lua.gc_stats().total_bytes);
    lua.close();
    assert_eq!(*used.lock(), 0);
}

// ============================================================================
// Randomized reachability tests
// ============================================================================

fn reachable(rooted: &BTreeSet<usize>, edges: &[HashMap<u32, usize>]) -> BTreeSet<usize> {
    let mut live = BTreeSet::new();
    let mut pending: Vec<usize> = rooted.iter().copied().collect();
    while let Some(index) = pending.pop() {
        if live.insert(index) {
            pending.extend(edges[index].values().copied());
        }
    }
    live
}

fn pick(rng: &mut StdRng, set: &BTreeSet<usize>) -> Option<usize> {
    if set.is_empty() {
        return None;
    }
    set.iter().nth(rng.random_range(0..set.len())).copied()
}

#[test]
fn test_random_graph_against_shadow() {
    let options = OptionsBuilder::new()
        .verify_heap(true)
        .gc_stress_test(false)
        .gc_pause(110)
        .gc_step_multiplier(150)
        .build();
    let mut lua = Lua::with_options(options).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let root_table = lua.new_table(0, 0).unwrap();
    root(&mut lua, Value::Table(root_table));

    let mut tables: Vec<GcPtr<Table>> = Vec::new();
    let mut edges: Vec<HashMap<u32, usize>> = Vec::new();
    let mut rooted = BTreeSet::new();

    for _ in 0..2000 {
        let live = reachable(&rooted, &edges);

        match rng.random_range(0..10) {
            0..=2 => {
                let table = lua.new_table(0, 0).unwrap();
                let index = tables.len();
                tables.push(table);
                edges.push(HashMap::new());
                lua.table_set(root_table, num(index), Value::Table(table)).unwrap();
                rooted.insert(index);
            }
            3..=5 => {
                if let (Some(from), Some(to)) = (pick(&mut rng, &live), pick(&mut rng, &live)) {
                    let key = rng.random_range(0..4u32);
                    lua.table_set(tables[from], num(key as usize), Value::Table(tables[to]))
                        .unwrap();
                    edges[from].insert(key, to);
                }
            }
            6 => {
                if let Some(from) = pick(&mut rng, &live) {
                    let key = rng.random_range(0..4u32);
                    lua.table_set(tables[from], num(key as usize), Value::Nil).unwrap();
                    edges[from].remove(&key);
                }
            }
            7 => {
                if let Some(index) = pick(&mut rng, &rooted) {
                    lua.table_set(root_table, num(index), Value::Nil).unwrap();
                    rooted.remove(&index);
                }
            }
            8 => {
                for _ in 0..rng.random_range(1..20) {
                    lua.gc_single_step();
                }
            }
            _ => assert!(lua.verify_heap().is_ok()),
        }

        for index in reachable(&rooted, &edges) {
            let table = tables[index];
            assert!(lua.is_alive(table.id()), "reachable table {index} was freed");
            for key in 0..4u32 {
                let expected = edges[index]
                    .get(&key)
                    .map_or(Value::Nil, |target| Value::Table(tables[*target]));
                assert_eq!(lua.table_get(table, &num(key as usize)), expected);
            }
        }
    }

    lua.gc(GcCommand::Collect);
    let live = reachable(&rooted, &edges);
    for (index, table) in tables.iter().enumerate() {
        assert_eq!(lua.is_alive(table.id()), live.contains(&index), "table {index}");
    }
    assert!(lua.verify_heap().is_ok());
}

// ============================================================================
// Multiple instances
// ============================================================================

struct SharedRoots(Arc<Mutex<Vec<Value>>>);

impl ExternalRoots for SharedRoots {
    fn visit_roots(&mut self, visitor: &mut dyn GcVisitor) {
        for value in self.0.lock().iter() {
            visitor.visit_value(value);
        }
    }
}

#[test]
fn test_instances_on_separate_threads() {
    fn assert_send<T: Send>() {}
    assert_send::<Lua>();

    let cycles = Arc::new(Mutex::new(Vec::new()));
    let handles: Vec<_> = (0..4)
        .map(|seed| {
            let cycles = cycles.clone();
            std::thread::spawn(move || {
                let mut lua = new_lua();
                let roots = Arc::new(Mutex::new(Vec::new()));
                lua.set_external_roots(Some(Box::new(SharedRoots(roots.clone()))));

                let kept = lua.new_table(0, 0).unwrap();
                roots.lock().push(Value::Table(kept));

                for i in 0..1000 {
                    let table = lua.new_table(0, 0).unwrap();
                    if i % 10 == seed {
                        lua.table_set(kept, num(i), Value::Table(table)).unwrap();
                    }
                }

                lua.gc(GcCommand::Collect);
                assert!(lua.is_alive(kept.id()));
                assert_eq!(lua.table(kept).count(), 100);
                assert!(lua.verify_heap().is_ok());

                cycles.lock().push(lua.gc_stats().cycles);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cycles.lock().len(), 4);
}
