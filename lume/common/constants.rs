/// Amount of allocation debt, in bytes, that a single collector step pays off.
pub const GC_STEP_SIZE: usize = 1024;

/// Maximum number of heap slots visited by one object sweep step.
pub const GC_SWEEP_MAX: usize = 40;

/// Work units charged for sweeping a single string bucket or heap slot.
pub const GC_SWEEP_COST: usize = 10;

/// Work units charged for running a single finalizer.
pub const GC_FINALIZE_COST: usize = 100;

/// Default wait between cycles, as a percentage of the live heap estimate.
pub const DEFAULT_GC_PAUSE: usize = 200;

/// Default collector speed relative to allocation, as a percentage.
pub const DEFAULT_GC_STEP_MULTIPLIER: usize = 200;

/// The string table never shrinks below this many buckets.
pub const MIN_STRING_TABLE_SIZE: usize = 32;

/// Initial number of call frame slots in a coroutine.
pub const BASIC_CALL_INFO_SIZE: usize = 8;

/// Minimum number of free stack slots guaranteed to a native function.
pub const MIN_STACK: usize = 20;

/// Initial usable stack size of a coroutine.
pub const BASIC_STACK_SIZE: usize = 2 * MIN_STACK;

/// Slots kept past the usable end of every stack for metamethod calls.
pub const EXTRA_STACK: usize = 5;

/// Default maximum number of call frames in one coroutine.
pub const DEFAULT_MAX_CALL_DEPTH: usize = 20000;

/// Default maximum number of value stack slots in one coroutine.
pub const DEFAULT_MAX_STACK_SIZE: usize = 1_000_000;

/// Default maximum depth of nested native calls.
pub const DEFAULT_MAX_NATIVE_CALLS: u16 = 200;
