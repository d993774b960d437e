use super::constants::{
    DEFAULT_GC_PAUSE, DEFAULT_GC_STEP_MULTIPLIER, DEFAULT_MAX_CALL_DEPTH,
    DEFAULT_MAX_NATIVE_CALLS, DEFAULT_MAX_STACK_SIZE, MIN_STRING_TABLE_SIZE,
};

/// Options passed to a runtime instance when it is created.
#[derive(Clone, Debug)]
pub struct Options {
    /// Percentage of the live heap estimate to wait for before starting a new cycle
    pub gc_pause: usize,

    /// Collector work performed per unit of allocation, as a percentage
    pub gc_step_multiplier: usize,

    /// Maximum number of value stack slots in a single coroutine
    pub max_stack_size: usize,

    /// Maximum number of call frames in a single coroutine
    pub max_call_depth: usize,

    /// Maximum depth of nested native calls
    pub max_native_calls: u16,

    /// Number of buckets the string table starts with. Rounded up to a power of two.
    pub initial_string_table_size: usize,

    /// Check the tri-color invariant at the end of every mark phase
    pub verify_heap: bool,

    /// Run a full collection before every allocation
    pub gc_stress_test: bool,
}

impl Default for Options {
    /// Create a new options struct with default values.
    fn default() -> Self {
        OptionsBuilder::new().build()
    }
}

pub struct OptionsBuilder(Options);

impl OptionsBuilder {
    /// Create new options with default values.
    pub fn new() -> Self {
        Self(Options {
            gc_pause: DEFAULT_GC_PAUSE,
            gc_step_multiplier: DEFAULT_GC_STEP_MULTIPLIER,
            max_stack_size: DEFAULT_MAX_STACK_SIZE,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            max_native_calls: DEFAULT_MAX_NATIVE_CALLS,
            initial_string_table_size: MIN_STRING_TABLE_SIZE,
            verify_heap: cfg!(debug_assertions),
            gc_stress_test: cfg!(feature = "gc_stress_test"),
        })
    }

    /// Return the options that have been built, consuming the builder.
    pub fn build(self) -> Options {
        self.0
    }

    pub fn gc_pause(mut self, gc_pause: usize) -> Self {
        self.0.gc_pause = gc_pause;
        self
    }

    pub fn gc_step_multiplier(mut self, gc_step_multiplier: usize) -> Self {
        self.0.gc_step_multiplier = gc_step_multiplier;
        self
    }

    pub fn max_stack_size(mut self, max_stack_size: usize) -> Self {
        self.0.max_stack_size = max_stack_size;
        self
    }

    pub fn max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.0.max_call_depth = max_call_depth;
        self
    }

    pub fn max_native_calls(mut self, max_native_calls: u16) -> Self {
        self.0.max_native_calls = max_native_calls;
        self
    }

    pub fn initial_string_table_size(mut self, size: usize) -> Self {
        self.0.initial_string_table_size = size;
        self
    }

    pub fn verify_heap(mut self, verify_heap: bool) -> Self {
        self.0.verify_heap = verify_heap;
        self
    }

    pub fn gc_stress_test(mut self, gc_stress_test: bool) -> Self {
        self.0.gc_stress_test = gc_stress_test;
        self
    }
}
