pub(crate) mod call_info;
pub(crate) mod coroutine;
pub(crate) mod error;
pub(crate) mod function;
pub(crate) mod global_state;
pub(crate) mod object;
pub(crate) mod state;
pub(crate) mod string;
pub(crate) mod string_table;
pub(crate) mod table;
pub(crate) mod tag_method;
pub(crate) mod upvalue;
pub(crate) mod userdata;
pub(crate) mod value;

pub use call_info::{CallInfo, CallStack, FrameId, MULTIPLE_RESULTS};
pub use coroutine::{
    Coroutine, HookEvent, HookFunction, HookMask, HookState, StackListener, StackReallocation,
    ThreadStatus,
};
pub use error::{ConversionError, InvalidKeyKind, LuaError, LuaResult};
pub use function::{Closure, LuaClosure, NativeClosure, NativeFunction, Proto};
pub use global_state::PanicFunction;
pub use object::{HeapItem, HeapObject};
pub use state::{FinalizerHook, Lua};
pub use string::{hash_bytes, LuaString};
pub use string_table::StringTable;
pub use table::{Table, TableKey};
pub use tag_method::TagMethod;
pub use upvalue::{UpVal, UpvalueState};
pub use userdata::Userdata;
pub use value::{Value, ValueKind};
