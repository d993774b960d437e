//! Lume runtime core
//!
//! The object model, per-instance and per-coroutine state, call frames and the incremental
//! garbage collector of an embeddable Lua 5.1 style interpreter. The parser, the instruction
//! dispatch loop and the standard library live elsewhere and use this crate to allocate
//! objects, grow stacks, push frames and record writes through the collector's barriers.
//!
//! ```ignore
//! let mut lua = Lua::new()?;
//! let table = lua.new_table(0, 0)?;
//! lua.push(lua.main_thread(), Value::Table(table))?;
//! lua.gc(GcCommand::Collect);
//! ```

pub mod common;
pub mod gc;
pub mod runtime;

pub use common::options::{Options, OptionsBuilder};
pub use gc::{GcCommand, GcPtr, GcStats};
pub use runtime::{Lua, LuaError, LuaResult, Value};
