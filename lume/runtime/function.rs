use std::mem::size_of;

use crate::gc::{GcPtr, GcVisitor};

use super::{
    coroutine::Coroutine, error::LuaResult, state::Lua, string::LuaString, upvalue::UpVal,
    value::Value,
};

/// A native function. Receives the coroutine it runs on, with its arguments on the stack, and
/// returns the number of results it pushed.
pub type NativeFunction = fn(&mut Lua, GcPtr<Coroutine>) -> LuaResult<usize>;

/// Compiled function prototype, shared by every closure created from it.
#[derive(Default)]
pub struct Proto {
    pub code: Vec<u32>,
    /// Source line of each instruction
    pub line_info: Vec<u32>,
    pub constants: Vec<Value>,
    /// Prototypes of nested functions
    pub protos: Vec<GcPtr<Proto>>,
    pub upvalue_names: Vec<GcPtr<LuaString>>,
    pub source: Option<GcPtr<LuaString>>,
    pub line_defined: u32,
    pub last_line_defined: u32,
    pub num_upvalues: u8,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u8,
}

impl Proto {
    pub fn new() -> Proto {
        Proto::default()
    }

    pub fn heap_size(&self) -> usize {
        size_of::<Proto>()
            + self.code.len() * size_of::<u32>()
            + self.line_info.len() * size_of::<u32>()
            + self.constants.len() * size_of::<Value>()
            + self.protos.len() * size_of::<GcPtr<Proto>>()
            + self.upvalue_names.len() * size_of::<GcPtr<LuaString>>()
    }

    pub fn visit_pointers(&self, visitor: &mut impl GcVisitor) {
        visitor.visit_opt(self.source);
        for constant in &self.constants {
            visitor.visit_value(constant);
        }
        for proto in &self.protos {
            visitor.visit(*proto);
        }
        for name in &self.upvalue_names {
            visitor.visit(*name);
        }
    }
}

/// A function value: a Lua function with its captured upvalues, or a native function with
/// upvalues stored inline.
pub enum Closure {
    Lua(LuaClosure),
    Native(NativeClosure),
}

pub struct LuaClosure {
    pub proto: GcPtr<Proto>,
    pub upvalues: Vec<GcPtr<UpVal>>,
    /// Environment table used for global accesses
    pub env: Value,
}

pub struct NativeClosure {
    pub function: NativeFunction,
    pub upvalues: Vec<Value>,
    pub env: Value,
}

impl Closure {
    #[inline]
    pub fn env(&self) -> Value {
        match self {
            Closure::Lua(closure) => closure.env,
            Closure::Native(closure) => closure.env,
        }
    }

    pub(crate) fn set_env(&mut self, env: Value) {
        match self {
            Closure::Lua(closure) => closure.env = env,
            Closure::Native(closure) => closure.env = env,
        }
    }

    pub fn num_upvalues(&self) -> usize {
        match self {
            Closure::Lua(closure) => closure.upvalues.len(),
            Closure::Native(closure) => closure.upvalues.len(),
        }
    }

    pub fn heap_size(&self) -> usize {
        match self {
            Closure::Lua(closure) => {
                size_of::<Closure>() + closure.upvalues.len() * size_of::<GcPtr<UpVal>>()
            }
            Closure::Native(closure) => {
                size_of::<Closure>() + closure.upvalues.len() * size_of::<Value>()
            }
        }
    }

    pub fn visit_pointers(&self, visitor: &mut impl GcVisitor) {
        match self {
            Closure::Lua(closure) => {
                visitor.visit_value(&closure.env);
                visitor.visit(closure.proto);
                for upvalue in &closure.upvalues {
                    visitor.visit(*upvalue);
                }
            }
            Closure::Native(closure) => {
                visitor.visit_value(&closure.env);
                for upvalue in &closure.upvalues {
                    visitor.visit_value(upvalue);
                }
            }
        }
    }
}
