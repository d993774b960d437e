use crate::gc::GcPtr;

use super::{
    state::Lua,
    string::LuaString,
    table::Table,
    value::{Value, ValueKind},
};

/// Metamethods, in the order their names are interned at startup
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TagMethod {
    Index,
    NewIndex,
    Gc,
    Mode,
    Eq,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Unm,
    Len,
    Lt,
    Le,
    Concat,
    Call,
}

impl TagMethod {
    pub const COUNT: usize = 17;

    pub const ALL: [TagMethod; TagMethod::COUNT] = [
        TagMethod::Index,
        TagMethod::NewIndex,
        TagMethod::Gc,
        TagMethod::Mode,
        TagMethod::Eq,
        TagMethod::Add,
        TagMethod::Sub,
        TagMethod::Mul,
        TagMethod::Div,
        TagMethod::Mod,
        TagMethod::Pow,
        TagMethod::Unm,
        TagMethod::Len,
        TagMethod::Lt,
        TagMethod::Le,
        TagMethod::Concat,
        TagMethod::Call,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TagMethod::Index => "__index",
            TagMethod::NewIndex => "__newindex",
            TagMethod::Gc => "__gc",
            TagMethod::Mode => "__mode",
            TagMethod::Eq => "__eq",
            TagMethod::Add => "__add",
            TagMethod::Sub => "__sub",
            TagMethod::Mul => "__mul",
            TagMethod::Div => "__div",
            TagMethod::Mod => "__mod",
            TagMethod::Pow => "__pow",
            TagMethod::Unm => "__unm",
            TagMethod::Len => "__len",
            TagMethod::Lt => "__lt",
            TagMethod::Le => "__le",
            TagMethod::Concat => "__concat",
            TagMethod::Call => "__call",
        }
    }
}

impl Lua {
    /// Interned name of a metamethod. These strings are never collected.
    #[inline]
    pub fn tag_method_name(&self, method: TagMethod) -> GcPtr<LuaString> {
        self.g.tag_method_names[method as usize]
    }

    /// Metatable shared by every value of a basic type
    pub fn type_metatable(&self, kind: ValueKind) -> Option<GcPtr<Table>> {
        self.g.type_metatables[kind.index()]
    }

    pub fn set_type_metatable(&mut self, kind: ValueKind, metatable: Option<GcPtr<Table>>) {
        self.g.type_metatables[kind.index()] = metatable;
    }

    /// Metatable of a value: its own for tables and userdata, the type metatable otherwise
    pub fn metatable(&self, value: &Value) -> Option<GcPtr<Table>> {
        match value {
            Value::Table(table) => self.table(*table).metatable(),
            Value::Userdata(userdata) => self.userdata(*userdata).metatable(),
            _ => self.type_metatable(value.kind()),
        }
    }

    /// Raw lookup of a metamethod in a value's metatable
    pub fn metamethod(&self, value: &Value, method: TagMethod) -> Value {
        match self.metatable(value) {
            Some(metatable) => self.metatable_field(metatable, method),
            None => Value::Nil,
        }
    }

    pub(crate) fn metatable_field(&self, metatable: GcPtr<Table>, method: TagMethod) -> Value {
        let name = Value::String(self.tag_method_name(method));
        self.table(metatable).get(&name)
    }

    /// Set the metatable of a table or userdata, or the type metatable for any other value.
    ///
    /// A userdata whose new metatable has a `__gc` field is registered for finalization.
    pub fn set_metatable(&mut self, value: &Value, metatable: Option<GcPtr<Table>>) {
        match value {
            Value::Table(table) => {
                self.table_mut(*table).set_metatable(metatable);
                if let Some(metatable) = metatable {
                    self.g.barrier(table.id(), &Value::Table(metatable));
                }
            }
            Value::Userdata(userdata) => {
                self.userdata_mut(*userdata).set_metatable(metatable);
                if let Some(metatable) = metatable {
                    self.g.barrier(userdata.id(), &Value::Table(metatable));
                    if !self.metatable_field(metatable, TagMethod::Gc).is_nil() {
                        self.g.register_finalizer(userdata.id());
                    }
                }
            }
            _ => self.set_type_metatable(value.kind(), metatable),
        }
    }
}
