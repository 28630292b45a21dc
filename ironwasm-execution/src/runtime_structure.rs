//! Runtime values, instances, and the operand stack.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use ironwasm_binary_format::ReadError;
use ironwasm_structure::modules::*;
use ironwasm_structure::types::*;

/// A runtime failure carrying a textual reason. Unwinds the whole
/// invocation; side effects performed before it stay visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trap {
    pub message: String,
}

impl Trap {
    pub fn new(message: impl Into<String>) -> Self {
        Trap { message: message.into() }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Trap {}

impl From<ReadError> for Trap {
    fn from(e: ReadError) -> Self {
        Trap::new(format!("Truncated instruction stream: {e}"))
    }
}

pub type EResult<T> = Result<T, Trap>;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Val {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    FuncRef(Option<FuncIdx>),
    ExternRef(Option<u64>),
}

impl Val {
    pub fn ty(&self) -> ValType {
        match self {
            Val::I32(_) => ValType::I32,
            Val::I64(_) => ValType::I64,
            Val::F32(_) => ValType::F32,
            Val::F64(_) => ValType::F64,
            Val::FuncRef(_) => ValType::FuncRef,
            Val::ExternRef(_) => ValType::ExternRef,
        }
    }

    /// The default for fresh locals and table slots: numeric zero or the
    /// null reference.
    pub fn zero(ty: ValType) -> Val {
        match ty {
            ValType::I32 => Val::I32(0),
            ValType::I64 => Val::I64(0),
            ValType::F32 => Val::F32(0.0),
            ValType::F64 => Val::F64(0.0),
            ValType::FuncRef => Val::FuncRef(None),
            ValType::ExternRef => Val::ExternRef(None),
        }
    }

    pub fn null_ref(rt: RefType) -> Val {
        match rt {
            RefType::FuncRef => Val::FuncRef(None),
            RefType::ExternRef => Val::ExternRef(None),
        }
    }

    pub fn is_null_ref(&self) -> bool {
        matches!(self, Val::FuncRef(None) | Val::ExternRef(None))
    }

    pub fn funcref_index(&self) -> EResult<FuncIdx> {
        match self {
            Val::FuncRef(Some(index)) => Ok(*index),
            _ => Err(Trap::new("Value is not a non-null funcref")),
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        if let Val::I32(v) = self { Some(*v) } else { None }
    }

    pub fn as_i64(&self) -> Option<i64> {
        if let Val::I64(v) = self { Some(*v) } else { None }
    }

    pub fn as_f32(&self) -> Option<f32> {
        if let Val::F32(v) = self { Some(*v) } else { None }
    }

    pub fn as_f64(&self) -> Option<f64> {
        if let Val::F64(v) = self { Some(*v) } else { None }
    }
}

/// Where a stack entry came from. Consulted only by the store
/// operand-order heuristic.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ValOrigin {
    Default,
    CallResult,
    LoadResult,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StackVal {
    pub val: Val,
    pub origin: ValOrigin,
}

impl Default for StackVal {
    fn default() -> Self {
        StackVal { val: Val::I32(0), origin: ValOrigin::Default }
    }
}

#[derive(Default)]
pub struct OperandStack {
    entries: Vec<StackVal>,
}

impl OperandStack {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resize(&mut self, len: usize) {
        self.entries.resize(len, StackVal::default());
    }

    pub fn push(&mut self, val: Val, origin: ValOrigin) {
        self.entries.push(StackVal { val, origin });
    }

    pub fn push_entry(&mut self, entry: StackVal) {
        self.entries.push(entry);
    }

    pub fn pop_entry(&mut self) -> EResult<StackVal> {
        self.entries.pop().ok_or_else(|| Trap::new("Operand stack underflow"))
    }

    pub fn pop_val(&mut self) -> EResult<Val> {
        Ok(self.pop_entry()?.val)
    }

    pub fn pop_i32(&mut self) -> EResult<i32> {
        match self.pop_val()? {
            Val::I32(v) => Ok(v),
            _ => Err(Trap::new("Expected i32 on stack")),
        }
    }

    pub fn pop_i64(&mut self) -> EResult<i64> {
        match self.pop_val()? {
            Val::I64(v) => Ok(v),
            _ => Err(Trap::new("Expected i64 on stack")),
        }
    }

    pub fn pop_f32(&mut self) -> EResult<f32> {
        match self.pop_val()? {
            Val::F32(v) => Ok(v),
            _ => Err(Trap::new("Expected f32 on stack")),
        }
    }

    pub fn pop_f64(&mut self) -> EResult<f64> {
        match self.pop_val()? {
            Val::F64(v) => Ok(v),
            _ => Err(Trap::new("Expected f64 on stack")),
        }
    }

    pub fn pop_ref(&mut self, expected: ValType) -> EResult<Val> {
        let val = self.pop_val()?;
        if val.ty() != expected {
            return Err(Trap::new(format!("Expected reference of type {}", expected.name())));
        }
        Ok(val)
    }

    pub fn pop_any_ref_entry(&mut self) -> EResult<StackVal> {
        let entry = self.pop_entry()?;
        if !entry.val.ty().is_ref() {
            return Err(Trap::new("Expected reference value on stack"));
        }
        Ok(entry)
    }

    /// The store operand-order heuristic: true when the entry below the
    /// top was produced by a call or load and the top entry was not. The
    /// store then treats the top entry as the address. In canonically
    /// produced code this never fires.
    pub fn store_swaps_operands(&self) -> bool {
        if self.entries.len() < 2 {
            return false;
        }
        let top = &self.entries[self.entries.len() - 1];
        let second = &self.entries[self.entries.len() - 2];
        let tagged = |origin: ValOrigin| {
            matches!(origin, ValOrigin::CallResult | ValOrigin::LoadResult)
        };
        tagged(second.origin) && !tagged(top.origin)
    }
}

pub struct MemInst {
    pub type_: MemType,
    pub data: Vec<u8>,
}

impl MemInst {
    pub fn new(type_: MemType) -> Self {
        let data = vec![0; type_.limits.min as usize * PAGE_SIZE];
        MemInst { type_, data }
    }

    pub fn size_in_pages(&self) -> u32 {
        (self.data.len() / PAGE_SIZE) as u32
    }

    /// Appends `delta_pages` zeroed pages, respecting the optional
    /// maximum. False on overflow or limit violation.
    pub fn grow(&mut self, delta_pages: u32) -> bool {
        let new_pages = u64::from(self.size_in_pages()) + u64::from(delta_pages);
        if new_pages > u64::from(u32::MAX) {
            return false;
        }
        if let Some(max) = self.type_.limits.max {
            if new_pages > u64::from(max) {
                return false;
            }
        }
        self.data.resize(new_pages as usize * PAGE_SIZE, 0);
        true
    }
}

pub struct TableInst {
    pub type_: TableType,
    pub valtype: ValType,
    pub elements: Vec<Val>,
}

impl TableInst {
    pub fn new(type_: TableType) -> Self {
        let valtype = type_.elemtype.valtype();
        let elements = vec![Val::null_ref(type_.elemtype); type_.limits.min as usize];
        TableInst { type_, valtype, elements }
    }
}

pub struct GlobalInst {
    pub type_: GlobalType,
    pub value: Val,
}

pub struct DataInst {
    pub bytes: Vec<u8>,
    pub passive: bool,
    pub dropped: bool,
}

/// Result of a host callback. A trapped result is propagated as a trap
/// carrying the message.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HostResult {
    pub trapped: bool,
    pub trap_message: String,
    pub values: Vec<Val>,
}

impl HostResult {
    pub fn values(values: Vec<Val>) -> Self {
        HostResult { trapped: false, trap_message: String::new(), values }
    }

    pub fn trap(message: impl Into<String>) -> Self {
        HostResult { trapped: true, trap_message: message.into(), values: Vec::new() }
    }
}

/// Internal host callback shape. The store parameter lets default shims
/// (fd_write) reach linear memory; callbacks registered through the
/// public API ignore it.
pub type HostCallback = Rc<dyn Fn(&mut Store, &[Val]) -> HostResult>;

#[derive(Clone)]
pub enum FuncInst {
    Local { type_: FuncType, code: usize },
    Host { type_: FuncType, hostcode: HostCallback },
}

impl FuncInst {
    pub fn type_(&self) -> &FuncType {
        match self {
            FuncInst::Local { type_, .. } | FuncInst::Host { type_, .. } => type_,
        }
    }
}

/// All runtime state of one instantiated module. Created once per
/// `load`; lives until the interpreter is dropped or reloaded.
pub struct Store {
    pub module: Module,
    pub codes: Vec<Rc<Code>>,
    pub funcs: Vec<FuncInst>,
    pub tables: Vec<TableInst>,
    pub mems: Vec<MemInst>,
    pub globals: Vec<GlobalInst>,
    pub datas: Vec<DataInst>,
    pub exports: HashMap<String, ExportDesc>,
}

impl Store {
    pub fn new(module: Module) -> Self {
        let codes = module.codes.iter().cloned().map(Rc::new).collect();
        Store {
            module,
            codes,
            funcs: Vec::new(),
            tables: Vec::new(),
            mems: Vec::new(),
            globals: Vec::new(),
            datas: Vec::new(),
            exports: HashMap::new(),
        }
    }

    pub fn mem(&self, index: u32) -> EResult<&MemInst> {
        self.mems
            .get(index as usize)
            .ok_or_else(|| Trap::new("Memory index out of bounds"))
    }

    pub fn mem_mut(&mut self, index: u32) -> EResult<&mut MemInst> {
        self.mems
            .get_mut(index as usize)
            .ok_or_else(|| Trap::new("Memory index out of bounds"))
    }
}
