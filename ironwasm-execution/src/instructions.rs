//! The interpreter proper: a dense dispatch over the opcode byte,
//! driven by an offset cursor over the raw function body.

use ironwasm_binary_format::Reader;
use ironwasm_structure::modules::*;
use ironwasm_structure::types::*;
use tracing::trace;

use crate::block::{analyze_block, block_signature, read_br_table, read_memarg, MemArg};
use crate::numerics::*;
use crate::runtime_structure::*;

// Value casts between stack slots and concrete operand types.

trait ValCast: Sized {
    fn from_val(val: Val) -> EResult<Self>;
    fn to_val(self) -> Val;
}

macro_rules! val_cast {
    ($t:ty, $variant:ident, $name:expr) => {
        impl ValCast for $t {
            fn from_val(val: Val) -> EResult<Self> {
                if let Val::$variant(v) = val {
                    Ok(v)
                } else {
                    Err(Trap::new(concat!("Expected ", $name, " on stack")))
                }
            }

            fn to_val(self) -> Val {
                Val::$variant(self)
            }
        }
    };
}

val_cast!(i32, I32, "i32");
val_cast!(i64, I64, "i64");
val_cast!(f32, F32, "f32");
val_cast!(f64, F64, "f64");

// Memory transfer shapes: the in-memory representation `Self`, widened
// to the operand type `T` on load and narrowed on store.

trait MemOp<T: ValCast>: Sized {
    const SIZE: usize = std::mem::size_of::<Self>();

    fn from_mem(b: &[u8]) -> Self;
    fn extend(self) -> T;
    fn to_mem(b: &mut [u8], v: Self);
    fn wrap(t: T) -> Self;
}

macro_rules! mem_op {
    (int: $memty:ty, $castty:ty, $opty:ty) => {
        impl MemOp<$opty> for $memty {
            fn from_mem(b: &[u8]) -> Self {
                let mut bytes = [0; std::mem::size_of::<$memty>()];
                bytes.copy_from_slice(b);
                Self::from_le_bytes(bytes)
            }

            fn extend(self) -> $opty {
                self as $castty as $opty
            }

            fn to_mem(b: &mut [u8], v: Self) {
                b.copy_from_slice(&v.to_le_bytes());
            }

            fn wrap(t: $opty) -> Self {
                t as $castty as $memty
            }
        }
    };
    (float: $memty:ty, $bits:ty) => {
        impl MemOp<$memty> for $memty {
            fn from_mem(b: &[u8]) -> Self {
                let mut bytes = [0; std::mem::size_of::<$memty>()];
                bytes.copy_from_slice(b);
                <$memty>::from_bits(<$bits>::from_le_bytes(bytes))
            }

            fn extend(self) -> $memty {
                self
            }

            fn to_mem(b: &mut [u8], v: Self) {
                b.copy_from_slice(&v.to_bits().to_le_bytes());
            }

            fn wrap(t: $memty) -> Self {
                t
            }
        }
    };
}

mem_op!(int: i32, i32, i32);
mem_op!(int: u8, u32, i32);
mem_op!(int: i8, i32, i32);
mem_op!(int: u16, u32, i32);
mem_op!(int: i16, i32, i32);

mem_op!(int: i64, i64, i64);
mem_op!(int: u8, u64, i64);
mem_op!(int: i8, i64, i64);
mem_op!(int: u16, u64, i64);
mem_op!(int: i16, i64, i64);
mem_op!(int: u32, u64, i64);
mem_op!(int: i32, i64, i64);

mem_op!(float: f32, u32);
mem_op!(float: f64, u64);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FrameKind {
    Function,
    Block,
    Loop,
    If,
}

#[derive(Clone, Debug)]
struct ControlFrame {
    kind: FrameKind,
    results: Vec<ValType>,
    start_pc: usize,
    end_pc: usize,
    end_next_pc: usize,
    else_body_pc: Option<usize>,
    stack_height: usize,
    executing_else: bool,
}

/// Executes function `func_idx` against the store. Shared by exported
/// calls, `call`, `call_indirect`, and the start function; nested calls
/// recurse here.
pub fn invoke(store: &mut Store, func_idx: FuncIdx, args: &[Val]) -> EResult<Vec<Val>> {
    enum Callee {
        Host(HostCallback),
        Local { params: usize, results: Vec<ValType>, code: usize },
    }

    let callee = match store.funcs.get(func_idx as usize) {
        None => return Err(Trap::new("Function index out of range")),
        Some(FuncInst::Host { hostcode, .. }) => Callee::Host(hostcode.clone()),
        Some(FuncInst::Local { type_, code }) => Callee::Local {
            params: type_.params.len(),
            results: type_.results.clone(),
            code: *code,
        },
    };

    match callee {
        Callee::Host(hostcode) => {
            trace!(func = func_idx, "invoking host function");
            let result = hostcode(store, args);
            if result.trapped {
                Err(Trap::new(result.trap_message))
            } else {
                Ok(result.values)
            }
        }
        Callee::Local { params, results, code } => {
            trace!(func = func_idx, "invoking local function");
            if params != args.len() {
                return Err(Trap::new("Incorrect number of arguments"));
            }
            let code = store
                .codes
                .get(code)
                .cloned()
                .ok_or_else(|| Trap::new("Function code out of range"))?;
            let mut locals: Vec<Val> = Vec::with_capacity(args.len());
            locals.extend_from_slice(args);
            for decl in &code.locals {
                for _ in 0..decl.count {
                    locals.push(Val::zero(decl.ty));
                }
            }
            run_body(store, &code, locals, &results)
        }
    }
}

fn run_body(
    store: &mut Store,
    code: &Code,
    mut locals: Vec<Val>,
    results: &[ValType],
) -> EResult<Vec<Val>> {
    let body = code.body.as_slice();
    let mut reader = Reader::new(body);
    let mut stack = OperandStack::new();
    let mut frames: Vec<ControlFrame> = vec![ControlFrame {
        kind: FrameKind::Function,
        results: results.to_vec(),
        start_pc: 0,
        end_pc: body.len().saturating_sub(1),
        end_next_pc: body.len(),
        else_body_pc: None,
        stack_height: 0,
        executing_else: false,
    }];

    loop {
        if reader.is_at_end() {
            return Err(Trap::new("Reached end of code without function end"));
        }
        let opcode = reader.read_u8()?;
        match opcode {
            0x00 => return Err(Trap::new("Unreachable executed")),
            0x01 => {} // nop

            // block / loop / if
            0x02 | 0x03 | 0x04 => {
                let block_results = block_signature(&mut reader, &store.module.types)?;
                let body_start = reader.offset();
                let info = analyze_block(body, body_start)?;
                let mut frame = ControlFrame {
                    kind: match opcode {
                        0x02 => FrameKind::Block,
                        0x03 => FrameKind::Loop,
                        _ => FrameKind::If,
                    },
                    results: block_results,
                    start_pc: body_start,
                    end_pc: info.end_pc,
                    end_next_pc: info.end_next_pc,
                    else_body_pc: info.else_body_pc,
                    stack_height: stack.len(),
                    executing_else: false,
                };
                if frame.kind == FrameKind::If {
                    let condition = stack.pop_i32()?;
                    frame.stack_height = stack.len();
                    if condition == 0 {
                        if let Some(else_body_pc) = frame.else_body_pc {
                            reader.set_offset(else_body_pc)?;
                            frame.executing_else = true;
                        } else {
                            reader.set_offset(frame.end_pc)?;
                        }
                    }
                }
                frames.push(frame);
            }

            // else: the then-branch ran through, fall to the owning end
            0x05 => match frames.last() {
                Some(frame) if frame.kind == FrameKind::If && !frame.executing_else => {
                    reader.set_offset(frame.end_pc)?;
                }
                _ => return Err(Trap::new("Unexpected else")),
            },

            0x0B => {
                let frame = frames
                    .pop()
                    .ok_or_else(|| Trap::new("Control stack underflow on end"))?;
                let vals = pop_results(&mut stack, &frame.results)?;
                stack.resize(frame.stack_height);
                for entry in &vals {
                    stack.push_entry(*entry);
                }
                if frame.kind == FrameKind::Function {
                    return Ok(vals.into_iter().map(|e| e.val).collect());
                }
                reader.set_offset(frame.end_next_pc)?;
            }

            0x0C => {
                let depth = reader.read_var_u32()?;
                if branch(depth, &mut reader, &mut stack, &mut frames)? {
                    return finish(&mut stack, results);
                }
            }
            0x0D => {
                let depth = reader.read_var_u32()?;
                let condition = stack.pop_i32()?;
                if condition != 0 && branch(depth, &mut reader, &mut stack, &mut frames)? {
                    return finish(&mut stack, results);
                }
            }
            0x0E => {
                let table = read_br_table(&mut reader)?;
                let index = stack.pop_i32()?;
                let target = if index >= 0 && (index as usize) < table.targets.len() {
                    table.targets[index as usize]
                } else {
                    table.default
                };
                if branch(target, &mut reader, &mut stack, &mut frames)? {
                    return finish(&mut stack, results);
                }
            }
            0x0F => {
                let depth = frames.len() as u32 - 1;
                if branch(depth, &mut reader, &mut stack, &mut frames)? {
                    return finish(&mut stack, results);
                }
            }

            0x10 => {
                let index = reader.read_var_u32()?;
                let params = match store.funcs.get(index as usize) {
                    Some(func) => func.type_().params.len(),
                    None => return Err(Trap::new("Function index out of range")),
                };
                let call_args = pop_call_args(&mut stack, params)?;
                let rets = invoke(store, index, &call_args)?;
                for val in rets {
                    stack.push(val, ValOrigin::CallResult);
                }
            }
            0x11 => {
                let type_index = reader.read_var_u32()?;
                let table_index = reader.read_var_u32()?;
                if table_index as usize >= store.tables.len() {
                    return Err(Trap::new("Table index out of bounds"));
                }
                let entry = stack.pop_i32()?;
                let table = &store.tables[table_index as usize];
                if table.valtype != ValType::FuncRef {
                    return Err(Trap::new("call_indirect on table without funcref elements"));
                }
                let entry_index = require_non_negative(entry, "call_indirect table index")?;
                let element = match table.elements.get(entry_index as usize) {
                    Some(element) => *element,
                    None => return Err(Trap::new("call_indirect index out of bounds")),
                };
                if element.is_null_ref() {
                    return Err(Trap::new("call_indirect to uninitialized table element"));
                }
                let func_index = element.funcref_index()?;
                let expected = store
                    .module
                    .types
                    .get(type_index as usize)
                    .ok_or_else(|| Trap::new("call_indirect type index out of range"))?;
                let actual = store
                    .funcs
                    .get(func_index as usize)
                    .ok_or_else(|| Trap::new("Function index out of range"))?
                    .type_();
                if expected.params != actual.params || expected.results != actual.results {
                    return Err(Trap::new("call_indirect signature mismatch"));
                }
                let params = actual.params.len();
                let call_args = pop_call_args(&mut stack, params)?;
                let rets = invoke(store, func_index, &call_args)?;
                for val in rets {
                    stack.push(val, ValOrigin::CallResult);
                }
            }

            0x1A => {
                stack.pop_val()?;
            }
            0x1B => {
                let condition = stack.pop_i32()?;
                let val2 = stack.pop_val()?;
                let val1 = stack.pop_val()?;
                stack.push(if condition != 0 { val1 } else { val2 }, ValOrigin::Default);
            }
            0x1C => return Err(Trap::new("typed select not supported")),

            0x20 => {
                let index = reader.read_var_u32()? as usize;
                let val = *locals
                    .get(index)
                    .ok_or_else(|| Trap::new("local.get index out of bounds"))?;
                stack.push(val, ValOrigin::Default);
            }
            0x21 => {
                let index = reader.read_var_u32()? as usize;
                let val = stack.pop_val()?;
                match locals.get_mut(index) {
                    Some(slot) => *slot = val,
                    None => return Err(Trap::new("local.set index out of bounds")),
                }
            }
            0x22 => {
                let index = reader.read_var_u32()? as usize;
                let val = stack.pop_val()?;
                match locals.get_mut(index) {
                    Some(slot) => *slot = val,
                    None => return Err(Trap::new("local.tee index out of bounds")),
                }
                stack.push(val, ValOrigin::Default);
            }
            0x23 => {
                let index = reader.read_var_u32()? as usize;
                let val = store
                    .globals
                    .get(index)
                    .ok_or_else(|| Trap::new("global.get index out of bounds"))?
                    .value;
                stack.push(val, ValOrigin::Default);
            }
            0x24 => {
                let index = reader.read_var_u32()? as usize;
                let val = stack.pop_val()?;
                let global = store
                    .globals
                    .get_mut(index)
                    .ok_or_else(|| Trap::new("global.set index out of bounds"))?;
                if global.type_.mutability == Mut::Const {
                    return Err(Trap::new("Attempt to modify immutable global"));
                }
                global.value = val;
            }

            0x25 => {
                let table_index = reader.read_var_u32()? as usize;
                if table_index >= store.tables.len() {
                    return Err(Trap::new("table.get table index out of bounds"));
                }
                let element_index = require_non_negative(stack.pop_i32()?, "table.get offset")?;
                let table = &store.tables[table_index];
                match table.elements.get(element_index as usize) {
                    Some(element) => stack.push(*element, ValOrigin::LoadResult),
                    None => return Err(Trap::new("table.get out of bounds")),
                }
            }
            0x26 => {
                let table_index = reader.read_var_u32()? as usize;
                if table_index >= store.tables.len() {
                    return Err(Trap::new("table.set table index out of bounds"));
                }
                let value = stack.pop_ref(store.tables[table_index].valtype)?;
                let element_index = require_non_negative(stack.pop_i32()?, "table.set offset")?;
                let table = &mut store.tables[table_index];
                match table.elements.get_mut(element_index as usize) {
                    Some(slot) => *slot = value,
                    None => return Err(Trap::new("table.set out of bounds")),
                }
            }

            // loads
            0x28 => loadop::<i32, i32>(store, &mut stack, &mut reader)?,
            0x29 => loadop::<i64, i64>(store, &mut stack, &mut reader)?,
            0x2A => loadop::<f32, f32>(store, &mut stack, &mut reader)?,
            0x2B => loadop::<f64, f64>(store, &mut stack, &mut reader)?,
            0x2C => loadop::<i32, i8>(store, &mut stack, &mut reader)?,
            0x2D => loadop::<i32, u8>(store, &mut stack, &mut reader)?,
            0x2E => loadop::<i32, i16>(store, &mut stack, &mut reader)?,
            0x2F => loadop::<i32, u16>(store, &mut stack, &mut reader)?,
            0x30 => loadop::<i64, i8>(store, &mut stack, &mut reader)?,
            0x31 => loadop::<i64, u8>(store, &mut stack, &mut reader)?,
            0x32 => loadop::<i64, i16>(store, &mut stack, &mut reader)?,
            0x33 => loadop::<i64, u16>(store, &mut stack, &mut reader)?,
            0x34 => loadop::<i64, i32>(store, &mut stack, &mut reader)?,
            0x35 => loadop::<i64, u32>(store, &mut stack, &mut reader)?,

            // stores
            0x36 => storeop::<i32, i32>(store, &mut stack, &mut reader)?,
            0x37 => storeop::<i64, i64>(store, &mut stack, &mut reader)?,
            0x38 => storeop::<f32, f32>(store, &mut stack, &mut reader)?,
            0x39 => storeop::<f64, f64>(store, &mut stack, &mut reader)?,
            0x3A => storeop::<i32, u8>(store, &mut stack, &mut reader)?,
            0x3B => storeop::<i32, u16>(store, &mut stack, &mut reader)?,
            0x3C => storeop::<i64, u8>(store, &mut stack, &mut reader)?,
            0x3D => storeop::<i64, u16>(store, &mut stack, &mut reader)?,
            0x3E => storeop::<i64, u32>(store, &mut stack, &mut reader)?,

            0x3F => {
                reader.read_var_u32()?; // reserved memory index
                let pages = store.mem(0)?.size_in_pages();
                stack.push(Val::I32(pages as i32), ValOrigin::Default);
            }
            0x40 => {
                reader.read_var_u32()?; // reserved memory index
                let delta = stack.pop_i32()?;
                let mem = store.mem_mut(0)?;
                let previous = mem.size_in_pages() as i32;
                let result = if delta < 0 {
                    -1
                } else if mem.grow(delta as u32) {
                    previous
                } else {
                    -1
                };
                stack.push(Val::I32(result), ValOrigin::Default);
            }

            0x41 => {
                let n = reader.read_var_s32()?;
                stack.push(Val::I32(n), ValOrigin::Default);
            }
            0x42 => {
                let n = reader.read_var_s64()?;
                stack.push(Val::I64(n), ValOrigin::Default);
            }
            0x43 => {
                let z = reader.read_f32()?;
                stack.push(Val::F32(z), ValOrigin::Default);
            }
            0x44 => {
                let z = reader.read_f64()?;
                stack.push(Val::F64(z), ValOrigin::Default);
            }

            // i32 tests and comparisons
            0x45 => testop(&mut stack, |v: i32| v == 0)?,
            0x46 => relop(&mut stack, |a: i32, b| a == b)?,
            0x47 => relop(&mut stack, |a: i32, b| a != b)?,
            0x48 => relop(&mut stack, |a: i32, b| a < b)?,
            0x49 => relop(&mut stack, |a: i32, b| (a as u32) < (b as u32))?,
            0x4A => relop(&mut stack, |a: i32, b| a > b)?,
            0x4B => relop(&mut stack, |a: i32, b| (a as u32) > (b as u32))?,
            0x4C => relop(&mut stack, |a: i32, b| a <= b)?,
            0x4D => relop(&mut stack, |a: i32, b| (a as u32) <= (b as u32))?,
            0x4E => relop(&mut stack, |a: i32, b| a >= b)?,
            0x4F => relop(&mut stack, |a: i32, b| (a as u32) >= (b as u32))?,

            // i64 tests and comparisons
            0x50 => testop(&mut stack, |v: i64| v == 0)?,
            0x51 => relop(&mut stack, |a: i64, b| a == b)?,
            0x52 => relop(&mut stack, |a: i64, b| a != b)?,
            0x53 => relop(&mut stack, |a: i64, b| a < b)?,
            0x54 => relop(&mut stack, |a: i64, b| (a as u64) < (b as u64))?,
            0x55 => relop(&mut stack, |a: i64, b| a > b)?,
            0x56 => relop(&mut stack, |a: i64, b| (a as u64) > (b as u64))?,
            0x57 => relop(&mut stack, |a: i64, b| a <= b)?,
            0x58 => relop(&mut stack, |a: i64, b| (a as u64) <= (b as u64))?,
            0x59 => relop(&mut stack, |a: i64, b| a >= b)?,
            0x5A => relop(&mut stack, |a: i64, b| (a as u64) >= (b as u64))?,

            // float comparisons; NaN makes ordered comparisons false
            0x5B => relop(&mut stack, |a: f32, b| a == b)?,
            0x5C => relop(&mut stack, |a: f32, b| a != b)?,
            0x5D => relop(&mut stack, |a: f32, b| a < b)?,
            0x5E => relop(&mut stack, |a: f32, b| a > b)?,
            0x5F => relop(&mut stack, |a: f32, b| a <= b)?,
            0x60 => relop(&mut stack, |a: f32, b| a >= b)?,
            0x61 => relop(&mut stack, |a: f64, b| a == b)?,
            0x62 => relop(&mut stack, |a: f64, b| a != b)?,
            0x63 => relop(&mut stack, |a: f64, b| a < b)?,
            0x64 => relop(&mut stack, |a: f64, b| a > b)?,
            0x65 => relop(&mut stack, |a: f64, b| a <= b)?,
            0x66 => relop(&mut stack, |a: f64, b| a >= b)?,

            // i32 arithmetic
            0x67 => unop(&mut stack, i32::iclz)?,
            0x68 => unop(&mut stack, i32::ictz)?,
            0x69 => unop(&mut stack, i32::ipopcnt)?,
            0x6A => binop(&mut stack, i32::wrapping_add)?,
            0x6B => binop(&mut stack, i32::wrapping_sub)?,
            0x6C => binop(&mut stack, i32::wrapping_mul)?,
            0x6D => binop_partial(&mut stack, i32::idiv_s)?,
            0x6E => binop_partial(&mut stack, i32::idiv_u)?,
            0x6F => binop_partial(&mut stack, i32::irem_s)?,
            0x70 => binop_partial(&mut stack, i32::irem_u)?,
            0x71 => binop(&mut stack, |a: i32, b| a & b)?,
            0x72 => binop(&mut stack, |a: i32, b| a | b)?,
            0x73 => binop(&mut stack, |a: i32, b| a ^ b)?,
            0x74 => binop(&mut stack, i32::ishl)?,
            0x75 => binop(&mut stack, i32::ishr_s)?,
            0x76 => binop(&mut stack, i32::ishr_u)?,
            0x77 => binop(&mut stack, i32::irotl)?,
            0x78 => binop(&mut stack, i32::irotr)?,

            // i64 arithmetic
            0x79 => unop(&mut stack, i64::iclz)?,
            0x7A => unop(&mut stack, i64::ictz)?,
            0x7B => unop(&mut stack, i64::ipopcnt)?,
            0x7C => binop(&mut stack, i64::wrapping_add)?,
            0x7D => binop(&mut stack, i64::wrapping_sub)?,
            0x7E => binop(&mut stack, i64::wrapping_mul)?,
            0x7F => binop_partial(&mut stack, i64::idiv_s)?,
            0x80 => binop_partial(&mut stack, i64::idiv_u)?,
            0x81 => binop_partial(&mut stack, i64::irem_s)?,
            0x82 => binop_partial(&mut stack, i64::irem_u)?,
            0x83 => binop(&mut stack, |a: i64, b| a & b)?,
            0x84 => binop(&mut stack, |a: i64, b| a | b)?,
            0x85 => binop(&mut stack, |a: i64, b| a ^ b)?,
            0x86 => binop(&mut stack, i64::ishl)?,
            0x87 => binop(&mut stack, i64::ishr_s)?,
            0x88 => binop(&mut stack, i64::ishr_u)?,
            0x89 => binop(&mut stack, i64::irotl)?,
            0x8A => binop(&mut stack, i64::irotr)?,

            // f32 arithmetic
            0x8B => unop(&mut stack, f32::abs)?,
            0x8C => unop(&mut stack, |v: f32| -v)?,
            0x8D => unop(&mut stack, f32::ceil)?,
            0x8E => unop(&mut stack, f32::floor)?,
            0x8F => unop(&mut stack, f32::trunc)?,
            0x90 => unop(&mut stack, f32::fnearest)?,
            0x91 => unop(&mut stack, f32::sqrt)?,
            0x92 => binop(&mut stack, |a: f32, b| a + b)?,
            0x93 => binop(&mut stack, |a: f32, b| a - b)?,
            0x94 => binop(&mut stack, |a: f32, b| a * b)?,
            0x95 => binop(&mut stack, |a: f32, b| a / b)?,
            0x96 => binop(&mut stack, f32::fmin)?,
            0x97 => binop(&mut stack, f32::fmax)?,
            0x98 => binop(&mut stack, f32::copysign)?,

            // f64 arithmetic
            0x99 => unop(&mut stack, f64::abs)?,
            0x9A => unop(&mut stack, |v: f64| -v)?,
            0x9B => unop(&mut stack, f64::ceil)?,
            0x9C => unop(&mut stack, f64::floor)?,
            0x9D => unop(&mut stack, f64::trunc)?,
            0x9E => unop(&mut stack, f64::fnearest)?,
            0x9F => unop(&mut stack, f64::sqrt)?,
            0xA0 => binop(&mut stack, |a: f64, b| a + b)?,
            0xA1 => binop(&mut stack, |a: f64, b| a - b)?,
            0xA2 => binop(&mut stack, |a: f64, b| a * b)?,
            0xA3 => binop(&mut stack, |a: f64, b| a / b)?,
            0xA4 => binop(&mut stack, f64::fmin)?,
            0xA5 => binop(&mut stack, f64::fmax)?,
            0xA6 => binop(&mut stack, f64::copysign)?,

            // conversions
            0xA7 => cvtop(&mut stack, |v: i64| v as i32)?,
            0xA8 => cvtop_partial(&mut stack, trunc_s_f32_i32)?,
            0xA9 => cvtop_partial(&mut stack, |v: f32| trunc_u_f32_i32(v).map(|x| x as i32))?,
            0xAA => cvtop_partial(&mut stack, trunc_s_f64_i32)?,
            0xAB => cvtop_partial(&mut stack, |v: f64| trunc_u_f64_i32(v).map(|x| x as i32))?,
            0xAC => cvtop(&mut stack, |v: i32| i64::from(v))?,
            0xAD => cvtop(&mut stack, |v: i32| i64::from(v as u32))?,
            0xAE => cvtop_partial(&mut stack, trunc_s_f32_i64)?,
            0xAF => cvtop_partial(&mut stack, |v: f32| trunc_u_f32_i64(v).map(|x| x as i64))?,
            0xB0 => cvtop_partial(&mut stack, trunc_s_f64_i64)?,
            0xB1 => cvtop_partial(&mut stack, |v: f64| trunc_u_f64_i64(v).map(|x| x as i64))?,
            0xB2 => cvtop(&mut stack, |v: i32| v as f32)?,
            0xB3 => cvtop(&mut stack, |v: i32| v as u32 as f32)?,
            0xB4 => cvtop(&mut stack, |v: i64| v as f32)?,
            0xB5 => cvtop(&mut stack, |v: i64| v as u64 as f32)?,
            0xB6 => cvtop(&mut stack, |v: f64| v as f32)?,
            0xB7 => cvtop(&mut stack, |v: i32| f64::from(v))?,
            0xB8 => cvtop(&mut stack, |v: i32| f64::from(v as u32))?,
            0xB9 => cvtop(&mut stack, |v: i64| v as f64)?,
            0xBA => cvtop(&mut stack, |v: i64| v as u64 as f64)?,
            0xBB => cvtop(&mut stack, |v: f32| f64::from(v))?,
            0xBC => cvtop(&mut stack, |v: f32| v.to_bits() as i32)?,
            0xBD => cvtop(&mut stack, |v: f64| v.to_bits() as i64)?,
            0xBE => cvtop(&mut stack, |v: i32| f32::from_bits(v as u32))?,
            0xBF => cvtop(&mut stack, |v: i64| f64::from_bits(v as u64))?,

            // sign extensions
            0xC0 => unop(&mut stack, |v: i32| v as i8 as i32)?,
            0xC1 => unop(&mut stack, |v: i32| v as i16 as i32)?,
            0xC2 => unop(&mut stack, |v: i64| v as i8 as i64)?,
            0xC3 => unop(&mut stack, |v: i64| v as i16 as i64)?,
            0xC4 => unop(&mut stack, |v: i64| v as i32 as i64)?,

            0xD0 => {
                let heap_type = reader.read_u8()?;
                let val = match heap_type {
                    0x70 => Val::FuncRef(None),
                    0x6F => Val::ExternRef(None),
                    _ => return Err(Trap::new("Unsupported heap type for ref.null")),
                };
                stack.push(val, ValOrigin::Default);
            }
            0xD1 => {
                let entry = stack.pop_any_ref_entry()?;
                stack.push(Val::I32(entry.val.is_null_ref() as i32), entry.origin);
            }
            0xD2 => {
                let func_index = reader.read_var_u32()?;
                if func_index as usize >= store.funcs.len() {
                    return Err(Trap::new("ref.func function index out of bounds"));
                }
                stack.push(Val::FuncRef(Some(func_index)), ValOrigin::Default);
            }

            0xFC => run_prefixed(store, &mut stack, &mut reader)?,

            _ => {
                return Err(Trap::new(format!(
                    "Unsupported opcode encountered: 0x{opcode:02X}"
                )))
            }
        }
    }
}

/// The `0xFC` sub-dispatch: saturating truncations, bulk memory, and
/// the table operations.
fn run_prefixed(
    store: &mut Store,
    stack: &mut OperandStack,
    reader: &mut Reader<'_>,
) -> EResult<()> {
    let sub = reader.read_var_u32()?;
    match sub {
        // Rust saturating float-to-int casts implement trunc_sat
        // exactly: NaN to zero, out-of-range to the bounds.
        0x00 => cvtop(stack, |v: f32| v as i32)?,
        0x01 => cvtop(stack, |v: f32| v as u32 as i32)?,
        0x02 => cvtop(stack, |v: f64| v as i32)?,
        0x03 => cvtop(stack, |v: f64| v as u32 as i32)?,
        0x04 => cvtop(stack, |v: f32| v as i64)?,
        0x05 => cvtop(stack, |v: f32| v as u64 as i64)?,
        0x06 => cvtop(stack, |v: f64| v as i64)?,
        0x07 => cvtop(stack, |v: f64| v as u64 as i64)?,

        0x08 => {
            let data_index = reader.read_var_u32()? as usize;
            let memory_index = reader.read_var_u32()? as usize;
            if memory_index >= store.mems.len() {
                return Err(Trap::new("memory.init memory index out of bounds"));
            }
            if data_index >= store.datas.len() {
                return Err(Trap::new("memory.init data index out of bounds"));
            }
            let size = require_non_negative(stack.pop_i32()?, "memory.init size")? as u64;
            let src = require_non_negative(stack.pop_i32()?, "memory.init source offset")? as u64;
            let dest = require_non_negative(stack.pop_i32()?, "memory.init destination")? as u64;
            let Store { datas, mems, .. } = store;
            let segment = &datas[data_index];
            if segment.dropped {
                return Err(Trap::new("memory.init on dropped data segment"));
            }
            if src + size > segment.bytes.len() as u64 {
                return Err(Trap::new("memory.init source out of bounds"));
            }
            let mem = &mut mems[memory_index];
            if dest + size > mem.data.len() as u64 {
                return Err(Trap::new("memory.init destination out of bounds"));
            }
            if size > 0 {
                mem.data[dest as usize..(dest + size) as usize]
                    .copy_from_slice(&segment.bytes[src as usize..(src + size) as usize]);
            }
        }
        0x09 => {
            let data_index = reader.read_var_u32()? as usize;
            match store.datas.get_mut(data_index) {
                Some(segment) => segment.dropped = true,
                None => return Err(Trap::new("data.drop index out of bounds")),
            }
        }
        0x0A => {
            let dest_memory = reader.read_var_u32()? as usize;
            let src_memory = reader.read_var_u32()? as usize;
            if dest_memory >= store.mems.len() || src_memory >= store.mems.len() {
                return Err(Trap::new("memory.copy memory index out of bounds"));
            }
            let size = require_non_negative(stack.pop_i32()?, "memory.copy size")? as u64;
            let src = require_non_negative(stack.pop_i32()?, "memory.copy source")? as u64;
            let dest = require_non_negative(stack.pop_i32()?, "memory.copy destination")? as u64;
            if src + size > store.mems[src_memory].data.len() as u64
                || dest + size > store.mems[dest_memory].data.len() as u64
            {
                return Err(Trap::new("memory.copy out of bounds"));
            }
            if size > 0 {
                if dest_memory == src_memory {
                    store.mems[dest_memory]
                        .data
                        .copy_within(src as usize..(src + size) as usize, dest as usize);
                } else {
                    let chunk =
                        store.mems[src_memory].data[src as usize..(src + size) as usize].to_vec();
                    store.mems[dest_memory].data[dest as usize..(dest + size) as usize]
                        .copy_from_slice(&chunk);
                }
            }
        }
        0x0B => {
            let memory_index = reader.read_var_u32()? as usize;
            if memory_index >= store.mems.len() {
                return Err(Trap::new("memory.fill memory index out of bounds"));
            }
            let size = require_non_negative(stack.pop_i32()?, "memory.fill size")? as u64;
            let value = stack.pop_i32()?;
            let dest = require_non_negative(stack.pop_i32()?, "memory.fill destination")? as u64;
            let mem = &mut store.mems[memory_index];
            if dest + size > mem.data.len() as u64 {
                return Err(Trap::new("memory.fill out of bounds"));
            }
            mem.data[dest as usize..(dest + size) as usize].fill(value as u8);
        }

        0x0C => return Err(Trap::new("table.init is not supported")),
        0x0D => return Err(Trap::new("elem.drop is not supported")),

        0x0E => {
            let dest_table = reader.read_var_u32()? as usize;
            let src_table = reader.read_var_u32()? as usize;
            if dest_table >= store.tables.len() || src_table >= store.tables.len() {
                return Err(Trap::new("table.copy table index out of bounds"));
            }
            let count = require_non_negative(stack.pop_i32()?, "table.copy count")? as u64;
            let src = require_non_negative(stack.pop_i32()?, "table.copy source offset")? as u64;
            let dest =
                require_non_negative(stack.pop_i32()?, "table.copy destination offset")? as u64;
            if store.tables[dest_table].valtype != store.tables[src_table].valtype {
                return Err(Trap::new("table.copy type mismatch"));
            }
            if src + count > store.tables[src_table].elements.len() as u64
                || dest + count > store.tables[dest_table].elements.len() as u64
            {
                return Err(Trap::new("table.copy out of bounds"));
            }
            if count > 0 {
                // a scratch copy keeps the overlapping same-table case correct
                let chunk = store.tables[src_table].elements
                    [src as usize..(src + count) as usize]
                    .to_vec();
                store.tables[dest_table].elements[dest as usize..(dest + count) as usize]
                    .copy_from_slice(&chunk);
            }
        }
        0x0F => {
            let table_index = reader.read_var_u32()? as usize;
            if table_index >= store.tables.len() {
                return Err(Trap::new("table.grow table index out of bounds"));
            }
            let delta = require_non_negative(stack.pop_i32()?, "table.grow delta")?;
            let value = stack.pop_ref(store.tables[table_index].valtype)?;
            let table = &mut store.tables[table_index];
            let previous = table.elements.len() as u32;
            let new_size = u64::from(previous) + u64::from(delta);
            let out_of_range = new_size > u64::from(u32::MAX)
                || table
                    .type_
                    .limits
                    .max
                    .is_some_and(|max| new_size > u64::from(max));
            let result = if out_of_range {
                -1
            } else {
                table.elements.resize(new_size as usize, value);
                previous as i32
            };
            stack.push(Val::I32(result), ValOrigin::Default);
        }
        0x10 => {
            let table_index = reader.read_var_u32()? as usize;
            if table_index >= store.tables.len() {
                return Err(Trap::new("table.size table index out of bounds"));
            }
            let size = store.tables[table_index].elements.len() as i32;
            stack.push(Val::I32(size), ValOrigin::LoadResult);
        }
        0x11 => {
            let table_index = reader.read_var_u32()? as usize;
            if table_index >= store.tables.len() {
                return Err(Trap::new("table.fill table index out of bounds"));
            }
            let count = require_non_negative(stack.pop_i32()?, "table.fill count")? as u64;
            let value = stack.pop_ref(store.tables[table_index].valtype)?;
            let offset = require_non_negative(stack.pop_i32()?, "table.fill offset")? as u64;
            let table = &mut store.tables[table_index];
            if offset + count > table.elements.len() as u64 {
                return Err(Trap::new("table.fill out of bounds"));
            }
            table.elements[offset as usize..(offset + count) as usize].fill(value);
        }

        _ => {
            return Err(Trap::new(format!(
                "Unsupported 0xFC prefixed opcode: {sub}"
            )))
        }
    }
    Ok(())
}

/// Branches `depth` frames up: pops the target's result arity, truncates
/// both stacks to the target, re-pushes. True means the target was the
/// Function frame and the body is done.
fn branch(
    depth: u32,
    reader: &mut Reader<'_>,
    stack: &mut OperandStack,
    frames: &mut Vec<ControlFrame>,
) -> EResult<bool> {
    if depth as usize >= frames.len() {
        return Err(Trap::new("Branch depth exceeds control stack"));
    }
    let target_index = frames.len() - 1 - depth as usize;
    let target = frames[target_index].clone();
    let vals = pop_results(stack, &target.results)?;
    frames.truncate(target_index + 1);
    stack.resize(target.stack_height);
    for entry in &vals {
        stack.push_entry(*entry);
    }
    if target.kind == FrameKind::Loop {
        reader.set_offset(target.start_pc)?;
        return Ok(false);
    }
    frames.truncate(target_index);
    reader.set_offset(target.end_next_pc)?;
    Ok(target.kind == FrameKind::Function)
}

/// Pops one entry per declared result, last result on top, preserving
/// origin tags.
fn pop_results(stack: &mut OperandStack, results: &[ValType]) -> EResult<Vec<StackVal>> {
    let mut out = vec![StackVal::default(); results.len()];
    for slot in out.iter_mut().rev() {
        *slot = stack.pop_entry()?;
    }
    Ok(out)
}

/// Pops the function's results off the stack after a branch to the
/// Function frame.
fn finish(stack: &mut OperandStack, results: &[ValType]) -> EResult<Vec<Val>> {
    Ok(pop_results(stack, results)?.into_iter().map(|e| e.val).collect())
}

/// Pops `params` arguments, last parameter on top.
fn pop_call_args(stack: &mut OperandStack, params: usize) -> EResult<Vec<Val>> {
    let mut args = vec![Val::I32(0); params];
    for slot in args.iter_mut().rev() {
        *slot = stack.pop_val()?;
    }
    Ok(args)
}

fn require_non_negative(value: i32, what: &str) -> EResult<u32> {
    if value < 0 {
        return Err(Trap::new(format!("{what} must be non-negative")));
    }
    Ok(value as u32)
}

fn checked_address(base: u32, memarg: &MemArg, width: usize, mem: &MemInst) -> EResult<usize> {
    let address = u64::from(base) + u64::from(memarg.offset);
    if address + width as u64 > mem.data.len() as u64 {
        return Err(Trap::new("Memory access out of bounds"));
    }
    Ok(address as usize)
}

fn loadop<T: ValCast, M: MemOp<T>>(
    store: &mut Store,
    stack: &mut OperandStack,
    reader: &mut Reader<'_>,
) -> EResult<()> {
    let memarg = read_memarg(reader)?;
    let address = stack.pop_i32()?;
    let mem = store.mem(0)?;
    let ea = checked_address(address as u32, &memarg, M::SIZE, mem)?;
    let raw = M::from_mem(&mem.data[ea..ea + M::SIZE]);
    stack.push(M::extend(raw).to_val(), ValOrigin::LoadResult);
    Ok(())
}

fn storeop<T: ValCast, M: MemOp<T>>(
    store: &mut Store,
    stack: &mut OperandStack,
    reader: &mut Reader<'_>,
) -> EResult<()> {
    let memarg = read_memarg(reader)?;
    let (value, address) = if stack.store_swaps_operands() {
        let address = stack.pop_i32()? as u32;
        let value = T::from_val(stack.pop_val()?)?;
        (value, address)
    } else {
        let value = T::from_val(stack.pop_val()?)?;
        let address = stack.pop_i32()? as u32;
        (value, address)
    };
    let mem = store.mem_mut(0)?;
    let ea = checked_address(address, &memarg, M::SIZE, mem)?;
    M::to_mem(&mut mem.data[ea..ea + M::SIZE], M::wrap(value));
    Ok(())
}

fn unop<T: ValCast>(stack: &mut OperandStack, f: impl FnOnce(T) -> T) -> EResult<()> {
    let c = T::from_val(stack.pop_val()?)?;
    stack.push(f(c).to_val(), ValOrigin::Default);
    Ok(())
}

fn binop<T: ValCast>(stack: &mut OperandStack, f: impl FnOnce(T, T) -> T) -> EResult<()> {
    let c2 = T::from_val(stack.pop_val()?)?;
    let c1 = T::from_val(stack.pop_val()?)?;
    stack.push(f(c1, c2).to_val(), ValOrigin::Default);
    Ok(())
}

fn binop_partial<T: ValCast>(
    stack: &mut OperandStack,
    f: impl FnOnce(T, T) -> EResult<T>,
) -> EResult<()> {
    let c2 = T::from_val(stack.pop_val()?)?;
    let c1 = T::from_val(stack.pop_val()?)?;
    stack.push(f(c1, c2)?.to_val(), ValOrigin::Default);
    Ok(())
}

fn testop<T: ValCast>(stack: &mut OperandStack, f: impl FnOnce(T) -> bool) -> EResult<()> {
    let c = T::from_val(stack.pop_val()?)?;
    stack.push(Val::I32(f(c) as i32), ValOrigin::Default);
    Ok(())
}

fn relop<T: ValCast>(stack: &mut OperandStack, f: impl FnOnce(T, T) -> bool) -> EResult<()> {
    let c2 = T::from_val(stack.pop_val()?)?;
    let c1 = T::from_val(stack.pop_val()?)?;
    stack.push(Val::I32(f(c1, c2) as i32), ValOrigin::Default);
    Ok(())
}

fn cvtop<T: ValCast, U: ValCast>(stack: &mut OperandStack, f: impl FnOnce(T) -> U) -> EResult<()> {
    let c = T::from_val(stack.pop_val()?)?;
    stack.push(f(c).to_val(), ValOrigin::Default);
    Ok(())
}

fn cvtop_partial<T: ValCast, U: ValCast>(
    stack: &mut OperandStack,
    f: impl FnOnce(T) -> EResult<U>,
) -> EResult<()> {
    let c = T::from_val(stack.pop_val()?)?;
    stack.push(f(c)?.to_val(), ValOrigin::Default);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_body(body: Vec<u8>, results: Vec<ValType>) -> Store {
        let mut module = Module::default();
        module.types.push(FuncType { params: vec![], results: results.clone() });
        module.funcs.push(0);
        module.codes.push(Code { locals: vec![], body });
        let mut store = Store::new(module);
        store.funcs.push(FuncInst::Local {
            type_: FuncType { params: vec![], results },
            code: 0,
        });
        store
    }

    fn trap_of(body: Vec<u8>) -> String {
        let mut store = store_with_body(body, vec![]);
        invoke(&mut store, 0, &[]).unwrap_err().message
    }

    #[test]
    fn unknown_opcodes_trap() {
        assert!(trap_of(vec![0xFE, 0x0B]).contains("Unsupported opcode"));
        assert!(trap_of(vec![0xFC, 0x20, 0x0B]).contains("Unsupported 0xFC"));
    }

    #[test]
    fn stack_underflow_traps() {
        // i32.add on an empty stack
        assert_eq!(trap_of(vec![0x6A, 0x0B]), "Operand stack underflow");
    }

    #[test]
    fn operand_type_mismatch_traps() {
        // i64.const 1, i32.const 1, i32.add
        assert_eq!(
            trap_of(vec![0x42, 0x01, 0x41, 0x01, 0x6A, 0x0B]),
            "Expected i32 on stack"
        );
    }

    #[test]
    fn branch_past_the_control_stack_traps() {
        assert_eq!(
            trap_of(vec![0x0C, 0x05, 0x0B]),
            "Branch depth exceeds control stack"
        );
    }

    #[test]
    fn body_without_end_traps() {
        assert_eq!(
            trap_of(vec![0x01]),
            "Reached end of code without function end"
        );
    }

    #[test]
    fn argument_count_is_checked() {
        let mut store = store_with_body(vec![0x0B], vec![]);
        let err = invoke(&mut store, 0, &[Val::I32(1)]).unwrap_err();
        assert_eq!(err.message, "Incorrect number of arguments");
        let err = invoke(&mut store, 9, &[]).unwrap_err();
        assert_eq!(err.message, "Function index out of range");
    }

    #[test]
    fn results_come_back_in_declared_order() {
        // i32.const 1, i32.const 2, end
        let mut store = store_with_body(
            vec![0x41, 0x01, 0x41, 0x02, 0x0B],
            vec![ValType::I32, ValType::I32],
        );
        let values = invoke(&mut store, 0, &[]).unwrap();
        assert_eq!(values, vec![Val::I32(1), Val::I32(2)]);
    }
}
