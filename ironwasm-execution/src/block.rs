//! Instruction immediates and the structured-block pre-scan.
//!
//! The engine interprets raw bodies in place, so entering a `block`,
//! `loop` or `if` needs the matching `end` (and `else`) offsets. The
//! scan here walks the body once, skipping every other opcode together
//! with its immediates.

use ironwasm_binary_format::Reader;
use ironwasm_structure::types::{FuncType, ValType};

use crate::runtime_structure::{EResult, Trap};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemArg {
    pub align: u32,
    pub offset: u32,
}

pub fn read_memarg(reader: &mut Reader<'_>) -> EResult<MemArg> {
    let align = reader.read_var_u32()?;
    let offset = reader.read_var_u32()?;
    Ok(MemArg { align, offset })
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BrTable {
    pub targets: Vec<u32>,
    pub default: u32,
}

pub fn read_br_table(reader: &mut Reader<'_>) -> EResult<BrTable> {
    let target_count = reader.read_var_u32()?;
    let mut targets = Vec::with_capacity(target_count as usize);
    for _ in 0..target_count {
        targets.push(reader.read_var_u32()?);
    }
    let default = reader.read_var_u32()?;
    Ok(BrTable { targets, default })
}

/// Raw blocktype: void, one value type, or a type index.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockType {
    Empty,
    Value(ValType),
    TypeIndex(u32),
}

/// One byte selects the shorthand forms; anything else begins a signed
/// LEB128 type index whose first byte is already consumed.
pub fn read_block_type(reader: &mut Reader<'_>) -> EResult<BlockType> {
    let first = reader.read_u8()?;
    let vt = match first {
        0x40 => return Ok(BlockType::Empty),
        0x7F => ValType::I32,
        0x7E => ValType::I64,
        0x7D => ValType::F32,
        0x7C => ValType::F64,
        _ => {
            let mut index = u32::from(first & 0x7F);
            if first & 0x80 != 0 {
                let mut shift = 7u32;
                loop {
                    let byte = reader.read_u8()?;
                    index |= u32::from(byte & 0x7F) << shift;
                    if byte & 0x80 == 0 {
                        break;
                    }
                    shift += 7;
                    if shift > 32 {
                        return Err(Trap::new("Block type index too large"));
                    }
                }
            }
            return Ok(BlockType::TypeIndex(index));
        }
    };
    Ok(BlockType::Value(vt))
}

fn skip_block_type(reader: &mut Reader<'_>) -> EResult<()> {
    read_block_type(reader).map(|_| ())
}

/// Resolves a blocktype against the module's type section. Parameters
/// are modeled by the operand-stack height at entry, so only the result
/// types are kept.
pub fn block_signature(reader: &mut Reader<'_>, types: &[FuncType]) -> EResult<Vec<ValType>> {
    match read_block_type(reader)? {
        BlockType::Empty => Ok(Vec::new()),
        BlockType::Value(vt) => Ok(vec![vt]),
        BlockType::TypeIndex(index) => types
            .get(index as usize)
            .map(|t| t.results.clone())
            .ok_or_else(|| Trap::new("Block type index out of range")),
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    pub body_start: usize,
    pub end_pc: usize,
    pub end_next_pc: usize,
    pub else_pc: Option<usize>,
    pub else_body_pc: Option<usize>,
}

/// Scans from just past a blocktype to the matching `end`, recording the
/// first `else` seen at depth one. Runs lazily on first entry into a
/// frame.
pub fn analyze_block(code: &[u8], body_start: usize) -> EResult<BlockInfo> {
    let mut reader = Reader::new(code);
    reader.set_offset(body_start)?;
    let mut info = BlockInfo {
        body_start,
        end_pc: 0,
        end_next_pc: 0,
        else_pc: None,
        else_body_pc: None,
    };
    let mut depth = 1u32;
    loop {
        if reader.is_at_end() {
            return Err(Trap::new("Unexpected end of code while analyzing block"));
        }
        let opcode_offset = reader.offset();
        let opcode = reader.read_u8()?;
        match opcode {
            0x02 | 0x03 | 0x04 => {
                skip_block_type(&mut reader)?;
                depth += 1;
            }
            0x05 => {
                if depth == 1 && info.else_pc.is_none() {
                    info.else_pc = Some(opcode_offset);
                    info.else_body_pc = Some(reader.offset());
                }
            }
            0x0B => {
                depth -= 1;
                if depth == 0 {
                    info.end_pc = opcode_offset;
                    info.end_next_pc = reader.offset();
                    return Ok(info);
                }
            }
            _ => skip_immediate(opcode, &mut reader)?,
        }
    }
}

/// Skips the immediates of a non-structured opcode.
fn skip_immediate(opcode: u8, reader: &mut Reader<'_>) -> EResult<()> {
    match opcode {
        // one index immediate
        0x0C | 0x0D | 0x10 | 0x20..=0x26 | 0x3F | 0x40 | 0xD2 => {
            reader.read_var_u32()?;
        }
        0x0E => {
            read_br_table(reader)?;
        }
        // call_indirect: type index then table index
        0x11 => {
            reader.read_var_u32()?;
            reader.read_var_u32()?;
        }
        // loads and stores
        0x28..=0x3E => {
            read_memarg(reader)?;
        }
        0x41 => {
            reader.read_var_s32()?;
        }
        0x42 => {
            reader.read_var_s64()?;
        }
        0x43 => {
            reader.read_f32()?;
        }
        0x44 => {
            reader.read_f64()?;
        }
        // ref.null heap type
        0xD0 => {
            reader.read_u8()?;
        }
        0xFC => {
            let sub = reader.read_var_u32()?;
            match sub {
                // memory.init / memory.copy / table.init / table.copy
                0x08 | 0x0A | 0x0C | 0x0E => {
                    reader.read_var_u32()?;
                    reader.read_var_u32()?;
                }
                // data.drop / memory.fill / elem.drop / table.{grow,size,fill}
                0x09 | 0x0B | 0x0D | 0x0F | 0x10 | 0x11 => {
                    reader.read_var_u32()?;
                }
                // saturating conversions carry no immediates
                _ => {}
            }
        }
        _ => {}
    }
    Ok(())
}
