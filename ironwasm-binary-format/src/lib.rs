//! Decoder for the WebAssembly binary format, version 1.
//!
//! One parser per grammar production; [`parse_binary_format`] is the entry
//! point. Function bodies are captured raw and interpreted in place later,
//! so this crate also exports the offset-addressable [`Reader`] the
//! execution engine uses to walk bytecode. All LEB128 decoding lives here.

use std::fmt;

use nom::bytes::complete::{tag, take};
use nom::combinator::{all_consuming, map, opt};
use nom::error::ErrorKind;
use nom::multi::{count, length_value, many0};
use nom::number::complete::{le_f32, le_f64, u8 as any_byte};
use nom::IResult;

use ironwasm_structure::modules::*;
use ironwasm_structure::types::*;

pub type Inp<'a> = &'a [u8];

/// Decoder-internal error: nom bookkeeping plus a static context string
/// for the checks the grammar alone cannot express.
#[derive(Debug, PartialEq)]
pub struct DecodeError<'a> {
    pub input: Inp<'a>,
    pub kind: ErrorKind,
    pub context: Option<&'static str>,
}

impl<'a> nom::error::ParseError<Inp<'a>> for DecodeError<'a> {
    fn from_error_kind(input: Inp<'a>, kind: ErrorKind) -> Self {
        DecodeError { input, kind, context: None }
    }

    fn append(_input: Inp<'a>, _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

pub type PResult<'a, T> = IResult<Inp<'a>, T, DecodeError<'a>>;

fn fail<'a, T>(input: Inp<'a>, context: &'static str) -> PResult<'a, T> {
    Err(nom::Err::Failure(DecodeError {
        input,
        kind: ErrorKind::Verify,
        context: Some(context),
    }))
}

/// Matches a single known byte.
fn byte<'a>(b: u8) -> impl Fn(Inp<'a>) -> PResult<'a, u8> {
    move |input: Inp<'a>| match input.split_first() {
        Some((&first, rest)) if first == b => Ok((rest, first)),
        _ => Err(nom::Err::Error(DecodeError {
            input,
            kind: ErrorKind::Tag,
            context: None,
        })),
    }
}

// Integers (LEB128 with a configurable bit budget)

pub fn parse_u_n(input: Inp<'_>, bits: u32) -> PResult<'_, u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    let mut rest = input;
    loop {
        let (r, b) = any_byte(rest)?;
        rest = r;
        result |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift >= bits {
            return fail(input, "unsigned LEB128 value overflows its bit budget");
        }
    }
    Ok((rest, result))
}

pub fn parse_s_n(input: Inp<'_>, bits: u32) -> PResult<'_, i64> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    let mut rest = input;
    let mut last;
    loop {
        let (r, b) = any_byte(rest)?;
        rest = r;
        last = b;
        result |= i64::from(b & 0x7F) << shift;
        shift += 7;
        if b & 0x80 == 0 {
            break;
        }
        if shift >= bits {
            return fail(input, "signed LEB128 value overflows its bit budget");
        }
    }
    if shift < bits && last & 0x40 != 0 {
        result |= -1i64 << shift;
    }
    Ok((rest, result))
}

pub fn parse_u32(input: Inp<'_>) -> PResult<'_, u32> {
    map(|i| parse_u_n(i, 32), |x| x as u32)(input)
}

pub fn parse_u64(input: Inp<'_>) -> PResult<'_, u64> {
    parse_u_n(input, 64)
}

pub fn parse_s32(input: Inp<'_>) -> PResult<'_, i32> {
    map(|i| parse_s_n(i, 32), |x| x as i32)(input)
}

pub fn parse_s64(input: Inp<'_>) -> PResult<'_, i64> {
    parse_s_n(input, 64)
}

// Vectors: an u32 count followed by that many elements.

fn parse_vec<'a, T>(
    input: Inp<'a>,
    parse_b: impl FnMut(Inp<'a>) -> PResult<'a, T>,
) -> PResult<'a, Vec<T>> {
    let (input, n) = parse_u32(input)?;
    count(parse_b, n as usize)(input)
}

// Names

fn parse_name(input: Inp<'_>) -> PResult<'_, String> {
    let (rest, n) = parse_u32(input)?;
    let (rest, raw) = take(n as usize)(rest)?;
    match std::str::from_utf8(raw) {
        Ok(s) => Ok((rest, s.to_owned())),
        Err(_) => fail(input, "name is not valid utf-8"),
    }
}

// Value types

fn parse_valtype(input: Inp<'_>) -> PResult<'_, ValType> {
    let (rest, b) = any_byte(input)?;
    let vt = match b {
        0x7F => ValType::I32,
        0x7E => ValType::I64,
        0x7D => ValType::F32,
        0x7C => ValType::F64,
        0x70 => ValType::FuncRef,
        0x6F => ValType::ExternRef,
        _ => return fail(input, "unknown value type"),
    };
    Ok((rest, vt))
}

fn parse_reftype(input: Inp<'_>) -> PResult<'_, RefType> {
    let (rest, b) = any_byte(input)?;
    let rt = match b {
        0x70 => RefType::FuncRef,
        0x6F => RefType::ExternRef,
        _ => return fail(input, "unknown reference type"),
    };
    Ok((rest, rt))
}

// Function types

fn parse_functype(input: Inp<'_>) -> PResult<'_, FuncType> {
    let (rest, form) = any_byte(input)?;
    if form != 0x60 {
        return fail(input, "expected function type form 0x60");
    }
    let (rest, params) = parse_vec(rest, parse_valtype)?;
    let (rest, results) = parse_vec(rest, parse_valtype)?;
    Ok((rest, FuncType { params, results }))
}

// Limits

fn parse_limits(input: Inp<'_>) -> PResult<'_, Limits> {
    let (rest, flags) = any_byte(input)?;
    match flags {
        0x00 => {
            let (rest, min) = parse_u32(rest)?;
            Ok((rest, Limits { min, max: None }))
        }
        0x01 => {
            let (rest, min) = parse_u32(rest)?;
            let (rest, max) = parse_u32(rest)?;
            Ok((rest, Limits { min, max: Some(max) }))
        }
        _ => fail(input, "unknown limits flag"),
    }
}

fn parse_memtype(input: Inp<'_>) -> PResult<'_, MemType> {
    map(parse_limits, |limits| MemType { limits })(input)
}

fn parse_tabletype(input: Inp<'_>) -> PResult<'_, TableType> {
    let (rest, elemtype) = parse_reftype(input)?;
    let (rest, limits) = parse_limits(rest)?;
    Ok((rest, TableType { elemtype, limits }))
}

fn parse_globaltype(input: Inp<'_>) -> PResult<'_, GlobalType> {
    let (rest, valtype) = parse_valtype(input)?;
    let (rest, flag) = any_byte(rest)?;
    let mutability = match flag {
        0x00 => Mut::Const,
        0x01 => Mut::Var,
        _ => return fail(input, "unknown mutability flag"),
    };
    Ok((rest, GlobalType { mutability, valtype }))
}

// Constant expressions: one producing instruction, then `end`.

fn parse_constexpr(input: Inp<'_>) -> PResult<'_, ConstExpr> {
    let (rest, opcode) = any_byte(input)?;
    let (rest, expr) = match opcode {
        0x41 => {
            let (rest, n) = parse_s32(rest)?;
            (rest, ConstExpr::I32Const(n))
        }
        0x42 => {
            let (rest, n) = parse_s64(rest)?;
            (rest, ConstExpr::I64Const(n))
        }
        0x43 => {
            let (rest, z) = le_f32(rest)?;
            (rest, ConstExpr::F32Const(z))
        }
        0x44 => {
            let (rest, z) = le_f64(rest)?;
            (rest, ConstExpr::F64Const(z))
        }
        0x23 => {
            let (rest, x) = parse_u32(rest)?;
            (rest, ConstExpr::GlobalGet(x))
        }
        0xD0 => {
            let (rest, rt) = parse_reftype(rest)?;
            (rest, ConstExpr::RefNull(rt))
        }
        0xD2 => {
            let (rest, x) = parse_u32(rest)?;
            (rest, ConstExpr::RefFunc(x))
        }
        _ => return fail(input, "unsupported constant expression opcode"),
    };
    match byte(0x0B)(rest) {
        Ok((rest, _)) => Ok((rest, expr)),
        Err(_) => fail(rest, "constant expression missing end opcode"),
    }
}

// Sections: a one-byte id, an LEB128 size, and a payload that must lie
// inside the input and be consumed exactly.

fn section<'a, T>(
    id: u8,
    inner: impl FnMut(Inp<'a>) -> PResult<'a, T>,
) -> impl FnMut(Inp<'a>) -> PResult<'a, T> {
    let mut framed = length_value(parse_u32, all_consuming(inner));
    move |input: Inp<'a>| {
        let (input, _) = byte(id)(input)?;
        framed(input)
    }
}

fn opt_section<'a, T: Default>(
    input: Inp<'a>,
    id: u8,
    inner: impl FnMut(Inp<'a>) -> PResult<'a, T>,
) -> PResult<'a, T> {
    map(opt(section(id, inner)), |x| x.unwrap_or_default())(input)
}

// Custom sections carry a name and opaque bytes; they may appear
// anywhere and are skipped.

fn parse_custom(input: Inp<'_>) -> PResult<'_, ()> {
    let (rest, _name) = parse_name(input)?;
    let (rest, _bytes) = take(rest.len())(rest)?;
    Ok((rest, ()))
}

fn parse_customsecs(input: Inp<'_>) -> PResult<'_, ()> {
    let (rest, _) = many0(section(0, parse_custom))(input)?;
    Ok((rest, ()))
}

// Import section

fn parse_import(input: Inp<'_>) -> PResult<'_, Import> {
    let (rest, module) = parse_name(input)?;
    let (rest, name) = parse_name(rest)?;
    let (rest, kind) = any_byte(rest)?;
    let (rest, desc) = match kind {
        0x00 => {
            let (rest, x) = parse_u32(rest)?;
            (rest, ImportDesc::Func(x))
        }
        0x01 => {
            let (rest, tt) = parse_tabletype(rest)?;
            (rest, ImportDesc::Table(tt))
        }
        0x02 => {
            let (rest, mt) = parse_memtype(rest)?;
            (rest, ImportDesc::Mem(mt))
        }
        0x03 => {
            let (rest, gt) = parse_globaltype(rest)?;
            (rest, ImportDesc::Global(gt))
        }
        _ => return fail(input, "unsupported import kind"),
    };
    Ok((rest, Import { module, name, desc }))
}

// Global section

fn parse_global(input: Inp<'_>) -> PResult<'_, Global> {
    let (rest, type_) = parse_globaltype(input)?;
    let (rest, init) = parse_constexpr(rest)?;
    Ok((rest, Global { type_, init }))
}

// Export section

fn parse_export(input: Inp<'_>) -> PResult<'_, Export> {
    let (rest, name) = parse_name(input)?;
    let (rest, kind) = any_byte(rest)?;
    let (rest, index) = parse_u32(rest)?;
    let desc = match kind {
        0x00 => ExportDesc::Func(index),
        0x01 => ExportDesc::Table(index),
        0x02 => ExportDesc::Mem(index),
        0x03 => ExportDesc::Global(index),
        _ => return fail(input, "unsupported export kind"),
    };
    Ok((rest, Export { name, desc }))
}

// Element section. Flags select active/passive/declarative and whether a
// table index is present. Only active funcref segments survive decoding;
// passive and declarative entries are read and discarded, and the
// expression form is rejected outright.

fn parse_elem_entry(input: Inp<'_>) -> PResult<'_, Option<Elem>> {
    let (rest, flags) = parse_u32(input)?;
    if flags & 0x04 != 0 {
        return fail(input, "element segments in expression form are not supported");
    }
    // Bit 0 clear means active; flags of 3 are declarative and, like
    // passive entries, get decoded and thrown away below.
    let is_active = flags & 0x01 == 0;

    if is_active {
        let (rest, table) = if flags & 0x02 != 0 {
            parse_u32(rest)?
        } else {
            (rest, 0)
        };
        let (rest, offset) = parse_constexpr(rest)?;
        let rest = skip_elem_kind(rest)?;
        let (rest, init) = parse_vec(rest, parse_u32)?;
        Ok((rest, Some(Elem { table, offset, init })))
    } else {
        let rest = skip_elem_kind(rest)?;
        let (rest, _init) = parse_vec(rest, parse_u32)?;
        Ok((rest, None))
    }
}

/// An `elem_kind` byte of 0x00 marks a funcref segment. Any other value
/// already belongs to the element count, so the byte is handed back.
fn skip_elem_kind(input: Inp<'_>) -> Result<Inp<'_>, nom::Err<DecodeError<'_>>> {
    match any_byte::<_, DecodeError>(input)? {
        (rest, 0x00) => Ok(rest),
        _ => Ok(input),
    }
}

fn parse_elemsec(input: Inp<'_>) -> PResult<'_, Vec<Elem>> {
    let (mut rest, n) = parse_u32(input)?;
    let mut elems = Vec::new();
    for _ in 0..n {
        let (r, entry) = parse_elem_entry(rest)?;
        rest = r;
        if let Some(elem) = entry {
            elems.push(elem);
        }
    }
    Ok((rest, elems))
}

// Code section: each entry is a sized blob holding run-length local
// declarations followed by the raw body, which is retained verbatim.

fn parse_local_decl(input: Inp<'_>) -> PResult<'_, LocalDecl> {
    let (rest, n) = parse_u32(input)?;
    let (rest, ty) = parse_valtype(rest)?;
    Ok((rest, LocalDecl { count: n, ty }))
}

fn parse_code(input: Inp<'_>) -> PResult<'_, Code> {
    let (rest, size) = parse_u32(input)?;
    let (rest, entry) = take(size as usize)(rest)?;
    let (body, locals) = parse_vec(entry, parse_local_decl)?;
    Ok((rest, Code { locals, body: body.to_vec() }))
}

// Data section: the leading varuint selects the segment mode; values of
// three and above are the legacy encoding where the discriminator is
// itself the memory index.

fn parse_data(input: Inp<'_>) -> PResult<'_, Data> {
    let (rest, disc) = parse_u32(input)?;
    let (rest, mem, passive, offset) = match disc {
        0 => {
            let (rest, offset) = parse_constexpr(rest)?;
            (rest, 0, false, Some(offset))
        }
        1 => (rest, 0, true, None),
        2 => {
            let (rest, mem) = parse_u32(rest)?;
            let (rest, offset) = parse_constexpr(rest)?;
            (rest, mem, false, Some(offset))
        }
        n => {
            let (rest, offset) = parse_constexpr(rest)?;
            (rest, n, false, Some(offset))
        }
    };
    let (rest, n) = parse_u32(rest)?;
    let (rest, raw) = take(n as usize)(rest)?;
    Ok((
        rest,
        Data { mem, passive, offset, init: raw.to_vec() },
    ))
}

// Modules

fn parse_module(input: Inp<'_>) -> PResult<'_, Module> {
    let (i, _) = match tag::<_, _, DecodeError>(&b"\0asm"[..])(input) {
        Ok(x) => x,
        Err(_) => return fail(input, "missing \\0asm magic"),
    };
    let (i, _) = match tag::<_, _, DecodeError>(&[0x01, 0x00, 0x00, 0x00][..])(i) {
        Ok(x) => x,
        Err(_) => return fail(i, "unsupported version"),
    };

    let (i, _) = parse_customsecs(i)?;
    let (i, types) = opt_section(i, 1, |i| parse_vec(i, parse_functype))?;
    let (i, _) = parse_customsecs(i)?;
    let (i, imports) = opt_section(i, 2, |i| parse_vec(i, parse_import))?;
    let (i, _) = parse_customsecs(i)?;
    let (i, funcs) = opt_section(i, 3, |i| parse_vec(i, parse_u32))?;
    let (i, _) = parse_customsecs(i)?;
    let (i, tables) = opt_section(i, 4, |i| parse_vec(i, parse_tabletype))?;
    let (i, _) = parse_customsecs(i)?;
    let (i, mems) = opt_section(i, 5, |i| parse_vec(i, parse_memtype))?;
    let (i, _) = parse_customsecs(i)?;
    let (i, globals) = opt_section(i, 6, |i| parse_vec(i, parse_global))?;
    let (i, _) = parse_customsecs(i)?;
    let (i, exports) = opt_section(i, 7, |i| parse_vec(i, parse_export))?;
    let (i, _) = parse_customsecs(i)?;
    let (i, start) = opt(section(8, parse_u32))(i)?;
    let (i, _) = parse_customsecs(i)?;
    let (i, elems) = opt_section(i, 9, parse_elemsec)?;
    let (i, _) = parse_customsecs(i)?;
    // DataCount is validated by its frame and otherwise ignored.
    let (i, _datacount) = opt(section(12, parse_u32))(i)?;
    let (i, _) = parse_customsecs(i)?;
    let (i, codes) = opt_section(i, 10, |i| parse_vec(i, parse_code))?;
    let (i, _) = parse_customsecs(i)?;
    let (i, data) = opt_section(i, 11, |i| parse_vec(i, parse_data))?;
    let (i, _) = parse_customsecs(i)?;

    if funcs.len() != codes.len() {
        return fail(i, "function and code section lengths disagree");
    }

    Ok((
        i,
        Module {
            types,
            imports,
            funcs,
            tables,
            mems,
            globals,
            exports,
            start,
            elems,
            codes,
            data,
        },
    ))
}

/// Structural decode failure, surfaced from `load`. Never a trap.
#[derive(Debug, PartialEq)]
pub enum ParseError {
    UnexpectedEnd,
    Malformed { offset: usize, what: &'static str },
}

impl ParseError {
    fn from_decode(full: &[u8], e: DecodeError<'_>) -> Self {
        if e.kind == ErrorKind::Eof {
            return ParseError::UnexpectedEnd;
        }
        let offset = (e.input.as_ptr() as usize).saturating_sub(full.as_ptr() as usize);
        ParseError::Malformed {
            offset: offset.min(full.len()),
            what: e.context.unwrap_or("invalid module syntax"),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::UnexpectedEnd => write!(f, "unexpected end of module bytes"),
            ParseError::Malformed { offset, what } => {
                write!(f, "malformed module at byte {offset}: {what}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Decodes a complete binary module. Trailing bytes after the final
/// section are rejected.
pub fn parse_binary_format(bytes: &[u8]) -> Result<Module, ParseError> {
    match all_consuming(parse_module)(bytes) {
        Ok((_, module)) => Ok(module),
        Err(nom::Err::Incomplete(_)) => Err(ParseError::UnexpectedEnd),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
            Err(ParseError::from_decode(bytes, e))
        }
    }
}

/// Failure while reading bytecode through a [`Reader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadError {
    pub offset: usize,
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "truncated or malformed value at bytecode offset {}", self.offset)
    }
}

impl std::error::Error for ReadError {}

/// Offset-addressable cursor over raw bytecode. One per function
/// activation; the block analyzer runs its own. Integer immediates go
/// through the same LEB128 parsers as the section decoder.
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn set_offset(&mut self, offset: usize) -> Result<(), ReadError> {
        if offset > self.data.len() {
            return Err(ReadError { offset });
        }
        self.pos = offset;
        Ok(())
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn apply<T>(&mut self, f: impl FnOnce(Inp<'a>) -> PResult<'a, T>) -> Result<T, ReadError> {
        match f(&self.data[self.pos..]) {
            Ok((rest, v)) => {
                self.pos = self.data.len() - rest.len();
                Ok(v)
            }
            Err(_) => Err(ReadError { offset: self.pos }),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        self.apply(any_byte)
    }

    pub fn read_var_u32(&mut self) -> Result<u32, ReadError> {
        self.apply(parse_u32)
    }

    pub fn read_var_s32(&mut self) -> Result<i32, ReadError> {
        self.apply(parse_s32)
    }

    pub fn read_var_s64(&mut self) -> Result<i64, ReadError> {
        self.apply(parse_s64)
    }

    pub fn read_f32(&mut self) -> Result<f32, ReadError> {
        self.apply(le_f32)
    }

    pub fn read_f64(&mut self) -> Result<f64, ReadError> {
        self.apply(le_f64)
    }
}

#[cfg(test)]
#[path = "tests_binary_format.rs"]
mod tests;
