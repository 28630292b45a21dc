use super::*;
use quickcheck_macros::quickcheck;
use std::fmt::Debug;

enum CheckRes<T> {
    Failed,
    OkWith(T),
}
use self::CheckRes::*;

fn check<'a, T, F>(parse: F, input: &'a [u8], res: CheckRes<T>)
where
    T: Debug + PartialEq,
    F: Fn(Inp<'a>) -> PResult<'a, T>,
{
    let mut err = None;
    match parse(input) {
        Ok((&[], is)) => {
            if let OkWith(should) = res {
                if is != should {
                    err = Some(format!("should have parsed with {should:?}, but is {is:?}"));
                }
            } else {
                err = Some(format!("should have failed, but parsed with {is:?}"));
            }
        }
        Ok((x, is)) => {
            err = Some(format!(
                "accepted without parsing all input; remaining {x:?}, result {is:?}"
            ));
        }
        Err(x) => {
            if let OkWith(should) = res {
                err = Some(format!("should have parsed with {should:?}, but failed with {x:?}"));
            }
        }
    }
    if let Some(err) = err {
        panic!("\n\nERROR: {}\nInput:\n{:?}\n\n", err, input);
    }
}

fn check_u_n<F>(parse: F, bits: u32)
where
    F: Fn(Inp<'_>) -> PResult<'_, u64>,
{
    check(&parse, &[0x00], OkWith(0x00));
    check(&parse, &[0x7f], OkWith(0x7f));
    check(&parse, &[0xff], Failed);

    check(&parse, &[0xff, 0x00], OkWith(0x7f));
    check(&parse, &[0xff, 0x01], OkWith(0xff));
    check(&parse, &[0xff, 0x80, 0x00], OkWith(0x7f));
    check(&parse, &[0xff, 0x80, 0x80, 0x00], OkWith(0x7f));
    check(&parse, &[0xff, 0x80, 0x80, 0x80, 0x00], OkWith(0x7f));
    if bits == 32 {
        check(&parse, &[0xff, 0x80, 0x80, 0x80, 0x80, 0x00], Failed);
    } else {
        check(&parse, &[0xff, 0x80, 0x80, 0x80, 0x80, 0x00], OkWith(0x7f));
        check(
            &parse,
            &[0xff, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00],
            OkWith(0x7f),
        );
        check(
            &parse,
            &[0xff, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00],
            Failed,
        );
    }

    check(&parse, &[0xff, 0xff, 0xff, 0x7f], OkWith(0b1111111_1111111_1111111_1111111));
    check(
        &parse,
        &[0b1_0011111, 0b1_0001111, 0b1_0000111, 0b0_0000011],
        OkWith(0b__0000011______0000111______0001111______0011111),
    );
}

#[test]
fn test_parse_u32() {
    check_u_n(|inp| parse_u32(inp).map(|(i, x)| (i, u64::from(x))), 32);
}

#[test]
fn test_parse_u64() {
    check_u_n(parse_u64, 64);
}

fn check_s_n<F>(parse: F, bits: u32)
where
    F: Fn(Inp<'_>) -> PResult<'_, i64>,
{
    check(&parse, &[0x00], OkWith(0x00));
    check(&parse, &[0x3f], OkWith(0x3f));
    check(&parse, &[0x7f], OkWith(-0x01));
    check(&parse, &[0xff], Failed);

    check(&parse, &[0xff, 0x00], OkWith(0x7f));
    check(&parse, &[0xff, 0x01], OkWith(0xff));
    check(&parse, &[0xff, 0x80, 0x00], OkWith(0x7f));
    check(&parse, &[0xff, 0x80, 0x80, 0x00], OkWith(0x7f));
    check(&parse, &[0xff, 0x80, 0x80, 0x80, 0x00], OkWith(0x7f));

    check(&parse, &[0x7f], OkWith(-1));
    check(&parse, &[0xff, 0x7f], OkWith(-1));
    check(&parse, &[0xff, 0xff, 0x7f], OkWith(-1));
    check(&parse, &[0xff, 0xff, 0xff, 0x7f], OkWith(-1));
    check(&parse, &[0xff, 0xff, 0xff, 0xff, 0x7f], OkWith(-1));

    if bits == 32 {
        check(&parse, &[0xff, 0x80, 0x80, 0x80, 0x80, 0x00], Failed);
    } else {
        check(&parse, &[0xff, 0x80, 0x80, 0x80, 0x80, 0x00], OkWith(0x7f));
        check(
            &parse,
            &[0xff, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00],
            OkWith(0x7f),
        );
        check(
            &parse,
            &[0xff, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00],
            Failed,
        );
    }

    check(
        &parse,
        &[0b1_0011111, 0b1_0001111, 0b1_0000111, 0b0_0000011],
        OkWith(0b__0000011______0000111______0001111______0011111),
    );
}

#[test]
fn test_parse_s32() {
    check_s_n(|inp| parse_s32(inp).map(|(i, x)| (i, i64::from(x))), 32);
}

#[test]
fn test_parse_s64() {
    check_s_n(parse_s64, 64);
}

fn encode_unsigned(mut v: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            return out;
        }
    }
}

fn encode_signed(mut v: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        let sign_clear = byte & 0x40 == 0;
        if (v == 0 && sign_clear) || (v == -1 && !sign_clear) {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

#[quickcheck]
fn leb_u32_roundtrip(x: u32) -> bool {
    parse_u32(&encode_unsigned(u64::from(x))) == Ok((&[][..], x))
}

#[quickcheck]
fn leb_u64_roundtrip(x: u64) -> bool {
    parse_u64(&encode_unsigned(x)) == Ok((&[][..], x))
}

#[quickcheck]
fn leb_s32_roundtrip(x: i32) -> bool {
    parse_s32(&encode_signed(i64::from(x))) == Ok((&[][..], x))
}

#[quickcheck]
fn leb_s64_roundtrip(x: i64) -> bool {
    parse_s64(&encode_signed(x)) == Ok((&[][..], x))
}

#[test]
fn test_parse_name() {
    let s = "hello wörldß";

    check(&parse_name, &{
        let mut v = vec![s.len() as u8];
        v.extend(s.bytes());
        v
    }, OkWith(s.to_owned()));

    check(&parse_name, &{
        let mut v = vec![s.len() as u8 - 1];
        v.extend(s.bytes());
        v
    }, Failed);

    check(&parse_name, &{
        let mut v = vec![s.len() as u8 + 1];
        v.extend(s.bytes());
        v
    }, Failed);

    check(&parse_name, &[5, 0xff, 0xff, 0xff, 0xff, 0xff], Failed);
}

#[test]
fn test_parse_valtype() {
    check(&parse_valtype, &[0x7f], OkWith(ValType::I32));
    check(&parse_valtype, &[0x7e], OkWith(ValType::I64));
    check(&parse_valtype, &[0x7d], OkWith(ValType::F32));
    check(&parse_valtype, &[0x7c], OkWith(ValType::F64));
    check(&parse_valtype, &[0x70], OkWith(ValType::FuncRef));
    check(&parse_valtype, &[0x6f], OkWith(ValType::ExternRef));
    check(&parse_valtype, &[0x7b], Failed);
}

#[test]
fn test_parse_functype() {
    check(&parse_functype, &[0x60, 1, 0x7f, 2, 0x7e, 0x7c], OkWith(FuncType {
        params: vec![ValType::I32],
        results: vec![ValType::I64, ValType::F64],
    }));
    check(&parse_functype, &[0x61, 0, 0], Failed);
}

#[test]
fn test_parse_limits() {
    check(&parse_limits, &[0x00, 0x00], OkWith(Limits { min: 0x00, max: None }));
    check(&parse_limits, &[0x00, 0xff, 0x01], OkWith(Limits { min: 0xff, max: None }));
    check(&parse_limits, &[0x01, 0x00, 0x00], OkWith(Limits { min: 0x00, max: Some(0x00) }));
    check(
        &parse_limits,
        &[0x01, 0xff, 0x01, 0xff, 0x01],
        OkWith(Limits { min: 0xff, max: Some(0xff) }),
    );
    check(&parse_limits, &[0x02, 0x00], Failed);
}

#[test]
fn test_parse_constexpr() {
    check(&parse_constexpr, &[0x41, 0x2A, 0x0B], OkWith(ConstExpr::I32Const(42)));
    check(&parse_constexpr, &[0x41, 0x7F, 0x0B], OkWith(ConstExpr::I32Const(-1)));
    check(&parse_constexpr, &[0x42, 0x2A, 0x0B], OkWith(ConstExpr::I64Const(42)));
    check(&parse_constexpr, &[0x23, 0x03, 0x0B], OkWith(ConstExpr::GlobalGet(3)));
    check(&parse_constexpr, &[0xD0, 0x70, 0x0B], OkWith(ConstExpr::RefNull(RefType::FuncRef)));
    check(&parse_constexpr, &[0xD0, 0x6F, 0x0B], OkWith(ConstExpr::RefNull(RefType::ExternRef)));
    check(&parse_constexpr, &[0xD2, 0x01, 0x0B], OkWith(ConstExpr::RefFunc(1)));

    let bits = 1.5f64.to_bits().to_le_bytes();
    let mut f64_const = vec![0x44];
    f64_const.extend_from_slice(&bits);
    f64_const.push(0x0B);
    check(&parse_constexpr, &f64_const, OkWith(ConstExpr::F64Const(1.5)));

    // missing end opcode
    check(&parse_constexpr, &[0x41, 0x2A], Failed);
    // i32.add is not a constant instruction
    check(&parse_constexpr, &[0x6A, 0x0B], Failed);
}

#[test]
fn test_parse_code_keeps_raw_body() {
    check(&parse_code, &[
        4,    // 4 byte entry
        1,    // one compressed local run
        2,    // 2x f32
        0x7D,
        0x0B, // empty expression
    ], OkWith(Code {
        locals: vec![LocalDecl { count: 2, ty: ValType::F32 }],
        body: vec![0x0B],
    }));

    check(&parse_code, &[
        8,
        2,    // two compressed local runs
        2,
        0x7D,
        1,
        0x7F,
        0x00, // unreachable
        0x47, // i32.ne
        0x0B,
    ], OkWith(Code {
        locals: vec![
            LocalDecl { count: 2, ty: ValType::F32 },
            LocalDecl { count: 1, ty: ValType::I32 },
        ],
        body: vec![0x00, 0x47, 0x0B],
    }));

    // entry runs past the section payload
    check(&parse_code, &[9, 1, 2, 0x7D, 0x0B], Failed);
}

#[test]
fn test_parse_data_modes() {
    check(&parse_data, &[0x00, 0x41, 0x10, 0x0B, 2, 0xAA, 0xBB], OkWith(Data {
        mem: 0,
        passive: false,
        offset: Some(ConstExpr::I32Const(16)),
        init: vec![0xAA, 0xBB],
    }));

    check(&parse_data, &[0x01, 3, b'a', b'b', b'c'], OkWith(Data {
        mem: 0,
        passive: true,
        offset: None,
        init: vec![b'a', b'b', b'c'],
    }));

    check(&parse_data, &[0x02, 0x01, 0x41, 0x00, 0x0B, 1, 0xCC], OkWith(Data {
        mem: 1,
        passive: false,
        offset: Some(ConstExpr::I32Const(0)),
        init: vec![0xCC],
    }));

    // legacy: discriminator is the memory index itself
    check(&parse_data, &[0x03, 0x41, 0x00, 0x0B, 1, 0xDD], OkWith(Data {
        mem: 3,
        passive: false,
        offset: Some(ConstExpr::I32Const(0)),
        init: vec![0xDD],
    }));
}

#[test]
fn test_parse_elem_entries() {
    // active, table 0, one function index
    check(&parse_elemsec, &[1, 0x00, 0x41, 0x00, 0x0B, 1, 0x02], OkWith(vec![Elem {
        table: 0,
        offset: ConstExpr::I32Const(0),
        init: vec![2],
    }]));

    // explicit elem_kind byte before the vector
    check(&parse_elemsec, &[1, 0x02, 0x00, 0x41, 0x01, 0x0B, 0x00, 2, 0x05, 0x06], OkWith(vec![
        Elem { table: 0, offset: ConstExpr::I32Const(1), init: vec![5, 6] },
    ]));

    // passive entries are decoded and discarded
    check(&parse_elemsec, &[1, 0x01, 0x00, 2, 0x01, 0x02], OkWith(vec![]));

    // declarative entries are decoded and discarded
    check(&parse_elemsec, &[1, 0x03, 0x00, 1, 0x01], OkWith(vec![]));

    // expression form is rejected
    check(&parse_elemsec, &[1, 0x04, 0x41, 0x00, 0x0B, 0x00], Failed);
}

fn minimal_module() -> Vec<u8> {
    let mut bytes = b"\0asm\x01\x00\x00\x00".to_vec();
    // type section: () -> (i32)
    bytes.extend_from_slice(&[0x01, 0x05, 0x01, 0x60, 0x00, 0x01, 0x7F]);
    // function section: one function of type 0
    bytes.extend_from_slice(&[0x03, 0x02, 0x01, 0x00]);
    // export section: "answer" -> func 0
    bytes.extend_from_slice(&[0x07, 0x0A, 0x01, 0x06]);
    bytes.extend_from_slice(b"answer");
    bytes.extend_from_slice(&[0x00, 0x00]);
    // code section: (i32.const 42) end
    bytes.extend_from_slice(&[0x0A, 0x06, 0x01, 0x04, 0x00, 0x41, 0x2A, 0x0B]);
    bytes
}

#[test]
fn test_parse_minimal_module() {
    let module = parse_binary_format(&minimal_module()).unwrap();
    assert_eq!(module.types, vec![FuncType { params: vec![], results: vec![ValType::I32] }]);
    assert_eq!(module.funcs, vec![0]);
    assert_eq!(module.exports, vec![Export {
        name: "answer".to_owned(),
        desc: ExportDesc::Func(0),
    }]);
    assert_eq!(module.codes, vec![Code { locals: vec![], body: vec![0x41, 0x2A, 0x0B] }]);
}

#[test]
fn test_parse_module_rejects_bad_header() {
    assert!(matches!(
        parse_binary_format(b"\0asl\x01\x00\x00\x00"),
        Err(ParseError::Malformed { offset: 0, .. })
    ));
    assert!(matches!(
        parse_binary_format(b"\0asm\x02\x00\x00\x00"),
        Err(ParseError::Malformed { offset: 4, .. })
    ));
    assert!(parse_binary_format(b"\0as").is_err());
}

#[test]
fn test_parse_module_rejects_code_count_mismatch() {
    let mut bytes = b"\0asm\x01\x00\x00\x00".to_vec();
    bytes.extend_from_slice(&[0x01, 0x04, 0x01, 0x60, 0x00, 0x00]);
    bytes.extend_from_slice(&[0x03, 0x02, 0x01, 0x00]); // one function
    // no code section
    assert!(matches!(
        parse_binary_format(&bytes),
        Err(ParseError::Malformed { .. })
    ));
}

#[test]
fn test_parse_module_rejects_trailing_garbage() {
    let mut bytes = minimal_module();
    bytes.push(0xFF);
    assert!(parse_binary_format(&bytes).is_err());
}

#[test]
fn test_parse_module_skips_custom_sections() {
    let mut bytes = b"\0asm\x01\x00\x00\x00".to_vec();
    // custom section "note" with two payload bytes, before and after types
    bytes.extend_from_slice(&[0x00, 0x07, 0x04]);
    bytes.extend_from_slice(b"note");
    bytes.extend_from_slice(&[0xAB, 0xCD]);
    bytes.extend_from_slice(&[0x01, 0x04, 0x01, 0x60, 0x00, 0x00]);
    bytes.extend_from_slice(&[0x00, 0x05, 0x04]);
    bytes.extend_from_slice(b"tail");
    let module = parse_binary_format(&bytes).unwrap();
    assert_eq!(module.types.len(), 1);
}

#[test]
fn test_reader_walks_immediates() {
    let bytes = [0x41, 0x85, 0x02, 0x0B];
    let mut reader = Reader::new(&bytes);
    assert_eq!(reader.read_u8(), Ok(0x41));
    assert_eq!(reader.read_var_s32(), Ok(261));
    assert_eq!(reader.offset(), 3);
    assert_eq!(reader.read_u8(), Ok(0x0B));
    assert!(reader.is_at_end());
    assert!(reader.read_u8().is_err());

    reader.set_offset(1).unwrap();
    assert_eq!(reader.read_var_u32(), Ok(261));
    assert!(reader.set_offset(5).is_err());
    assert!(reader.set_offset(4).is_ok());
}
