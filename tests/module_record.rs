//! Checks on the decoded module record itself: section contents land in
//! the right places with the right shapes.

use ironwasm::binary_format::parse_binary_format;
use ironwasm::structure::modules::*;
use ironwasm::structure::types::*;

fn decode(wat_src: &str) -> Module {
    let wasm = wat::parse_str(wat_src).expect("fixture should assemble");
    parse_binary_format(&wasm).expect("fixture should decode")
}

#[test]
fn imports_carry_their_descriptors() {
    let module = decode(
        r#"(module
             (import "env" "f" (func (param i32) (result i64)))
             (import "env" "t" (table 1 8 funcref))
             (import "env" "m" (memory 2))
             (import "env" "g" (global (mut f64))))"#,
    );
    assert_eq!(module.imports.len(), 4);
    assert_eq!(module.imports[0].module, "env");
    assert_eq!(module.imports[0].name, "f");
    assert_eq!(module.imports[0].desc, ImportDesc::Func(0));
    assert_eq!(
        module.types[0],
        FuncType { params: vec![ValType::I32], results: vec![ValType::I64] }
    );
    assert_eq!(
        module.imports[1].desc,
        ImportDesc::Table(TableType {
            elemtype: RefType::FuncRef,
            limits: Limits { min: 1, max: Some(8) },
        })
    );
    assert_eq!(
        module.imports[2].desc,
        ImportDesc::Mem(MemType { limits: Limits { min: 2, max: None } })
    );
    assert_eq!(
        module.imports[3].desc,
        ImportDesc::Global(GlobalType { mutability: Mut::Var, valtype: ValType::F64 })
    );
}

#[test]
fn definitions_and_exports_line_up() {
    let module = decode(
        r#"(module
             (memory 1 4)
             (table 3 funcref)
             (global $g i64 (i64.const -5))
             (func $f (export "f") (local i32 i32) (local f64))
             (export "mem" (memory 0))
             (export "tbl" (table 0))
             (export "glob" (global 0))
             (start $f))"#,
    );
    assert_eq!(module.mems, vec![MemType { limits: Limits { min: 1, max: Some(4) } }]);
    assert_eq!(
        module.tables,
        vec![TableType { elemtype: RefType::FuncRef, limits: Limits { min: 3, max: None } }]
    );
    assert_eq!(module.globals.len(), 1);
    assert_eq!(module.globals[0].init, ConstExpr::I64Const(-5));
    assert_eq!(module.start, Some(0));

    assert_eq!(
        module.codes[0].locals,
        vec![
            LocalDecl { count: 2, ty: ValType::I32 },
            LocalDecl { count: 1, ty: ValType::F64 },
        ]
    );
    // a bare body is just its end opcode
    assert_eq!(module.codes[0].body, vec![0x0B]);

    let find = |name: &str| {
        module
            .exports
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.desc)
            .unwrap()
    };
    assert_eq!(find("f"), ExportDesc::Func(0));
    assert_eq!(find("mem"), ExportDesc::Mem(0));
    assert_eq!(find("tbl"), ExportDesc::Table(0));
    assert_eq!(find("glob"), ExportDesc::Global(0));
}

#[test]
fn segments_keep_their_mode() {
    let module = decode(
        r#"(module
             (memory 1)
             (table 4 funcref)
             (func $f)
             (data (i32.const 3) "abc")
             (data $passive "xyz")
             (elem (i32.const 1) $f $f))"#,
    );
    assert_eq!(module.data.len(), 2);
    assert!(!module.data[0].passive);
    assert_eq!(module.data[0].offset, Some(ConstExpr::I32Const(3)));
    assert_eq!(module.data[0].init, b"abc");
    assert!(module.data[1].passive);
    assert_eq!(module.data[1].offset, None);
    assert_eq!(module.data[1].init, b"xyz");

    assert_eq!(
        module.elems,
        vec![Elem { table: 0, offset: ConstExpr::I32Const(1), init: vec![0, 0] }]
    );
}

#[test]
fn global_initializers_cover_every_constant_form() {
    let module = decode(
        r#"(module
             (import "env" "base" (global i32))
             (func $f)
             (global i32 (i32.const 7))
             (global i64 (i64.const 8))
             (global f32 (f32.const 0.5))
             (global f64 (f64.const 0.25))
             (global i32 (global.get 0))
             (global funcref (ref.null func))
             (global externref (ref.null extern))
             (global funcref (ref.func $f))
             (elem declare func $f))"#,
    );
    let inits: Vec<_> = module.globals.iter().map(|g| g.init.clone()).collect();
    assert_eq!(
        inits,
        vec![
            ConstExpr::I32Const(7),
            ConstExpr::I64Const(8),
            ConstExpr::F32Const(0.5),
            ConstExpr::F64Const(0.25),
            ConstExpr::GlobalGet(0),
            ConstExpr::RefNull(RefType::FuncRef),
            ConstExpr::RefNull(RefType::ExternRef),
            ConstExpr::RefFunc(0),
        ]
    );
    // the declarative element segment was decoded and discarded
    assert!(module.elems.is_empty());
}
