//! Execution-engine behavior: structured control flow, multi-value,
//! the store operand-order heuristic, bulk memory, tables and
//! references, and trap discipline.

use ironwasm::{Interpreter, Val};
use quickcheck_macros::quickcheck;

fn interpreter_for(wat_src: &str) -> Interpreter {
    let wasm = wat::parse_str(wat_src).expect("fixture should assemble");
    let mut interp = Interpreter::new();
    interp.load(&wasm).expect("fixture should load");
    interp
}

fn read_i32(interp: &mut Interpreter, addr: usize) -> i32 {
    let mem = interp.memory().expect("module has a memory");
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&mem[addr..addr + 4]);
    i32::from_le_bytes(bytes)
}

fn assert_traps(interp: &mut Interpreter, export: &str, args: &[Val], needle: &str) {
    let result = interp.invoke(export, args);
    assert!(result.trapped, "{export} should trap");
    assert!(
        result.trap_message.contains(needle),
        "expected {:?} in {:?}",
        needle,
        result.trap_message
    );
}

#[test]
fn loop_with_conditional_exit() {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (func (export "sum_to_five")
               (local $i i32) (local $sum i32)
               (block $exit
                 (loop $top
                   (local.set $i (i32.add (local.get $i) (i32.const 1)))
                   (local.set $sum (i32.add (local.get $sum) (local.get $i)))
                   (br_if $exit (i32.ge_s (local.get $i) (i32.const 5)))
                   (br $top)))
               (i32.store (i32.const 0) (local.get $sum))))"#,
    );
    let result = interp.invoke("sum_to_five", &[]);
    assert!(!result.trapped, "{}", result.trap_message);
    assert_eq!(read_i32(&mut interp, 0), 15);
}

#[test]
fn br_table_dispatch() {
    let mut interp = interpreter_for(
        r#"(module
             (func (export "pick") (param i32) (result i32)
               (block $out (result i32)
                 (block $two
                   (block $one
                     (block $zero
                       (br_table $zero $one $two (local.get 0)))
                     (br $out (i32.const 100)))
                   (br $out (i32.const 200)))
                 (i32.const 300))))"#,
    );
    assert_eq!(interp.invoke("pick", &[Val::I32(0)]).values, vec![Val::I32(100)]);
    assert_eq!(interp.invoke("pick", &[Val::I32(1)]).values, vec![Val::I32(200)]);
    assert_eq!(interp.invoke("pick", &[Val::I32(2)]).values, vec![Val::I32(300)]);
    // out-of-range index falls back to the default target
    assert_eq!(interp.invoke("pick", &[Val::I32(-7)]).values, vec![Val::I32(300)]);
    assert_eq!(interp.invoke("pick", &[Val::I32(99)]).values, vec![Val::I32(300)]);
}

#[test]
fn if_without_else_skips_the_body() {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (func (export "check") (param i32)
               (if (local.get 0)
                 (then (i32.store (i32.const 0) (i32.const 111))))
               (i32.store (i32.const 4) (i32.const 222))))"#,
    );
    interp.invoke("check", &[Val::I32(0)]);
    assert_eq!(read_i32(&mut interp, 0), 0);
    assert_eq!(read_i32(&mut interp, 4), 222);
    interp.invoke("check", &[Val::I32(1)]);
    assert_eq!(read_i32(&mut interp, 0), 111);
}

#[test]
fn multi_value_results_and_blocks() {
    let mut interp = interpreter_for(
        r#"(module
             (func (export "divmod") (param i32 i32) (result i32 i32)
               (i32.div_u (local.get 0) (local.get 1))
               (i32.rem_u (local.get 0) (local.get 1)))
             (func (export "swap") (param i32 i32) (result i32 i32)
               (local.get 1) (local.get 0))
             (func (export "pair_sum") (result i32)
               (block (result i32 i32)
                 (i32.const 20) (i32.const 30))
               i32.add))"#,
    );
    assert_eq!(
        interp.invoke("divmod", &[Val::I32(17), Val::I32(5)]).values,
        vec![Val::I32(3), Val::I32(2)]
    );
    assert_eq!(
        interp.invoke("swap", &[Val::I32(1), Val::I32(2)]).values,
        vec![Val::I32(2), Val::I32(1)]
    );
    assert_eq!(interp.invoke("pair_sum", &[]).values, vec![Val::I32(50)]);
}

#[test]
fn branch_at_block_bottom_equals_fallthrough() {
    let mut interp = interpreter_for(
        r#"(module
             (func (export "with_br") (result i32)
               (block (result i32) (i32.const 7) (br 0)))
             (func (export "without_br") (result i32)
               (block (result i32) (i32.const 7))))"#,
    );
    let with_br = interp.invoke("with_br", &[]);
    let without_br = interp.invoke("without_br", &[]);
    assert!(!with_br.trapped && !without_br.trapped);
    assert_eq!(with_br.values, without_br.values);
}

#[test]
fn store_heuristic_swaps_for_call_results() {
    // `call` leaves its result below the address, which canonical
    // validation would treat as the address. The origin tags make the
    // engine pick the type-consistent interpretation instead.
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (func $answer (result i32) (i32.const 42))
             (func (export "run")
               (call $answer)
               (i32.const 12)
               i32.store))"#,
    );
    let result = interp.invoke("run", &[]);
    assert!(!result.trapped, "{}", result.trap_message);
    assert_eq!(read_i32(&mut interp, 12), 42);
    assert_eq!(read_i32(&mut interp, 42), 0);
}

#[test]
fn store_heuristic_swaps_for_load_results() {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (func (export "run")
               (i32.store (i32.const 0) (i32.const 9))
               (i32.load (i32.const 0))
               (i32.const 16)
               i32.store))"#,
    );
    let result = interp.invoke("run", &[]);
    assert!(!result.trapped, "{}", result.trap_message);
    assert_eq!(read_i32(&mut interp, 16), 9);
}

#[test]
fn store_heuristic_is_a_noop_for_canonical_code() {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (func (export "run")
               (i32.store (i32.const 8) (i32.const 5))))"#,
    );
    interp.invoke("run", &[]);
    assert_eq!(read_i32(&mut interp, 8), 5);
    assert_eq!(read_i32(&mut interp, 5), 0);
}

#[test]
fn globals_persist_across_invocations() {
    let mut interp = interpreter_for(
        r#"(module
             (global $count (mut i32) (i32.const 0))
             (global $fixed i32 (i32.const 9))
             (func (export "bump") (result i32)
               (global.set $count (i32.add (global.get $count) (i32.const 1)))
               (global.get $count))
             (func (export "read_fixed") (result i32) (global.get $fixed)))"#,
    );
    assert_eq!(interp.invoke("bump", &[]).values, vec![Val::I32(1)]);
    assert_eq!(interp.invoke("bump", &[]).values, vec![Val::I32(2)]);
    assert_eq!(interp.invoke("read_fixed", &[]).values, vec![Val::I32(9)]);
}

#[test]
fn writing_an_immutable_global_traps() {
    // Hand-assembled because the text-format tooling refuses to emit a
    // global.set against a const global.
    fn section(id: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![id, payload.len() as u8];
        out.extend_from_slice(payload);
        out
    }
    let mut wasm = b"\0asm\x01\x00\x00\x00".to_vec();
    wasm.extend_from_slice(&section(1, &[1, 0x60, 0, 0])); // type () -> ()
    wasm.extend_from_slice(&section(3, &[1, 0])); // one function
    wasm.extend_from_slice(&section(6, &[1, 0x7F, 0x00, 0x41, 0x09, 0x0B])); // const i32 = 9
    wasm.extend_from_slice(&section(7, &[1, 3, b's', b'e', b't', 0x00, 0x00]));
    wasm.extend_from_slice(&section(10, &[1, 6, 0, 0x41, 0x01, 0x24, 0x00, 0x0B]));

    let mut interp = Interpreter::new();
    interp.load(&wasm).unwrap();
    assert_traps(&mut interp, "set", &[], "immutable global");
}

#[test]
fn memory_size_and_grow() {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1 3)
             (func (export "size") (result i32) (memory.size))
             (func (export "grow") (param i32) (result i32)
               (memory.grow (local.get 0))))"#,
    );
    assert_eq!(interp.invoke("size", &[]).values, vec![Val::I32(1)]);
    assert_eq!(interp.invoke("grow", &[Val::I32(1)]).values, vec![Val::I32(1)]);
    assert_eq!(interp.invoke("size", &[]).values, vec![Val::I32(2)]);
    // beyond the declared maximum
    assert_eq!(interp.invoke("grow", &[Val::I32(5)]).values, vec![Val::I32(-1)]);
    // negative delta fails without side effect
    assert_eq!(interp.invoke("grow", &[Val::I32(-1)]).values, vec![Val::I32(-1)]);
    assert_eq!(interp.invoke("size", &[]).values, vec![Val::I32(2)]);
}

#[test]
fn bulk_memory_fill_init_drop() {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (data $seg "abc")
             (func (export "fill")
               (memory.fill (i32.const 10) (i32.const 65) (i32.const 4)))
             (func (export "init")
               (memory.init $seg (i32.const 0) (i32.const 0) (i32.const 3)))
             (func (export "drop_seg") (data.drop $seg)))"#,
    );
    interp.invoke("fill", &[]);
    assert_eq!(&interp.memory().unwrap()[10..14], &[65, 65, 65, 65]);

    let init = interp.invoke("init", &[]);
    assert!(!init.trapped, "{}", init.trap_message);
    assert_eq!(&interp.memory().unwrap()[0..3], b"abc");

    assert!(!interp.invoke("drop_seg", &[]).trapped);
    assert_traps(&mut interp, "init", &[], "dropped data segment");
}

#[test]
fn memory_fill_uses_low_byte_of_value() {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (func (export "fill")
               (memory.fill (i32.const 0) (i32.const 0x1FF) (i32.const 2))))"#,
    );
    interp.invoke("fill", &[]);
    assert_eq!(&interp.memory().unwrap()[0..3], &[0xFF, 0xFF, 0]);
}

#[test]
fn table_set_get_and_indirect_call() {
    let mut interp = interpreter_for(
        r#"(module
             (table 2 funcref)
             (func $forty_two (result i32) (i32.const 42))
             (func (export "install")
               (table.set 0 (i32.const 1) (ref.func $forty_two)))
             (func (export "call_it") (result i32)
               (call_indirect (result i32) (i32.const 1)))
             (func (export "get_is_null") (param i32) (result i32)
               (ref.is_null (table.get 0 (local.get 0)))))"#,
    );
    assert_eq!(interp.invoke("get_is_null", &[Val::I32(1)]).values, vec![Val::I32(1)]);
    assert_traps(&mut interp, "call_it", &[], "uninitialized table element");

    assert!(!interp.invoke("install", &[]).trapped);
    assert_eq!(interp.invoke("get_is_null", &[Val::I32(1)]).values, vec![Val::I32(0)]);
    assert_eq!(interp.invoke("call_it", &[]).values, vec![Val::I32(42)]);
}

#[test]
fn externref_tables_grow_fill_and_size() {
    let mut interp = interpreter_for(
        r#"(module
             (table $t 4 externref)
             (func (export "size") (result i32) (table.size $t))
             (func (export "grow") (param externref i32) (result i32)
               (table.grow $t (local.get 0) (local.get 1)))
             (func (export "fill") (param i32 externref i32)
               (table.fill $t (local.get 0) (local.get 1) (local.get 2)))
             (func (export "get_is_null") (param i32) (result i32)
               (ref.is_null (table.get $t (local.get 0)))))"#,
    );
    assert_eq!(interp.invoke("size", &[]).values, vec![Val::I32(4)]);
    assert_eq!(
        interp
            .invoke("grow", &[Val::ExternRef(Some(7)), Val::I32(2)])
            .values,
        vec![Val::I32(4)]
    );
    assert_eq!(interp.invoke("size", &[]).values, vec![Val::I32(6)]);
    // grown slots carry the supplied reference
    assert_eq!(interp.invoke("get_is_null", &[Val::I32(5)]).values, vec![Val::I32(0)]);

    let fill = interp.invoke(
        "fill",
        &[Val::I32(0), Val::ExternRef(None), Val::I32(6)],
    );
    assert!(!fill.trapped, "{}", fill.trap_message);
    assert_eq!(interp.invoke("get_is_null", &[Val::I32(5)]).values, vec![Val::I32(1)]);
}

#[test]
fn table_copy_moves_references() {
    let mut interp = interpreter_for(
        r#"(module
             (table 4 funcref)
             (elem (i32.const 0) $f)
             (func $f (result i32) (i32.const 1))
             (func (export "shift")
               (table.copy (i32.const 2) (i32.const 0) (i32.const 2)))
             (func (export "get_is_null") (param i32) (result i32)
               (ref.is_null (table.get 0 (local.get 0)))))"#,
    );
    assert_eq!(interp.invoke("get_is_null", &[Val::I32(2)]).values, vec![Val::I32(1)]);
    assert!(!interp.invoke("shift", &[]).trapped);
    assert_eq!(interp.invoke("get_is_null", &[Val::I32(2)]).values, vec![Val::I32(0)]);
    assert_eq!(interp.invoke("get_is_null", &[Val::I32(3)]).values, vec![Val::I32(1)]);
}

#[test]
fn table_init_and_elem_drop_are_unsupported() {
    let mut interp = interpreter_for(
        r#"(module
             (table 1 funcref)
             (elem $e func $f)
             (func $f)
             (func (export "ti")
               (table.init $e (i32.const 0) (i32.const 0) (i32.const 1)))
             (func (export "ed") (elem.drop $e)))"#,
    );
    assert_traps(&mut interp, "ti", &[], "table.init is not supported");
    assert_traps(&mut interp, "ed", &[], "elem.drop is not supported");
}

#[test]
fn trap_discipline() {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (func (export "div0") (result i32)
               (i32.div_s (i32.const 1) (i32.const 0)))
             (func (export "rem0") (result i64)
               (i64.rem_u (i64.const 1) (i64.const 0)))
             (func (export "overflow") (result i32)
               (i32.div_s (i32.const 0x80000000) (i32.const -1)))
             (func (export "boom") (unreachable))
             (func (export "oob") (result i32)
               (i32.load (i32.const 70000)))
             (func (export "oob_edge") (result i32)
               (i32.load (i32.const 65533)))
             (func (export "trunc_nan") (result i32)
               (i32.trunc_f32_s (f32.const nan)))
             (func (export "trunc_range") (result i32)
               (i32.trunc_f64_s (f64.const 1e300))))"#,
    );
    assert_traps(&mut interp, "div0", &[], "divide by zero");
    assert_traps(&mut interp, "rem0", &[], "remainder by zero");
    assert_traps(&mut interp, "overflow", &[], "Integer overflow");
    assert_traps(&mut interp, "boom", &[], "Unreachable");
    assert_traps(&mut interp, "oob", &[], "out of bounds");
    assert_traps(&mut interp, "oob_edge", &[], "out of bounds");
    assert_traps(&mut interp, "trunc_nan", &[], "NaN");
    assert_traps(&mut interp, "trunc_range", &[], "overflow during truncation");
    assert_traps(&mut interp, "missing", &[], "Export not found");
}

#[test]
fn side_effects_before_a_trap_stay_visible() {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (func (export "partial")
               (i32.store (i32.const 0) (i32.const 77))
               (unreachable)))"#,
    );
    assert_traps(&mut interp, "partial", &[], "Unreachable");
    assert_eq!(read_i32(&mut interp, 0), 77);
    // a fresh invoke starts from the mutated state
    assert_traps(&mut interp, "partial", &[], "Unreachable");
    assert_eq!(read_i32(&mut interp, 0), 77);
}

#[test]
fn float_semantics_through_the_engine() {
    let mut interp = interpreter_for(
        r#"(module
             (func (export "min") (param f64 f64) (result f64)
               (f64.min (local.get 0) (local.get 1)))
             (func (export "max") (param f64 f64) (result f64)
               (f64.max (local.get 0) (local.get 1)))
             (func (export "nearest") (param f64) (result f64)
               (f64.nearest (local.get 0)))
             (func (export "lt_nan") (result i32)
               (f64.lt (f64.const nan) (f64.const 1)))
             (func (export "ne_nan") (result i32)
               (f64.ne (f64.const nan) (f64.const nan))))"#,
    );
    let min = interp.invoke("min", &[Val::F64(0.0), Val::F64(-0.0)]);
    assert!(matches!(min.values[0], Val::F64(z) if z == 0.0 && z.is_sign_negative()));
    let max = interp.invoke("max", &[Val::F64(0.0), Val::F64(-0.0)]);
    assert!(matches!(max.values[0], Val::F64(z) if z == 0.0 && z.is_sign_positive()));
    let nan = interp.invoke("min", &[Val::F64(f64::NAN), Val::F64(1.0)]);
    assert!(matches!(nan.values[0], Val::F64(z) if z.is_nan()));

    assert_eq!(interp.invoke("nearest", &[Val::F64(2.5)]).values, vec![Val::F64(2.0)]);
    assert_eq!(interp.invoke("nearest", &[Val::F64(3.5)]).values, vec![Val::F64(4.0)]);
    assert_eq!(interp.invoke("lt_nan", &[]).values, vec![Val::I32(0)]);
    assert_eq!(interp.invoke("ne_nan", &[]).values, vec![Val::I32(1)]);
}

#[quickcheck]
fn store_load_roundtrip_preserves_bit_patterns(bits: u32) -> bool {
    // Round-trips arbitrary f32 bit patterns (NaN payloads included)
    // through a store and load.
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (func (export "rt") (param i32) (result i32)
               (f32.store (i32.const 0) (f32.reinterpret_i32 (local.get 0)))
               (i32.reinterpret_f32 (f32.load (i32.const 0)))))"#,
    );
    let result = interp.invoke("rt", &[Val::I32(bits as i32)]);
    !result.trapped && result.values == vec![Val::I32(bits as i32)]
}

#[quickcheck]
fn overlapping_copy_matches_a_memmove_model(dest: u8, src: u8, len: u8) -> bool {
    let mut interp = interpreter_for(
        r#"(module
             (memory 1)
             (data (i32.const 0)
               "\00\01\02\03\04\05\06\07\08\09\0A\0B\0C\0D\0E\0F")
             (func (export "copy") (param i32 i32 i32)
               (memory.copy (local.get 0) (local.get 1) (local.get 2))))"#,
    );
    let dest = usize::from(dest % 16);
    let src = usize::from(src % 16);
    let len = usize::from(len % 16).min(16 - dest).min(16 - src);

    let mut model = interp.memory().unwrap().to_vec();
    model.copy_within(src..src + len, dest);

    let result = interp.invoke(
        "copy",
        &[Val::I32(dest as i32), Val::I32(src as i32), Val::I32(len as i32)],
    );
    !result.trapped && interp.memory().unwrap() == model.as_slice()
}
