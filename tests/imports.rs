//! Import resolution against the host registry, host dispatch, the
//! default WASI shims, and start-function behavior.

use ironwasm::{
    GlobalType, HostResult, Interpreter, Limits, MemType, Mut, RefType, TableType, Val, ValType,
};

fn assemble(wat_src: &str) -> Vec<u8> {
    wat::parse_str(wat_src).expect("fixture should assemble")
}

fn read_i32(interp: &mut Interpreter, addr: usize) -> i32 {
    let mem = interp.memory().expect("module has a memory");
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&mem[addr..addr + 4]);
    i32::from_le_bytes(bytes)
}

#[test]
fn host_function_results_feed_the_store_heuristic() {
    let wasm = assemble(
        r#"(module
             (import "env" "add" (func $add (param i32 i32) (result i32)))
             (memory 1)
             (func (export "run")
               (call $add (i32.const 8) (i32.const 7))
               (i32.const 4)
               i32.store))"#,
    );
    let mut interp = Interpreter::new();
    interp.register_host_function(
        "env",
        "add",
        vec![ValType::I32, ValType::I32],
        vec![ValType::I32],
        |args| match (args[0].as_i32(), args[1].as_i32()) {
            (Some(a), Some(b)) => HostResult::values(vec![Val::I32(a.wrapping_add(b))]),
            _ => HostResult::trap("add expects i32 arguments"),
        },
    );
    interp.load(&wasm).unwrap();
    let result = interp.invoke("run", &[]);
    assert!(!result.trapped, "{}", result.trap_message);
    assert_eq!(read_i32(&mut interp, 4), 15);
}

#[test]
fn host_trap_aborts_the_invocation() {
    let wasm = assemble(
        r#"(module
             (import "env" "deny" (func $deny))
             (memory 1)
             (func (export "run")
               (i32.store (i32.const 0) (i32.const 1))
               (call $deny)
               (i32.store (i32.const 0) (i32.const 2))))"#,
    );
    let mut interp = Interpreter::new();
    interp.register_host_function("env", "deny", vec![], vec![], |_args| {
        HostResult::trap("host says no")
    });
    interp.load(&wasm).unwrap();
    let result = interp.invoke("run", &[]);
    assert!(result.trapped);
    assert_eq!(result.trap_message, "host says no");
    // the first store stays visible
    assert_eq!(read_i32(&mut interp, 0), 1);
}

#[test]
fn host_global_import_is_copied_in() {
    let wasm = assemble(
        r#"(module
             (import "env" "base" (global $base i32))
             (func (export "plus_one") (result i32)
               (i32.add (global.get $base) (i32.const 1))))"#,
    );
    let mut interp = Interpreter::new();
    interp.register_host_global(
        "env",
        "base",
        GlobalType { mutability: Mut::Const, valtype: ValType::I32 },
        Val::I32(41),
    );
    interp.load(&wasm).unwrap();
    assert_eq!(interp.invoke("plus_one", &[]).values, vec![Val::I32(42)]);
}

#[test]
fn host_memory_import_carries_initial_bytes() {
    let wasm = assemble(
        r#"(module
             (import "env" "mem" (memory 1 1))
             (func (export "first") (result i32)
               (i32.load8_u (i32.const 0))))"#,
    );
    let mut data = vec![0u8; 65536];
    data[0] = 7;
    let mut interp = Interpreter::new();
    interp.register_host_memory(
        "env",
        "mem",
        MemType { limits: Limits { min: 1, max: Some(1) } },
        data,
    );
    interp.load(&wasm).unwrap();
    assert_eq!(interp.invoke("first", &[]).values, vec![Val::I32(7)]);
}

#[test]
fn host_table_import_supplies_elements() {
    let wasm = assemble(
        r#"(module
             (import "env" "tbl" (table 2 2 funcref))
             (func (export "count") (result i32) (table.size 0))
             (func (export "slot_is_null") (param i32) (result i32)
               (ref.is_null (table.get 0 (local.get 0)))))"#,
    );
    let mut interp = Interpreter::new();
    interp.register_host_table(
        "env",
        "tbl",
        TableType { elemtype: RefType::FuncRef, limits: Limits { min: 2, max: Some(2) } },
        vec![Val::FuncRef(None), Val::FuncRef(None)],
    );
    interp.load(&wasm).unwrap();
    assert_eq!(interp.invoke("count", &[]).values, vec![Val::I32(2)]);
    assert_eq!(interp.invoke("slot_is_null", &[Val::I32(1)]).values, vec![Val::I32(1)]);
}

#[test]
fn missing_and_mismatched_imports_fail_to_load() {
    let wasm = assemble(
        r#"(module
             (import "env" "absent" (func (param i32))))"#,
    );
    let mut interp = Interpreter::new();
    let err = interp.load(&wasm).unwrap_err();
    assert!(err.to_string().contains("Missing host function import: env.absent"));

    let mut interp = Interpreter::new();
    interp.register_host_function("env", "absent", vec![ValType::I64], vec![], |_| {
        HostResult::values(vec![])
    });
    let err = interp.load(&wasm).unwrap_err();
    assert!(err.to_string().contains("signature mismatch"));

    let wasm = assemble(r#"(module (import "env" "g" (global i64)))"#);
    let mut interp = Interpreter::new();
    interp.register_host_global(
        "env",
        "g",
        GlobalType { mutability: Mut::Const, valtype: ValType::I32 },
        Val::I32(0),
    );
    let err = interp.load(&wasm).unwrap_err();
    assert!(err.to_string().contains("Host global type mismatch"));
}

#[test]
fn host_memory_size_must_be_page_aligned() {
    let wasm = assemble(
        r#"(module (import "env" "mem" (memory 1 1)))"#,
    );
    let mut interp = Interpreter::new();
    interp.register_host_memory(
        "env",
        "mem",
        MemType { limits: Limits { min: 1, max: Some(1) } },
        vec![0u8; 100],
    );
    let err = interp.load(&wasm).unwrap_err();
    assert!(err.to_string().contains("multiple of the page size"));
}

#[test]
fn wasi_fd_write_rejects_unknown_fds() {
    let wasm = assemble(
        r#"(module
             (import "wasi_snapshot_preview1" "fd_write"
               (func $fd_write (param i32 i32 i32 i32) (result i32)))
             (memory 1)
             (func (export "run") (result i32)
               (i32.store (i32.const 20) (i32.const 0xEEEE))
               (call $fd_write (i32.const 7) (i32.const 0) (i32.const 0) (i32.const 20))))"#,
    );
    let mut interp = Interpreter::new();
    interp.load(&wasm).unwrap();
    let result = interp.invoke("run", &[]);
    assert!(!result.trapped, "{}", result.trap_message);
    assert_eq!(result.values, vec![Val::I32(8)]); // BADF
    assert_eq!(read_i32(&mut interp, 20), 0); // nwritten zeroed
}

#[test]
fn wasi_fd_write_reports_bytes_written() {
    let wasm = assemble(
        r#"(module
             (import "wasi_snapshot_preview1" "fd_write"
               (func $fd_write (param i32 i32 i32 i32) (result i32)))
             (memory 1)
             (data (i32.const 100) "hello")
             (func (export "run") (result i32)
               ;; one iovec at 8: ptr=100 len=5
               (i32.store (i32.const 8) (i32.const 100))
               (i32.store (i32.const 12) (i32.const 5))
               (call $fd_write (i32.const 1) (i32.const 8) (i32.const 1) (i32.const 20))))"#,
    );
    let mut interp = Interpreter::new();
    interp.load(&wasm).unwrap();
    let result = interp.invoke("run", &[]);
    assert!(!result.trapped, "{}", result.trap_message);
    assert_eq!(result.values, vec![Val::I32(0)]); // success
    assert_eq!(read_i32(&mut interp, 20), 5);
}

#[test]
fn wasi_fd_write_faults_on_bad_iovecs() {
    let wasm = assemble(
        r#"(module
             (import "wasi_snapshot_preview1" "fd_write"
               (func $fd_write (param i32 i32 i32 i32) (result i32)))
             (memory 1)
             (func (export "run") (result i32)
               ;; iovec list sits past the end of memory
               (call $fd_write (i32.const 1) (i32.const 65530) (i32.const 1) (i32.const 20))))"#,
    );
    let mut interp = Interpreter::new();
    interp.load(&wasm).unwrap();
    let result = interp.invoke("run", &[]);
    assert_eq!(result.values, vec![Val::I32(21)]); // FAULT
}

#[test]
fn wasi_proc_exit_traps_with_the_exit_code() {
    let wasm = assemble(
        r#"(module
             (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
             (func (export "quit") (call $proc_exit (i32.const 7))))"#,
    );
    let mut interp = Interpreter::new();
    interp.load(&wasm).unwrap();
    let result = interp.invoke("quit", &[]);
    assert!(result.trapped);
    assert_eq!(result.trap_message, "wasi::proc_exit(7)");
}

#[test]
fn start_function_runs_during_load() {
    let wasm = assemble(
        r#"(module
             (memory 1)
             (func $init (i32.store (i32.const 0) (i32.const 9)))
             (start $init)
             (func (export "noop")))"#,
    );
    let mut interp = Interpreter::new();
    interp.load(&wasm).unwrap();
    assert_eq!(read_i32(&mut interp, 0), 9);
}

#[test]
fn trapping_start_function_fails_the_load() {
    let wasm = assemble(
        r#"(module
             (func $bad (unreachable))
             (start $bad))"#,
    );
    let mut interp = Interpreter::new();
    let err = interp.load(&wasm).unwrap_err();
    assert!(err.to_string().contains("Unreachable"));
    // nothing usable was loaded
    assert!(interp.module().is_none());
    assert!(interp.invoke("anything", &[]).trapped);
}

#[test]
fn active_segment_overflow_fails_the_load() {
    let wasm = assemble(
        r#"(module
             (memory 1)
             (data (i32.const 65534) "overflow"))"#,
    );
    let mut interp = Interpreter::new();
    let err = interp.load(&wasm).unwrap_err();
    assert!(err.to_string().contains("Data segment out of bounds"));
}

#[test]
fn reload_replaces_runtime_state() {
    let first = assemble(
        r#"(module (memory 1)
             (func (export "mark") (i32.store (i32.const 0) (i32.const 1))))"#,
    );
    let second = assemble(
        r#"(module (memory 1)
             (func (export "read") (result i32) (i32.load (i32.const 0))))"#,
    );
    let mut interp = Interpreter::new();
    interp.load(&first).unwrap();
    interp.invoke("mark", &[]);
    assert_eq!(read_i32(&mut interp, 0), 1);

    interp.load(&second).unwrap();
    // fresh zeroed memory, old exports gone
    assert_eq!(interp.invoke("read", &[]).values, vec![Val::I32(0)]);
    assert!(interp.invoke("mark", &[]).trapped);
}
