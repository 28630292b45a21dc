//! Host import registry and the default `wasi_snapshot_preview1` shims.

use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;

use ironwasm_structure::types::*;

use crate::runtime_structure::{HostCallback, HostResult, Store, Val};

pub struct HostFunctionRecord {
    pub type_: FuncType,
    pub callback: HostCallback,
}

pub struct HostMemoryRecord {
    pub type_: MemType,
    pub data: Vec<u8>,
}

pub struct HostTableRecord {
    pub type_: TableType,
    pub elements: Vec<Val>,
}

pub struct HostGlobalRecord {
    pub type_: GlobalType,
    pub value: Val,
}

/// Records keyed by `(module, name)`, consumed while resolving imports.
/// Registration must happen before `load`; registering afterwards has
/// no effect on the already-instantiated store.
#[derive(Default)]
pub struct HostRegistry {
    functions: HashMap<(String, String), HostFunctionRecord>,
    memories: HashMap<(String, String), HostMemoryRecord>,
    tables: HashMap<(String, String), HostTableRecord>,
    globals: HashMap<(String, String), HostGlobalRecord>,
}

fn key(module: &str, name: &str) -> (String, String) {
    (module.to_owned(), name.to_owned())
}

impl HostRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// A fresh registry pre-populated with the default WASI entries.
    pub fn with_wasi_preview1() -> Self {
        let mut registry = HostRegistry::new();
        registry.register_function(
            "wasi_snapshot_preview1",
            "fd_write",
            FuncType {
                params: vec![ValType::I32, ValType::I32, ValType::I32, ValType::I32],
                results: vec![ValType::I32],
            },
            Rc::new(wasi_fd_write),
        );
        registry.register_function(
            "wasi_snapshot_preview1",
            "proc_exit",
            FuncType { params: vec![ValType::I32], results: vec![] },
            Rc::new(wasi_proc_exit),
        );
        registry
    }

    pub fn register_function(
        &mut self,
        module: &str,
        name: &str,
        type_: FuncType,
        callback: HostCallback,
    ) {
        self.functions
            .insert(key(module, name), HostFunctionRecord { type_, callback });
    }

    pub fn register_memory(&mut self, module: &str, name: &str, type_: MemType, data: Vec<u8>) {
        self.memories
            .insert(key(module, name), HostMemoryRecord { type_, data });
    }

    pub fn register_table(
        &mut self,
        module: &str,
        name: &str,
        type_: TableType,
        elements: Vec<Val>,
    ) {
        self.tables
            .insert(key(module, name), HostTableRecord { type_, elements });
    }

    pub fn register_global(&mut self, module: &str, name: &str, type_: GlobalType, value: Val) {
        self.globals
            .insert(key(module, name), HostGlobalRecord { type_, value });
    }

    pub fn function(&self, module: &str, name: &str) -> Option<&HostFunctionRecord> {
        self.functions.get(&key(module, name))
    }

    pub fn memory(&self, module: &str, name: &str) -> Option<&HostMemoryRecord> {
        self.memories.get(&key(module, name))
    }

    pub fn table(&self, module: &str, name: &str) -> Option<&HostTableRecord> {
        self.tables.get(&key(module, name))
    }

    pub fn global(&self, module: &str, name: &str) -> Option<&HostGlobalRecord> {
        self.globals.get(&key(module, name))
    }
}

const ERRNO_SUCCESS: i32 = 0;
const ERRNO_BADF: i32 = 8;
const ERRNO_FAULT: i32 = 21;

fn read_u32_le(data: &[u8], addr: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[addr..addr + 4]);
    u32::from_le_bytes(bytes)
}

/// `fd_write(fd, iovs, iovs_len, nwritten) -> errno`. Writes each iovec
/// to stdout (fd 1) or stderr (fd 2). Unknown fds yield BADF with
/// nwritten zeroed when it fits; any pointer overflow yields FAULT.
fn wasi_fd_write(store: &mut Store, args: &[Val]) -> HostResult {
    if args.len() != 4 {
        return HostResult::trap("wasi::fd_write expects 4 arguments");
    }
    let (fd, iovs_ptr, iovs_len, nwritten_ptr) = match (
        args[0].as_i32(),
        args[1].as_i32(),
        args[2].as_i32(),
        args[3].as_i32(),
    ) {
        (Some(fd), Some(iovs), Some(len), Some(nwritten)) => {
            (fd, iovs as u32, len as u32, nwritten as u32)
        }
        _ => return HostResult::trap("wasi::fd_write expects i32 arguments"),
    };

    let Some(mem) = store.mems.first_mut() else {
        return HostResult::trap("wasi::fd_write requires linear memory");
    };
    let mem_len = mem.data.len() as u64;

    let mut sink: Box<dyn Write> = match fd {
        1 => Box::new(std::io::stdout()),
        2 => Box::new(std::io::stderr()),
        _ => {
            if u64::from(nwritten_ptr) + 4 <= mem_len {
                let at = nwritten_ptr as usize;
                mem.data[at..at + 4].copy_from_slice(&0u32.to_le_bytes());
            }
            return HostResult::values(vec![Val::I32(ERRNO_BADF)]);
        }
    };

    let mut total: u64 = 0;
    for i in 0..iovs_len {
        let entry = u64::from(iovs_ptr) + u64::from(i) * 8;
        if entry + 8 > mem_len {
            return HostResult::values(vec![Val::I32(ERRNO_FAULT)]);
        }
        let ptr = read_u32_le(&mem.data, entry as usize);
        let len = read_u32_le(&mem.data, entry as usize + 4);
        let end = u64::from(ptr) + u64::from(len);
        if end > mem_len {
            return HostResult::values(vec![Val::I32(ERRNO_FAULT)]);
        }
        let _ = sink.write_all(&mem.data[ptr as usize..end as usize]);
        total += u64::from(len);
    }
    let _ = sink.flush();

    if u64::from(nwritten_ptr) + 4 > mem_len {
        return HostResult::values(vec![Val::I32(ERRNO_FAULT)]);
    }
    let total = total.min(u64::from(u32::MAX)) as u32;
    let at = nwritten_ptr as usize;
    mem.data[at..at + 4].copy_from_slice(&total.to_le_bytes());

    HostResult::values(vec![Val::I32(ERRNO_SUCCESS)])
}

/// `proc_exit(code)` always traps; embedders recover the exit code from
/// the message. This contract is load-bearing.
fn wasi_proc_exit(_store: &mut Store, args: &[Val]) -> HostResult {
    if args.len() != 1 {
        return HostResult::trap("wasi::proc_exit expects 1 argument");
    }
    match args[0].as_i32() {
        Some(code) => HostResult::trap(format!("wasi::proc_exit({code})")),
        None => HostResult::trap("wasi::proc_exit expects an i32 exit code"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_structure::MemInst;
    use ironwasm_structure::modules::Module;

    fn store_with_one_page() -> Store {
        let mut store = Store::new(Module::default());
        store.mems.push(MemInst::new(MemType {
            limits: Limits { min: 1, max: None },
        }));
        store
    }

    fn write_u32_le(store: &mut Store, addr: usize, value: u32) {
        store.mems[0].data[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn fd_write_unknown_fd_is_badf_and_zeroes_nwritten() {
        let mut store = store_with_one_page();
        write_u32_le(&mut store, 20, 0xDEAD_BEEF);
        let result = wasi_fd_write(
            &mut store,
            &[Val::I32(5), Val::I32(0), Val::I32(0), Val::I32(20)],
        );
        assert!(!result.trapped);
        assert_eq!(result.values, vec![Val::I32(ERRNO_BADF)]);
        assert_eq!(read_u32_le(&store.mems[0].data, 20), 0);
    }

    #[test]
    fn fd_write_faults_on_out_of_range_pointers() {
        let mut store = store_with_one_page();
        // iovec list past the end of memory
        let result = wasi_fd_write(
            &mut store,
            &[Val::I32(1), Val::I32(65530), Val::I32(1), Val::I32(0)],
        );
        assert_eq!(result.values, vec![Val::I32(ERRNO_FAULT)]);

        // iovec whose buffer runs off the end
        write_u32_le(&mut store, 8, 65530);
        write_u32_le(&mut store, 12, 100);
        let result = wasi_fd_write(
            &mut store,
            &[Val::I32(1), Val::I32(8), Val::I32(1), Val::I32(0)],
        );
        assert_eq!(result.values, vec![Val::I32(ERRNO_FAULT)]);
    }

    #[test]
    fn fd_write_reports_the_total_written() {
        let mut store = store_with_one_page();
        store.mems[0].data[100..105].copy_from_slice(b"hello");
        write_u32_le(&mut store, 8, 100);
        write_u32_le(&mut store, 12, 5);
        write_u32_le(&mut store, 16, 100);
        write_u32_le(&mut store, 20, 2);
        let result = wasi_fd_write(
            &mut store,
            &[Val::I32(2), Val::I32(8), Val::I32(2), Val::I32(40)],
        );
        assert_eq!(result.values, vec![Val::I32(ERRNO_SUCCESS)]);
        assert_eq!(read_u32_le(&store.mems[0].data, 40), 7);
    }

    #[test]
    fn fd_write_without_memory_traps() {
        let mut store = Store::new(Module::default());
        let result = wasi_fd_write(
            &mut store,
            &[Val::I32(1), Val::I32(0), Val::I32(0), Val::I32(0)],
        );
        assert!(result.trapped);
        assert!(result.trap_message.contains("requires linear memory"));
    }

    #[test]
    fn proc_exit_encodes_the_code_in_its_message() {
        let mut store = Store::new(Module::default());
        let result = wasi_proc_exit(&mut store, &[Val::I32(-3)]);
        assert!(result.trapped);
        assert_eq!(result.trap_message, "wasi::proc_exit(-3)");
    }

    #[test]
    fn default_registry_carries_the_wasi_entries() {
        let registry = HostRegistry::with_wasi_preview1();
        let fd_write = registry
            .function("wasi_snapshot_preview1", "fd_write")
            .expect("fd_write registered");
        assert_eq!(fd_write.type_.params.len(), 4);
        assert_eq!(fd_write.type_.results, vec![ValType::I32]);
        assert!(registry.function("wasi_snapshot_preview1", "proc_exit").is_some());
        assert!(registry.function("wasi_snapshot_preview1", "fd_read").is_none());
    }
}
