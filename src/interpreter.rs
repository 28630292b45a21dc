//! The embedder-facing façade: load, invoke, memory access, and host
//! registration.

use std::fmt;
use std::rc::Rc;

use ironwasm_binary_format::{parse_binary_format, ParseError};
use ironwasm_execution::host::HostRegistry;
use ironwasm_execution::instructions;
use ironwasm_execution::modules::{instantiate, InstantiationError};
use ironwasm_execution::runtime_structure::{HostResult, Store, Val};
use ironwasm_structure::modules::{ExportDesc, Module};
use ironwasm_structure::types::{FuncType, GlobalType, MemType, TableType, ValType};
use tracing::debug;

/// Outcome of [`Interpreter::invoke`]: either the export's results or a
/// trap message. Traps unwind the invocation but leave all prior side
/// effects in place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionResult {
    pub trapped: bool,
    pub trap_message: String,
    pub values: Vec<Val>,
}

impl ExecutionResult {
    fn trap(message: impl Into<String>) -> Self {
        ExecutionResult {
            trapped: true,
            trap_message: message.into(),
            values: Vec::new(),
        }
    }
}

/// Fatal `load` failure. Structural, never a trap.
#[derive(Debug)]
pub enum LoadError {
    Parse(ParseError),
    Instantiation(InstantiationError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Parse(e) => write!(f, "failed to decode module: {e}"),
            LoadError::Instantiation(e) => write!(f, "failed to instantiate module: {e}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Parse(e) => Some(e),
            LoadError::Instantiation(e) => Some(e),
        }
    }
}

/// One interpreter owns one instantiated module plus the host registry
/// its imports resolve against. Single-threaded and synchronous: an
/// `invoke` returns when the export finishes or traps.
pub struct Interpreter {
    registry: HostRegistry,
    store: Option<Store>,
}

impl Interpreter {
    /// A fresh interpreter with the default `wasi_snapshot_preview1`
    /// hosts (`fd_write`, `proc_exit`) registered.
    pub fn new() -> Self {
        Interpreter {
            registry: HostRegistry::with_wasi_preview1(),
            store: None,
        }
    }

    /// Parses and instantiates a module, replacing any prior runtime
    /// state. Registration of host imports must happen before this.
    pub fn load(&mut self, bytes: &[u8]) -> Result<(), LoadError> {
        self.store = None;
        let module = parse_binary_format(bytes).map_err(LoadError::Parse)?;
        debug!(bytes = bytes.len(), funcs = module.funcs.len(), "module decoded");
        let store = instantiate(module, &self.registry).map_err(LoadError::Instantiation)?;
        self.store = Some(store);
        Ok(())
    }

    /// Calls a function export. Runtime violations surface as a trapped
    /// result carrying a textual reason.
    pub fn invoke(&mut self, export_name: &str, args: &[Val]) -> ExecutionResult {
        let Some(store) = self.store.as_mut() else {
            return ExecutionResult::trap("No module loaded");
        };
        let desc = match store.exports.get(export_name) {
            Some(desc) => *desc,
            None => return ExecutionResult::trap(format!("Export not found: {export_name}")),
        };
        let ExportDesc::Func(index) = desc else {
            return ExecutionResult::trap(format!("Export is not a function: {export_name}"));
        };
        match instructions::invoke(store, index, args) {
            Ok(values) => ExecutionResult {
                trapped: false,
                trap_message: String::new(),
                values,
            },
            Err(trap) => ExecutionResult::trap(trap.message),
        }
    }

    /// Mutable view of the first memory's bytes. Valid until the next
    /// mutating operation (invoke, load).
    pub fn memory(&mut self) -> Option<&mut [u8]> {
        self.store
            .as_mut()?
            .mems
            .first_mut()
            .map(|mem| mem.data.as_mut_slice())
    }

    /// The decoded module, immutable once loaded.
    pub fn module(&self) -> Option<&Module> {
        self.store.as_ref().map(|store| &store.module)
    }

    pub fn register_host_function<F>(
        &mut self,
        module: &str,
        name: &str,
        params: Vec<ValType>,
        results: Vec<ValType>,
        callback: F,
    ) where
        F: Fn(&[Val]) -> HostResult + 'static,
    {
        let type_ = FuncType { params, results };
        self.registry
            .register_function(module, name, type_, Rc::new(move |_store, args| callback(args)));
    }

    pub fn register_host_memory(&mut self, module: &str, name: &str, type_: MemType, data: Vec<u8>) {
        self.registry.register_memory(module, name, type_, data);
    }

    pub fn register_host_table(
        &mut self,
        module: &str,
        name: &str,
        type_: TableType,
        elements: Vec<Val>,
    ) {
        self.registry.register_table(module, name, type_, elements);
    }

    pub fn register_host_global(&mut self, module: &str, name: &str, type_: GlobalType, value: Val) {
        self.registry.register_global(module, name, type_, value);
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}
