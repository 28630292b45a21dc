//! A standalone interpreter for WebAssembly 1.0 modules with selected
//! post-MVP extensions: non-trapping float-to-int conversion, bulk
//! memory, reference types, and multi-value results.
//!
//! The [`Interpreter`] façade decodes a binary module, resolves imports
//! from the host registry, instantiates runtime state, and executes
//! exported functions:
//!
//! ```
//! use ironwasm::{Interpreter, Val};
//!
//! let wasm = wat::parse_str(
//!     r#"(module (func (export "add") (param i32 i32) (result i32)
//!            local.get 0
//!            local.get 1
//!            i32.add))"#,
//! ).unwrap();
//!
//! let mut interp = Interpreter::new();
//! interp.load(&wasm).unwrap();
//! let result = interp.invoke("add", &[Val::I32(8), Val::I32(7)]);
//! assert!(!result.trapped);
//! assert_eq!(result.values, vec![Val::I32(15)]);
//! ```

pub use ironwasm_binary_format as binary_format;
pub use ironwasm_execution as execution;
pub use ironwasm_structure as structure;

mod interpreter;

pub use interpreter::{ExecutionResult, Interpreter, LoadError};

pub use execution::host::HostRegistry;
pub use execution::runtime_structure::{HostResult, Trap, Val};
pub use structure::modules::Module;
pub use structure::types::{
    FuncType, GlobalType, Limits, MemType, Mut, RefType, TableType, ValType,
};
