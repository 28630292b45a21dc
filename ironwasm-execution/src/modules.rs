//! Module instantiation: import resolution, constant-expression
//! evaluation, segment application, export table, start function.

use std::fmt;

use ironwasm_structure::modules::*;
use ironwasm_structure::types::*;
use tracing::debug;

use crate::host::HostRegistry;
use crate::instructions;
use crate::runtime_structure::*;

#[derive(Debug)]
pub enum InstantiationError {
    /// Missing or mismatched imports, bad indices, bad initializers.
    Link(String),
    /// Active segment application or the start function trapped.
    Trap(Trap),
}

impl fmt::Display for InstantiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstantiationError::Link(message) => f.write_str(message),
            InstantiationError::Trap(trap) => write!(f, "instantiation trapped: {trap}"),
        }
    }
}

impl std::error::Error for InstantiationError {}

type IResult<T> = Result<T, InstantiationError>;

fn link_err<T>(message: String) -> IResult<T> {
    Err(InstantiationError::Link(message))
}

/// Evaluates a constant expression against the globals instantiated so
/// far (imports precede local globals).
pub fn evaluate_constexpr(expr: &ConstExpr, globals: &[GlobalInst]) -> IResult<Val> {
    match expr {
        ConstExpr::I32Const(n) => Ok(Val::I32(*n)),
        ConstExpr::I64Const(n) => Ok(Val::I64(*n)),
        ConstExpr::F32Const(z) => Ok(Val::F32(*z)),
        ConstExpr::F64Const(z) => Ok(Val::F64(*z)),
        ConstExpr::GlobalGet(index) => globals
            .get(*index as usize)
            .map(|g| g.value)
            .ok_or_else(|| {
                InstantiationError::Link("Constant expression global index out of bounds".into())
            }),
        ConstExpr::RefNull(rt) => Ok(Val::null_ref(*rt)),
        ConstExpr::RefFunc(index) => Ok(Val::FuncRef(Some(*index))),
    }
}

/// Builds a live store from a decoded module, then runs the start
/// function if there is one.
pub fn instantiate(module: Module, host: &HostRegistry) -> IResult<Store> {
    let mut store = Store::new(module);

    resolve_imports(&mut store, host)?;
    instantiate_functions(&mut store)?;
    instantiate_globals(&mut store)?;
    instantiate_memories(&mut store);
    instantiate_tables(&mut store);
    prepare_data_segments(&mut store);
    apply_data_segments(&mut store)?;
    apply_element_segments(&mut store)?;
    build_export_table(&mut store);

    debug!(
        funcs = store.funcs.len(),
        mems = store.mems.len(),
        tables = store.tables.len(),
        globals = store.globals.len(),
        exports = store.exports.len(),
        "module instantiated"
    );

    if let Some(start) = store.module.start {
        debug!(func = start, "running start function");
        instructions::invoke(&mut store, start, &[]).map_err(InstantiationError::Trap)?;
    }

    Ok(store)
}

fn resolve_imports(store: &mut Store, host: &HostRegistry) -> IResult<()> {
    let Store { module, funcs, tables, mems, globals, .. } = store;
    for import in &module.imports {
        let who = format!("{}.{}", import.module, import.name);
        match &import.desc {
            ImportDesc::Func(type_index) => {
                let Some(expected) = module.types.get(*type_index as usize) else {
                    return link_err("Imported function references invalid type index".into());
                };
                let Some(record) = host.function(&import.module, &import.name) else {
                    return link_err(format!("Missing host function import: {who}"));
                };
                if record.type_.params != expected.params
                    || record.type_.results != expected.results
                {
                    return link_err(format!("Host function signature mismatch for import: {who}"));
                }
                funcs.push(FuncInst::Host {
                    type_: record.type_.clone(),
                    hostcode: record.callback.clone(),
                });
            }
            ImportDesc::Mem(memtype) => {
                let Some(record) = host.memory(&import.module, &import.name) else {
                    return link_err(format!("Missing host memory import: {who}"));
                };
                if record.type_.limits != memtype.limits {
                    return link_err(format!("Host memory limits mismatch for import: {who}"));
                }
                let mut instance = MemInst::new(*memtype);
                if !record.data.is_empty() {
                    if record.data.len() % PAGE_SIZE != 0 {
                        return link_err(format!(
                            "Host memory import size must be a multiple of the page size: {who}"
                        ));
                    }
                    let min_bytes = memtype.limits.min as usize * PAGE_SIZE;
                    if record.data.len() < min_bytes {
                        return link_err(format!(
                            "Host memory import smaller than declared minimum pages for import: {who}"
                        ));
                    }
                    if let Some(max) = memtype.limits.max {
                        if record.data.len() / PAGE_SIZE > max as usize {
                            return link_err(format!(
                                "Host memory import exceeds declared maximum pages for import: {who}"
                            ));
                        }
                    }
                    instance.data = record.data.clone();
                }
                mems.push(instance);
            }
            ImportDesc::Table(tabletype) => {
                let Some(record) = host.table(&import.module, &import.name) else {
                    return link_err(format!("Missing host table import: {who}"));
                };
                if record.type_ != *tabletype {
                    return link_err(format!("Host table type mismatch for import: {who}"));
                }
                let mut instance = TableInst::new(*tabletype);
                if !record.elements.is_empty() {
                    if record.elements.len() < tabletype.limits.min as usize {
                        return link_err(format!(
                            "Host table import provides fewer elements than minimum for import: {who}"
                        ));
                    }
                    if let Some(max) = tabletype.limits.max {
                        if record.elements.len() > max as usize {
                            return link_err(format!(
                                "Host table import exceeds maximum entries for import: {who}"
                            ));
                        }
                    }
                    if record.elements.iter().any(|v| v.ty() != instance.valtype) {
                        return link_err(format!(
                            "Host table element type mismatch for import: {who}"
                        ));
                    }
                    instance.elements = record.elements.clone();
                }
                tables.push(instance);
            }
            ImportDesc::Global(globaltype) => {
                let Some(record) = host.global(&import.module, &import.name) else {
                    return link_err(format!("Missing host global import: {who}"));
                };
                if record.type_ != *globaltype {
                    return link_err(format!("Host global type mismatch for import: {who}"));
                }
                if record.value.ty() != globaltype.valtype {
                    return link_err(format!("Host global value type mismatch for import: {who}"));
                }
                globals.push(GlobalInst { type_: *globaltype, value: record.value });
            }
        }
    }
    Ok(())
}

fn instantiate_functions(store: &mut Store) -> IResult<()> {
    let Store { module, funcs, .. } = store;
    for (index, type_index) in module.funcs.iter().enumerate() {
        let Some(type_) = module.types.get(*type_index as usize) else {
            return link_err("Function type index out of range".into());
        };
        funcs.push(FuncInst::Local { type_: type_.clone(), code: index });
    }
    Ok(())
}

fn instantiate_globals(store: &mut Store) -> IResult<()> {
    let Store { module, globals, .. } = store;
    for global in &module.globals {
        let value = evaluate_constexpr(&global.init, globals)?;
        globals.push(GlobalInst { type_: global.type_, value });
    }
    Ok(())
}

fn instantiate_memories(store: &mut Store) {
    let Store { module, mems, .. } = store;
    for memtype in &module.mems {
        mems.push(MemInst::new(*memtype));
    }
}

fn instantiate_tables(store: &mut Store) {
    let Store { module, tables, .. } = store;
    for tabletype in &module.tables {
        tables.push(TableInst::new(*tabletype));
    }
}

fn prepare_data_segments(store: &mut Store) {
    let Store { module, datas, .. } = store;
    datas.clear();
    for segment in &module.data {
        datas.push(DataInst {
            bytes: segment.init.clone(),
            passive: segment.passive,
            dropped: false,
        });
    }
}

fn apply_data_segments(store: &mut Store) -> IResult<()> {
    let Store { module, mems, globals, .. } = store;
    for segment in &module.data {
        if segment.passive {
            continue;
        }
        let Some(mem) = mems.get_mut(segment.mem as usize) else {
            return link_err("Data segment references missing memory".into());
        };
        let Some(offset_expr) = &segment.offset else {
            return link_err("Active data segment is missing its offset".into());
        };
        let offset = match evaluate_constexpr(offset_expr, globals)? {
            Val::I32(n) => n as u32 as usize,
            _ => return link_err("Data segment offset must be i32".into()),
        };
        if offset as u64 + segment.init.len() as u64 > mem.data.len() as u64 {
            return Err(InstantiationError::Trap(Trap::new("Data segment out of bounds")));
        }
        mem.data[offset..offset + segment.init.len()].copy_from_slice(&segment.init);
    }
    Ok(())
}

fn apply_element_segments(store: &mut Store) -> IResult<()> {
    let Store { module, tables, globals, .. } = store;
    for segment in &module.elems {
        let Some(table) = tables.get_mut(segment.table as usize) else {
            return link_err("Element segment references missing table".into());
        };
        let offset = match evaluate_constexpr(&segment.offset, globals)? {
            Val::I32(n) => n as u32 as usize,
            _ => return link_err("Element segment offset must be i32".into()),
        };
        if table.valtype != ValType::FuncRef {
            return link_err("Element segment cannot initialize non-funcref table".into());
        }
        if offset as u64 + segment.init.len() as u64 > table.elements.len() as u64 {
            return Err(InstantiationError::Trap(Trap::new("Element segment out of bounds")));
        }
        for (i, func_index) in segment.init.iter().enumerate() {
            table.elements[offset + i] = Val::FuncRef(Some(*func_index));
        }
    }
    Ok(())
}

fn build_export_table(store: &mut Store) {
    let Store { module, exports, .. } = store;
    exports.clear();
    for export in &module.exports {
        exports.insert(export.name.clone(), export.desc);
    }
}
