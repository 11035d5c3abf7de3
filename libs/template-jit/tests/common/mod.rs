// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A minimal embedder for running compiled modules in tests.

#![allow(dead_code, reason = "not every test uses every helper")]

use code_memory::{CodeArena, CodeBlob};
use core::ffi::c_void;
use cranelift_entity::EntityRef;
use template_jit::{EntryFn, RuntimeCall, TemplateCompiler, TrapKind, VMContext, X86_64Compiler};
use wasm_decode::test_utils::{FuncBody, ModuleBuilder};
use wasm_decode::{
    DataMode, ElementMode, ExportDesc, FuncIdx, FuncType, GlobalType, Instruction, Limits, Module,
    Mutability, PAGE_SIZE, TypeIdx, ValType,
};

/// Everything the runtime callbacks need, reached through
/// `VMContext::host_data`.
struct Host {
    module: Module,
    memory: Vec<u8>,
    max_pages: u32,
    table: Vec<Option<FuncIdx>>,
    functions: Vec<*const u8>,
    traps_handled: usize,
}

pub struct Instance {
    arena: CodeArena,
    blobs: Vec<CodeBlob>,
    globals: Vec<u64>,
    host: Box<Host>,
    vmctx: Box<VMContext>,
}

impl Instance {
    pub fn new(bytes: &[u8]) -> Self {
        Self::with_imports(bytes, &[])
    }

    /// Instantiates the module with host functions for its function imports,
    /// in import order.
    pub fn with_imports(bytes: &[u8], imports: &[EntryFn]) -> Self {
        let module = wasm_decode::decode(bytes).unwrap();
        assert_eq!(module.num_imported_funcs(), imports.len());

        let arena = CodeArena::new();
        let blobs = X86_64Compiler::new()
            .compile_module(&module, &arena)
            .unwrap();

        let mut functions: Vec<*const u8> = imports.iter().map(|f| *f as *const u8).collect();
        functions.extend(blobs.iter().map(CodeBlob::as_ptr));

        let globals = module
            .globals()
            .iter()
            .map(|global| const_value(global.init.instructions()))
            .collect();

        let (memory, max_pages) = match module.memories().first() {
            Some(ty) => (
                vec![0; ty.limits.min as usize * PAGE_SIZE as usize],
                ty.limits.max.unwrap_or(wasm_decode::MAX_PAGES),
            ),
            None => (Vec::new(), 0),
        };
        let table = match module.tables().first() {
            Some(ty) => vec![None; ty.limits.min as usize],
            None => Vec::new(),
        };

        let mut host = Box::new(Host {
            module,
            memory,
            max_pages,
            table,
            functions,
            traps_handled: 0,
        });

        for data in host.module.data() {
            if let DataMode::Active { offset, .. } = &data.mode {
                let start = usize::try_from(const_value(offset.instructions())).unwrap();
                host.memory[start..start + data.init.len()].copy_from_slice(&data.init);
            }
        }
        let mut entries = Vec::new();
        for elem in host.module.elements() {
            if let ElementMode::Active { offset, .. } = &elem.mode {
                let start = usize::try_from(const_value(offset.instructions())).unwrap();
                for (i, func) in elem.items.iter().enumerate() {
                    entries.push((start + i, *func));
                }
            }
        }
        for (slot, func) in entries {
            host.table[slot] = Some(func);
        }

        let mut instance = Self {
            arena,
            blobs,
            globals,
            host,
            vmctx: Box::new(VMContext::new()),
        };
        instance.sync_context();
        instance
    }

    fn sync_context(&mut self) {
        let vmctx = &mut *self.vmctx;
        vmctx.memory_base = self.host.memory.as_mut_ptr();
        vmctx.memory_len = self.host.memory.len() as u64;
        vmctx.globals = self.globals.as_mut_ptr();
        vmctx.functions = self.host.functions.as_ptr();
        vmctx.runtime_call = runtime_call;
        vmctx.trap_handler = trap_handler;
        vmctx.host_data = (&raw mut *self.host).cast::<c_void>();
    }

    /// Calls the exported function `name`.
    pub fn invoke(&mut self, name: &str, args: &[u64]) -> Result<u64, TrapKind> {
        let Some(ExportDesc::Func(func)) = self.host.module.export(name) else {
            panic!("no exported function `{name}`");
        };
        let params = self.host.module.func_type(func).unwrap().params().len();
        assert_eq!(params, args.len(), "wrong number of arguments for `{name}`");

        let entry = self.host.functions[func.index()];
        self.vmctx.clear_trap();
        // Safety: the pointer is either a compiled function or a host import,
        // both with the entry signature, and the context is fully set up.
        let result = unsafe {
            let f: EntryFn = core::mem::transmute(entry);
            f(&raw mut *self.vmctx, args.as_ptr())
        };
        match self.vmctx.trap() {
            Some(trap) => {
                assert_eq!(result, 0, "trapping functions return zero");
                Err(trap)
            }
            None => Ok(result),
        }
    }

    pub fn invoke_i32(&mut self, name: &str, args: &[i32]) -> Result<i32, TrapKind> {
        let args: Vec<u64> = args.iter().map(|a| u64::from(a.cast_unsigned())).collect();
        self.invoke(name, &args)
            .map(|r| u32::try_from(r).expect("i32 results are zero-extended").cast_signed())
    }

    pub fn invoke_i64(&mut self, name: &str, args: &[i64]) -> Result<i64, TrapKind> {
        let args: Vec<u64> = args.iter().map(|a| a.cast_unsigned()).collect();
        self.invoke(name, &args).map(u64::cast_signed)
    }

    pub fn memory(&self) -> &[u8] {
        &self.host.memory
    }

    pub fn memory_mut(&mut self) -> &mut [u8] {
        &mut self.host.memory
    }

    pub fn global(&self, index: usize) -> u64 {
        self.globals[index]
    }

    pub fn set_table(&mut self, slot: usize, func: Option<u32>) {
        self.host.table[slot] = func.map(FuncIdx::from_u32);
    }

    pub fn traps_handled(&self) -> usize {
        self.host.traps_handled
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        for blob in self.blobs.drain(..) {
            self.arena.free(blob);
        }
    }
}

fn const_value(init: &[Instruction]) -> u64 {
    match init.first() {
        Some(Instruction::I32Const(v)) => u64::from(v.cast_unsigned()),
        Some(Instruction::I64Const(v)) => v.cast_unsigned(),
        Some(Instruction::F32Const(v)) => u64::from(v.bits()),
        Some(Instruction::F64Const(v)) => v.bits(),
        other => panic!("unsupported constant expression {other:?}"),
    }
}

/// # Safety
///
/// `vmctx` must be the context of a live [`Instance`].
unsafe fn host<'a>(vmctx: *mut VMContext) -> &'a mut Host {
    // Safety: ensured by caller
    unsafe { &mut *(*vmctx).host_data.cast::<Host>() }
}

unsafe extern "sysv64" fn runtime_call(vmctx: *mut VMContext, call: u32, arg0: u64, arg1: u64) -> u64 {
    // Safety: compiled code passes the context it was entered with
    let host = unsafe { host(vmctx) };
    match RuntimeCall::from_u32(call) {
        Some(RuntimeCall::MemoryGrow) => {
            let old = u32::try_from(host.memory.len() / PAGE_SIZE as usize).unwrap();
            let Some(new) = u32::try_from(arg0)
                .ok()
                .and_then(|delta| old.checked_add(delta))
                .filter(|new| *new <= host.max_pages)
            else {
                return u64::from(u32::MAX);
            };
            host.memory.resize(new as usize * PAGE_SIZE as usize, 0);
            // Safety: see above
            unsafe {
                (*vmctx).memory_base = host.memory.as_mut_ptr();
                (*vmctx).memory_len = host.memory.len() as u64;
            }
            u64::from(old)
        }
        Some(RuntimeCall::ResolveIndirect) => {
            let trap = |kind: TrapKind| {
                // Safety: see above
                unsafe { (*vmctx).trap_code = kind.code() };
                0
            };
            let Some(entry) = usize::try_from(arg1).ok().and_then(|i| host.table.get(i)) else {
                return trap(TrapKind::TableOutOfBounds);
            };
            let Some(func) = *entry else {
                return trap(TrapKind::IndirectCallToNull);
            };
            let expected = host.module.func_type_at(TypeIdx::from_u32(u32::try_from(arg0).unwrap()));
            if expected != host.module.func_type(func) {
                return trap(TrapKind::BadSignature);
            }
            host.functions[func.index()] as u64
        }
        None => panic!("unknown runtime call {call}"),
    }
}

unsafe extern "sysv64" fn trap_handler(vmctx: *mut VMContext) {
    // Safety: compiled code passes the context it was entered with
    let host = unsafe { host(vmctx) };
    // Safety: see above
    let code = unsafe { (*vmctx).trap_code };
    log::debug!("trap {:?}", TrapKind::from_code(code));
    host.traps_handled += 1;
}

/// Describes a module function by function, emitting the sections in the
/// order the binary format wants them.
#[derive(Debug, Default, Clone)]
pub struct TestModule {
    types: Vec<FuncType>,
    imports: Vec<(String, u32)>,
    funcs: Vec<(String, u32, FuncBody)>,
    table: Option<u32>,
    memory: Option<Limits>,
    globals: Vec<(GlobalType, i64)>,
    elements: Vec<(i32, Vec<u32>)>,
    data: Vec<(i32, Vec<u8>)>,
}

impl TestModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of `ty` in the type section, adding it if needed.
    pub fn type_index(&mut self, ty: &FuncType) -> u32 {
        let idx = self.types.iter().position(|t| t == ty).unwrap_or_else(|| {
            self.types.push(ty.clone());
            self.types.len() - 1
        });
        u32::try_from(idx).unwrap()
    }

    /// Imports a function from module `env`. Imports have to be declared
    /// before any function.
    pub fn import(mut self, name: &str, ty: &FuncType) -> Self {
        assert!(self.funcs.is_empty());
        let ty = self.type_index(ty);
        self.imports.push((name.to_owned(), ty));
        self
    }

    /// Adds a function exported as `name`.
    pub fn func(mut self, name: &str, ty: &FuncType, body: FuncBody) -> Self {
        let ty = self.type_index(ty);
        self.funcs.push((name.to_owned(), ty, body));
        self
    }

    pub fn table(mut self, size: u32) -> Self {
        self.table = Some(size);
        self
    }

    pub fn memory(mut self, min: u32, max: Option<u32>) -> Self {
        self.memory = Some(Limits { min, max });
        self
    }

    pub fn global(mut self, ty: ValType, mutability: Mutability, init: i64) -> Self {
        self.globals.push((GlobalType { ty, mutability }, init));
        self
    }

    pub fn elements(mut self, offset: i32, funcs: &[u32]) -> Self {
        self.elements.push((offset, funcs.to_vec()));
        self
    }

    pub fn data(mut self, offset: i32, bytes: &[u8]) -> Self {
        self.data.push((offset, bytes.to_vec()));
        self
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut builder = ModuleBuilder::new().types(&self.types);
        if !self.imports.is_empty() {
            let imports: Vec<(&str, &str, u32)> = self
                .imports
                .iter()
                .map(|(name, ty)| ("env", name.as_str(), *ty))
                .collect();
            builder = builder.func_imports(&imports);
        }
        let types: Vec<u32> = self.funcs.iter().map(|(_, ty, _)| *ty).collect();
        builder = builder.functions(&types);
        if let Some(size) = self.table {
            builder = builder.table(Limits { min: size, max: None });
        }
        if let Some(limits) = self.memory {
            builder = builder.memory(limits);
        }
        if !self.globals.is_empty() {
            builder = builder.globals(&self.globals);
        }

        let first = self.imports.len();
        let exports: Vec<(&str, u8, u32)> = self
            .funcs
            .iter()
            .enumerate()
            .map(|(i, (name, _, _))| (name.as_str(), 0, u32::try_from(first + i).unwrap()))
            .collect();
        builder = builder.exports(&exports);

        if !self.elements.is_empty() {
            let segments: Vec<(i32, &[u32])> = self
                .elements
                .iter()
                .map(|(offset, funcs)| (*offset, funcs.as_slice()))
                .collect();
            builder = builder.elements(&segments);
        }
        let bodies: Vec<FuncBody> = self.funcs.iter().map(|(_, _, body)| body.clone()).collect();
        builder = builder.code(&bodies);
        if !self.data.is_empty() {
            let segments: Vec<(i32, &[u8])> = self
                .data
                .iter()
                .map(|(offset, bytes)| (*offset, bytes.as_slice()))
                .collect();
            builder = builder.data(&segments);
        }
        builder.finish()
    }

    pub fn instantiate(&self) -> Instance {
        Instance::new(&self.encode())
    }

    pub fn instantiate_with(&self, imports: &[EntryFn]) -> Instance {
        Instance::with_imports(&self.encode(), imports)
    }
}

pub fn sig(params: &[ValType], results: &[ValType]) -> FuncType {
    FuncType::new(params.iter().copied(), results.iter().copied())
}

/// Compiles and runs a module with the single function `f`.
pub fn run(ty: &FuncType, body: FuncBody, args: &[u64]) -> Result<u64, TrapKind> {
    TestModule::new().func("f", ty, body).instantiate().invoke("f", args)
}
