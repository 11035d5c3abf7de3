// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::indices::{DefinedFuncIdx, FuncIdx, GlobalIdx, MemIdx, TableIdx, TypeIdx};
use crate::instructions::{BlockType, Expr};
use crate::types::{FuncType, GlobalType, MemoryType, TableType, ValType};
use cranelift_entity::EntityRef;

pub const WASM_MAGIC_BYTES: [u8; 4] = *b"\0asm";
pub const WASM_VERSION: u32 = 0x01;

/// A custom section, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomSection {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub desc: ImportDesc,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ImportDesc {
    Func(TypeIdx),
    Table(TableType),
    Memory(MemoryType),
    Global(GlobalType),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub name: String,
    pub desc: ExportDesc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportDesc {
    Func(FuncIdx),
    Table(TableIdx),
    Memory(MemIdx),
    Global(GlobalIdx),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub ty: GlobalType,
    pub init: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub mode: ElementMode,
    pub items: Vec<FuncIdx>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ElementMode {
    Passive,
    Active { table: TableIdx, offset: Expr },
    Declarative,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub mode: DataMode,
    pub init: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DataMode {
    Passive,
    Active { memory: MemIdx, offset: Expr },
}

/// A run of `count` locals sharing one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Locals {
    pub count: u32,
    pub ty: ValType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    pub(crate) locals: Vec<Locals>,
    pub(crate) body: Expr,
}

impl FunctionBody {
    #[must_use]
    pub fn locals(&self) -> &[Locals] {
        &self.locals
    }

    /// Total number of declared locals, not counting parameters.
    #[must_use]
    pub fn num_locals(&self) -> u32 {
        self.locals.iter().map(|l| l.count).sum()
    }

    /// The declared locals, one entry per local.
    pub fn local_types(&self) -> impl Iterator<Item = ValType> + '_ {
        self.locals
            .iter()
            .flat_map(|l| core::iter::repeat_n(l.ty, l.count as usize))
    }

    #[must_use]
    pub fn body(&self) -> &Expr {
        &self.body
    }
}

/// A decoded module.
///
/// Produced once by [`decode`](crate::decode) and read-only afterwards. The
/// module owns all of its data so it can outlive the input buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub(crate) magic: [u8; 4],
    pub(crate) version: u32,
    pub(crate) customs: Vec<CustomSection>,
    pub(crate) types: Vec<FuncType>,
    pub(crate) imports: Vec<Import>,
    pub(crate) functions: Vec<TypeIdx>,
    pub(crate) tables: Vec<TableType>,
    pub(crate) memories: Vec<MemoryType>,
    pub(crate) globals: Vec<Global>,
    pub(crate) exports: Vec<Export>,
    pub(crate) start: Option<FuncIdx>,
    pub(crate) elements: Vec<Element>,
    pub(crate) code: Vec<FunctionBody>,
    pub(crate) data: Vec<Data>,
}

impl Module {
    pub(crate) fn new(magic: [u8; 4], version: u32) -> Self {
        Self {
            magic,
            version,
            customs: Vec::new(),
            types: Vec::new(),
            imports: Vec::new(),
            functions: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            exports: Vec::new(),
            start: None,
            elements: Vec::new(),
            code: Vec::new(),
            data: Vec::new(),
        }
    }

    #[must_use]
    pub fn magic(&self) -> [u8; 4] {
        self.magic
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn custom_sections(&self) -> &[CustomSection] {
        &self.customs
    }

    #[must_use]
    pub fn types(&self) -> &[FuncType] {
        &self.types
    }

    #[must_use]
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    /// Type indices of the functions defined by this module.
    #[must_use]
    pub fn functions(&self) -> &[TypeIdx] {
        &self.functions
    }

    #[must_use]
    pub fn tables(&self) -> &[TableType] {
        &self.tables
    }

    #[must_use]
    pub fn memories(&self) -> &[MemoryType] {
        &self.memories
    }

    #[must_use]
    pub fn globals(&self) -> &[Global] {
        &self.globals
    }

    #[must_use]
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    #[must_use]
    pub fn start(&self) -> Option<FuncIdx> {
        self.start
    }

    #[must_use]
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    #[must_use]
    pub fn code(&self) -> &[FunctionBody] {
        &self.code
    }

    #[must_use]
    pub fn data(&self) -> &[Data] {
        &self.data
    }

    pub fn func_types_of_imports(&self) -> impl Iterator<Item = TypeIdx> + '_ {
        self.imports.iter().filter_map(|import| match import.desc {
            ImportDesc::Func(ty) => Some(ty),
            _ => None,
        })
    }

    #[must_use]
    pub fn num_imported_funcs(&self) -> usize {
        self.func_types_of_imports().count()
    }

    #[must_use]
    pub fn num_imported_globals(&self) -> usize {
        self.imports
            .iter()
            .filter(|import| matches!(import.desc, ImportDesc::Global(_)))
            .count()
    }

    #[must_use]
    pub fn num_imported_memories(&self) -> usize {
        self.imports
            .iter()
            .filter(|import| matches!(import.desc, ImportDesc::Memory(_)))
            .count()
    }

    /// Size of the function index space, imports included.
    #[must_use]
    pub fn num_funcs(&self) -> usize {
        self.num_imported_funcs() + self.functions.len()
    }

    /// Size of the global index space, imports included.
    #[must_use]
    pub fn num_globals(&self) -> usize {
        self.num_imported_globals() + self.globals.len()
    }

    /// Whether the module has a linear memory, imported or defined.
    #[must_use]
    pub fn has_memory(&self) -> bool {
        !self.memories.is_empty() || self.num_imported_memories() > 0
    }

    #[must_use]
    pub fn has_table(&self) -> bool {
        !self.tables.is_empty()
            || self
                .imports
                .iter()
                .any(|import| matches!(import.desc, ImportDesc::Table(_)))
    }

    #[must_use]
    pub fn func_type_at(&self, ty: TypeIdx) -> Option<&FuncType> {
        self.types.get(ty.index())
    }

    /// Resolves the signature of any function in the function index space.
    #[must_use]
    pub fn func_type(&self, func: FuncIdx) -> Option<&FuncType> {
        let num_imported = self.num_imported_funcs();
        let ty = if func.index() < num_imported {
            self.func_types_of_imports().nth(func.index())?
        } else {
            *self.functions.get(func.index() - num_imported)?
        };
        self.func_type_at(ty)
    }

    /// Maps a defined function to its position in the function index space.
    #[must_use]
    pub fn func_index(&self, defined: DefinedFuncIdx) -> FuncIdx {
        FuncIdx::new(self.num_imported_funcs() + defined.index())
    }

    #[must_use]
    pub fn defined_func_index(&self, func: FuncIdx) -> Option<DefinedFuncIdx> {
        func.index()
            .checked_sub(self.num_imported_funcs())
            .filter(|idx| *idx < self.functions.len())
            .map(DefinedFuncIdx::new)
    }

    #[must_use]
    pub fn defined_func_type(&self, defined: DefinedFuncIdx) -> Option<&FuncType> {
        self.func_type_at(*self.functions.get(defined.index())?)
    }

    pub fn global_type(&self, global: GlobalIdx) -> Option<GlobalType> {
        let num_imported = self.num_imported_globals();
        if global.index() < num_imported {
            self.imports
                .iter()
                .filter_map(|import| match import.desc {
                    ImportDesc::Global(ty) => Some(ty),
                    _ => None,
                })
                .nth(global.index())
        } else {
            self.globals
                .get(global.index() - num_imported)
                .map(|global| global.ty)
        }
    }

    /// The parameters and results of a block with type `ty`, or `None` if `ty`
    /// names a type index that doesn't exist.
    #[must_use]
    pub fn block_signature(&self, ty: BlockType) -> Option<(&[ValType], &[ValType])> {
        static RESULTS: [ValType; 4] = [ValType::I32, ValType::I64, ValType::F32, ValType::F64];

        match ty {
            BlockType::Empty => Some((&[], &[])),
            BlockType::Value(ty) => {
                let pos = RESULTS.iter().position(|r| *r == ty)?;
                Some((&[], &RESULTS[pos..=pos]))
            }
            BlockType::FuncType(idx) => {
                let ty = self.func_type_at(idx)?;
                Some((ty.params(), ty.results()))
            }
        }
    }

    /// Looks up an export by name.
    #[must_use]
    pub fn export(&self, name: &str) -> Option<ExportDesc> {
        self.exports
            .iter()
            .find(|export| export.name == name)
            .map(|export| export.desc)
    }
}
