// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::binary_reader::BinaryReader;
use crate::error::ErrorKind;
use crate::limits::{
    MAX_WASM_DATA_SEGMENTS, MAX_WASM_ELEMENT_SEGMENTS, MAX_WASM_EXPORTS, MAX_WASM_FUNCTIONS,
    MAX_WASM_GLOBALS, MAX_WASM_IMPORTS, MAX_WASM_MEMORIES, MAX_WASM_TABLES, MAX_WASM_TYPES,
    ReaderConfig,
};
use crate::module::{Module, WASM_MAGIC_BYTES, WASM_VERSION};

const CUSTOM_SECTION: u8 = 0;
const TYPE_SECTION: u8 = 1;
const IMPORT_SECTION: u8 = 2;
const FUNCTION_SECTION: u8 = 3;
const TABLE_SECTION: u8 = 4;
const MEMORY_SECTION: u8 = 5;
const GLOBAL_SECTION: u8 = 6;
const EXPORT_SECTION: u8 = 7;
const START_SECTION: u8 = 8;
const ELEMENT_SECTION: u8 = 9;
const CODE_SECTION: u8 = 10;
const DATA_SECTION: u8 = 11;

pub(crate) fn parse_module(bytes: &[u8], config: &ReaderConfig) -> crate::Result<Module> {
    let mut reader = BinaryReader::new(bytes, 0, config);

    let magic = reader.read_array::<4>()?;
    if magic != WASM_MAGIC_BYTES {
        return Err(BinaryReader::error_at(ErrorKind::BadMagic, 0));
    }
    let version = reader.read_u32_le()?;
    if version != WASM_VERSION {
        return Err(BinaryReader::error_at(ErrorKind::UnsupportedVersion(version), 4));
    }

    let mut module = Module::new(magic, version);
    let mut last_id = CUSTOM_SECTION;

    while !reader.eof() {
        let id_offset = reader.original_position();
        let id = reader.read_u8()?;
        let size = reader.read_var_u32()? as usize;

        if id > DATA_SECTION {
            return Err(BinaryReader::error_at(ErrorKind::UnknownSection(id), id_offset));
        }
        if id != CUSTOM_SECTION {
            if id <= last_id {
                return Err(BinaryReader::error_at(ErrorKind::SectionOutOfOrder(id), id_offset));
            }
            last_id = id;
        }

        let mut section = reader.sub_reader(size)?;
        read_section(&mut section, id, &mut module).map_err(|err| {
            // running out of section bytes means the declared size is too small
            if *err.kind() == ErrorKind::UnexpectedEof {
                section.error(ErrorKind::SectionSizeMismatch(size, section.position()))
            } else {
                err
            }
        })?;

        if !section.eof() {
            return Err(section.error(ErrorKind::SectionSizeMismatch(size, section.position())));
        }
    }

    if module.functions.len() != module.code.len() {
        return Err(reader.error(ErrorKind::FunctionCodeMismatch(
            module.functions.len(),
            module.code.len(),
        )));
    }

    log::trace!(
        "decoded module: {} types, {} imports, {} functions, {} exports",
        module.types.len(),
        module.imports.len(),
        module.functions.len(),
        module.exports.len()
    );

    Ok(module)
}

fn read_section(reader: &mut BinaryReader<'_>, id: u8, module: &mut Module) -> crate::Result<()> {
    match id {
        CUSTOM_SECTION => {
            let custom = reader.read_custom_section()?;
            log::debug!("Parsing custom section {:?}...", custom.name);
            module.customs.push(custom);
        }
        TYPE_SECTION => {
            log::debug!("Parsing type section...");
            module.types = reader.read_vec(MAX_WASM_TYPES, "types", BinaryReader::read_func_type)?;
        }
        IMPORT_SECTION => {
            log::debug!("Parsing import section...");
            module.imports =
                reader.read_vec(MAX_WASM_IMPORTS, "imports", BinaryReader::read_import)?;
        }
        FUNCTION_SECTION => {
            log::debug!("Parsing function section...");
            module.functions =
                reader.read_vec(MAX_WASM_FUNCTIONS, "functions", BinaryReader::read_type_idx)?;
        }
        TABLE_SECTION => {
            log::debug!("Parsing table section...");
            module.tables =
                reader.read_vec(MAX_WASM_TABLES, "tables", BinaryReader::read_table_type)?;
        }
        MEMORY_SECTION => {
            log::debug!("Parsing memory section...");
            module.memories =
                reader.read_vec(MAX_WASM_MEMORIES, "memories", BinaryReader::read_memory_type)?;
        }
        GLOBAL_SECTION => {
            log::debug!("Parsing global section...");
            module.globals =
                reader.read_vec(MAX_WASM_GLOBALS, "globals", BinaryReader::read_global)?;
        }
        EXPORT_SECTION => {
            log::debug!("Parsing export section...");
            module.exports =
                reader.read_vec(MAX_WASM_EXPORTS, "exports", BinaryReader::read_export)?;
        }
        START_SECTION => {
            log::debug!("Parsing start section...");
            module.start = Some(reader.read_func_idx()?);
        }
        ELEMENT_SECTION => {
            log::debug!("Parsing element section...");
            module.elements = reader.read_vec(
                MAX_WASM_ELEMENT_SEGMENTS,
                "element segments",
                BinaryReader::read_element,
            )?;
        }
        CODE_SECTION => {
            log::debug!("Parsing code section...");
            module.code = reader.read_vec(
                MAX_WASM_FUNCTIONS,
                "function bodies",
                BinaryReader::read_function_body,
            )?;
        }
        DATA_SECTION => {
            log::debug!("Parsing data section...");
            module.data =
                reader.read_vec(MAX_WASM_DATA_SEGMENTS, "data segments", BinaryReader::read_data)?;
        }
        _ => unreachable!("section ids are range checked before dispatch"),
    }

    Ok(())
}
