//! AVR part definitions: signature, ISP instruction set, memory regions.
//!
//! Parts are described in YAML files under `devices/`, with each ISP
//! instruction given as a 32-token bit specification (see [`crate::opcode`]).
//! Loading compiles every instruction once and validates the memory geometry.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::opcode::Opcode;

/// The standard ISP instruction primitives a part or memory may define.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    PgmEnable,
    ChipErase,
    Read,
    Write,
    ReadLo,
    ReadHi,
    WriteLo,
    WriteHi,
    LoadpageLo,
    LoadpageHi,
    LoadExtAddr,
    Writepage,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::PgmEnable => "program enable",
            OpKind::ChipErase => "chip erase",
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::ReadLo => "read low byte",
            OpKind::ReadHi => "read high byte",
            OpKind::WriteLo => "write low byte",
            OpKind::WriteHi => "write high byte",
            OpKind::LoadpageLo => "load page low byte",
            OpKind::LoadpageHi => "load page high byte",
            OpKind::LoadExtAddr => "load extended address",
            OpKind::Writepage => "write page",
        };
        write!(f, "{}", name)
    }
}

/// One non-volatile memory region of a part.
#[derive(Debug, Clone)]
pub struct Memory {
    pub name: String,
    pub size: u32,
    pub page_size: u32,
    pub num_pages: u32,
    pub paged: bool,
    pub min_write_delay_us: u32,
    pub max_write_delay_us: u32,
    /// Candidate values read back from an erased cell, for completion checks.
    pub readback: [u8; 2],
    /// In-memory image of the region, filled by reads and drained by writes.
    pub buf: Vec<u8>,
    ops: HashMap<OpKind, Opcode>,
}

impl Memory {
    pub fn op(&self, kind: OpKind) -> Option<&Opcode> {
        self.ops.get(&kind)
    }
}

/// A programmable AVR device.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: String,
    pub signature: [u8; 3],
    pub chip_erase_delay_us: u32,
    ops: HashMap<OpKind, Opcode>,
    pub memories: Vec<Memory>,
}

impl Part {
    /// Part-wide instruction (program enable, chip erase).
    pub fn op(&self, kind: OpKind) -> Option<&Opcode> {
        self.ops.get(&kind)
    }

    pub fn memory(&self, name: &str) -> Option<&Memory> {
        self.memories.iter().find(|m| m.name == name)
    }

    pub fn memory_mut(&mut self, name: &str) -> Option<&mut Memory> {
        self.memories.iter_mut().find(|m| m.name == name)
    }

    fn from_raw(raw: RawPart) -> Result<Part, ConfigError> {
        let mut memories = Vec::with_capacity(raw.memories.len());
        for m in raw.memories {
            if m.paged && m.size != m.page_size * m.num_pages {
                return Err(ConfigError::PageSizeMismatch {
                    name: m.name,
                    size: m.size,
                    page_size: m.page_size,
                    num_pages: m.num_pages,
                });
            }
            memories.push(Memory {
                buf: vec![0xff; m.size as usize],
                name: m.name,
                size: m.size,
                page_size: m.page_size,
                num_pages: m.num_pages,
                paged: m.paged,
                min_write_delay_us: m.min_write_delay,
                max_write_delay_us: m.max_write_delay,
                readback: m.readback,
                ops: compile_ops(m.ops)?,
            });
        }
        Ok(Part {
            name: raw.name,
            signature: raw.signature,
            chip_erase_delay_us: raw.chip_erase_delay,
            ops: compile_ops(raw.ops)?,
            memories,
        })
    }
}

impl fmt::Display for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (signature 0x{})",
            self.name,
            hex::encode(self.signature)
        )
    }
}

fn compile_ops(raw: HashMap<OpKind, String>) -> Result<HashMap<OpKind, Opcode>, ConfigError> {
    raw.into_iter()
        .map(|(kind, spec)| Ok((kind, Opcode::compile(&spec)?)))
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPart {
    name: String,
    signature: [u8; 3],
    /// Chip erase settle time in microseconds.
    chip_erase_delay: u32,
    #[serde(default)]
    ops: HashMap<OpKind, String>,
    #[serde(default)]
    memories: Vec<RawMemory>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMemory {
    name: String,
    size: u32,
    #[serde(default = "default_page_size")]
    page_size: u32,
    #[serde(default = "default_num_pages")]
    num_pages: u32,
    #[serde(default)]
    paged: bool,
    #[serde(default)]
    min_write_delay: u32,
    #[serde(default)]
    max_write_delay: u32,
    #[serde(default = "default_readback")]
    readback: [u8; 2],
    #[serde(default)]
    ops: HashMap<OpKind, String>,
}

fn default_page_size() -> u32 {
    1
}

fn default_num_pages() -> u32 {
    1
}

fn default_readback() -> [u8; 2] {
    [0xff, 0xff]
}

/// The built-in part database, embedded at compile time.
pub struct PartDb {
    parts: Vec<Part>,
}

impl PartDb {
    pub fn load() -> Result<PartDb, ConfigError> {
        Ok(PartDb {
            parts: vec![
                Part::from_yaml(include_str!("../devices/atmega328p.yaml"))?,
                Part::from_yaml(include_str!("../devices/atmega2560.yaml"))?,
            ],
        })
    }

    pub fn find(name: &str) -> Result<Part, ConfigError> {
        let db = PartDb::load()?;
        db.parts
            .into_iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| ConfigError::Description(format!("unknown part {:?}", name)))
    }

    pub fn names() -> Result<Vec<String>, ConfigError> {
        Ok(PartDb::load()?.parts.into_iter().map(|p| p.name).collect())
    }
}

impl Part {
    pub fn from_yaml(yaml: &str) -> Result<Part, ConfigError> {
        let raw: RawPart =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Description(e.to_string()))?;
        Part::from_raw(raw)
    }
}
