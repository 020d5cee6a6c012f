//! AVR ISP instruction templates.
//!
//! Every ISP primitive is a 4-byte SPI instruction. Device descriptions
//! specify each of its 32 bits with one token (`0`, `1`, `x`, `i`, `o`,
//! `a`/`aN`), most significant bit first. The specification is compiled once
//! into an [`Opcode`] at load time and then encoded many times against an
//! address/data operand while programming.

use std::fmt;

use crate::error::ConfigError;

/// Role of a single instruction bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitKind {
    /// Fixed `0` bit.
    Literal0,
    /// Fixed `1` bit.
    Literal1,
    /// Don't care, transmitted as `0`.
    Ignore,
    /// Carries the given bit of the address operand.
    Address(u8),
    /// Carries a bit of the data operand; bit numbering restarts per byte.
    Input,
    /// Filled by the device in the response, transmitted as `0`.
    Output,
}

/// One bit slot of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdBit {
    pub kind: BitKind,
    /// Position within the containing byte, 7 = most significant.
    pub bit_index: u8,
}

/// A compiled 32-bit ISP instruction template.
///
/// `bits[0]` is instruction bit 31, the first bit shifted out on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opcode {
    bits: [CmdBit; 32],
}

impl Opcode {
    /// Compiles a textual bit specification. Tokens are separated by spaces
    /// and/or commas; exactly 32 are required.
    ///
    /// A bare `a` addresses by its absolute bit position in the instruction;
    /// `aN` names address bit `N` explicitly.
    pub fn compile(spec: &str) -> Result<Opcode, ConfigError> {
        let tokens: Vec<&str> = spec
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .collect();
        if tokens.len() != 32 {
            return Err(ConfigError::TokenCount(tokens.len()));
        }

        let mut bits = [CmdBit {
            kind: BitKind::Ignore,
            bit_index: 0,
        }; 32];
        for (pos, token) in tokens.iter().enumerate() {
            let kind = match *token {
                "0" => BitKind::Literal0,
                "1" => BitKind::Literal1,
                "x" => BitKind::Ignore,
                "i" => BitKind::Input,
                "o" => BitKind::Output,
                "a" => BitKind::Address(31 - pos as u8),
                t if t.starts_with('a') => match t[1..].parse::<u8>() {
                    Ok(n) if n < 32 => BitKind::Address(n),
                    _ => {
                        return Err(ConfigError::BadToken {
                            pos,
                            token: t.to_string(),
                        })
                    }
                },
                t => {
                    return Err(ConfigError::BadToken {
                        pos,
                        token: t.to_string(),
                    })
                }
            };
            bits[pos] = CmdBit {
                kind,
                bit_index: 7 - (pos % 8) as u8,
            };
        }
        Ok(Opcode { bits })
    }

    /// Builds the concrete 4-byte instruction for an address/data operand.
    ///
    /// Output and ignore slots are transmitted as zero; the device overwrites
    /// output positions in its response.
    pub fn encode(&self, address: u32, data_in: u8) -> [u8; 4] {
        let mut cmd = [0u8; 4];
        for (pos, bit) in self.bits.iter().enumerate() {
            let set = match bit.kind {
                BitKind::Literal1 => true,
                BitKind::Literal0 | BitKind::Ignore | BitKind::Output => false,
                BitKind::Address(n) => (address >> n) & 1 == 1,
                BitKind::Input => (data_in >> bit.bit_index) & 1 == 1,
            };
            if set {
                cmd[pos / 8] |= 1 << bit.bit_index;
            }
        }
        cmd
    }

    /// Collects the output-kind bits of a 4-byte response into one byte.
    pub fn decode_output(&self, response: &[u8; 4]) -> u8 {
        let mut data = 0u8;
        for (pos, bit) in self.bits.iter().enumerate() {
            if bit.kind == BitKind::Output && response[pos / 8] & (1 << bit.bit_index) != 0 {
                data |= 1 << bit.bit_index;
            }
        }
        data
    }

    /// Reconstructs the address operand from an encoded instruction.
    /// Inverse of the address part of [`Opcode::encode`].
    pub fn decode_address(&self, cmd: &[u8; 4]) -> u32 {
        let mut address = 0u32;
        for (pos, bit) in self.bits.iter().enumerate() {
            if let BitKind::Address(n) = bit.kind {
                if cmd[pos / 8] & (1 << bit.bit_index) != 0 {
                    address |= 1 << n;
                }
            }
        }
        address
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pos, bit) in self.bits.iter().enumerate() {
            if pos > 0 && pos % 8 == 0 {
                write!(f, " ")?;
            }
            match bit.kind {
                BitKind::Literal0 => write!(f, "0")?,
                BitKind::Literal1 => write!(f, "1")?,
                BitKind::Ignore => write!(f, "x")?,
                BitKind::Address(n) => write!(f, "a{}", n)?,
                BitKind::Input => write!(f, "i")?,
                BitKind::Output => write!(f, "o")?,
            }
        }
        Ok(())
    }
}
