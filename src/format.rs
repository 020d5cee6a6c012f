//! Firmware file formats.
//!
//! Accepts raw binary, plain hex, Intel HEX and ELF images. Sparse images
//! are flattened into one contiguous buffer with the gaps filled with the
//! flash erased value.

use std::str;
use std::{borrow::Cow, path::Path};

use anyhow::Result;
use object::{
    elf::FileHeader32, elf::PT_LOAD, read::elf::FileHeader, read::elf::ProgramHeader, Endianness,
};

/// Erased flash cell value, used to fill gaps between image sections.
const FILL: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FirmwareFormat {
    PlainHex,
    IntelHex,
    Elf,
    Binary,
}

pub fn read_firmware_from_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let p = path.as_ref();
    let raw = std::fs::read(p)?;

    let format = guess_format(p, &raw);
    log::info!("Read {} as {:?} format", p.display(), format);
    match format {
        FirmwareFormat::PlainHex => {
            let clean: Vec<u8> = raw
                .into_iter()
                .filter(|c| !c.is_ascii_whitespace())
                .collect();
            Ok(hex::decode(clean)?)
        }
        FirmwareFormat::IntelHex => read_ihex(str::from_utf8(&raw)?),
        FirmwareFormat::Elf => objcopy_binary(&raw),
        FirmwareFormat::Binary => Ok(raw),
    }
}

pub fn guess_format(path: &Path, raw: &[u8]) -> FirmwareFormat {
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "h86", "hex", "a43", "a90"].contains(&&*ext) {
        return FirmwareFormat::IntelHex;
    }

    if raw.starts_with(&[0x7f, b'E', b'L', b'F']) {
        FirmwareFormat::Elf
    } else if raw.first() == Some(&b':')
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b':' || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::IntelHex
    } else if !raw.is_empty()
        && raw
            .iter()
            .all(|&c| c.is_ascii_hexdigit() || c == b'\n' || c == b'\r')
    {
        FirmwareFormat::PlainHex
    } else {
        FirmwareFormat::Binary
    }
}

pub fn read_ihex(data: &str) -> Result<Vec<u8>> {
    use ihex::Record;

    let mut base_address = 0;
    let mut sections: Vec<(u32, Cow<[u8]>)> = vec![];
    for record in ihex::Reader::new(data) {
        match record? {
            Record::Data { offset, value } => {
                sections.push((base_address + offset as u32, value.into()));
            }
            Record::ExtendedSegmentAddress(address) => {
                base_address = (address as u32) * 16;
            }
            Record::ExtendedLinearAddress(address) => {
                base_address = (address as u32) << 16;
            }
            Record::EndOfFile
            | Record::StartSegmentAddress { .. }
            | Record::StartLinearAddress(_) => (),
        };
    }
    merge_sections(sections)
}

/// Simulates `objcopy -O binary`: concatenates the loadable segments at
/// their physical addresses.
pub fn objcopy_binary(elf_data: &[u8]) -> Result<Vec<u8>> {
    match object::FileKind::parse(elf_data)? {
        object::FileKind::Elf32 => (),
        _ => anyhow::bail!("cannot read file as ELF32 format"),
    }
    let elf_header = FileHeader32::<Endianness>::parse(elf_data)?;
    let endian = elf_header.endian()?;

    let mut sections: Vec<(u32, Cow<[u8]>)> = vec![];
    for segment in elf_header.program_headers(endian, elf_data)? {
        if segment.p_type(endian) != PT_LOAD {
            continue;
        }
        let segment_data = segment
            .data(endian, elf_data)
            .map_err(|_| anyhow::format_err!("failed to access data for an ELF segment"))?;
        if segment_data.is_empty() {
            continue;
        }
        let p_paddr: u64 = segment.p_paddr(endian).into();
        log::debug!(
            "loadable segment: physical address {:#010x}, {} bytes",
            p_paddr,
            segment_data.len()
        );
        sections.push((p_paddr as u32, segment_data.into()));
    }

    merge_sections(sections)
}

/// Writes memory content to a file, as Intel HEX when the extension asks
/// for it and raw binary otherwise.
pub fn write_firmware_to_file<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let p = path.as_ref();
    let ext = p
        .extension()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default()
        .to_lowercase();
    if ["ihex", "ihe", "hex"].contains(&&*ext) {
        std::fs::write(p, to_ihex(data)?)?;
    } else {
        std::fs::write(p, data)?;
    }
    Ok(())
}

pub fn to_ihex(data: &[u8]) -> Result<String> {
    use ihex::Record;

    let mut upper = 0u16;
    let mut records = vec![];
    for (i, chunk) in data.chunks(16).enumerate() {
        let addr = i as u32 * 16;
        let hi = (addr >> 16) as u16;
        if hi != upper {
            records.push(Record::ExtendedLinearAddress(hi));
            upper = hi;
        }
        records.push(Record::Data {
            offset: (addr & 0xffff) as u16,
            value: chunk.to_vec(),
        });
    }
    records.push(Record::EndOfFile);
    Ok(ihex::create_object_file_representation(&records)?)
}

fn merge_sections(mut sections: Vec<(u32, Cow<[u8]>)>) -> Result<Vec<u8>> {
    sections.sort(); // order by start address

    let (first, last) = match (sections.first(), sections.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => anyhow::bail!("empty firmware image"),
    };
    let start_address = first.0;
    let total_size = last.0 + last.1.len() as u32 - start_address;

    let mut binary = vec![FILL; total_size as usize];
    for (addr, sect) in &sections {
        let sect_start = (addr - start_address) as usize;
        let sect_end = sect_start + sect.len();
        anyhow::ensure!(sect_end <= binary.len(), "overlapping firmware sections");
        binary[sect_start..sect_end].copy_from_slice(sect);
    }
    Ok(binary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ihex_records_merge_with_gap_fill() {
        // two data records with a 4-byte hole between them
        let image = read_ihex(
            ":0400000001020304F2\n:04000800AABBCCDDE6\n:00000001FF\n",
        )
        .unwrap();
        assert_eq!(
            image,
            [0x01, 0x02, 0x03, 0x04, 0xff, 0xff, 0xff, 0xff, 0xaa, 0xbb, 0xcc, 0xdd]
        );
    }

    #[test]
    fn format_guessing() {
        let p = Path::new("firmware.hex");
        assert_eq!(guess_format(p, b"whatever"), FirmwareFormat::IntelHex);

        let p = Path::new("firmware.bin");
        assert_eq!(
            guess_format(p, &[0x7f, b'E', b'L', b'F', 0x01]),
            FirmwareFormat::Elf
        );
        assert_eq!(
            guess_format(p, b":0400000001020304F2\n"),
            FirmwareFormat::IntelHex
        );
        assert_eq!(guess_format(p, b"0102cafe\n"), FirmwareFormat::PlainHex);
        assert_eq!(guess_format(p, &[0x0c, 0x94]), FirmwareFormat::Binary);
    }

    #[test]
    fn ihex_output_round_trips() {
        let data: Vec<u8> = (0..80u8).collect();
        let text = to_ihex(&data).unwrap();
        assert_eq!(read_ihex(&text).unwrap(), data);
    }

    #[test]
    fn plain_hex_ignores_line_breaks() {
        let p = Path::new("x.bin");
        assert_eq!(guess_format(p, b"0c94\r\n5c00\r\n"), FirmwareFormat::PlainHex);
    }
}
