//! Device programming logic.
//!
//! Drives a [`Programmer`] through the full update flow: enter programming
//! mode, check the device signature, then erase, write, read and verify
//! memory regions page by page.

use anyhow::{Context, Result};
use indicatif::ProgressBar;

use crate::part::Part;
use crate::programmer::Programmer;

pub struct Flashing {
    programmer: Box<dyn Programmer>,
    pub part: Part,
}

impl Flashing {
    /// Enters programming mode and verifies the device signature before
    /// anything else touches the target.
    pub fn open(programmer: Box<dyn Programmer>, part: Part) -> Result<Flashing> {
        let mut f = Flashing { programmer, part };
        f.programmer.enable(&f.part)?;
        f.programmer.initialize(&f.part)?;

        let signature = f.read_signature()?;
        if signature != f.part.signature {
            f.programmer.disable();
            f.programmer.close();
            anyhow::bail!(
                "signature mismatch: {} has 0x{}, device reads 0x{}",
                f.part.name,
                hex::encode(f.part.signature),
                hex::encode(signature)
            );
        }
        log::debug!("device signature 0x{} matches", hex::encode(signature));
        Ok(f)
    }

    pub fn dump_info(&mut self) -> Result<()> {
        self.programmer.display("");
        log::info!("Part: {}", self.part);
        for mem in &self.part.memories {
            log::debug!(
                "Memory {}: {} bytes, {} pages of {}",
                mem.name,
                mem.size,
                mem.num_pages,
                mem.page_size
            );
        }
        for name in ["lfuse", "hfuse", "efuse", "lock"] {
            if let Some(mem) = self.part.memory(name) {
                let value = self.programmer.read_byte(mem, 0)?;
                log::info!("{}: 0x{:02x}", name, value);
            }
        }
        Ok(())
    }

    pub fn read_signature(&mut self) -> Result<[u8; 3]> {
        let mem = self
            .part
            .memory("signature")
            .context("part has no signature memory")?;
        let mut signature = [0u8; 3];
        for (i, byte) in signature.iter_mut().enumerate() {
            *byte = self.programmer.read_byte(mem, i as u32)?;
        }
        Ok(signature)
    }

    pub fn erase(&mut self) -> Result<()> {
        self.programmer.chip_erase(&self.part)?;
        log::info!("Chip erased");
        Ok(())
    }

    /// Writes `raw` to flash, padded to a whole number of pages with the
    /// erased value.
    pub fn flash(&mut self, raw: &[u8]) -> Result<()> {
        let mem = self.part.memory_mut("flash").context("part has no flash")?;
        anyhow::ensure!(
            raw.len() <= mem.size as usize,
            "firmware size {} exceeds flash size {}",
            raw.len(),
            mem.size
        );

        let page = mem.page_size as usize;
        let len = raw.len().div_ceil(page) * page;
        mem.buf[..raw.len()].copy_from_slice(raw);
        mem.buf[raw.len()..len].fill(0xff);

        let bar = ProgressBar::new(len as u64);
        for addr in (0..len).step_by(page) {
            self.programmer.paged_write(mem, addr as u32, page as u32)?;
            bar.inc(page as u64);
        }
        bar.finish_and_clear();
        log::info!("Flash written: {} bytes ({} pages)", len, len / page);
        Ok(())
    }

    /// Reads flash back and compares it against `raw`.
    pub fn verify(&mut self, raw: &[u8]) -> Result<()> {
        let mem = self.part.memory_mut("flash").context("part has no flash")?;
        anyhow::ensure!(
            raw.len() <= mem.size as usize,
            "firmware size {} exceeds flash size {}",
            raw.len(),
            mem.size
        );

        let page = mem.page_size as usize;
        let len = raw.len().div_ceil(page) * page;
        mem.buf.fill(0xff);

        let bar = ProgressBar::new(len as u64);
        for addr in (0..len).step_by(page) {
            self.programmer.paged_load(mem, addr as u32, page as u32)?;
            bar.inc(page as u64);
        }
        bar.finish_and_clear();

        if let Some(offset) = raw.iter().zip(&mem.buf).position(|(a, b)| a != b) {
            let start = offset & !0xf;
            let end = (start + 64).min(raw.len());
            let mut dump = Vec::new();
            hxdmp::hexdump(&mem.buf[start..end], &mut dump)?;
            log::warn!(
                "device contents near 0x{:06x}:\n{}",
                start,
                String::from_utf8_lossy(&dump)
            );
            anyhow::bail!(
                "verification failed at 0x{:06x}: expected 0x{:02x}, read 0x{:02x}",
                offset,
                raw[offset],
                mem.buf[offset]
            );
        }
        log::info!("Flash verified: {} bytes", raw.len());
        Ok(())
    }

    /// Reads a whole memory region, paged where the region supports it.
    pub fn read_memory(&mut self, name: &str) -> Result<Vec<u8>> {
        let mem = self
            .part
            .memory_mut(name)
            .with_context(|| format!("part has no memory {:?}", name))?;

        if mem.paged && mem.page_size > 1 {
            let page = mem.page_size as usize;
            let bar = ProgressBar::new(mem.size as u64);
            for addr in (0..mem.size as usize).step_by(page) {
                self.programmer.paged_load(mem, addr as u32, page as u32)?;
                bar.inc(page as u64);
            }
            bar.finish_and_clear();
            Ok(mem.buf.clone())
        } else {
            let mut data = Vec::with_capacity(mem.size as usize);
            for addr in 0..mem.size {
                data.push(self.programmer.read_byte(mem, addr)?);
            }
            Ok(data)
        }
    }

    /// Leaves programming mode and drops the USB handle.
    pub fn release(&mut self) {
        self.programmer.disable();
        self.programmer.close();
    }
}
