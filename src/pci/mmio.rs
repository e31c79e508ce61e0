/*!
BAR-backed MMIO register block.

Every port and device maps one register block behind BAR0. The block is
RAM-floored: offsets with no architected register behave as plain
memory, which is what lets software scribble scratch values anywhere in
the BAR and read them back. One architected window is carved out: the
HDM decoder capability at [`HDM_CAP_OFFSET`].

HDM decoder register window, one 32-byte slot per decoder:

```plaintext
+0x00  capability      decoder count in the low byte
+0x04  global control  bit 1: decoder enable
+0x10 + i*0x20:
  +0x00 base_lo   +0x04 base_hi
  +0x08 size_lo   +0x0C size_hi
  +0x10 control   ig[3:0], iw[7:4], bit 9 commit (w), bit 10 committed (r)
  +0x14 target list / DPA skip lo     (switch / device flavour)
  +0x18 target list / DPA skip hi
```

Writing the control register with the commit bit set gathers the staged
base/size/interleave/target values and commits the decoder; the
committed bit reports success. A rejected commit leaves the committed
bit clear and the decoder bank untouched.
*/

use tracing::warn;

use crate::hdm::{DecoderInfo, HdmDecoderBank};

/// Offset of the HDM decoder capability window inside the block
pub const HDM_CAP_OFFSET: u64 = 0x1000;
/// Stride of one decoder's register slot
pub const HDM_DECODER_STRIDE: u64 = 0x20;
/// First decoder slot, relative to the capability window
pub const HDM_FIRST_DECODER: u64 = 0x10;

const CTRL_COMMIT: u32 = 1 << 9;
const CTRL_COMMITTED: u32 = 1 << 10;

pub struct MmioRegisterBlock<const SWITCH: bool> {
    ram: Vec<u8>,
    decoders: HdmDecoderBank<SWITCH>,
}

pub type SwitchMmio = MmioRegisterBlock<true>;
pub type DeviceMmio = MmioRegisterBlock<false>;

impl<const SWITCH: bool> MmioRegisterBlock<SWITCH> {
    pub fn new(size: usize, decoder_count: usize) -> Self {
        let mut block = Self {
            ram: vec![0; size],
            decoders: HdmDecoderBank::new(decoder_count),
        };
        block.poke32(HDM_CAP_OFFSET, decoder_count as u32);
        block
    }

    pub fn size(&self) -> usize {
        self.ram.len()
    }

    pub fn decoders(&self) -> &HdmDecoderBank<SWITCH> {
        &self.decoders
    }

    fn poke32(&mut self, at: u64, value: u32) {
        let at = at as usize;
        if at + 4 <= self.ram.len() {
            self.ram[at..at + 4].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn peek32(&self, at: u64) -> u32 {
        let at = at as usize;
        if at + 4 <= self.ram.len() {
            u32::from_le_bytes(self.ram[at..at + 4].try_into().unwrap())
        } else {
            0
        }
    }

    pub fn read32(&self, at: u64) -> u32 {
        self.peek32(at)
    }

    pub fn read64(&self, at: u64) -> u64 {
        u64::from(self.peek32(at)) | u64::from(self.peek32(at + 4)) << 32
    }

    pub fn write32(&mut self, at: u64, value: u32) {
        if at == HDM_CAP_OFFSET {
            // Capability register is read-only
            return;
        }
        if at == HDM_CAP_OFFSET + 4 {
            self.decoders.decoder_enable(value & 0b10 != 0);
            self.poke32(at, value);
            return;
        }
        if let Some(index) = self.decoder_ctrl_index(at) {
            self.write_decoder_ctrl(index, value);
            return;
        }
        self.poke32(at, value);
    }

    pub fn write64(&mut self, at: u64, value: u64) {
        self.write32(at, value as u32);
        self.write32(at + 4, (value >> 32) as u32);
    }

    fn decoder_slot(index: usize) -> u64 {
        HDM_CAP_OFFSET + HDM_FIRST_DECODER + index as u64 * HDM_DECODER_STRIDE
    }

    fn decoder_ctrl_index(&self, at: u64) -> Option<usize> {
        let first = HDM_CAP_OFFSET + HDM_FIRST_DECODER;
        let end = first + self.decoders.decoder_count() as u64 * HDM_DECODER_STRIDE;
        if (first..end).contains(&at) && (at - first) % HDM_DECODER_STRIDE == 0x10 {
            Some(((at - first) / HDM_DECODER_STRIDE) as usize)
        } else {
            None
        }
    }

    fn write_decoder_ctrl(&mut self, index: usize, value: u32) {
        let slot = Self::decoder_slot(index);
        if value & CTRL_COMMIT == 0 {
            self.poke32(slot + 0x10, value & !CTRL_COMMITTED);
            return;
        }
        let aux = self.read64(slot + 0x14);
        let info = DecoderInfo {
            base: self.read64(slot),
            size: self.read64(slot + 0x08),
            ig: (value & 0xF) as u8,
            iw: ((value >> 4) & 0xF) as u8,
            dpa_skip: if SWITCH { 0 } else { aux },
            target_ports: if SWITCH {
                aux.to_le_bytes().to_vec()
            } else {
                Vec::new()
            },
        };
        match self.decoders.commit(index, &info) {
            Ok(()) => self.poke32(slot + 0x10, (value & !CTRL_COMMIT) | CTRL_COMMITTED),
            Err(error) => {
                warn!(index, %error, "decoder commit rejected");
                self.poke32(slot + 0x10, value & !(CTRL_COMMIT | CTRL_COMMITTED));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ram_floor_reads_back_writes() {
        let mut block = SwitchMmio::new(0x10_0000, 4);
        block.write32(0x0, 0xDEAD_BEEF);
        assert_eq!(block.read32(0x0), 0xDEAD_BEEF);
        block.write64(0x8, 0x1122_3344_5566_7788);
        assert_eq!(block.read64(0x8), 0x1122_3344_5566_7788);
        // Unbacked offsets read zero
        assert_eq!(block.read32(0x20_0000), 0);
    }

    #[test]
    fn commit_through_registers_programs_the_decoder() {
        let mut block = SwitchMmio::new(0x10_0000, 4);
        let slot = HDM_CAP_OFFSET + HDM_FIRST_DECODER;
        block.write64(slot, 0x1_0000_0000);
        block.write64(slot + 0x08, 0x10_0000);
        // Targets ports 1 and 2, two-way, 256 B granularity
        block.write64(slot + 0x14, 0x0201);
        block.write32(slot + 0x10, CTRL_COMMIT | 0x1 << 4);
        assert_eq!(block.read32(slot + 0x10) & CTRL_COMMITTED, CTRL_COMMITTED);
        block.write32(HDM_CAP_OFFSET + 4, 0b10);
        assert!(block.decoders().is_enabled());
        assert_eq!(block.decoders().get_target(0x1_0000_0000), Some(1));
        assert_eq!(block.decoders().get_target(0x1_0000_0100), Some(2));
    }

    #[test]
    fn rejected_commit_clears_committed() {
        let mut block = DeviceMmio::new(0x10_0000, 1);
        let slot = HDM_CAP_OFFSET + HDM_FIRST_DECODER;
        block.write64(slot, 0x1000);
        block.write64(slot + 0x08, 0x1000);
        // Reserved interleave-ways encoding 0x7
        block.write32(slot + 0x10, CTRL_COMMIT | 0x7 << 4);
        assert_eq!(block.read32(slot + 0x10) & CTRL_COMMITTED, 0);
    }

    #[test]
    fn capability_register_is_read_only() {
        let mut block = DeviceMmio::new(0x10_0000, 8);
        block.write32(HDM_CAP_OFFSET, 0xFFFF);
        assert_eq!(block.read32(HDM_CAP_OFFSET), 8);
    }
}
