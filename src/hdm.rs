/*!
HDM decoders.

A host-managed device memory decoder translates a host physical address
into a target. Two flavours share one interface: the *switch* decoder
maps an HPA to a downstream port index through its target list, the
*device* decoder maps an HPA to a device physical address. A decoder is
enabled by a commit and disabled (size 0) otherwise; the in-range test
is `base <= hpa < base + size`.

The device translation splits the HPA offset at the interleave
granularity boundary:

```plaintext
ig_bytes = 1 << (ig + 8)                      # 256 B for ig = 0
low      = offset mod ig_bytes
high     = offset >> (log2(ig_bytes) + iw)    # power-of-two ways
dpa      = dpa_base + (low | high << log2(ig_bytes))
```

For 3, 6 and 12 ways the high part is instead divided by three — the
same tie-break real silicon implements, kept verbatim so interleaved
topologies decode identically.
*/

use displaydoc::Display as DisplayDoc;
use snafu::Snafu;
use tracing::debug;

/// Interleave granularity register encodings
#[derive(DisplayDoc, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterleaveGranularity {
    /// 256 B
    Size256B = 0x0,
    /// 512 B
    Size512B = 0x1,
    /// 1 KiB
    Size1K = 0x2,
    /// 2 KiB
    Size2K = 0x3,
    /// 4 KiB
    Size4K = 0x4,
    /// 8 KiB
    Size8K = 0x5,
    /// 16 KiB
    Size16K = 0x6,
}

impl InterleaveGranularity {
    pub fn from_encoding(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => Self::Size256B,
            0x1 => Self::Size512B,
            0x2 => Self::Size1K,
            0x3 => Self::Size2K,
            0x4 => Self::Size4K,
            0x5 => Self::Size8K,
            0x6 => Self::Size16K,
            _ => return None,
        })
    }

    /// Register encoding: granularity in bytes is `1 << (encoding + 8)`
    pub fn bytes(self) -> u64 {
        1 << (self as u64 + 8)
    }

    pub fn shift(self) -> u32 {
        self as u32 + 8
    }
}

#[derive(DisplayDoc, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InterleaveWays {
    /// 1 way
    Way1 = 0x0,
    /// 2 ways
    Way2 = 0x1,
    /// 4 ways
    Way4 = 0x2,
    /// 8 ways
    Way8 = 0x3,
    /// 16 ways
    Way16 = 0x4,
    /// 3 ways
    Way3 = 0x8,
    /// 6 ways
    Way6 = 0x9,
    /// 12 ways
    Way12 = 0xA,
}

impl InterleaveWays {
    pub fn from_encoding(value: u8) -> Option<Self> {
        Some(match value {
            0x0 => Self::Way1,
            0x1 => Self::Way2,
            0x2 => Self::Way4,
            0x3 => Self::Way8,
            0x4 => Self::Way16,
            0x8 => Self::Way3,
            0x9 => Self::Way6,
            0xA => Self::Way12,
            _ => return None,
        })
    }

    pub fn ways(self) -> u64 {
        match self {
            Self::Way1 => 1,
            Self::Way2 => 2,
            Self::Way3 => 3,
            Self::Way4 => 4,
            Self::Way6 => 6,
            Self::Way8 => 8,
            Self::Way12 => 12,
            Self::Way16 => 16,
        }
    }

    /// log2 of the power-of-two factor of the way count: 3/6/12 decompose
    /// into (3, 1 << n)
    fn pow2_shift(self) -> u32 {
        match self {
            Self::Way1 => 0,
            Self::Way2 => 1,
            Self::Way3 => 0,
            Self::Way4 => 2,
            Self::Way6 => 1,
            Self::Way8 => 3,
            Self::Way12 => 2,
            Self::Way16 => 4,
        }
    }

    fn has_factor3(self) -> bool {
        matches!(self, Self::Way3 | Self::Way6 | Self::Way12)
    }
}

/// Decoder commit failures. A failed commit aborts the configuration
/// transaction and leaves every previously committed decoder intact.
#[derive(Snafu, Debug, Clone, PartialEq, Eq)]
pub enum DecoderError {
    #[snafu(display("decoder index {index} out of range, only {count} decoders"))]
    IndexOutOfRange { index: usize, count: usize },
    #[snafu(display("interleave granularity encoding {value:#x} is reserved"))]
    BadGranularity { value: u8 },
    #[snafu(display("interleave ways encoding {value:#x} is reserved"))]
    BadWays { value: u8 },
    #[snafu(display("target list holds {got} ports, {ways} ways need {ways}"))]
    TargetCount { ways: u64, got: usize },
    #[snafu(display("dpa-to-hpa reversal is only defined for 1-way decoders"))]
    NotReversible,
}

/// One commit request, both flavours
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecoderInfo {
    pub base: u64,
    pub size: u64,
    pub ig: u8,
    pub iw: u8,
    pub dpa_skip: u64,
    pub target_ports: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CommittedDecoder {
    base: u64,
    size: u64,
    ig: InterleaveGranularity,
    iw: InterleaveWays,
    dpa_base: u64,
    dpa_skip: u64,
    target_ports: Vec<u8>,
}

impl CommittedDecoder {
    fn contains(&self, hpa: u64) -> bool {
        self.base <= hpa && hpa < self.base + self.size
    }

    fn dpa(&self, hpa: u64) -> u64 {
        let offset = hpa - self.base;
        let ig_shift = self.ig.shift();
        let low = offset & (self.ig.bytes() - 1);
        let high = if self.iw.has_factor3() {
            (offset >> (ig_shift + self.iw.pow2_shift())) / 3
        } else {
            offset >> (ig_shift + self.iw.pow2_shift())
        };
        self.dpa_base + (low | high << ig_shift)
    }

    fn target_port(&self, hpa: u64) -> u8 {
        let index = (hpa / self.ig.bytes()) % self.iw.ways();
        self.target_ports[index as usize]
    }
}

/// Decoder bank shared by both flavours. `SWITCH` decoders route to a
/// target port, device decoders translate to a DPA.
#[derive(Debug)]
pub struct HdmDecoderBank<const SWITCH: bool> {
    decoders: Vec<Option<CommittedDecoder>>,
    enabled: bool,
}

pub type SwitchHdmDecoder = HdmDecoderBank<true>;
pub type DeviceHdmDecoder = HdmDecoderBank<false>;

impl<const SWITCH: bool> HdmDecoderBank<SWITCH> {
    pub fn new(decoder_count: usize) -> Self {
        Self {
            decoders: vec![None; decoder_count],
            enabled: false,
        }
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }

    pub fn decoder_enable(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_committed(&self, index: usize) -> bool {
        self.decoders.get(index).is_some_and(Option::is_some)
    }

    /// Commits decoder `index`. Validation happens before any state is
    /// touched, so a failed commit cannot corrupt a committed decoder.
    pub fn commit(&mut self, index: usize, info: &DecoderInfo) -> Result<(), DecoderError> {
        if index >= self.decoders.len() {
            return Err(DecoderError::IndexOutOfRange {
                index,
                count: self.decoders.len(),
            });
        }
        let ig = InterleaveGranularity::from_encoding(info.ig)
            .ok_or(DecoderError::BadGranularity { value: info.ig })?;
        let iw =
            InterleaveWays::from_encoding(info.iw).ok_or(DecoderError::BadWays { value: info.iw })?;
        if SWITCH && info.target_ports.len() < iw.ways() as usize {
            return Err(DecoderError::TargetCount {
                ways: iw.ways(),
                got: info.target_ports.len(),
            });
        }
        debug!(index, base = info.base, size = info.size, ig = ?ig, iw = ?iw, "decoder commit");
        self.decoders[index] = Some(CommittedDecoder {
            base: info.base,
            size: info.size,
            ig,
            iw,
            dpa_base: 0,
            dpa_skip: info.dpa_skip,
            target_ports: info.target_ports.clone(),
        });
        Ok(())
    }

    fn decoder_from_hpa(&self, hpa: u64) -> Option<&CommittedDecoder> {
        self.decoders
            .iter()
            .flatten()
            .find(|decoder| decoder.contains(hpa))
    }

    pub fn is_hpa_in_range(&self, hpa: u64) -> bool {
        self.decoder_from_hpa(hpa).is_some()
    }
}

impl SwitchHdmDecoder {
    /// Downstream port index for `hpa`: `target_ports[(hpa / ig) mod iw]`
    pub fn get_target(&self, hpa: u64) -> Option<u8> {
        self.decoder_from_hpa(hpa).map(|d| d.target_port(hpa))
    }
}

impl DeviceHdmDecoder {
    pub fn get_dpa(&self, hpa: u64) -> Option<u64> {
        self.decoder_from_hpa(hpa).map(|d| d.dpa(hpa))
    }

    /// Reverses a DPA back to its HPA. Only meaningful when the single
    /// committed decoder is 1-way; interleaved DPAs have no unique HPA
    /// on one device.
    pub fn get_hpa(&self, dpa: u64) -> Result<u64, DecoderError> {
        let decoder = self
            .decoders
            .iter()
            .flatten()
            .next()
            .ok_or(DecoderError::NotReversible)?;
        if decoder.iw != InterleaveWays::Way1 {
            return Err(DecoderError::NotReversible);
        }
        Ok(dpa + decoder.base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn committed_switch(base: u64, size: u64, ig: u8, iw: u8, ports: &[u8]) -> SwitchHdmDecoder {
        let mut bank = SwitchHdmDecoder::new(4);
        bank.commit(
            0,
            &DecoderInfo {
                base,
                size,
                ig,
                iw,
                dpa_skip: 0,
                target_ports: ports.to_vec(),
            },
        )
        .unwrap();
        bank.decoder_enable(true);
        bank
    }

    #[test]
    fn switch_target_follows_modulo_rule() {
        for (ig, iw, ways) in [(0u8, 0x1u8, 2u64), (2, 0x2, 4), (4, 0x3, 8), (0, 0x8, 3)] {
            let ports: Vec<u8> = (1..=ways as u8).collect();
            let bank = committed_switch(0x1_0000_0000, 0x4000_0000, ig, iw, &ports);
            let ig_bytes = 1u64 << (ig as u64 + 8);
            for chunk in 0..(ways * 3) {
                let hpa = 0x1_0000_0000 + chunk * ig_bytes + 17;
                let expected = ports[((hpa / ig_bytes) % ways) as usize];
                assert_eq!(bank.get_target(hpa), Some(expected), "ig={ig} iw={iw:#x}");
            }
        }
    }

    #[test]
    fn hpa_out_of_every_range_decodes_to_none() {
        let bank = committed_switch(0x1000, 0x1000, 0, 0x0, &[0]);
        assert_eq!(bank.get_target(0x0fff), None);
        assert_eq!(bank.get_target(0x2000), None);
        assert!(bank.is_hpa_in_range(0x1000));
        assert!(bank.is_hpa_in_range(0x1fff));
    }

    #[test]
    fn device_one_way_translation_is_reversible() {
        let mut bank = DeviceHdmDecoder::new(1);
        bank.commit(
            0,
            &DecoderInfo {
                base: 0x1_0000_0000,
                size: 0x10_0000,
                ig: 0,
                iw: 0,
                ..Default::default()
            },
        )
        .unwrap();
        for hpa in [0x1_0000_0000u64, 0x1_0000_1040, 0x1_000F_FFC0] {
            let dpa = bank.get_dpa(hpa).unwrap();
            assert_eq!(dpa, hpa - 0x1_0000_0000);
            assert_eq!(bank.get_hpa(dpa).unwrap(), hpa);
        }
    }

    #[test]
    fn device_two_way_interleave_splits_offset() {
        let mut bank = DeviceHdmDecoder::new(1);
        bank.commit(
            0,
            &DecoderInfo {
                base: 0,
                size: 0x2_0000,
                ig: 0,  // 256 B
                iw: 1,  // 2 ways
                ..Default::default()
            },
        )
        .unwrap();
        // Offset 0x200 = chunk 2; this device holds every second chunk,
        // so its local DPA collapses to chunk 1
        assert_eq!(bank.get_dpa(0x200), Some(0x100));
        // Low bits pass through untouched
        assert_eq!(bank.get_dpa(0x244), Some(0x144));
        // Reversal is undefined off 1-way
        assert_eq!(bank.get_hpa(0x100), Err(DecoderError::NotReversible));
    }

    #[test]
    fn three_way_high_part_divides_by_three() {
        let mut bank = DeviceHdmDecoder::new(1);
        bank.commit(
            0,
            &DecoderInfo {
                base: 0,
                size: 0x10_0000,
                ig: 0,    // 256 B
                iw: 0x8,  // 3 ways
                ..Default::default()
            },
        )
        .unwrap();
        // Chunks 0,3,6,... land on this device as local chunks 0,1,2,...
        assert_eq!(bank.get_dpa(0x000), Some(0x000));
        assert_eq!(bank.get_dpa(0x300), Some(0x100));
        assert_eq!(bank.get_dpa(0x600), Some(0x200));
    }

    #[test]
    fn failed_commit_leaves_committed_state_alone() {
        let mut bank = SwitchHdmDecoder::new(2);
        let good = DecoderInfo {
            base: 0x1000,
            size: 0x1000,
            ig: 0,
            iw: 0,
            dpa_skip: 0,
            target_ports: vec![1],
        };
        bank.commit(0, &good).unwrap();
        assert_eq!(
            bank.commit(5, &good),
            Err(DecoderError::IndexOutOfRange { index: 5, count: 2 })
        );
        assert_eq!(
            bank.commit(1, &DecoderInfo { iw: 0x7, ..good.clone() }),
            Err(DecoderError::BadWays { value: 0x7 })
        );
        assert_eq!(bank.get_target(0x1800), Some(1));
    }
}
