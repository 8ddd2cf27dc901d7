//! Leaf page-table entry decoding: present/swap state, protection flags,
//! and the kernel-version dependent swap encoding.
use crate::arch::layout::{AddressSpaceLayout, PHYS_MASK};
use crate::core::offsets::KernelVersion;
use bitflags::bitflags;
use serde::Serialize;
use std::io::Write;

bitflags! {
    /// Version-independent leaf descriptor bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
        const VALID = 1 << 0;
        const USER = 1 << 6;        // AP[1]
        const RDONLY = 1 << 7;      // AP[2]
        const SHARED = 3 << 8;      // SH[1:0], inner shareable
        const AF = 1 << 10;
        const NG = 1 << 11;
        const PXN = 1 << 53;
        const UXN = 1 << 54;
        const DIRTY = 1 << 55;
        const SPECIAL = 1 << 56;
    }
}

struct PteFormatBand {
    min_version: (u32, u32, u32),
    swp_type_bits: u32,
    swp_type_shift: u32,
    swp_offset_bits: u32,
    prot_none: u64,
    file: u64,
}

/// Newest first; the first band whose minimum version is <= the kernel applies.
const PTE_FORMAT_BANDS: [PteFormatBand; 4] = [
    PteFormatBand {
        min_version: (4, 0, 0),
        swp_type_bits: 6,
        swp_type_shift: 2,
        swp_offset_bits: 50,
        prot_none: 1 << 58,
        file: 0,
    },
    PteFormatBand {
        min_version: (3, 13, 0),
        swp_type_bits: 6,
        swp_type_shift: 3,
        swp_offset_bits: 49,
        prot_none: 1 << 58,
        file: 1 << 2,
    },
    PteFormatBand {
        min_version: (3, 11, 0),
        swp_type_bits: 6,
        swp_type_shift: 4,
        swp_offset_bits: 0,
        prot_none: 1 << 2,
        file: 1 << 3,
    },
    PteFormatBand {
        min_version: (0, 0, 0),
        swp_type_bits: 6,
        swp_type_shift: 3,
        swp_offset_bits: 0,
        prot_none: 1 << 1,
        file: 1 << 2,
    },
];

/// Swap-entry layout and version-dependent protection bits.
/// A zero `swp_offset_bits`/`swp_offset_mask` or `file` means "unused".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PteFormat {
    pub swp_type_bits: u32,
    pub swp_type_shift: u32,
    pub swp_type_mask: u64,
    pub swp_offset_bits: u32,
    pub swp_offset_shift: u32,
    pub swp_offset_mask: u64,
    pub prot_none: u64,
    pub file: u64,
}

impl PteFormat {
    /// Pick the format band for a kernel; unknown kernels get the newest band.
    pub fn for_version(version: Option<&KernelVersion>) -> Self {
        let band = match version {
            Some(v) => PTE_FORMAT_BANDS
                .iter()
                .find(|b| {
                    let (major, minor, patch) = b.min_version;
                    *v >= KernelVersion::new(major, minor, patch)
                })
                .unwrap_or(&PTE_FORMAT_BANDS[PTE_FORMAT_BANDS.len() - 1]),
            None => &PTE_FORMAT_BANDS[0],
        };
        Self::from_band(band)
    }

    fn from_band(band: &PteFormatBand) -> Self {
        let mask = |bits: u32| if bits == 0 { 0 } else { (1u64 << bits) - 1 };
        PteFormat {
            swp_type_bits: band.swp_type_bits,
            swp_type_shift: band.swp_type_shift,
            swp_type_mask: mask(band.swp_type_bits),
            swp_offset_bits: band.swp_offset_bits,
            swp_offset_shift: band.swp_type_bits + band.swp_type_shift,
            swp_offset_mask: mask(band.swp_offset_bits),
            prot_none: band.prot_none,
            file: band.file,
        }
    }

    pub fn swp_type(&self, pte: u64) -> u64 {
        (pte >> self.swp_type_shift) & self.swp_type_mask
    }

    pub fn swp_offset(&self, pte: u64) -> u64 {
        let offset = pte >> self.swp_offset_shift;
        if self.swp_offset_mask != 0 {
            offset & self.swp_offset_mask
        } else {
            offset
        }
    }

    /// Encode a (type, offset) pair the way the kernel builds a swap PTE.
    pub fn swp_entry(&self, swp_type: u64, offset: u64) -> u64 {
        let offset = if self.swp_offset_mask != 0 {
            offset & self.swp_offset_mask
        } else {
            offset
        };
        ((swp_type & self.swp_type_mask) << self.swp_type_shift) | (offset << self.swp_offset_shift)
    }

    /// Present means valid, or PROT_NONE (valid bit cleared by mprotect).
    pub fn is_present(&self, pte: u64) -> bool {
        pte & (PteFlags::VALID.bits() | self.prot_none) != 0
    }
}

/// Result of decoding a leaf entry for its address only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PteInfo {
    pub present: bool,
    pub paddr: u64,
}

/// Decode a leaf entry without rendering anything.
pub fn decode_pte(layout: &AddressSpaceLayout, pte: u64) -> PteInfo {
    PteInfo {
        present: layout.pte.is_present(pte),
        paddr: pte & PHYS_MASK & layout.page_mask(),
    }
}

/// Names of the flags set in a present entry, in display order.
pub fn flag_names(format: &PteFormat, pte: u64) -> Vec<&'static str> {
    let checks: [(u64, &'static str); 12] = [
        (PteFlags::VALID.bits(), "VALID"),
        (format.file, "FILE"),
        (format.prot_none, "PROT_NONE"),
        (PteFlags::USER.bits(), "USER"),
        (PteFlags::RDONLY.bits(), "RDONLY"),
        (PteFlags::SHARED.bits(), "SHARED"),
        (PteFlags::AF.bits(), "AF"),
        (PteFlags::NG.bits(), "NG"),
        (PteFlags::PXN.bits(), "PXN"),
        (PteFlags::UXN.bits(), "UXN"),
        (PteFlags::DIRTY.bits(), "DIRTY"),
        (PteFlags::SPECIAL.bits(), "SPECIAL"),
    ];

    checks
        .iter()
        .filter(|(mask, _)| *mask != 0 && pte & mask != 0)
        .map(|(_, name)| *name)
        .collect()
}

/// Render a leaf entry: swap type/offset when not present, otherwise the
/// physical page and flag summary. Returns the present state.
pub fn render_pte(layout: &AddressSpaceLayout, pte: u64, out: &mut dyn Write) -> std::io::Result<bool> {
    let info = decode_pte(layout, pte);
    let ptebuf = format!("{:x}", pte);
    let len1 = ptebuf.len().max("PTE".len());

    if !info.present {
        let swap = layout.pte.swp_type(pte).to_string();
        let offset = layout.pte.swp_offset(pte).to_string();
        let len2 = swap.len().max("SWAP".len());
        let len3 = offset.len().max("OFFSET".len());

        writeln!(
            out,
            "{:^len1$}  {:^len2$}  {:^len3$}",
            "PTE", "SWAP", "OFFSET"
        )?;
        writeln!(out, "{:^len1$}  {:^len2$}  {:^len3$}", ptebuf, swap, offset)?;
        return Ok(false);
    }

    let physbuf = format!("{:x}", info.paddr);
    let len2 = physbuf.len().max("PHYSICAL".len());

    writeln!(out, "{:^len1$}  {:^len2$}  FLAGS", "PTE", "PHYSICAL")?;
    let flags = if pte != 0 {
        flag_names(&layout.pte, pte).join("|")
    } else {
        "no mapping".to_string()
    };
    writeln!(out, "{:^len1$}  {:^len2$}  ({})", ptebuf, physbuf, flags)?;

    Ok(true)
}
