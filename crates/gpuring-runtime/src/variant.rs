//! Built-in GPU generations
//!
//! Each variant is a set of static tables the init sequencer writes out.
//! The device picks one at creation and keeps it for its lifetime.

use std::sync::Arc;

use gpuring_core::{GpuResult, GpuVariant, ProtectRange};

use crate::regs;

/// Clock-gating registers shared by the variants below
mod hwcg {
    pub const RBBM_CLOCK_CNTL_SP0: u32 = 0x00b0;
    pub const RBBM_CLOCK_CNTL2_SP0: u32 = 0x00b4;
    pub const RBBM_CLOCK_HYST_SP0: u32 = 0x00b8;
    pub const RBBM_CLOCK_DELAY_SP0: u32 = 0x00bc;
    pub const RBBM_CLOCK_CNTL_TP0: u32 = 0x00c0;
    pub const RBBM_CLOCK_CNTL_UCHE: u32 = 0x00d0;
    pub const RBBM_CLOCK_CNTL_GMU_GX: u32 = 0x00e0;
}

/// UBWC configuration registers
mod ubwc {
    pub const RB_NC_MODE_CNTL: u32 = 0x8e08;
    pub const SP_NC_MODE_CNTL: u32 = 0xae02;
    pub const TPL1_NC_MODE_CNTL: u32 = 0xb604;
    pub const UCHE_MODE_CNTL: u32 = 0x0e01;
}

const A7XX_HWCG: &[(u32, u32)] = &[
    (hwcg::RBBM_CLOCK_CNTL_SP0, 0x0222_2222),
    (hwcg::RBBM_CLOCK_CNTL2_SP0, 0x0202_2222),
    (hwcg::RBBM_CLOCK_HYST_SP0, 0x0000_f3cf),
    (hwcg::RBBM_CLOCK_DELAY_SP0, 0x0000_0080),
    (hwcg::RBBM_CLOCK_CNTL_TP0, 0x2222_2222),
    (hwcg::RBBM_CLOCK_CNTL_UCHE, 0x2222_2222),
    (hwcg::RBBM_CLOCK_CNTL_GMU_GX, 0x0000_0222),
    (regs::RBBM_CLOCK_CNTL, 0x8aa8_aa82),
];

const A730_UBWC: &[(u32, u32)] = &[
    (ubwc::RB_NC_MODE_CNTL, (1 << 4) | (2 << 1)),
    (ubwc::SP_NC_MODE_CNTL, 2 << 1),
    (ubwc::TPL1_NC_MODE_CNTL, 2 << 1),
    (ubwc::UCHE_MODE_CNTL, 2 << 21),
];

const A740_UBWC: &[(u32, u32)] = &[
    (ubwc::RB_NC_MODE_CNTL, (1 << 4) | (3 << 1) | 1),
    (ubwc::SP_NC_MODE_CNTL, (3 << 1) | 1),
    (ubwc::TPL1_NC_MODE_CNTL, (3 << 1) | 1),
    (ubwc::UCHE_MODE_CNTL, 3 << 21),
];

const A730_PROTECT: &[ProtectRange] = &[
    ProtectRange::no_read(0x0000, 0x04),
    ProtectRange::new(0x0005, 0x04),
    ProtectRange::new(0x0020, 0x0f),
    ProtectRange::new(0x0050, 0x12),
    ProtectRange::new(0x00ab, 0x0a),
    ProtectRange::new(0x0800, 0x100),
    ProtectRange::new(0x0e00, 0x01),
    ProtectRange::no_read(0xf400, 0x01),
];

const A740_PROTECT: &[ProtectRange] = &[
    ProtectRange::no_read(0x0000, 0x04),
    ProtectRange::new(0x0005, 0x04),
    ProtectRange::new(0x0020, 0x0f),
    ProtectRange::new(0x0050, 0x12),
    ProtectRange::new(0x00ab, 0x0a),
    ProtectRange::new(0x0800, 0x100),
    ProtectRange::new(0x0900, 0x40),
    ProtectRange::new(0x0e00, 0x01),
    ProtectRange::no_read(0xf400, 0x01),
];

const A7XX_PWRUP_REGLIST: &[u32] = &[
    ubwc::UCHE_MODE_CNTL,
    ubwc::RB_NC_MODE_CNTL,
    ubwc::SP_NC_MODE_CNTL,
    ubwc::TPL1_NC_MODE_CNTL,
    regs::RBBM_CLOCK_CNTL,
];

/// Adreno 730
#[derive(Debug, Default)]
pub struct A730;

impl GpuVariant for A730 {
    fn name(&self) -> &'static str {
        "a730"
    }

    fn hwcg(&self) -> &[(u32, u32)] {
        A7XX_HWCG
    }

    fn protect(&self) -> &[ProtectRange] {
        A730_PROTECT
    }

    fn ubwc(&self) -> &[(u32, u32)] {
        A730_UBWC
    }

    fn pwrup_reglist(&self) -> &[u32] {
        A7XX_PWRUP_REGLIST
    }

    fn load_zap_shader(&self) -> GpuResult<()> {
        Ok(())
    }
}

/// Adreno 740
#[derive(Debug, Default)]
pub struct A740;

impl GpuVariant for A740 {
    fn name(&self) -> &'static str {
        "a740"
    }

    fn hwcg(&self) -> &[(u32, u32)] {
        A7XX_HWCG
    }

    fn protect(&self) -> &[ProtectRange] {
        A740_PROTECT
    }

    fn ubwc(&self) -> &[(u32, u32)] {
        A740_UBWC
    }

    fn pwrup_reglist(&self) -> &[u32] {
        A7XX_PWRUP_REGLIST
    }

    fn load_zap_shader(&self) -> GpuResult<()> {
        Ok(())
    }
}

pub const CHIP_ID_A730: u32 = 0x0703_0001;
pub const CHIP_ID_A740: u32 = 0x4305_0a01;

/// Variant for a chip id; the patch level in the low byte is ignored
pub fn variant_for_chip(chip_id: u32) -> Option<Arc<dyn GpuVariant>> {
    match chip_id & !0xff {
        id if id == CHIP_ID_A730 & !0xff => Some(Arc::new(A730)),
        id if id == CHIP_ID_A740 & !0xff => Some(Arc::new(A740)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variant_for_chip() {
        assert_eq!(variant_for_chip(CHIP_ID_A730).unwrap().name(), "a730");
        assert_eq!(variant_for_chip(0x4305_0a02).unwrap().name(), "a740");
        assert!(variant_for_chip(0x0600_0000).is_none());
    }

    #[test]
    fn test_protect_tables_fit() {
        for v in [&A730 as &dyn GpuVariant, &A740] {
            assert!(v.protect().len() <= regs::CP_PROTECT_REG_COUNT as usize);
            assert!(v.protect().iter().all(|r| r.count > 0));
        }
    }
}
