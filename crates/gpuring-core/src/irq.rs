//! Interrupt status and context-switch control bits

use bitflags::bitflags;

bitflags! {
    /// Bits of the interrupt status register the controller services
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IrqStatus: u32 {
        /// CP AHB bus error
        const CP_AHB_ERROR          = 1 << 0;
        /// Context switch complete
        const CP_SW                 = 1 << 1;
        /// CP hardware fault (bad opcode, protected register access)
        const CP_HW_ERROR           = 1 << 2;
        /// ATB bus overflow
        const RBBM_ATB_BUS_OVERFLOW = 1 << 22;
        /// A timestamp event retired
        const CP_CACHE_FLUSH_TS     = 1 << 20;
        /// Uncorrectable SMMU / protection fault
        const SMMU_FAULT            = 1 << 24;
        /// Hang detect timer expired
        const HANG_DETECT           = 1 << 30;
    }
}

impl IrqStatus {
    /// Bits that are enabled in the interrupt mask after init
    pub const MASK: IrqStatus = IrqStatus::all();

    /// Bits that mean the device cannot continue without a reset
    pub const FATAL: IrqStatus = IrqStatus::CP_HW_ERROR
        .union(IrqStatus::CP_AHB_ERROR)
        .union(IrqStatus::RBBM_ATB_BUS_OVERFLOW)
        .union(IrqStatus::SMMU_FAULT)
        .union(IrqStatus::HANG_DETECT);

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.intersects(IrqStatus::FATAL)
    }
}

bitflags! {
    /// `CP_CONTEXT_SWITCH_CNTL` fields
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SwitchCntl: u32 {
        /// Write: request a switch. Read: switch still in progress.
        const BUSY             = 1 << 0;
        const USES_GMEM        = 1 << 8;
        const SKIP_SAVE_RESTORE = 1 << 9;
        const _ = !0;
    }
}

impl SwitchCntl {
    const LEVEL_SHIFT: u32 = 6;
    const LEVEL_MASK: u32 = 0x3 << 6;

    /// Control word requesting a switch to preemption `level`
    pub fn request(level: u32, uses_gmem: bool, skip_save_restore: bool) -> SwitchCntl {
        let mut cntl = SwitchCntl::from_bits_retain((level << Self::LEVEL_SHIFT) & Self::LEVEL_MASK)
            | SwitchCntl::BUSY;
        if uses_gmem {
            cntl |= SwitchCntl::USES_GMEM;
        }
        if skip_save_restore {
            cntl |= SwitchCntl::SKIP_SAVE_RESTORE;
        }
        cntl
    }

    #[inline]
    pub fn level(&self) -> u32 {
        (self.bits() & Self::LEVEL_MASK) >> Self::LEVEL_SHIFT
    }
}
