//! Register offsets (in dwords) used by the ring controller

/// RBBM block
pub const RBBM_INT_CLEAR_CMD: u32 = 0x0037;
pub const RBBM_INT_0_MASK: u32 = 0x0038;
pub const RBBM_SW_RESET_CMD: u32 = 0x0043;
pub const RBBM_INT_0_STATUS: u32 = 0x0201;
pub const RBBM_STATUS: u32 = 0x0210;
pub const RBBM_CLOCK_CNTL: u32 = 0x00ae;
pub const RBBM_SECVID_TRUST_CNTL: u32 = 0xf400;

/// GPU busy bit of `RBBM_STATUS`
pub const RBBM_STATUS_GPU_BUSY: u32 = 1 << 23;

/// CP ring 0 registers
pub const CP_RB_BASE: u32 = 0x0800;
pub const CP_RB_CNTL: u32 = 0x0802;
pub const CP_RB_RPTR_ADDR: u32 = 0x0804;
pub const CP_RB_RPTR: u32 = 0x0806;
pub const CP_RB_WPTR: u32 = 0x0807;
pub const CP_SQE_CNTL: u32 = 0x0808;
pub const CP_BV_RB_RPTR_ADDR: u32 = 0x0813;
pub const CP_HW_FAULT: u32 = 0x0821;
pub const CP_INTERRUPT_STATUS: u32 = 0x0823;
pub const CP_SQE_INSTR_BASE: u32 = 0x0830;

/// CP register protection
pub const CP_PROTECT_CNTL: u32 = 0x084f;
pub const CP_PROTECT_REG_BASE: u32 = 0x0850;
pub const CP_PROTECT_REG_COUNT: u32 = 48;

/// Context switch block
pub const CP_CONTEXT_SWITCH_CNTL: u32 = 0x08a0;
pub const CP_CONTEXT_SWITCH_SMMU_INFO: u32 = 0x08a1;
pub const CP_CONTEXT_SWITCH_PRIV_NON_SECURE_RESTORE_ADDR: u32 = 0x08a3;
pub const CP_CONTEXT_SWITCH_PRIV_SECURE_RESTORE_ADDR: u32 = 0x08a5;
pub const CP_CONTEXT_SWITCH_NON_PRIV_RESTORE_ADDR: u32 = 0x08a7;
pub const CP_CONTEXT_SWITCH_LEVEL_STATUS: u32 = 0x08ab;

/// Power-up register list handed to the CP
pub const CP_PWRUP_REGLIST_ADDR: u32 = 0x08b0;

/// `CP_PROTECT_REG[n]`
#[inline]
pub const fn cp_protect_reg(n: u32) -> u32 {
    CP_PROTECT_REG_BASE + n
}

/// `CP_PROTECT_CNTL`: enable protection, fault on access, last span infinite
pub const CP_PROTECT_CNTL_ENABLE: u32 = (1 << 0) | (1 << 1) | (1 << 3);

/// `CP_RB_CNTL` for a ring of `dwords`
///
/// `BUFSZ` is log2 of the size in quadwords, `BLKSZ` log2 of the rptr
/// update block, and bit 27 stops the CP from writing `CP_RB_RPTR` back
/// to the register file (the shadow in memptrs is used instead).
#[inline]
pub const fn rb_cntl(dwords: u32) -> u32 {
    let bufsz = (dwords * 4 / 8).trailing_zeros();
    let blksz = 2;
    bufsz | (blksz << 8) | (1 << 27)
}

/// Value the CP expects in `CP_SQE_CNTL` to start fetching
pub const CP_SQE_CNTL_START: u32 = 1;

/// Names of the registers captured in a diagnostic dump
pub const DUMP_REGS: &[(&str, u32)] = &[
    ("RBBM_STATUS", RBBM_STATUS),
    ("RBBM_INT_0_STATUS", RBBM_INT_0_STATUS),
    ("CP_RB_RPTR", CP_RB_RPTR),
    ("CP_RB_WPTR", CP_RB_WPTR),
    ("CP_HW_FAULT", CP_HW_FAULT),
    ("CP_INTERRUPT_STATUS", CP_INTERRUPT_STATUS),
    ("CP_CONTEXT_SWITCH_CNTL", CP_CONTEXT_SWITCH_CNTL),
    ("CP_CONTEXT_SWITCH_LEVEL_STATUS", CP_CONTEXT_SWITCH_LEVEL_STATUS),
];
