//! The register frame pushed on the kernel stack at every trap.
//!
//! Layout matches the common interrupt stub: general-purpose registers
//! pushed in a fixed order, then the vector and error code, then the
//! hardware IRET image. Syscall handlers rewrite `rax` (and, for exec,
//! the whole frame) before the stub restores it.

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    /// Interrupt vector number pushed by the stub.
    pub vector: u64,
    /// Hardware error code, or 0 for vectors without one.
    pub error_code: u64,
    // Hardware IRET image.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    pub const fn zero() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: 0,
            error_code: 0,
            rip: 0,
            cs: 0,
            rflags: 0x202,
            rsp: 0,
            ss: 0,
        }
    }

    /// True if the frame was captured while executing in ring 3.
    #[inline]
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}
