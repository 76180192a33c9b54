//! Low-level context switching with compile-time struct offsets.
//!
//! Naked routines over [`SwitchContext`]: saving the callee-saved set of
//! the outgoing task and loading the incoming one. FPU state and CR3 are
//! the caller's business.

use core::arch::naked_asm;
use core::mem::offset_of;

use ferrite_lib::InterruptFrame;

use super::task_struct::SwitchContext;

/// Swap register state between two kernel contexts.
///
/// # Safety
/// Interrupts must be disabled; both contexts must be initialised; never
/// called re-entrantly on one CPU.
#[unsafe(naked)]
pub extern "sysv64" fn switch_registers(prev: *mut SwitchContext, next: *const SwitchContext) {
    naked_asm!(
        // rdi = prev, rsi = next. A null prev means first dispatch.
        "test rdi, rdi",
        "jz 2f",

        "mov [rdi + {off_rbx}], rbx",
        "mov [rdi + {off_r12}], r12",
        "mov [rdi + {off_r13}], r13",
        "mov [rdi + {off_r14}], r14",
        "mov [rdi + {off_r15}], r15",
        "mov [rdi + {off_rbp}], rbp",
        "mov [rdi + {off_rsp}], rsp",

        "pushfq",
        "pop QWORD PTR [rdi + {off_rflags}]",

        "mov rax, [rsp]",
        "mov [rdi + {off_rip}], rax",

        "2:",
        "mov rbx, [rsi + {off_rbx}]",
        "mov r12, [rsi + {off_r12}]",
        "mov r13, [rsi + {off_r13}]",
        "mov r14, [rsi + {off_r14}]",
        "mov r15, [rsi + {off_r15}]",
        "mov rbp, [rsi + {off_rbp}]",

        "push QWORD PTR [rsi + {off_rflags}]",
        "popfq",

        // The stack swap is the switch point; ret pops the new task's
        // return address.
        "mov rsp, [rsi + {off_rsp}]",
        "ret",

        off_rbx = const offset_of!(SwitchContext, rbx),
        off_r12 = const offset_of!(SwitchContext, r12),
        off_r13 = const offset_of!(SwitchContext, r13),
        off_r14 = const offset_of!(SwitchContext, r14),
        off_r15 = const offset_of!(SwitchContext, r15),
        off_rbp = const offset_of!(SwitchContext, rbp),
        off_rsp = const offset_of!(SwitchContext, rsp),
        off_rflags = const offset_of!(SwitchContext, rflags),
        off_rip = const offset_of!(SwitchContext, rip),
    );
}

/// Entry shim for tasks that have never run: entry point in r12, argument
/// in r13 (placed by `SwitchContext::new_for_task`).
#[unsafe(naked)]
pub extern "sysv64" fn task_entry_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // Entry returned: the task is done.
        "call {task_exit}",
        "ud2",
        task_exit = sym super::task::task_exit_current_trampoline,
    );
}

/// Drop to ring 3 by building an IRET image from `frame`.
///
/// # Safety
/// `frame` must hold user-mode CS/SS and a mapped RIP/RSP in the active
/// address space.
pub unsafe fn enter_user_frame(frame: &InterruptFrame) -> ! {
    unsafe {
        core::arch::asm!(
            // Interrupt-return image: SS, RSP, RFLAGS, CS, RIP.
            "push QWORD PTR [r11 + {off_ss}]",
            "push QWORD PTR [r11 + {off_rsp}]",
            "push QWORD PTR [r11 + {off_rflags}]",
            "push QWORD PTR [r11 + {off_cs}]",
            "push QWORD PTR [r11 + {off_rip}]",
            // Full general-purpose state; r11 (the frame base) goes last.
            "mov r15, [r11 + {off_r15}]",
            "mov r14, [r11 + {off_r14}]",
            "mov r13, [r11 + {off_r13}]",
            "mov r12, [r11 + {off_r12}]",
            "mov r10, [r11 + {off_r10}]",
            "mov r9,  [r11 + {off_r9}]",
            "mov r8,  [r11 + {off_r8}]",
            "mov rbp, [r11 + {off_rbp}]",
            "mov rdi, [r11 + {off_rdi}]",
            "mov rsi, [r11 + {off_rsi}]",
            "mov rdx, [r11 + {off_rdx}]",
            "mov rcx, [r11 + {off_rcx}]",
            "mov rbx, [r11 + {off_rbx}]",
            "mov rax, [r11 + {off_rax}]",
            "mov r11, [r11 + {off_r11}]",
            "iretq",
            in("r11") frame as *const InterruptFrame,
            off_ss = const offset_of!(InterruptFrame, ss),
            off_rsp = const offset_of!(InterruptFrame, rsp),
            off_rflags = const offset_of!(InterruptFrame, rflags),
            off_cs = const offset_of!(InterruptFrame, cs),
            off_rip = const offset_of!(InterruptFrame, rip),
            off_r15 = const offset_of!(InterruptFrame, r15),
            off_r14 = const offset_of!(InterruptFrame, r14),
            off_r13 = const offset_of!(InterruptFrame, r13),
            off_r12 = const offset_of!(InterruptFrame, r12),
            off_r11 = const offset_of!(InterruptFrame, r11),
            off_r10 = const offset_of!(InterruptFrame, r10),
            off_r9 = const offset_of!(InterruptFrame, r9),
            off_r8 = const offset_of!(InterruptFrame, r8),
            off_rbp = const offset_of!(InterruptFrame, rbp),
            off_rdi = const offset_of!(InterruptFrame, rdi),
            off_rsi = const offset_of!(InterruptFrame, rsi),
            off_rdx = const offset_of!(InterruptFrame, rdx),
            off_rcx = const offset_of!(InterruptFrame, rcx),
            off_rbx = const offset_of!(InterruptFrame, rbx),
            off_rax = const offset_of!(InterruptFrame, rax),
            options(noreturn)
        );
    }
}
