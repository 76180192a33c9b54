//! Serial console used as the klog backend.
//!
//! The UART itself is driver territory; the kernel only needs a byte sink
//! for log lines and panic banners, so this wraps `uart_16550` behind an
//! `IrqMutex` and registers itself with klog during early init.

use core::fmt;
use core::fmt::Write;

use uart_16550::SerialPort;

use crate::once_lock::InitFlag;
use crate::spinlock::IrqMutex;

const COM1_BASE: u16 = 0x3F8;

static PORT: IrqMutex<Option<SerialPort>> = IrqMutex::new(None);
static SERIAL_INIT: InitFlag = InitFlag::new();

fn backend(args: fmt::Arguments<'_>) {
    let mut guard = PORT.lock();
    if let Some(port) = guard.as_mut() {
        let _ = port.write_fmt(args);
        let _ = port.write_str("\n");
    }
}

/// Initialise COM1 and route klog through it. Safe to call more than once.
pub fn init() {
    if !SERIAL_INIT.init_once() {
        return;
    }
    // SAFETY: COM1_BASE is the standard COM1 I/O port block.
    let mut port = unsafe { SerialPort::new(COM1_BASE) };
    port.init();
    *PORT.lock() = Some(port);
    crate::klog::klog_register_backend(backend);
}

/// Raw byte output for the panic path and the console device node.
pub fn write_bytes(bytes: &[u8]) {
    let mut guard = PORT.lock();
    if let Some(port) = guard.as_mut() {
        for &b in bytes {
            if b == b'\n' {
                port.send(b'\r');
            }
            port.send(b);
        }
    }
}
