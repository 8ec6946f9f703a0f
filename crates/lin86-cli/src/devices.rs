//! The two port devices the runner attaches: a debug console and a POST-code latch.

use std::cell::Cell;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::rc::Rc;

use anyhow::{Context, Result};
use lin86_cpu_core::{IoAccess, IoPortBus, IoWidths, PortIoDevice};

pub const DEBUGCON_PORT: u16 = 0xE9;
pub const POST_CODE_PORT: u16 = 0x80;

/// Bochs/QEMU-style debug console: every byte written to port 0xE9 goes to the sink. Reads
/// return 0xE9 so guests can detect it.
pub struct DebugCon {
    sink: Box<dyn Write>,
}

impl DebugCon {
    pub fn new(sink: Box<dyn Write>) -> Self {
        Self { sink }
    }
}

impl PortIoDevice for DebugCon {
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        u32::from(DEBUGCON_PORT)
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        let byte = value as u8;
        if let Err(err) = self.sink.write_all(&[byte]) {
            tracing::warn!(%err, "debugcon write failed");
            return;
        }
        if byte == b'\n' {
            let _ = self.sink.flush();
        }
    }
}

impl Drop for DebugCon {
    fn drop(&mut self) {
        let _ = self.sink.flush();
    }
}

/// Opens the debugcon destination: `stdout`, `none`, or a file path.
pub fn open_sink(target: &str) -> Result<Option<Box<dyn Write>>> {
    Ok(match target {
        "none" => None,
        "stdout" | "-" => Some(Box::new(io::stdout())),
        path => {
            let file = File::create(path)
                .with_context(|| format!("failed to create debugcon output {path}"))?;
            Some(Box::new(BufWriter::new(file)))
        }
    })
}

/// Port 0x80: remembers the last diagnostic byte the guest wrote.
pub struct PostCode {
    last: Rc<Cell<Option<u8>>>,
}

impl PortIoDevice for PostCode {
    fn read(&mut self, _port: u16, _size: u8) -> u32 {
        u32::from(self.last.get().unwrap_or(0xFF))
    }

    fn write(&mut self, _port: u16, _size: u8, value: u32) {
        let code = value as u8;
        tracing::trace!(code = format_args!("{code:#04x}"), "POST code");
        self.last.set(Some(code));
    }
}

/// Registers the runner's devices and returns a handle to the last POST code.
pub fn attach(io: &mut IoPortBus, debugcon: Option<Box<dyn Write>>) -> Rc<Cell<Option<u8>>> {
    if let Some(sink) = debugcon {
        io.register(
            DEBUGCON_PORT,
            1,
            IoWidths::BYTE,
            IoAccess::READ | IoAccess::WRITE,
            Box::new(DebugCon::new(sink)),
        );
    }
    let last = Rc::new(Cell::new(None));
    io.register(
        POST_CODE_PORT,
        1,
        IoWidths::BYTE,
        IoAccess::READ | IoAccess::WRITE,
        Box::new(PostCode { last: last.clone() }),
    );
    last
}
