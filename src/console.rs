//! Kernel console
//!
//! Collects the characters user threads print through `print_char` and
//! emits them line by line through the kernel log.

use core::fmt;

/// Capacity of the line buffer
pub const LINE_CAPACITY: usize = 128;

/// Per-kernel console line buffer
#[derive(Debug, Default)]
pub struct Console {
    line: heapless::String<LINE_CAPACITY>,
    last: heapless::String<LINE_CAPACITY>,
    lines: u64,
}

impl Console {
    /// Create an empty console
    pub const fn new() -> Self {
        Console {
            line: heapless::String::new(),
            last: heapless::String::new(),
            lines: 0,
        }
    }

    /// Append one byte, a newline or a full buffer flushes the line
    pub fn put_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.flush(),
            b'\r' => {}
            _ => {
                let c = if byte.is_ascii() { byte as char } else { '?' };
                if self.line.push(c).is_err() {
                    self.flush();
                    let _ = self.line.push(c);
                }
            }
        }
    }

    /// Emit the buffered line, if any
    pub fn flush(&mut self) {
        if self.line.is_empty() {
            return;
        }
        log::info!("{}", self.line.as_str());
        self.last = core::mem::take(&mut self.line);
        self.lines += 1;
    }

    /// Characters not yet flushed
    pub fn pending(&self) -> &str {
        &self.line
    }

    /// The most recently flushed line
    pub fn last_line(&self) -> &str {
        &self.last
    }

    /// Number of lines flushed so far
    pub fn lines(&self) -> u64 {
        self.lines
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.put_byte(byte);
        }
        Ok(())
    }
}
