//! Kernel console log sink
//!
//! Records emitted through the `log` facade are formatted into a bounded
//! ring of fixed-size lines, the way a kernel console buffer keeps the most
//! recent messages. When the ring is full the oldest line is dropped; a line
//! that overflows [`LINE_LEN`] is cut short.

use alloc::vec::Vec;
use core::fmt::Write;

use heapless::{Deque, String};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Maximum bytes kept per line
pub const LINE_LEN: usize = 160;

/// Lines retained in the ring
pub const RING_LINES: usize = 64;

pub type ConsoleLine = String<LINE_LEN>;

/// Console ring buffer
pub struct Console {
    lines: Deque<ConsoleLine, RING_LINES>,
    dropped: u64,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            lines: Deque::new(),
            dropped: 0,
        }
    }

    /// Append one line, evicting the oldest if full
    pub fn push_line(&mut self, line: ConsoleLine) {
        if self.lines.is_full() {
            self.lines.pop_front();
            self.dropped += 1;
        }
        let _ = self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn drain(&mut self) -> Vec<ConsoleLine> {
        let mut out = Vec::with_capacity(self.lines.len());
        while let Some(line) = self.lines.pop_front() {
            out.push(line);
        }
        out
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// Global console instance
static CONSOLE: Mutex<Console> = Mutex::new(Console::new());

/// `log` backend writing into [`CONSOLE`]
pub struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = ConsoleLine::new();
        // Overflowing the line just truncates it.
        let _ = write!(line, "[{}] {}: {}", record.level(), record.target(), record.args());
        CONSOLE.lock().push_line(line);
    }

    fn flush(&self) {}
}

/// Install the console logger at `level`
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(level);
    Ok(())
}

/// Take every buffered line, oldest first
pub fn drain() -> Vec<ConsoleLine> {
    CONSOLE.lock().drain()
}
