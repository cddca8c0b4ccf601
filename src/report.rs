//! Corruption reporting: the last-error slot, the error callback and the
//! dump file.

use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write as _};
use std::path::Path;

use crate::error::PoolError;
use crate::layout::ALIGNMENT;
use crate::region::Region;
use crate::settings::PoolSettings;

/// Capacity of the in-region last-error message buffer.
pub(crate) const ERROR_MESSAGE_CAPACITY: usize = 512;

/// The auxiliary section of the pool region: the lock state and the
/// last-error slot. Field order is part of the on-memory format.
#[repr(C)]
pub(crate) struct AuxData {
    /// Reserved slot for the in-region lock handle; the lock itself is owned
    /// by the pool handle.
    #[allow(dead_code, reason = "wire format slot, consumed through the region bytes")]
    pub(crate) lock_word: usize,

    /// Whether the pool was created for cross-thread use and its lock is
    /// operational. Nonzero means initialized.
    #[allow(dead_code, reason = "wire format slot, consumed through the region bytes")]
    pub(crate) lock_initialized: usize,

    /// The last-error code; zero is "no error".
    pub(crate) last_error: usize,

    /// NUL-terminated human-readable rendering of the last error.
    pub(crate) message: [u8; ERROR_MESSAGE_CAPACITY],
}

impl AuxData {
    /// Resets the slot to "no error", as done on entry of every user-facing
    /// operation.
    pub(crate) fn clear_error(&mut self) {
        self.last_error = PoolError::to_code(None);
        self.message.fill(0);
    }

    pub(crate) fn set_error(&mut self, error: PoolError, message: &str) {
        self.last_error = PoolError::to_code(Some(error));
        self.message.fill(0);

        // Keep the trailing NUL: at most capacity - 1 message bytes.
        let length = message.len().min(ERROR_MESSAGE_CAPACITY - 1);
        self.message[..length].copy_from_slice(&message.as_bytes()[..length]);
    }

    pub(crate) fn error(&self) -> Option<PoolError> {
        PoolError::from_code(self.last_error)
    }

    pub(crate) fn message(&self) -> String {
        let length = self
            .message
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(ERROR_MESSAGE_CAPACITY);
        String::from_utf8_lossy(&self.message[..length]).into_owned()
    }
}

/// Renders the error message, appending the fixed-form location suffix when
/// an address inside the region is implicated.
pub(crate) fn compose_message(
    error: PoolError,
    base_addr: usize,
    location: Option<usize>,
) -> String {
    let mut message = error.to_string();

    if let Some(address) = location {
        let offset = address - base_addr;
        // Infallible: writing to a String cannot fail.
        _ = write!(
            message,
            " (at the {address:#x} location / {offset} mempool offset)"
        );
    }

    message
}

/// Publishes an error through all three sinks: the last-error slot, the
/// registered callback (once, synchronously) and the dump file.
pub(crate) fn publish(
    region: &mut Region,
    settings: &PoolSettings,
    error: PoolError,
    location: Option<usize>,
) {
    let base_addr = region.base_addr();
    let message = compose_message(error, base_addr, location);

    region.aux_mut().set_error(error, &message);

    if let Some(callback) = &settings.error_callback {
        callback(error, &message);
    }

    if let Some(path) = &settings.dump_path {
        let mark_offset = location.map(|address| address - base_addr);
        append_dump(path, &message, region.as_bytes(), base_addr, mark_offset);
    }
}

/// Appends the error message and a full hex dump of the region to the dump
/// file. Best effort: I/O failures are swallowed, losing a dump must not
/// break the allocator.
pub(crate) fn append_dump(
    path: &Path,
    message: &str,
    region: &[u8],
    base_addr: usize,
    mark_offset: Option<usize>,
) {
    _ = try_append_dump(path, message, region, base_addr, mark_offset);
}

fn try_append_dump(
    path: &Path,
    message: &str,
    region: &[u8],
    base_addr: usize,
    mark_offset: Option<usize>,
) -> std::io::Result<()> {
    let file = OpenOptions::new().append(true).create(true).open(path)?;
    let mut writer = BufWriter::new(file);

    writeln!(writer)?;
    writeln!(writer, "{message}")?;
    write!(
        writer,
        "Mempool dump at location {base_addr:#x} ({} lines)",
        region.len() / ALIGNMENT
    )?;

    for (offset, byte) in region.iter().enumerate() {
        if offset % ALIGNMENT == 0 {
            write!(writer, "\n{}: ", offset / ALIGNMENT)?;
        }

        let mark = if mark_offset == Some(offset) {
            "(!!!MARK POINT!!!)"
        } else {
            ""
        };
        write!(writer, " {mark}{byte:02x}")?;
    }

    writeln!(writer)?;
    writer.flush()
}
