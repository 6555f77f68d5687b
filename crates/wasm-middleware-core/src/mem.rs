//! Guest linear-memory transfer primitives.
//!
//! Every host function that moves data in or out of guest memory goes through
//! these helpers. Reads and writes are bounds-checked against the memory
//! slice; an out-of-range access is a fatal guest violation and surfaces as a
//! Wasm trap in the calling host function.
//!
//! Getters use a retry protocol instead of a separate size query: the guest
//! supplies a buffer and a limit, the host always returns the true payload
//! length, and the payload is written only when it fits. An undersized buffer
//! is a success path; the guest retries with a larger one.

use anyhow::{bail, Result};

const EMPTY: &[u8] = &[];

/// Read `len` bytes of guest memory starting at `offset`.
///
/// A zero-length read returns a shared empty slice without touching memory.
///
/// # Errors
///
/// Returns an error (trapping the guest) if `[offset, offset + len)` is not
/// within the memory.
pub fn read<'a>(data: &'a [u8], field: &str, offset: u32, len: u32) -> Result<&'a [u8]> {
    if len == 0 {
        return Ok(EMPTY);
    }

    let start = offset as usize;
    let Some(end) = start.checked_add(len as usize) else {
        bail!("out of memory reading {field}: offset {offset} + len {len} overflows");
    };
    if end > data.len() {
        bail!(
            "out of memory reading {field}: [{start}, {end}) exceeds memory size {}",
            data.len()
        );
    }

    Ok(&data[start..end])
}

/// Read a UTF-8 string of `len` bytes from guest memory.
///
/// # Errors
///
/// Returns an error (trapping the guest) on out-of-range access or invalid
/// UTF-8.
pub fn read_string<'a>(data: &'a [u8], field: &str, offset: u32, len: u32) -> Result<&'a str> {
    let bytes = read(data, field, offset, len)?;
    match std::str::from_utf8(bytes) {
        Ok(s) => Ok(s),
        Err(e) => bail!("invalid UTF-8 reading {field}: {e}"),
    }
}

/// Write `bytes` to guest memory at `offset`.
///
/// # Errors
///
/// Returns an error (trapping the guest) if the target range is not within
/// the memory.
pub fn write(data: &mut [u8], field: &str, offset: u32, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }

    let start = offset as usize;
    let Some(end) = start.checked_add(bytes.len()) else {
        bail!("out of memory writing {field}: offset overflow");
    };
    if end > data.len() {
        bail!(
            "out of memory writing {field}: [{start}, {end}) exceeds memory size {}",
            data.len()
        );
    }

    data[start..end].copy_from_slice(bytes);
    Ok(())
}

/// Write `bytes` at `offset` only if they fit within `limit`; always return
/// the true length.
///
/// The write happens iff `0 < bytes.len() <= limit`. On an undersized buffer
/// the guest observes the required length in the return value and retries.
///
/// # Errors
///
/// Returns an error (trapping the guest) if a write that fits the limit falls
/// outside the memory.
pub fn write_if_under_limit(
    data: &mut [u8],
    field: &str,
    offset: u32,
    limit: u32,
    bytes: &[u8],
) -> Result<u32> {
    let len = bytes.len() as u32;
    if len > limit || len == 0 {
        return Ok(len); // caller retries with a larger buffer, or had nothing to read
    }

    write(data, field, offset, bytes)?;
    Ok(len)
}

/// [`write_if_under_limit`] specialized to UTF-8 string payloads.
///
/// No NUL terminator is written; the return value carries the length.
pub fn write_string_if_under_limit(
    data: &mut [u8],
    field: &str,
    offset: u32,
    limit: u32,
    value: &str,
) -> Result<u32> {
    write_if_under_limit(data, field, offset, limit, value.as_bytes())
}
