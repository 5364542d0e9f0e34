//! NUL-terminated UTF-16 text stored in fixed-capacity envelope fields.

use crate::error::{CapacityError, TextError};

/// Length of `text` in UTF-16 code units, the unit envelope capacities use.
pub fn wide_len(text: &str) -> usize {
    text.encode_utf16().count()
}

/// Check that `text` fits a field of `capacity` units, leaving room for the NUL.
pub fn check_capacity(
    field: &'static str,
    text: &str,
    capacity: usize,
) -> Result<(), CapacityError> {
    let length = wide_len(text);
    if length >= capacity {
        return Err(CapacityError {
            field,
            length,
            capacity,
        });
    }
    Ok(())
}

/// Position, in UTF-16 code units, of the first NUL in `text`. The reader
/// would stop there.
pub fn find_nul(text: &str) -> Option<usize> {
    text.encode_utf16().position(|unit| unit == 0)
}

/// Copy `text` into `dest` and terminate it. Never truncates.
pub fn write_wide(field: &'static str, dest: &mut [u16], text: &str) -> Result<(), TextError> {
    if let Some(position) = find_nul(text) {
        return Err(TextError::EmbeddedNul { field, position });
    }
    check_capacity(field, text, dest.len())?;

    let mut end = 0;
    for (slot, unit) in dest.iter_mut().zip(text.encode_utf16()) {
        *slot = unit;
        end += 1;
    }
    dest[end] = 0;
    Ok(())
}

/// Read text up to the first NUL (or the end of the field).
pub fn read_wide(src: &[u16]) -> String {
    let end = src.iter().position(|&unit| unit == 0).unwrap_or(src.len());
    String::from_utf16_lossy(&src[..end])
}
