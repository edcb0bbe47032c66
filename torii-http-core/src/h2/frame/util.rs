use std::fmt;

use super::Error;

/// Big-endian u32 at `offset`.
pub(super) fn unpack_octets_as_u32(src: &[u8], offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&src[offset..offset + 4]);
    u32::from_be_bytes(buf)
}

/// Strips the pad-length prefix and trailing padding from a padded
/// payload.
pub(super) fn strip_padding(payload: &[u8]) -> Result<&[u8], Error> {
    let Some((&pad_len, rest)) = payload.split_first() else {
        return Err(Error::TooMuchPadding);
    };
    let pad_len = pad_len as usize;
    if pad_len > rest.len() {
        return Err(Error::TooMuchPadding);
    }
    Ok(&rest[..rest.len() - pad_len])
}

pub(super) struct DebugFlags<'a, 'f> {
    formatter: &'a mut fmt::Formatter<'f>,
    started: bool,
    result: fmt::Result,
}

pub(super) fn debug_flags<'a, 'f>(
    formatter: &'a mut fmt::Formatter<'f>,
    bits: u8,
) -> DebugFlags<'a, 'f> {
    let result = write!(formatter, "({bits:#x}");
    DebugFlags {
        formatter,
        started: false,
        result,
    }
}

impl DebugFlags<'_, '_> {
    pub(super) fn flag_if(mut self, enabled: bool, name: &str) -> Self {
        if enabled && self.result.is_ok() {
            let prefix = if self.started { " | " } else { ": " };
            self.started = true;
            self.result = write!(self.formatter, "{prefix}{name}");
        }
        self
    }

    pub(super) fn finish(self) -> fmt::Result {
        self.result?;
        write!(self.formatter, ")")
    }
}
