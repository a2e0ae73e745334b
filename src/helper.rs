use bincode::{DefaultOptions, Options};
use nix::sys::stat::mode_t;

use crate::FileType;

/// The bincode config every wire struct goes through: fixed-width ints,
/// little-endian, trailing bytes allowed so a record can be read off the
/// front of a larger payload.
pub(crate) fn get_bincode_config() -> impl Options + Copy {
    DefaultOptions::new()
        .with_little_endian()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}

pub(crate) fn get_first_null_position(data: impl AsRef<[u8]>) -> Option<usize> {
    data.as_ref().iter().position(|char| *char == 0)
}

/// returns the mode for a given filetype and permission
pub fn mode_from_kind_and_perm(kind: FileType, perm: u16) -> u32 {
    (mode_t::from(kind) | perm as mode_t) as u32
}

/// returns the permission for a given file kind and mode
pub fn perm_from_mode_and_kind(kind: FileType, mode: mode_t) -> u16 {
    (mode ^ mode_t::from(kind)) as u16
}
