//! Helpers for the fixed-size, NUL-padded name buffers used by threads,
//! disks and directory entries.

/// Copy `src` into a fixed buffer, truncating to `N - 1` bytes and
/// NUL-terminating.
pub fn copy_name<const N: usize>(dst: &mut [u8; N], src: &str) {
    let len = src.len().min(N - 1);
    dst[..len].copy_from_slice(&src.as_bytes()[..len]);
    dst[len..].fill(0);
}

/// View a NUL-padded buffer as a `&str`, stopping at the first NUL.
pub fn name_str(buf: &[u8]) -> &str {
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    core::str::from_utf8(&buf[..len]).unwrap_or("<invalid>")
}

/// Length of a NUL-terminated C string, bounded by `max`.
///
/// # Safety
/// `ptr` must be valid for reads up to the terminator or `max` bytes.
pub unsafe fn cstr_len(ptr: *const u8, max: usize) -> usize {
    let mut len = 0;
    while len < max && unsafe { *ptr.add(len) } != 0 {
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_truncates_and_terminates() {
        let mut buf = [0xFFu8; 8];
        copy_name(&mut buf, "basalt");
        assert_eq!(name_str(&buf), "basalt");

        copy_name(&mut buf, "a-very-long-name");
        assert_eq!(name_str(&buf), "a-very-");
        assert_eq!(buf[7], 0);
    }
}
