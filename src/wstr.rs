//! UTF-16 string helpers for the Win32 W-APIs

/// encode as a nul-terminated UTF-16 buffer
pub fn to_wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(core::iter::once(0)).collect()
}

/// decode a nul-terminated or exact-length UTF-16 buffer
pub fn from_wide(buffer: &[u16]) -> String {
    let len = buffer.iter().position(|&c| c == 0).unwrap_or(buffer.len());
    String::from_utf16_lossy(&buffer[..len])
}
