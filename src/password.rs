//! Secure in-memory password container.
//!
//! The buffer is overwritten on drop and on `clear`; the only way to
//! read the plaintext is the scoped [`Password::with_plain`] deployment,
//! which hands the bytes to a closure and keeps them from escaping.

use rand::rngs::OsRng;
use rand::RngCore;

/// Maximum password length in octets.
pub const MAX_PASSWORD_LENGTH: usize = 256;

/// A password held in a fixed-capacity buffer that is wiped on drop.
pub struct Password {
    buffer: Box<[u8; MAX_PASSWORD_LENGTH]>,
    length: usize,
}

impl Password {
    pub fn new() -> Self {
        Password { buffer: Box::new([0u8; MAX_PASSWORD_LENGTH]), length: 0 }
    }

    /// Construct from an octet sequence; excess octets are dropped.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut password = Password::new();
        password.set(bytes);
        password
    }

    /// Replace the content. Octets beyond the capacity are ignored.
    pub fn set(&mut self, bytes: &[u8]) {
        self.clear();
        let n = bytes.len().min(MAX_PASSWORD_LENGTH);
        self.buffer[..n].copy_from_slice(&bytes[..n]);
        self.length = n;
    }

    /// Append a single character (UTF-8 encoded). Silently ignored when
    /// the buffer is full.
    pub fn push(&mut self, ch: char) {
        let mut utf8 = [0u8; 4];
        let encoded = ch.encode_utf8(&mut utf8);
        if self.length + encoded.len() <= MAX_PASSWORD_LENGTH {
            self.buffer[self.length..self.length + encoded.len()]
                .copy_from_slice(encoded.as_bytes());
            self.length += encoded.len();
        }
    }

    /// Overwrite the buffer and reset the length.
    pub fn clear(&mut self) {
        wipe(&mut self.buffer[..]);
        self.length = 0;
    }

    /// Fill with `n` random octets.
    pub fn random(&mut self, n: usize) {
        self.clear();
        let n = n.min(MAX_PASSWORD_LENGTH);
        OsRng.fill_bytes(&mut self.buffer[..n]);
        self.length = n;
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Constant-time equality over the full capacity.
    pub fn equals(&self, other: &Password) -> bool {
        let mut diff = (self.length ^ other.length) as u8;
        for i in 0..MAX_PASSWORD_LENGTH {
            diff |= self.buffer[i] ^ other.buffer[i];
        }
        diff == 0
    }

    /// A crude quality heuristic in [0,1]: rewards length and use of
    /// several character classes.
    pub fn quality(&self) -> f64 {
        if self.length == 0 {
            return 0.0;
        }
        let bytes = &self.buffer[..self.length];
        let mut classes = 0u32;
        if bytes.iter().any(|b| b.is_ascii_lowercase()) {
            classes += 1;
        }
        if bytes.iter().any(|b| b.is_ascii_uppercase()) {
            classes += 1;
        }
        if bytes.iter().any(|b| b.is_ascii_digit()) {
            classes += 1;
        }
        if bytes.iter().any(|b| !b.is_ascii_alphanumeric()) {
            classes += 1;
        }
        let length_score = (self.length as f64 / 12.0).min(1.0);
        let class_score = classes as f64 / 4.0;
        (0.6 * length_score + 0.4 * class_score).clamp(0.0, 1.0)
    }

    /// Scoped deployment: reveal the plaintext octets to `f` only.
    ///
    /// The borrow ends with the closure, so the plain bytes cannot
    /// escape the deployment scope.
    pub fn with_plain<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.buffer[..self.length])
    }
}

impl Default for Password {
    fn default() -> Self {
        Password::new()
    }
}

impl Clone for Password {
    fn clone(&self) -> Self {
        let mut duplicate = Password::new();
        duplicate.buffer.copy_from_slice(&self.buffer[..]);
        duplicate.length = self.length;
        duplicate
    }
}

impl Drop for Password {
    fn drop(&mut self) {
        wipe(&mut self.buffer[..]);
    }
}

// Passwords never appear in debug output.
impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Password(<{} octets>)", self.length)
    }
}

/// Overwrite a buffer in a way the optimizer may not elide.
fn wipe(buffer: &mut [u8]) {
    for b in buffer.iter_mut() {
        // SAFETY: `b` is a valid, aligned pointer into the buffer.
        unsafe { std::ptr::write_volatile(b, 0) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_len() {
        let mut p = Password::new();
        assert!(p.is_empty());
        p.set(b"secret");
        assert_eq!(p.len(), 6);
        p.with_plain(|bytes| assert_eq!(bytes, b"secret"));
    }

    #[test]
    fn push_appends_characters() {
        let mut p = Password::new();
        p.push('a');
        p.push('b');
        p.with_plain(|bytes| assert_eq!(bytes, b"ab"));
    }

    #[test]
    fn clear_wipes() {
        let mut p = Password::from_bytes(b"topsecret");
        p.clear();
        assert!(p.is_empty());
        p.with_plain(|bytes| assert!(bytes.is_empty()));
    }

    #[test]
    fn constant_time_equality() {
        let a = Password::from_bytes(b"same");
        let b = Password::from_bytes(b"same");
        let c = Password::from_bytes(b"other");
        assert!(a.equals(&b));
        assert!(!a.equals(&c));
    }

    #[test]
    fn duplicate_copies_bytes_and_length() {
        let a = Password::from_bytes(b"dup");
        let b = a.clone();
        assert!(a.equals(&b));
    }

    #[test]
    fn random_fill() {
        let mut p = Password::new();
        p.random(32);
        assert_eq!(p.len(), 32);
    }

    #[test]
    fn quality_bounds() {
        let weak = Password::from_bytes(b"a");
        let strong = Password::from_bytes(b"Tr0ub4dor&3xtra!");
        assert!(weak.quality() > 0.0 && weak.quality() <= 1.0);
        assert!(strong.quality() > weak.quality());
        assert_eq!(Password::new().quality(), 0.0);
    }

    #[test]
    fn debug_never_shows_plaintext() {
        let p = Password::from_bytes(b"hunter2");
        let shown = format!("{:?}", p);
        assert!(!shown.contains("hunter2"));
    }

    #[test]
    fn set_truncates_overlong_input() {
        let long = vec![b'x'; MAX_PASSWORD_LENGTH + 64];
        let p = Password::from_bytes(&long);
        assert_eq!(p.len(), MAX_PASSWORD_LENGTH);
    }
}
