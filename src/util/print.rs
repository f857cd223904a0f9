//! Output that never touches the allocator. Everything here is safe to call
//! from inside `malloc()`.

use std::fmt::{self, Write};

/// Write raw bytes to stderr with `write(2)`. Short writes and errors are
/// ignored: this is debug output.
pub fn putbytes(bytes: &[u8]) {
    // SAFETY: `bytes` is a valid buffer of `bytes.len()` bytes.
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

/// `puts`... but safe (doesn't use the allocator), and to stderr
pub fn putstr(s: &str) {
    putbytes(s.as_bytes());
}

/// Something `put!` knows how to print without allocating.
pub trait Put {
    fn put(&self);
}

impl Put for &str {
    fn put(&self) {
        putstr(self)
    }
}

impl Put for usize {
    fn put(&self) {
        let mut buf = [0u8; 20];
        let mut i = buf.len();
        let mut n = *self;
        loop {
            i -= 1;
            buf[i] = b'0' + (n % 10) as u8;
            n /= 10;
            if n == 0 {
                break;
            }
        }
        putbytes(&buf[i..]);
    }
}

/// Print a word as 16 lowercase hex digits, zero padded.
#[derive(Clone, Copy)]
pub struct Hex(pub usize);

impl Hex {
    pub fn digits(self) -> [u8; 16] {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut buf = [0u8; 16];
        let mut x = self.0 as u64;
        for slot in buf.iter_mut().rev() {
            *slot = DIGITS[(x & 0xf) as usize];
            x >>= 4;
        }
        buf
    }
}

impl Put for Hex {
    fn put(&self) {
        putbytes(&self.digits());
    }
}

/// A fixed-capacity buffer to format into. Output past the end is dropped
/// and reported as [`fmt::Error`].
pub struct StackBuf<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackBuf<N> {
    pub const fn new() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The text written so far, minus any character cut in half at the end
    pub fn as_str(&self) -> &str {
        match std::str::from_utf8(self.as_bytes()) {
            Ok(s) => s,
            Err(err) => {
                let valid = &self.buf[..err.valid_up_to()];
                // SAFETY: validated just now
                unsafe { std::str::from_utf8_unchecked(valid) }
            }
        }
    }
}

impl<const N: usize> Default for StackBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Write for StackBuf<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let n = s.len().min(N - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        if n < s.len() {
            Err(fmt::Error)
        } else {
            Ok(())
        }
    }
}

impl<const N: usize> Put for StackBuf<N> {
    fn put(&self) {
        putbytes(self.as_bytes());
    }
}

/// Format `args` into a fixed stack buffer and write it to stderr, followed by
/// a newline. Output longer than the buffer is truncated.
pub fn putfmt(args: fmt::Arguments<'_>) {
    let mut buf = StackBuf::<512>::new();
    // A full buffer is the only possible error, and truncation is fine.
    let _ = buf.write_fmt(args);
    putbytes(buf.as_bytes());
    putbytes(b"\n");
}

/// Like `print!()` but for values implementing [`Put`], and never allocates
#[macro_export]
macro_rules! put {
    ($($arg:expr),* $(,)?) => {{
        $($crate::util::print::Put::put(&$arg);)*
    }};
}

/// [`put!`] with a trailing newline
#[macro_export]
macro_rules! putln {
    ($($arg:expr),* $(,)?) => {{
        $crate::put!($($arg,)* "\n");
    }};
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use super::{Hex, StackBuf};

    #[test]
    fn hex_is_zero_padded() {
        assert_eq!(&Hex(0xaced).digits(), b"000000000000aced");
        assert_eq!(&Hex(0).digits(), b"0000000000000000");
    }

    #[test]
    fn stack_buffer_truncates_on_a_character_boundary() {
        let mut buf = StackBuf::<8>::new();
        write!(buf, "{}", 1234).unwrap();
        assert_eq!(buf.as_str(), "1234");
        assert!(buf.write_str("abcé!").is_err());
        assert_eq!(buf.as_bytes().len(), 8);
        assert_eq!(buf.as_str(), "1234abc");
    }
}
