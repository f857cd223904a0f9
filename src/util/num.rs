/// Round up `n` to the nearest `to`
pub fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// Round down `n` to the nearest `to`
pub fn round_down(n: usize, to: usize) -> usize {
    n - n % to
}

/// Trial division. Only used on configuration values, never on a hot path.
pub fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3u64;
    while d.saturating_mul(d) <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

/// The largest prime `<= n`, or `None` if `n < 2`.
pub fn prime_at_or_below(n: u64) -> Option<u64> {
    (2..=n).rev().find(|&candidate| is_prime(candidate))
}

/// Parse an unsigned integer the way `strtoul(s, NULL, 0)` picks its base:
/// `0x`/`0X` is hex, a leading `0` is octal, anything else is decimal.
/// Surrounding whitespace is ignored. Unlike `strtoul`, trailing garbage is an
/// error rather than silently ignored.
pub fn parse_auto_radix(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}
