//! Glob matching for subscription patterns.
//!
//! Follows the pattern syntax of Redis `PSUBSCRIBE` so that local matching
//! agrees with what the server delivers:
//! - `*` matches any sequence of characters (including none)
//! - `?` matches exactly one character
//! - `[abc]`, `[a-z]`, `[^abc]` match one character from (or not from) a set
//! - `\x` matches `x` literally
//!
//! Matching is case-sensitive and operates on bytes.

/// Returns true if `pattern` contains any glob metacharacter.
pub fn is_glob(pattern: &str) -> bool {
    pattern.bytes().any(|b| matches!(b, b'*' | b'?' | b'[' | b'\\'))
}

/// Check whether `channel` matches the glob `pattern`.
pub fn matches(pattern: &str, channel: &str) -> bool {
    if !is_glob(pattern) {
        return pattern == channel;
    }
    match_bytes(pattern.as_bytes(), channel.as_bytes())
}

/// Iterative matcher with a single backtrack point: the pattern position
/// after the most recent `*` and the channel position it was tried from.
/// Runs in O(pattern * channel).
fn match_bytes(pat: &[u8], s: &[u8]) -> bool {
    let (mut p, mut i) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    loop {
        if pat.get(p) == Some(&b'*') {
            while pat.get(p) == Some(&b'*') {
                p += 1;
            }
            if p == pat.len() {
                return true;
            }
            star = Some((p, i));
            continue;
        }

        if i == s.len() {
            return p == pat.len();
        }

        if let Some(next) = match_token(pat, p, s[i]) {
            p = next;
            i += 1;
            continue;
        }

        match star {
            Some((resume, from)) => {
                star = Some((resume, from + 1));
                p = resume;
                i = from + 1;
            }
            None => return false,
        }
    }
}

/// Match the single-byte token at `pat[p]` against `c`.
///
/// Returns the pattern position after the token, or `None` on mismatch or
/// when the pattern is exhausted.
fn match_token(pat: &[u8], p: usize, c: u8) -> Option<usize> {
    match *pat.get(p)? {
        b'?' => Some(p + 1),
        b'[' => {
            let (matched, rest) = match_class(&pat[p + 1..], c);
            matched.then(|| pat.len() - rest.len())
        }
        b'\\' if p + 1 < pat.len() => (pat[p + 1] == c).then_some(p + 2),
        literal => (literal == c).then_some(p + 1),
    }
}

/// Match one byte against a character class body (the part after `[`).
///
/// Returns whether it matched and the pattern remaining after the closing `]`.
/// An unterminated class consumes the rest of the pattern.
fn match_class(mut pat: &[u8], c: u8) -> (bool, &[u8]) {
    let negate = pat.first() == Some(&b'^');
    if negate {
        pat = &pat[1..];
    }

    let mut matched = false;
    loop {
        match pat {
            [] => break,
            [b']', rest @ ..] => {
                pat = rest;
                break;
            }
            [b'\\', esc, rest @ ..] => {
                if *esc == c {
                    matched = true;
                }
                pat = rest;
            }
            [lo, b'-', hi, rest @ ..] if *hi != b']' => {
                let (lo, hi) = if lo <= hi { (*lo, *hi) } else { (*hi, *lo) };
                if (lo..=hi).contains(&c) {
                    matched = true;
                }
                pat = rest;
            }
            [b, rest @ ..] => {
                if *b == c {
                    matched = true;
                }
                pat = rest;
            }
        }
    }

    (matched != negate, pat)
}
