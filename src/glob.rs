//! Glob matching for key patterns, channel patterns, and PUBSUB CHANNELS.
//!
//! Supports `*`, `?`, `[abc]`, `[^abc]`, `[a-z]`, and `\` escapes. Matching is
//! iterative with single-star backtracking, so hostile patterns from
//! SUBSCRIBE arguments cannot trigger exponential blowup.

pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pat = pattern.as_bytes();
    let txt = text.as_bytes();

    let mut p = 0;
    let mut t = 0;
    // Position of the most recent `*` and the text offset it was tried at.
    let mut backtrack: Option<(usize, usize)> = None;

    while t < txt.len() {
        let step = if p < pat.len() {
            match pat[p] {
                b'*' => {
                    backtrack = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => Some(1),
                b'[' => bracket_len(&pat[p..], txt[t]),
                b'\\' if p + 1 < pat.len() => (pat[p + 1] == txt[t]).then_some(2),
                c => (c == txt[t]).then_some(1),
            }
        } else {
            None
        };

        match (step, backtrack) {
            (Some(consumed), _) => {
                p += consumed;
                t += 1;
            }
            (None, Some((star_p, star_t))) => {
                // Widen the last star by one character and retry.
                p = star_p + 1;
                t = star_t + 1;
                backtrack = Some((star_p, star_t + 1));
            }
            (None, None) => return false,
        }
    }

    while p < pat.len() && pat[p] == b'*' {
        p += 1;
    }
    p == pat.len()
}

/// If `pat` starts with a bracket class matching `c`, the number of pattern
/// bytes the class occupies. `None` on mismatch or an unterminated class.
fn bracket_len(pat: &[u8], c: u8) -> Option<usize> {
    debug_assert_eq!(pat[0], b'[');
    let mut i = 1;
    let negated = pat.get(i) == Some(&b'^');
    if negated {
        i += 1;
    }

    let mut hit = false;
    while i < pat.len() && pat[i] != b']' {
        if pat.get(i + 1) == Some(&b'-') && i + 2 < pat.len() && pat[i + 2] != b']' {
            if pat[i] <= c && c <= pat[i + 2] {
                hit = true;
            }
            i += 3;
        } else {
            if pat[i] == c {
                hit = true;
            }
            i += 1;
        }
    }

    if i >= pat.len() {
        return None;
    }

    (hit != negated).then_some(i + 1)
}
