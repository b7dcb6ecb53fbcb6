//! Pure matching helpers for key scans.
//!
//! [`pattern_matches`] implements the subset of store glob syntax used by the
//! legacy layout lookups (`*` and `?`). [`contains_key_fragment`] is the byte
//! containment test behind the linear composite-key scan.

use super::keys::KEY_CODE_JOIN_CHAR;

/// Checks if a key matches a glob pattern.
///
/// `*` matches any sequence of characters (including an empty one) and `?`
/// matches exactly one character.
///
/// # Examples
///
/// ```
/// use gamecache_core::cache::pattern_matches;
///
/// assert!(pattern_matches("Game.Item_*", "Game.Item_1001"));
/// assert!(pattern_matches("Game.Item_10?1", "Game.Item_1001"));
/// assert!(!pattern_matches("Game.Item_*", "Game.Mail_1001"));
/// ```
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let key: Vec<char> = key.chars().collect();

    let (mut p, mut k) = (0, 0);
    // Position of the last `*` seen and the key position it is currently
    // absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while k < key.len() {
        match pattern.get(p) {
            Some('*') => {
                star = Some((p, k));
                p += 1;
            }
            Some('?') => {
                p += 1;
                k += 1;
            }
            Some(c) if *c == key[k] => {
                p += 1;
                k += 1;
            }
            _ => match star {
                Some((star_p, star_k)) => {
                    p = star_p + 1;
                    k = star_k + 1;
                    star = Some((star_p, star_k + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|c| *c == '*')
}

/// Returns the owning fragment of a composite key code.
///
/// ```
/// use gamecache_core::cache::owner_fragment;
///
/// assert_eq!(owner_fragment("1001-7"), "1001");
/// assert_eq!(owner_fragment("1001"), "1001");
/// ```
pub fn owner_fragment(key_code: &str) -> &str {
    key_code
        .split(KEY_CODE_JOIN_CHAR)
        .next()
        .unwrap_or(key_code)
}

/// Checks whether a stored hash field belongs to one of the requested keys.
///
/// Both sides are prefixed with the key join character before the
/// containment test, so a fragment only matches at the start of the field or
/// right after a join character.
pub fn contains_key_fragment(field: &[u8], fragments: &[Vec<u8>]) -> bool {
    let mut buf = [0u8; 4];
    let join = KEY_CODE_JOIN_CHAR.encode_utf8(&mut buf).as_bytes();

    let haystack: Vec<u8> = join.iter().chain(field.iter()).copied().collect();
    fragments.iter().any(|fragment| {
        let needle: Vec<u8> = join.iter().chain(fragment.iter()).copied().collect();
        haystack
            .windows(needle.len())
            .any(|window| window == needle.as_slice())
    })
}
