//! Knuth-Morris-Pratt substring search over byte slices.

/// Returns the offset of the first occurrence of `pattern` within
/// `data[start..end]`, relative to the start of `data`.
///
/// An empty pattern is never found; readers use it to mean "no delimiter".
///
/// ```
/// # use warden::io::kmp::index_of;
/// assert_eq!(index_of(b"abc|def", 0, 7, b"|"), Some(3));
/// assert_eq!(index_of(b"abc", 0, 3, b""), None);
/// ```
pub fn index_of(data: &[u8], start: usize, end: usize, pattern: &[u8]) -> Option<usize> {
    let end = end.min(data.len());
    if pattern.is_empty() || start >= end {
        return None;
    }

    let failure = failure(pattern);
    let mut j = 0;
    for (i, &byte) in data.iter().enumerate().take(end).skip(start) {
        while j > 0 && pattern[j] != byte {
            j = failure[j - 1];
        }
        if pattern[j] == byte {
            j += 1;
        }
        if j == pattern.len() {
            return Some(i + 1 - pattern.len());
        }
    }
    None
}

fn failure(pattern: &[u8]) -> Vec<usize> {
    let mut failure = vec![0; pattern.len()];
    let mut j = 0;
    for i in 1..pattern.len() {
        while j > 0 && pattern[j] != pattern[i] {
            j = failure[j - 1];
        }
        if pattern[j] == pattern[i] {
            j += 1;
        }
        failure[i] = j;
    }
    failure
}
