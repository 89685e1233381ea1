//! Non-owning string views and a small growable buffer.
//!
//! The rule loader tokenizes over these rather than allocating a `String` per
//! line or word: [`lines`] drives its line/stanza walk, [`words`] and
//! [`split_first_word`] split a line into its arguments, and
//! [`Span::starts_with`] strips the `$srcdir` prefix off a declared `dep`
//! target before it is stored. `Span` mirrors a `&str` slice, kept as a
//! distinct type so call sites read like the two-pointer view they describe
//! (start/end rather than pointer/length); callers that need to retain one
//! past the buffer's lifetime call [`Span::to_owned_string`].

use std::fmt;

/// A borrowed range of bytes within some backing string.
///
/// Equivalent to `&str`, kept as a distinct type so call sites read like the
/// two-pointer view they describe (start/end rather than pointer/length), and
/// so prefix/suffix operations (`starts_with`, `tail`) read as span algebra.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Span<'a> {
    text: &'a str,
}

impl<'a> Span<'a> {
    pub fn new(text: &'a str) -> Self {
        Span { text }
    }

    pub fn as_str(&self) -> &'a str {
        self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// Returns the span with its first character removed.
    ///
    /// Panics if the span is empty; callers check `is_empty` first, matching
    /// the unchecked pointer-advance the original performs.
    pub fn tail(&self) -> Span<'a> {
        let mut chars = self.text.chars();
        chars.next();
        Span::new(chars.as_str())
    }

    /// If `self` starts with `prefix`, returns the remainder after it.
    pub fn starts_with(&self, prefix: &str) -> Option<Span<'a>> {
        self.text.strip_prefix(prefix).map(Span::new)
    }

    pub fn eq_str(&self, other: &str) -> bool {
        self.text == other
    }

    pub fn to_owned_string(&self) -> String {
        self.text.to_string()
    }
}

impl<'a> fmt::Display for Span<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.text)
    }
}

impl<'a> fmt::Debug for Span<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Span({:?})", self.text)
    }
}

impl<'a> From<&'a str> for Span<'a> {
    fn from(text: &'a str) -> Self {
        Span::new(text)
    }
}

/// Tracks a reader's position within a buffer for error-location reporting.
///
/// The rule loader pushes one of these per file/macro-replay/for-iteration/sub
/// onto a location stack (see `rules::Location`); this type is the leaf unit
/// that stack is built from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineCursor<'a> {
    pub line_no: usize,
    pub text: &'a str,
}

/// Splits `buf` into `(line_no, line_text)` pairs, 1-indexed, with trailing
/// newlines stripped and blank lines preserved (stanza boundaries rely on
/// seeing them).
pub fn lines(buf: &str) -> impl Iterator<Item = LineCursor<'_>> {
    buf.lines()
        .enumerate()
        .map(|(i, text)| LineCursor { line_no: i + 1, text })
}

/// Splits a line into whitespace-separated words, preserving nothing of the
/// original whitespace width (the rule grammar has no columnar syntax).
pub fn words(line: &str) -> impl Iterator<Item = &str> {
    line.split_ascii_whitespace()
}

/// Splits `line` into its first whitespace-separated word and the
/// (left-trimmed) remainder -- the split the rule loader applies at every
/// command dispatch point (`cmd ARGS`, `set NAME VALUE`, ...).
pub fn split_first_word(line: &str) -> (&str, &str) {
    let line = line.trim_start();
    match line.find(' ') {
        Some(idx) => (&line[..idx], line[idx..].trim_start()),
        None => (line, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basic_ops() {
        let s = Span::new("hello");
        assert_eq!(s.len(), 5);
        assert!(!s.is_empty());
        assert_eq!(s.tail().as_str(), "ello");
    }

    #[test]
    fn span_starts_with() {
        let s = Span::new("$srcdir/foo.c");
        let rest = s.starts_with("$srcdir/").unwrap();
        assert_eq!(rest.as_str(), "foo.c");
        assert!(s.starts_with("nope").is_none());
    }

    #[test]
    fn span_empty_tail_of_empty_is_empty() {
        let s = Span::new("");
        assert!(s.is_empty());
    }

    #[test]
    fn lines_preserves_blank_lines_as_stanza_separators() {
        let buf = "set a 1\n\nset b 2\n";
        let collected: Vec<_> = lines(buf).map(|l| (l.line_no, l.text)).collect();
        assert_eq!(collected, vec![(1, "set a 1"), (2, ""), (3, "set b 2")]);
    }

    #[test]
    fn words_splits_on_ascii_whitespace() {
        let w: Vec<_> = words("cmd  /bin/echo   hello").collect();
        assert_eq!(w, vec!["cmd", "/bin/echo", "hello"]);
    }

    #[test]
    fn split_first_word_separates_command_from_rest() {
        assert_eq!(split_first_word("cmd /bin/echo hello"), ("cmd", "/bin/echo hello"));
        assert_eq!(split_first_word("out x"), ("out", "x"));
    }

    #[test]
    fn split_first_word_on_single_word_line_leaves_rest_empty() {
        assert_eq!(split_first_word("noop"), ("noop", ""));
    }
}
