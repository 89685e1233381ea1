//! Parsing support for `gib-wrapcc`, the compiler wrapper that turns a `-MD`
//! dependency file into `dep` lines on the job's control socket (§4.7's
//! "dynamic dependency discovery").
//!
//! The wrapper itself (argv rewriting, the child fork/exec, the fd-3 write)
//! lives in `src/bin/wrapcc.rs`; this module holds the pure text-processing
//! pieces so they can be unit tested without spawning a compiler.

/// Joins Makefile line continuations the way `read_logical_line` does: a
/// backslash immediately before a newline becomes a single space, and any
/// indentation on the continuation line is swallowed; a backslash before
/// anything else (including another backslash) is kept verbatim.
pub fn join_logical_lines(depfile: &str) -> Vec<String> {
    let chars: Vec<char> = depfile.chars().collect();
    let mut lines = Vec::new();
    let mut cur = String::new();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '\n' => {
                lines.push(std::mem::take(&mut cur));
                i += 1;
            }
            '\\' if i + 1 < chars.len() && chars[i + 1] == '\n' => {
                cur.push(' ');
                i += 2;
                while i < chars.len() && (chars[i] == ' ' || chars[i] == '\t') {
                    i += 1;
                }
            }
            '\\' if i + 1 < chars.len() && chars[i + 1] == '\\' => {
                cur.push('\\');
                cur.push('\\');
                i += 2;
            }
            c => {
                cur.push(c);
                i += 1;
            }
        }
    }
    if !cur.is_empty() {
        lines.push(cur);
    }
    lines
}

/// Splits on spaces not preceded by a backslash, keeping the backslash in the
/// returned word (mirrors `fetch_word_escaped`'s "esc passes the char
/// through unexamined" rule -- the dependency name itself may legitimately
/// contain a backslash-escaped space).
fn split_escaped_words(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    let mut words = Vec::new();
    let mut word = String::new();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ' ' {
            if !word.is_empty() {
                words.push(std::mem::take(&mut word));
            }
            i += 1;
            continue;
        }
        if chars[i] == '\\' && i + 1 < chars.len() {
            word.push(chars[i]);
            word.push(chars[i + 1]);
            i += 2;
            continue;
        }
        word.push(chars[i]);
        i += 1;
    }
    if !word.is_empty() {
        words.push(word);
    }
    words
}

/// `$$` in a Make dependency file escapes a literal `$`.
fn unescape_dollar(word: &str) -> String {
    word.replace("$$", "$")
}

/// Parses a `-MT out -MD` dependency file and returns the dependency paths
/// (everything after the `out:` target), with `$$` unescaped. Mirrors
/// `process_depfile`'s rule-matching loop.
pub fn parse_out_deps(depfile: &str) -> Option<Vec<String>> {
    for logical_line in join_logical_lines(depfile) {
        let trimmed = logical_line.trim_start();
        let mut words = split_escaped_words(trimmed);
        if words.is_empty() {
            continue;
        }
        let target = words.remove(0);
        if target != "out:" {
            continue;
        }
        return Some(words.iter().map(|w| unescape_dollar(w)).collect());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_single_line_rule() {
        let depfile = "out: a.c b.h\n";
        assert_eq!(parse_out_deps(depfile), Some(vec!["a.c".to_string(), "b.h".to_string()]));
    }

    #[test]
    fn joins_backslash_newline_continuations() {
        let depfile = "out: a.c \\\n  b.h \\\n  c.h\n";
        assert_eq!(
            parse_out_deps(depfile),
            Some(vec!["a.c".to_string(), "b.h".to_string(), "c.h".to_string()])
        );
    }

    #[test]
    fn unescapes_doubled_dollar_signs() {
        let depfile = "out: weird$$file.c\n";
        assert_eq!(parse_out_deps(depfile), Some(vec!["weird$file.c".to_string()]));
    }

    #[test]
    fn preserves_escaped_space_in_a_word() {
        let depfile = "out: has\\ space.c\n";
        assert_eq!(parse_out_deps(depfile), Some(vec!["has\\ space.c".to_string()]));
    }

    #[test]
    fn returns_none_when_no_out_target_found() {
        let depfile = "other: a.c\n";
        assert_eq!(parse_out_deps(depfile), None);
    }

    #[test]
    fn ignores_lines_before_the_out_target() {
        let depfile = "# comment\nout: x.c\n";
        assert_eq!(parse_out_deps(depfile), Some(vec!["x.c".to_string()]));
    }
}
