//! Scoped variables and the `$(name:pattern:replacement)` expansion grammar.
//!
//! Two [`OrderedStringMap`]s are live during rule loading: *global* persists
//! across the whole file, *local* resets between stanzas. [`Expander`]
//! borrows both, resolving dotted/`$sub`-indirected names and driving the
//! expansion grammar described in the rule-file format.

use std::collections::BTreeSet;

use thiserror::Error;

use crate::ordmap::OrderedStringMap;

#[derive(Debug, Error, Clone)]
pub enum ExpandError {
    #[error("cannot change frozen variable '{0}'")]
    FrozenVariable(String),
    #[error("variable '{0}' not defined")]
    UndefinedVariable(String),
    #[error("cannot expand non-singleton '{sub}' in '{spec}'")]
    NonSingletonSub { sub: String, spec: String },
    #[error("invalid variable reference '{0}'")]
    InvalidReference(String),
    #[error("unexpected $ at the end of string")]
    DanglingDollar,
    #[error("expected ( after $ in '{0}'")]
    MissingOpenParen(String),
    #[error("unbalanced parentheses in '{0}'")]
    UnbalancedParens(String),
    #[error("modifier expansions ('~') are not supported")]
    ModifierUnsupported,
    #[error("expansion nesting too deep in '{0}'")]
    TooDeep(String),
}

/// A named, ordered list of string values plus a same-content set used for
/// pattern-match seeking. Once `frozen`, further mutation is a rule-file
/// error -- variables are frozen the moment they are referenced by an
/// expansion, and (separately) `out`/`meta`/`cmd` freeze their backing
/// variables at stanza end.
#[derive(Debug, Default, Clone)]
pub struct Variable {
    values: Vec<String>,
    value_set: BTreeSet<String>,
    frozen: bool,
}

impl Variable {
    pub fn new() -> Self {
        Variable::default()
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn add(&mut self, name: &str, value: impl Into<String>) -> Result<(), ExpandError> {
        if self.frozen {
            return Err(ExpandError::FrozenVariable(name.to_string()));
        }
        let value = value.into();
        self.value_set.insert(value.clone());
        self.values.push(value);
        Ok(())
    }

    pub fn clear(&mut self, name: &str) -> Result<(), ExpandError> {
        if self.frozen {
            return Err(ExpandError::FrozenVariable(name.to_string()));
        }
        self.values.clear();
        self.value_set.clear();
        Ok(())
    }

    pub fn reset(&mut self, name: &str, value: impl Into<String>) -> Result<(), ExpandError> {
        self.clear(name)?;
        self.add(name, value)
    }

    /// Rewrites the value at `idx` in place, fixing up the membership set
    /// pattern-match seeking relies on. Used to normalize a value after it
    /// has already been appended (e.g. stripping the `$srcdir` prefix off a
    /// `dep` target) without going through `clear`+`add` and losing the rest
    /// of the list.
    pub fn replace(&mut self, name: &str, idx: usize, value: impl Into<String>) -> Result<(), ExpandError> {
        if self.frozen {
            return Err(ExpandError::FrozenVariable(name.to_string()));
        }
        let value = value.into();
        let old = std::mem::replace(&mut self.values[idx], value.clone());
        self.value_set.remove(&old);
        self.value_set.insert(value);
        Ok(())
    }

    /// Content hash of the ordered value list, stable across process runs
    /// (used for `cmd_hash`; `std::hash::DefaultHasher` is explicitly not
    /// stable across runs and would defeat persistence).
    pub fn content_hash(&self) -> blake3::Hash {
        let mut hasher = blake3::Hasher::new();
        for v in &self.values {
            hasher.update(v.as_bytes());
            hasher.update(b"\0");
        }
        hasher.finalize()
    }

    fn iter_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> {
        self.value_set
            .range(prefix.to_string()..)
            .take_while(move |v| v.starts_with(prefix))
            .map(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Local,
    Global,
}

/// The two name-scoped maps live for the duration of rule loading.
#[derive(Debug, Default)]
pub struct Environment {
    pub global: OrderedStringMap<Variable>,
    pub local: OrderedStringMap<Variable>,
}

impl Environment {
    pub fn new() -> Self {
        Environment::default()
    }

    pub fn reset_local(&mut self) {
        self.local = OrderedStringMap::new();
    }

    fn map(&self, scope: Scope) -> &OrderedStringMap<Variable> {
        match scope {
            Scope::Local => &self.local,
            Scope::Global => &self.global,
        }
    }

    fn map_mut(&mut self, scope: Scope) -> &mut OrderedStringMap<Variable> {
        match scope {
            Scope::Local => &mut self.local,
            Scope::Global => &mut self.global,
        }
    }

    pub fn get(&self, scope: Scope, name: &str) -> Option<&Variable> {
        self.map(scope).get(name)
    }

    /// Assigns (overwriting) `name` in `scope`, returning the fresh variable.
    /// Mirrors `env_set`: clearing a frozen variable is a rule-file error.
    pub fn set(&mut self, scope: Scope, name: &str) -> Result<&mut Variable, ExpandError> {
        if let Some(existing) = self.map(scope).get(name) {
            if existing.is_frozen() {
                return Err(ExpandError::FrozenVariable(name.to_string()));
            }
        }
        if !self.map(scope).contains(name) {
            self.map_mut(scope).insert(name, Variable::new());
        } else {
            self.map_mut(scope).get_mut(name).unwrap().clear(name)?;
        }
        Ok(self.map_mut(scope).get_mut(name).unwrap())
    }

    /// Appends `value` to `name` in `scope`, autovivifying the variable.
    pub fn add(&mut self, scope: Scope, name: &str, value: impl Into<String>) -> Result<(), ExpandError> {
        if !self.map(scope).contains(name) {
            self.map_mut(scope).insert(name, Variable::new());
        }
        self.map_mut(scope).get_mut(name).unwrap().add(name, value)
    }

    /// Rewrites a single already-appended value of `name` in `scope` in place.
    pub fn replace_value(
        &mut self,
        scope: Scope,
        name: &str,
        idx: usize,
        value: impl Into<String>,
    ) -> Result<(), ExpandError> {
        self.map_mut(scope)
            .get_mut(name)
            .ok_or_else(|| ExpandError::UndefinedVariable(name.to_string()))?
            .replace(name, idx, value)
    }

    /// Resolves `spec` per §4.2.1: a `base.suffix` name resolves `base` in
    /// either scope; `base.$sub` expands `$sub` (must be a singleton) before
    /// composing the final key. Returns `(resolved_key, autovivify)` so the
    /// caller can create the variable on demand without re-deriving the key.
    pub fn resolve_name(&self, spec: &str) -> Result<(String, bool), ExpandError> {
        if let Some(dot) = spec.find('.') {
            let base = &spec[..dot];
            let sub = &spec[dot + 1..];
            if !base.is_empty() {
                if let Some(sub_name) = sub.strip_prefix('$') {
                    let sub_var = self
                        .get(Scope::Local, sub_name)
                        .or_else(|| self.get(Scope::Global, sub_name))
                        .ok_or_else(|| ExpandError::UndefinedVariable(sub_name.to_string()))?;
                    if sub_var.values().is_empty() {
                        return Ok((String::new(), true));
                    }
                    if sub_var.values().len() > 1 {
                        return Err(ExpandError::NonSingletonSub {
                            sub: sub_name.to_string(),
                            spec: spec.to_string(),
                        });
                    }
                    let composed = format!("{base}.{}", sub_var.values()[0]);
                    return Ok((composed, true));
                }
            }
        }
        Ok((spec.to_string(), false))
    }

    /// Full resolution including autovivification, mirroring `env_resolve`.
    /// Returns `None` when the spec refers to a sub-variable whose value
    /// list is empty (the caller should silently skip, per the original).
    pub fn resolve(
        &mut self,
        spec: &str,
        autovivify: bool,
    ) -> Result<Option<(Scope, String)>, ExpandError> {
        let (key, vivified_by_sub) = self.resolve_name(spec)?;
        if vivified_by_sub && key.is_empty() {
            return Ok(None);
        }

        if let Some(dot) = spec.find('.') {
            let base = &spec[..dot];
            if !base.is_empty() && !vivified_by_sub {
                for scope in [Scope::Local, Scope::Global] {
                    if self.get(scope, base).is_some() {
                        if self.get(scope, spec).is_none() && autovivify {
                            self.set(scope, spec)?;
                        }
                        return Ok(Some((scope, spec.to_string())));
                    }
                }
            } else if vivified_by_sub {
                let use_scope = if self.get(Scope::Local, base).is_some() {
                    Scope::Local
                } else {
                    Scope::Global
                };
                if self.get(use_scope, &key).is_none() && autovivify {
                    self.set(use_scope, &key)?;
                }
                return Ok(Some((use_scope, key)));
            }
        }

        if self.get(Scope::Local, spec).is_some() {
            return Ok(Some((Scope::Local, spec.to_string())));
        }
        if self.get(Scope::Global, spec).is_some() {
            return Ok(Some((Scope::Global, spec.to_string())));
        }
        Ok(None)
    }
}

const MAX_EXPANSION_DEPTH: usize = 64;

/// Drives `$(...)` expansion of a single rule-file argument into `target`.
pub fn expand(env: &mut Environment, target_scope: Scope, target_name: &str, text: &str) -> Result<(), ExpandError> {
    let mut captures: [Option<String>; 9] = Default::default();
    expand_list(env, target_scope, target_name, text, &mut captures, 0)
}

fn expand_list(
    env: &mut Environment,
    target_scope: Scope,
    target_name: &str,
    text: &str,
    captures: &mut [Option<String>; 9],
    depth: usize,
) -> Result<(), ExpandError> {
    if depth > MAX_EXPANSION_DEPTH {
        return Err(ExpandError::TooDeep(text.to_string()));
    }

    let bytes = text.as_bytes();
    let mut i = 0usize;
    let mut escaped = false;
    let mut dollar_at = None;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '$' {
            dollar_at = Some(i);
            break;
        }
        i += 1;
    }

    let Some(dollar) = dollar_at else {
        let literal = unescape(text);
        return append_value(env, target_scope, target_name, literal);
    };

    if dollar + 1 >= bytes.len() {
        return Err(ExpandError::DanglingDollar);
    }
    if bytes[dollar + 1] != b'(' {
        return Err(ExpandError::MissingOpenParen(text.to_string()));
    }

    let mut depth_count = 0i32;
    let mut close = None;
    let mut j = dollar + 1;
    let mut esc = false;
    while j < bytes.len() {
        let c = bytes[j];
        if esc {
            esc = false;
        } else if c == b'\\' {
            esc = true;
        } else if c == b'(' {
            depth_count += 1;
        } else if c == b')' {
            depth_count -= 1;
            if depth_count == 0 {
                close = Some(j);
                break;
            }
        }
        j += 1;
    }
    let close = close.ok_or_else(|| ExpandError::UnbalancedParens(text.to_string()))?;

    let prefix = unescape(&text[..dollar]);
    let inner = &text[dollar + 2..close];
    let suffix = &text[close + 1..];

    let split_at = inner.find([':', '~']);
    let (ref_name, ref_spec) = match split_at {
        Some(p) => (&inner[..p], &inner[p..]),
        None => (inner, ""),
    };

    let Some((scope, key)) = env.resolve(ref_name, true)? else {
        return Ok(());
    };
    if let Some(var) = env.map_mut(scope).get_mut(&key) {
        var.freeze();
    } else {
        return Err(ExpandError::InvalidReference(text.to_string()));
    }

    if let Some(rest) = ref_spec.strip_prefix(':') {
        let var = env.map(scope).get(&key).cloned().unwrap_or_default();
        expand_match(env, target_scope, target_name, &var, rest, &prefix, suffix, captures, depth)
    } else if ref_spec.starts_with('~') {
        Err(ExpandError::ModifierUnsupported)
    } else {
        let var = env.map(scope).get(&key).cloned().unwrap_or_default();
        for v in var.values() {
            expand_item(env, target_scope, target_name, &prefix, v, suffix, false, captures, depth)?;
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
fn expand_item(
    env: &mut Environment,
    target_scope: Scope,
    target_name: &str,
    prefix: &str,
    value: &str,
    suffix: &str,
    replace: bool,
    captures: &mut [Option<String>; 9],
    depth: usize,
) -> Result<(), ExpandError> {
    let mut buf = String::with_capacity(prefix.len() + value.len() + suffix.len());
    buf.push_str(prefix);

    if replace {
        // A bare `%` substitutes the next capture in left-to-right order
        // (mirrors `%` on the pattern side); `$1`..`$9` substitutes a capture
        // by explicit index for replacements that reorder or repeat one.
        let mut chars = value.chars().peekable();
        let mut escape = false;
        let mut next_implicit = 0usize;
        while let Some(c) = chars.next() {
            if c == '\\' && !escape {
                escape = true;
            } else if !escape && c == '%' {
                if let Some(Some(cap)) = captures.get(next_implicit) {
                    buf.push_str(cap);
                }
                next_implicit += 1;
            } else if !escape && c == '$' && chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                let digit = chars.next().unwrap();
                let idx = digit.to_digit(10).unwrap() as usize;
                if idx >= 1 {
                    if let Some(Some(cap)) = captures.get(idx - 1) {
                        buf.push_str(cap);
                    }
                }
            } else {
                buf.push(c);
                escape = false;
            }
        }
    } else {
        buf.push_str(value);
    }

    buf.push_str(suffix);

    expand_list(env, target_scope, target_name, &buf, captures, depth + 1)
}

#[allow(clippy::too_many_arguments)]
fn expand_match(
    env: &mut Environment,
    target_scope: Scope,
    target_name: &str,
    var: &Variable,
    spec: &str,
    prefix: &str,
    suffix: &str,
    captures: &mut [Option<String>; 9],
    depth: usize,
) -> Result<(), ExpandError> {
    let (pattern_str, replacement) = split_unescaped(spec, ':');

    let mut pattern_var = Variable::new();
    {
        let mut pcaps: [Option<String>; 9] = Default::default();
        let tmp_scope = Scope::Local;
        let tmp_name = format!("$$pattern{depth}$$");
        env.map_mut(tmp_scope).insert_or_replace(&tmp_name, Variable::new());
        expand_list(env, tmp_scope, &tmp_name, pattern_str, &mut pcaps, depth + 1)?;
        if let Some(v) = env.map(tmp_scope).get(&tmp_name) {
            pattern_var = v.clone();
        }
        env.map_mut(tmp_scope).remove(&tmp_name);
    }

    for pattern in pattern_var.values().to_vec() {
        let lit_prefix = literal_prefix(&pattern);
        for candidate in var.iter_prefix(&lit_prefix).map(|s| s.to_string()).collect::<Vec<_>>() {
            let replace = !replacement.is_empty();
            let Some(caps) = pattern_match(&pattern, &candidate) else {
                continue;
            };
            let mut local_caps = captures.clone();
            for (idx, cap) in caps.into_iter().enumerate().take(9) {
                local_caps[idx] = cap;
            }
            let chosen = if replace { replacement } else { candidate.as_str() };
            expand_item(
                env,
                target_scope,
                target_name,
                prefix,
                chosen,
                suffix,
                replace,
                &mut local_caps,
                depth,
            )?;
        }
    }

    Ok(())
}

fn append_value(env: &mut Environment, scope: Scope, name: &str, value: String) -> Result<(), ExpandError> {
    env.add(scope, name, value)
}

/// Splits `spec` at the first unescaped occurrence of `stop`, consuming it.
/// Mirrors `fetch_until(&in, stop, '\\')`.
fn split_unescaped(spec: &str, stop: char) -> (&str, &str) {
    let bytes = spec.as_bytes();
    let mut i = 0;
    let mut escaped = false;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == stop {
            return (&spec[..i], &spec[i + 1..]);
        }
        i += 1;
    }
    (spec, "")
}

fn literal_prefix(pattern: &str) -> String {
    let mut out = String::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => out.push(escaped),
                None => break,
            },
            '*' | '%' => break,
            other => out.push(other),
        }
    }
    out
}

#[derive(Debug, Clone, Copy)]
enum PatToken {
    Lit(char),
    Star,
    Capture,
}

fn compile_pattern(pattern: &str) -> Vec<PatToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    tokens.push(PatToken::Lit(escaped));
                }
            }
            '*' => tokens.push(PatToken::Star),
            '%' => tokens.push(PatToken::Capture),
            other => tokens.push(PatToken::Lit(other)),
        }
    }
    tokens
}

/// Matches `candidate` against `pattern`'s glob (literal / `*` / `%`)
/// grammar, returning the `%`-captured substrings in left-to-right order on
/// success.
fn pattern_match(pattern: &str, candidate: &str) -> Option<Vec<Option<String>>> {
    let tokens = compile_pattern(pattern);
    let text: Vec<char> = candidate.chars().collect();
    let mut captures = Vec::new();
    if match_tokens(&tokens, &text, &mut captures) {
        Some(captures)
    } else {
        None
    }
}

fn match_tokens(tokens: &[PatToken], text: &[char], captures: &mut Vec<Option<String>>) -> bool {
    match tokens.split_first() {
        None => text.is_empty(),
        Some((PatToken::Lit(c), rest)) => {
            !text.is_empty() && text[0] == *c && match_tokens(rest, &text[1..], captures)
        }
        Some((PatToken::Star, rest)) => {
            for take in 0..=text.len() {
                if match_tokens(rest, &text[take..], captures) {
                    return true;
                }
            }
            false
        }
        Some((PatToken::Capture, rest)) => {
            for take in 0..=text.len() {
                let mut trial = captures.clone();
                trial.push(Some(text[..take].iter().collect()));
                if match_tokens(rest, &text[take..], &mut trial) {
                    *captures = trial;
                    return true;
                }
            }
            false
        }
    }
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}
