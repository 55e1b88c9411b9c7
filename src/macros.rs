//! Macro expansion: `$(NAME)` and `$(NAME|DEFAULT)` references resolved against a
//! stack of scoped macro tables.
//!
//! Expansion is recursive: a bound value (or a default) that itself contains
//! references is expanded again under the same scope. There is no memoization, so
//! the same text can expand differently in different scopes. Runaway recursion
//! (e.g. `A=$(B)`, `B=$(A)`) is cut off at [`Expander::max_depth`].

use indexmap::IndexMap;
use pest::Parser;
use pest_derive::Parser as PestParser;

#[derive(PestParser)]
#[grammar = "macro.pest"]
struct MacroParser;

/// Default limit for nested macro expansion.
pub const DEFAULT_MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MacroError {
    #[error("undefined macro $({name})")]
    Missing { name: String },
    #[error("macro expansion too deep expanding $({name}) (limit {limit}), possible cycle")]
    TooDeep { name: String, limit: usize },
    #[error("malformed macro reference: {0}")]
    Syntax(String),
    #[error("malformed macro definition {0:?}, expected name=value")]
    Definition(String),
}

/// One piece of a tokenized macro text.
#[derive(Debug, Clone, PartialEq)]
pub enum MacroToken {
    Literal(String),
    Ref {
        name: String,
        /// `None` when no `|` was given; `Some(vec![])` for `$(NAME|)`.
        default: Option<Vec<MacroToken>>,
    },
}

/// Ordered name → raw value bindings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroScope {
    bindings: IndexMap<String, String>,
}

impl MacroScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.bindings.get(name).map(String::as_str)
    }

    /// Bind `name`, replacing any previous value in this scope.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.bindings.insert(name.into(), value.into());
    }

    pub fn extend<I, K, V>(&mut self, bindings: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in bindings {
            self.set(k, v);
        }
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for MacroScope {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut scope = MacroScope::new();
        scope.extend(iter);
        scope
    }
}

/// Stack of scopes. The bottom scope always exists.
#[derive(Debug, Clone)]
pub struct MacroStack {
    scopes: Vec<MacroScope>,
}

impl Default for MacroStack {
    fn default() -> Self {
        Self::new(MacroScope::new())
    }
}

impl MacroStack {
    pub fn new(root: MacroScope) -> Self {
        MacroStack { scopes: vec![root] }
    }

    pub fn top(&self) -> &MacroScope {
        // `pop` never removes the root scope.
        &self.scopes[self.scopes.len() - 1]
    }

    pub fn top_mut(&mut self) -> &mut MacroScope {
        let last = self.scopes.len() - 1;
        &mut self.scopes[last]
    }

    /// Push a copy of the top scope with `overlay` applied on top of it.
    pub fn push_child(&mut self, overlay: MacroScope) {
        let mut child = self.top().clone();
        child.extend(overlay.bindings);
        self.scopes.push(child);
    }

    /// Drop the top scope. The root scope is never popped.
    pub fn pop(&mut self) -> Option<MacroScope> {
        if self.scopes.len() > 1 {
            self.scopes.pop()
        } else {
            None
        }
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }
}

/// Split `text` into literal runs and macro references.
pub fn tokenize(text: &str) -> Result<Vec<MacroToken>, MacroError> {
    let pairs = MacroParser::parse(Rule::text, text).map_err(|e| MacroError::Syntax(format!("{}", e.variant.message())))?;
    let text_pair = pairs.into_iter().next().ok_or_else(|| MacroError::Syntax("empty parse".to_string()))?;
    Ok(build_tokens(text_pair))
}

fn build_tokens(pair: pest::iterators::Pair<Rule>) -> Vec<MacroToken> {
    let mut out = Vec::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::literal | Rule::default_literal => out.push(MacroToken::Literal(inner.as_str().to_string())),
            Rule::macro_ref => out.push(build_ref(inner)),
            _ => {}
        }
    }
    out
}

fn build_ref(pair: pest::iterators::Pair<Rule>) -> MacroToken {
    let mut name = String::new();
    let mut default = None;
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::macro_name => name = inner.as_str().to_string(),
            Rule::default_text => default = Some(build_tokens(inner)),
            _ => {}
        }
    }
    MacroToken::Ref { name, default }
}

/// True if `text` contains at least one `$(` reference.
pub fn has_references(text: &str) -> bool {
    text.contains("$(")
}

/// Expansion settings.
#[derive(Debug, Clone, Copy)]
pub struct Expander {
    /// Substitute an empty string for unresolved macros instead of failing.
    pub allow_missing: bool,
    pub max_depth: usize,
}

impl Default for Expander {
    fn default() -> Self {
        Expander {
            allow_missing: false,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl Expander {
    /// Fully expand `text` against `scope`.
    pub fn expand(&self, text: &str, scope: &MacroScope) -> Result<String, MacroError> {
        if !has_references(text) {
            return Ok(text.to_string());
        }
        let mut out = String::with_capacity(text.len());
        self.expand_text(text, scope, 0, &mut out)?;
        Ok(out)
    }

    fn expand_text(&self, text: &str, scope: &MacroScope, depth: usize, out: &mut String) -> Result<(), MacroError> {
        if !has_references(text) {
            out.push_str(text);
            return Ok(());
        }
        let tokens = tokenize(text)?;
        self.expand_tokens(&tokens, scope, depth, out)
    }

    fn expand_tokens(
        &self,
        tokens: &[MacroToken],
        scope: &MacroScope,
        depth: usize,
        out: &mut String,
    ) -> Result<(), MacroError> {
        for token in tokens {
            match token {
                MacroToken::Literal(s) => out.push_str(s),
                MacroToken::Ref { name, default } => {
                    if depth >= self.max_depth {
                        return Err(MacroError::TooDeep {
                            name: name.clone(),
                            limit: self.max_depth,
                        });
                    }
                    match (scope.get(name), default) {
                        (Some(value), _) => self.expand_text(value, scope, depth + 1, out)?,
                        (None, Some(default)) => self.expand_tokens(default, scope, depth + 1, out)?,
                        (None, None) if self.allow_missing => {}
                        (None, None) => return Err(MacroError::Missing { name: name.clone() }),
                    }
                }
            }
        }
        Ok(())
    }
}

/// Parse a `name=value, name=value` definition list.
///
/// Names and values are trimmed; `\"` inside values is unescaped. Empty entries are skipped.
pub fn parse_definitions(text: &str) -> Result<MacroScope, MacroError> {
    let mut scope = MacroScope::new();
    for entry in split_definitions(text) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (name, value) = entry
            .split_once('=')
            .ok_or_else(|| MacroError::Definition(entry.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(MacroError::Definition(entry.to_string()));
        }
        let value = unquote(value.trim()).replace("\\\"", "\"");
        scope.set(name, value);
    }
    Ok(scope)
}

/// Split on commas that are not inside a `$( )` reference or a quoted value.
fn split_definitions(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut in_quotes = false;
    let mut start = 0;
    let mut prev = '\0';
    for (i, c) in text.char_indices() {
        match c {
            '"' if prev != '\\' => in_quotes = !in_quotes,
            '(' if prev == '$' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            ',' if depth == 0 && !in_quotes => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        prev = c;
    }
    parts.push(&text[start..]);
    parts
}

fn unquote(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') && !s.ends_with("\\\"") {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(pairs: &[(&str, &str)]) -> MacroScope {
        pairs.iter().copied().collect()
    }

    #[test]
    fn tokenize_literal_and_refs() {
        let tokens = tokenize("a$(B)c$(D|x$(E))").expect("tokenize");
        assert_eq!(tokens.len(), 4);
        assert_eq!(tokens[0], MacroToken::Literal("a".to_string()));
        match &tokens[3] {
            MacroToken::Ref { name, default: Some(d) } => {
                assert_eq!(name, "D");
                assert_eq!(d.len(), 2);
            }
            other => panic!("unexpected token {:?}", other),
        }
    }

    #[test]
    fn tokenize_unterminated_is_error() {
        assert!(matches!(tokenize("abc$(X"), Err(MacroError::Syntax(_))));
    }

    #[test]
    fn expand_bound_and_default() {
        let e = Expander::default();
        let s = scope(&[("P", "IOC:"), ("M", "m1")]);
        assert_eq!(e.expand("$(P)$(M)", &s).unwrap(), "IOC:m1");
        assert_eq!(e.expand("$(V|0)", &s).unwrap(), "0");
        assert_eq!(e.expand("$(V|)", &s).unwrap(), "");
        assert_eq!(e.expand("$(V|$(P)x)", &s).unwrap(), "IOC:x");
    }

    #[test]
    fn expand_rescans_values() {
        let e = Expander::default();
        let s = scope(&[("A", "$(B)-$(B)"), ("B", "b")]);
        assert_eq!(e.expand("<$(A)>", &s).unwrap(), "<b-b>");
    }

    #[test]
    fn expand_missing() {
        let s = MacroScope::new();
        let strict = Expander::default();
        assert_eq!(
            strict.expand("$(MISSING)", &s),
            Err(MacroError::Missing { name: "MISSING".to_string() })
        );
        let lenient = Expander { allow_missing: true, ..Expander::default() };
        assert_eq!(lenient.expand("a$(MISSING)b", &s).unwrap(), "ab");
    }

    #[test]
    fn expand_cycle_hits_depth_limit() {
        let e = Expander { allow_missing: false, max_depth: 8 };
        let s = scope(&[("A", "$(B)"), ("B", "$(A)")]);
        assert!(matches!(e.expand("$(A)", &s), Err(MacroError::TooDeep { limit: 8, .. })));
    }

    #[test]
    fn stack_child_does_not_touch_parent() {
        let mut stack = MacroStack::new(scope(&[("X", "5")]));
        stack.push_child(scope(&[("Y", "1")]));
        stack.top_mut().set("X", "7");
        assert_eq!(stack.top().get("X"), Some("7"));
        assert_eq!(stack.top().get("Y"), Some("1"));
        stack.pop();
        assert_eq!(stack.top().get("X"), Some("5"));
        assert_eq!(stack.top().get("Y"), None);
        assert!(stack.pop().is_none());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn definitions_trim_and_unescape() {
        let s = parse_definitions(r#" A = 1 , B=\"q\" ,C=$(X|a,b), D="x, y" "#).unwrap();
        assert_eq!(s.get("A"), Some("1"));
        assert_eq!(s.get("B"), Some("\"q\""));
        assert_eq!(s.get("C"), Some("$(X|a,b)"));
        assert_eq!(s.get("D"), Some("x, y"));
        assert!(parse_definitions("novalue").is_err());
    }
}
