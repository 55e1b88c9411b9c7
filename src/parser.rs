//! Parse template databases into records, expanding macros and following `include`
//! and `expand` statements.
//!
//! All state lives in a [`ParserContext`]: the macro scope stack, the stack of open
//! files (for error locations and relative includes), the include search path and the
//! options. Nested files reuse the caller's context; every push onto its stacks is
//! paired with a pop whether the nested parse succeeds or fails.
//!
//! Scoping: `include` parses the file under the *current* scope, so a `substitute`
//! inside an included file stays visible to the including file afterwards. `expand`
//! parses under a child scope, so nothing defined inside it leaks out.

use crate::ast::*;
use crate::error::{Location, ParseError};
use crate::macros::{self, Expander, MacroScope, MacroStack};
use crate::validate::RecordValidator;
use pest::Parser;
use pest_derive::Parser as PestParser;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(PestParser)]
#[grammar = "db.pest"]
struct DbParser;

/// Default limit for include/expand nesting.
pub const DEFAULT_MAX_NESTING: usize = 128;

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// Unresolved macros expand to "" instead of failing.
    pub allow_missing: bool,
    /// Drop comments from the result.
    pub strip_comments: bool,
    pub max_macro_depth: usize,
    pub max_nesting_depth: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            allow_missing: false,
            strip_comments: false,
            max_macro_depth: macros::DEFAULT_MAX_DEPTH,
            max_nesting_depth: DEFAULT_MAX_NESTING,
        }
    }
}

struct OpenFile {
    name: String,
    dir: PathBuf,
}

/// Parse state for one top-level parse at a time.
pub struct ParserContext<'a> {
    macros: MacroStack,
    files: Vec<OpenFile>,
    include_path: Vec<PathBuf>,
    options: ParseOptions,
    on_dependency: Option<Box<dyn FnMut(&Path) + 'a>>,
    validator: Option<&'a dyn RecordValidator>,
}

impl Default for ParserContext<'_> {
    fn default() -> Self {
        Self::new(ParseOptions::default())
    }
}

impl<'a> ParserContext<'a> {
    pub fn new(options: ParseOptions) -> Self {
        ParserContext {
            macros: MacroStack::default(),
            files: Vec::new(),
            include_path: vec![PathBuf::from(".")],
            options,
            on_dependency: None,
            validator: None,
        }
    }

    /// Initial macro bindings, visible to the top-level file and everything it pulls in.
    pub fn with_macros(mut self, macros: MacroScope) -> Self {
        self.macros = MacroStack::new(macros);
        self
    }

    pub fn with_include_path(mut self, include_path: Vec<PathBuf>) -> Self {
        self.include_path = include_path;
        self
    }

    /// Validate every record as soon as it is constructed.
    pub fn with_validator(mut self, validator: &'a dyn RecordValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Called once for every file successfully opened, the top-level file included.
    pub fn on_dependency(mut self, callback: impl FnMut(&Path) + 'a) -> Self {
        self.on_dependency = Some(Box::new(callback));
        self
    }

    pub fn options(&self) -> &ParseOptions {
        &self.options
    }

    /// Bindings currently in effect.
    pub fn macros(&self) -> &MacroScope {
        self.macros.top()
    }

    /// True when no parse is in progress (all stacks back at their base).
    pub fn is_idle(&self) -> bool {
        self.files.is_empty() && self.macros.depth() == 1
    }

    /// Parse a template file from disk.
    pub fn parse_file(&mut self, path: &Path) -> Result<Database, ParseError> {
        let source = self.read(path)?;
        self.parse_top_level(&source, path.display().to_string(), dir_of(path))
    }

    /// Parse template text; `name` labels error locations and relative includes resolve
    /// against the working directory.
    pub fn parse_str(&mut self, source: &str, name: &str) -> Result<Database, ParseError> {
        self.parse_top_level(source, name.to_string(), PathBuf::new())
    }

    fn parse_top_level(&mut self, source: &str, name: String, dir: PathBuf) -> Result<Database, ParseError> {
        self.macros.push_child(MacroScope::new());
        self.files.push(OpenFile { name, dir });
        let result = self.parse_source(source);
        self.files.pop();
        self.macros.pop();
        result.map(Database::new)
    }

    fn read(&mut self, path: &Path) -> Result<String, ParseError> {
        let source = fs::read_to_string(path).map_err(|source| ParseError::Io {
            file: path.display().to_string(),
            source,
        })?;
        if let Some(callback) = self.on_dependency.as_mut() {
            callback(path);
        }
        Ok(source)
    }

    fn current_file(&self) -> &str {
        self.files.last().map(|f| f.name.as_str()).unwrap_or("<input>")
    }

    fn location(&self, pair: &pest::iterators::Pair<Rule>) -> Location {
        let (line, column) = pair.as_span().start_pos().line_col();
        Location::new(self.current_file(), line, column)
    }

    fn expand(&self, text: &str, location: &Location) -> Result<String, ParseError> {
        let expander = Expander {
            allow_missing: self.options.allow_missing,
            max_depth: self.options.max_macro_depth,
        };
        expander
            .expand(text, self.macros.top())
            .map_err(|source| ParseError::Macro {
                location: location.clone(),
                source,
            })
    }

    fn parse_source(&mut self, source: &str) -> Result<Vec<DbItem>, ParseError> {
        let pairs = DbParser::parse(Rule::database, source).map_err(|e| self.syntax_error(e))?;
        let database = pairs.into_iter().next().ok_or_else(|| ParseError::Syntax {
            location: Location::new(self.current_file(), 1, 1),
            message: "empty parse".to_string(),
        })?;

        let mut items = Vec::new();
        let mut last_was_comment = false;
        for stmt in database.into_inner() {
            let is_comment = stmt.as_rule() == Rule::comment;
            match stmt.as_rule() {
                Rule::comment => {
                    if !self.options.strip_comments {
                        let line = stmt.as_str().trim_end().to_string();
                        match items.last_mut() {
                            Some(DbItem::Comment(c)) if last_was_comment => c.lines.push(line),
                            _ => items.push(DbItem::Comment(Comment { lines: vec![line] })),
                        }
                    }
                }
                Rule::record => items.push(DbItem::Record(self.build_record(stmt)?)),
                Rule::include => items.push(self.build_include(stmt)?),
                Rule::substitute => self.apply_substitute(stmt)?,
                Rule::expand => items.push(self.build_expand(stmt)?),
                _ => {}
            }
            last_was_comment = is_comment;
        }
        Ok(items)
    }

    fn syntax_error(&self, e: pest::error::Error<Rule>) -> ParseError {
        let (line, column) = match e.line_col {
            pest::error::LineColLocation::Pos(p) => p,
            pest::error::LineColLocation::Span(p, _) => p,
        };
        ParseError::Syntax {
            location: Location::new(self.current_file(), line, column),
            message: e.variant.message().to_string(),
        }
    }

    fn build_record(&mut self, pair: pest::iterators::Pair<Rule>) -> Result<Record, ParseError> {
        let location = self.location(&pair);
        let mut record_type = String::new();
        let mut name = String::new();
        let mut fields = Vec::new();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::record_type => record_type = self.expand(raw_text(inner), &location)?,
                Rule::record_name => name = self.expand(raw_text(inner), &location)?,
                Rule::field => {
                    let field_location = self.location(&inner);
                    let mut it = inner.into_inner();
                    let field_name = it.next().map(raw_text).unwrap_or_default();
                    let value = it.next().map(raw_text).unwrap_or_default();
                    fields.push((
                        self.expand(field_name, &field_location)?,
                        self.expand(value, &field_location)?,
                    ));
                }
                _ => {}
            }
        }

        let record = Record::new(record_type, name, fields, location.file.clone(), location.line).map_err(|e| {
            ParseError::DuplicateField {
                location: location.clone(),
                record: e.record,
                field: e.field,
            }
        })?;
        log::debug!("{}: record({}, \"{}\")", location, record.record_type, record.name);

        if let Some(validator) = self.validator {
            validator
                .validate(&record)
                .map_err(|source| ParseError::Validation { location, source })?;
        }
        Ok(record)
    }

    fn build_include(&mut self, pair: pest::iterators::Pair<Rule>) -> Result<DbItem, ParseError> {
        let location = self.location(&pair);
        let raw = pair.into_inner().next().map(raw_text).unwrap_or_default();
        let target = self.expand(raw, &location)?;
        log::debug!("{}: include \"{}\"", location, target);
        self.nested(NestAction::Included, &location, &target, None)
    }

    fn apply_substitute(&mut self, pair: pest::iterators::Pair<Rule>) -> Result<(), ParseError> {
        let location = self.location(&pair);
        let line = pair.into_inner().next().map_or("", |p| p.as_str());
        let raw = strip_quotes(line.trim());
        let definitions = macros::parse_definitions(raw).map_err(|source| ParseError::Macro {
            location: location.clone(),
            source,
        })?;
        log::debug!("{}: substitute \"{}\"", location, raw);
        self.macros.top_mut().extend(definitions.iter());
        Ok(())
    }

    fn build_expand(&mut self, pair: pest::iterators::Pair<Rule>) -> Result<DbItem, ParseError> {
        let location = self.location(&pair);
        let mut target = String::new();
        let mut overlay = MacroScope::new();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::quoted => target = self.expand(raw_text(inner), &location)?,
                Rule::macro_def => {
                    let macro_location = self.location(&inner);
                    let mut it = inner.into_inner();
                    let name = it.next().map(raw_text).unwrap_or_default();
                    let value = it.next().map(raw_text).unwrap_or_default();
                    // Values are expanded in the caller's scope, so `macro(P, "$(P):x")` extends P.
                    overlay.set(
                        self.expand(name, &macro_location)?,
                        self.expand(value, &macro_location)?,
                    );
                }
                _ => {}
            }
        }
        log::debug!("{}: expand(\"{}\") with {} macro(s)", location, target, overlay.len());
        self.nested(NestAction::Expanded, &location, &target, Some(overlay))
    }

    /// Parse `target` as a nested file, wrapping any failure with the referencing location.
    fn nested(
        &mut self,
        action: NestAction,
        location: &Location,
        target: &str,
        scope: Option<MacroScope>,
    ) -> Result<DbItem, ParseError> {
        match self.parse_nested(location, target, scope) {
            Ok((file, items)) => Ok(DbItem::Nested { action, file, items }),
            Err(inner) => Err(ParseError::Nested {
                action,
                location: location.clone(),
                target: target.to_string(),
                inner: Box::new(inner),
            }),
        }
    }

    fn parse_nested(
        &mut self,
        location: &Location,
        target: &str,
        scope: Option<MacroScope>,
    ) -> Result<(PathBuf, Vec<DbItem>), ParseError> {
        if self.files.len() >= self.options.max_nesting_depth {
            return Err(ParseError::NestingTooDeep {
                location: location.clone(),
                limit: self.options.max_nesting_depth,
            });
        }
        let path = self.resolve(target).ok_or_else(|| ParseError::MissingFile {
            location: location.clone(),
            name: target.to_string(),
            search: self.search_dirs(),
        })?;
        let source = self.read(&path)?;

        let child_scope = scope.is_some();
        if let Some(scope) = scope {
            self.macros.push_child(scope);
        }
        self.files.push(OpenFile {
            name: path.display().to_string(),
            dir: dir_of(&path),
        });
        let result = self.parse_source(&source);
        self.files.pop();
        if child_scope {
            self.macros.pop();
        }
        result.map(|items| (path, items))
    }

    /// Include path entries in order, then the directory of the current file.
    fn search_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = self.include_path.clone();
        if let Some(current) = self.files.last() {
            dirs.push(current.dir.clone());
        }
        dirs
    }

    fn resolve(&self, target: &str) -> Option<PathBuf> {
        let target_path = Path::new(target);
        if target_path.is_absolute() {
            return target_path.is_file().then(|| target_path.to_path_buf());
        }
        self.search_dirs()
            .into_iter()
            .map(|dir| dir.join(target_path))
            .find(|p| p.is_file())
    }
}

fn dir_of(path: &Path) -> PathBuf {
    path.parent().map(Path::to_path_buf).unwrap_or_default()
}

/// Raw text of a name/value pair: quoted content without the quotes, or the bareword.
fn raw_text<'i>(pair: pest::iterators::Pair<'i, Rule>) -> &'i str {
    let span_text = pair.as_str();
    match pair.into_inner().next() {
        Some(inner) if inner.as_rule() == Rule::quoted => inner.into_inner().next().map_or("", |p| p.as_str()),
        Some(inner) => inner.as_str(),
        None => span_text,
    }
}

/// `substitute` takes the rest of the line, optionally wrapped in one pair of quotes.
fn strip_quotes(text: &str) -> &str {
    match text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
        Some(inner) if !inner.ends_with('\\') => inner,
        _ => text,
    }
}

/// Parse template text with default options and no initial macros.
pub fn parse(source: &str) -> Result<Database, ParseError> {
    ParserContext::default().parse_str(source, "<input>")
}

/// Parse template text with initial macro bindings.
pub fn parse_with_macros(source: &str, macros: MacroScope, options: ParseOptions) -> Result<Database, ParseError> {
    ParserContext::new(options)
        .with_macros(macros)
        .parse_str(source, "<input>")
}
