//! Template parse errors, including the include/expand causal chain.

use crate::ast::NestAction;
use crate::macros::MacroError;
use crate::validate::ValidationError;
use std::fmt;
use std::path::PathBuf;

/// File, line and column of a construct in a template or schema file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new(file: impl Into<String>, line: usize, column: usize) -> Self {
        Location {
            file: file.into(),
            line,
            column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("{location}: syntax error: {message}")]
    Syntax { location: Location, message: String },
    #[error("{file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{location}: cannot find \"{name}\" in include path {search:?}")]
    MissingFile {
        location: Location,
        name: String,
        search: Vec<PathBuf>,
    },
    #[error("{location}: {source}")]
    Macro {
        location: Location,
        #[source]
        source: MacroError,
    },
    #[error("{location}: record \"{record}\": duplicate field {field}")]
    DuplicateField {
        location: Location,
        record: String,
        field: String,
    },
    #[error("{location}: {source}")]
    Validation {
        location: Location,
        #[source]
        source: ValidationError,
    },
    #[error("{location}: include/expand nesting deeper than {limit}")]
    NestingTooDeep { location: Location, limit: usize },
    /// A failure inside an included or expanded file, wrapped with the statement that pulled it in.
    #[error("{location}: error in {action} file \"{target}\"")]
    Nested {
        action: NestAction,
        location: Location,
        target: String,
        #[source]
        inner: Box<ParseError>,
    },
}

impl ParseError {
    /// Layers of the chain, innermost first.
    pub fn chain(&self) -> Vec<&ParseError> {
        let mut layers = Vec::new();
        let mut current = self;
        layers.push(current);
        while let ParseError::Nested { inner, .. } = current {
            current = inner;
            layers.push(current);
        }
        layers.reverse();
        layers
    }

    /// The error that started the chain.
    pub fn root_cause(&self) -> &ParseError {
        match self {
            ParseError::Nested { inner, .. } => inner.root_cause(),
            other => other,
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            ParseError::Io { .. } => None,
            ParseError::Syntax { location, .. }
            | ParseError::MissingFile { location, .. }
            | ParseError::Macro { location, .. }
            | ParseError::DuplicateField { location, .. }
            | ParseError::Validation { location, .. }
            | ParseError::NestingTooDeep { location, .. }
            | ParseError::Nested { location, .. } => Some(location),
        }
    }

    /// Render the full chain, innermost error first, one line per layer:
    ///
    /// ```text
    /// b.db:3:5: syntax error: expected field
    ///   included from a.db:7:1
    ///   expanded from top.db:2:1
    /// ```
    pub fn render_chain(&self) -> String {
        let mut out = String::new();
        for layer in self.chain() {
            match layer {
                ParseError::Nested { action, location, .. } => {
                    out.push_str(&format!("\n  {} from {}", action, location));
                }
                leaf => out.push_str(&leaf.to_string()),
            }
        }
        out
    }
}
