//! # dbmsi: template database expansion and DBD validation
//!
//! Expands template databases (record/field declarations with `$(NAME)` macro
//! references, `include` and `expand` statements) into a flat database, optionally
//! validating every record against a DBD schema as it is parsed.
//!
//! ## Template structure
//!
//! - **Records**: `record(TYPE, "NAME") { field(NAME, "VALUE") ... }`
//! - **Comments**: `#` lines, kept in the output unless stripped
//! - **substitute "A=1,B=2"**: define macros in the current scope
//! - **include "file"**: parse a file under the current scope
//! - **expand("file") { macro(NAME, VALUE) ... }**: parse a file under a child scope
//!
//! ## Macros
//!
//! - `$(NAME)`: value of `NAME`; an error if undefined (unless `allow_missing`)
//! - `$(NAME|DEFAULT)`: `DEFAULT` when `NAME` is undefined; defaults may nest references
//! - Values are expanded recursively, up to a configurable depth
//!
//! ## Example
//!
//! ```text
//! substitute "P=IOC:"
//! record(ai, "$(P)$(M|m1)") {
//!   field(DESC, "test")
//!   field(VAL,  "$(V|0)")
//! }
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use dbmsi::{ParseOptions, ParserContext, Schema};
//! use std::path::Path;
//!
//! let schema = Schema::parse_file(Path::new("app.dbd"), &[]).unwrap();
//! let mut ctx = ParserContext::new(ParseOptions::default()).with_validator(&schema);
//! let db = ctx.parse_file(Path::new("motor.template")).unwrap();
//! print!("{}", db);
//! ```

pub mod ast;
pub mod cli;
pub mod dbd;
pub mod error;
pub mod macros;
pub mod parser;
pub mod validate;

pub use ast::{Comment, Database, DbItem, NestAction, Record};
pub use dbd::{DbdError, FieldType, Menu, RecordType, Schema};
pub use error::{Location, ParseError};
pub use macros::{Expander, MacroError, MacroScope, MacroStack};
pub use parser::{parse, parse_with_macros, ParseOptions, ParserContext};
pub use validate::{validate_record, RecordValidator, ValidationError, ValueError};
