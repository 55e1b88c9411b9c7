//! Parsed template database: comments, records and nested include/expand sequences.

use std::fmt;
use std::io::{self, Write};
use std::path::PathBuf;

/// How a nested file was pulled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestAction {
    /// `include "file"`: shares the caller's macro scope.
    Included,
    /// `expand("file") { ... }`: parsed under a child scope.
    Expanded,
}

impl fmt::Display for NestAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NestAction::Included => f.write_str("included"),
            NestAction::Expanded => f.write_str("expanded"),
        }
    }
}

/// Consecutive `#` lines, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub lines: Vec<String>,
}

impl fmt::Display for Comment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// A record declared twice with the same field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("record \"{record}\": duplicate field {field}")]
pub struct DuplicateField {
    pub record: String,
    pub field: String,
}

/// One `record(TYPE, "NAME") { ... }` after macro expansion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: String,
    pub name: String,
    fields: Vec<(String, String)>,
    pub file: String,
    pub line: usize,
}

impl Record {
    /// Build a record; fails if a field name appears more than once.
    pub fn new(
        record_type: impl Into<String>,
        name: impl Into<String>,
        fields: Vec<(String, String)>,
        file: impl Into<String>,
        line: usize,
    ) -> Result<Self, DuplicateField> {
        let name = name.into();
        for (i, (field, _)) in fields.iter().enumerate() {
            if fields[..i].iter().any(|(f, _)| f == field) {
                return Err(DuplicateField {
                    record: name,
                    field: field.clone(),
                });
            }
        }
        Ok(Record {
            record_type: record_type.into(),
            name,
            fields,
            file: file.into(),
            line,
        })
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(f, _)| f == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "record({}, \"{}\") {{", self.record_type, self.name)?;
        for (field, value) in &self.fields {
            writeln!(f, "  field({}, \"{}\")", field, value)?;
        }
        writeln!(f, "}}")?;
        writeln!(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DbItem {
    Comment(Comment),
    Record(Record),
    Nested {
        action: NestAction,
        file: PathBuf,
        items: Vec<DbItem>,
    },
}

/// Result of parsing a top-level template file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Database {
    pub items: Vec<DbItem>,
}

impl Database {
    pub fn new(items: Vec<DbItem>) -> Self {
        Database { items }
    }

    /// All records in output order, descending into include/expand sequences.
    pub fn records(&self) -> Vec<&Record> {
        let mut out = Vec::new();
        collect_records(&self.items, &mut out);
        out
    }

    pub fn find_record(&self, name: &str) -> Option<&Record> {
        self.records().into_iter().find(|r| r.name == name)
    }

    /// Write the flattened, fully expanded database.
    pub fn write_to<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write_items(&self.items, out)
    }
}

impl fmt::Display for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_items(&self.items, f)
    }
}

fn collect_records<'a>(items: &'a [DbItem], out: &mut Vec<&'a Record>) {
    for item in items {
        match item {
            DbItem::Record(r) => out.push(r),
            DbItem::Nested { items, .. } => collect_records(items, out),
            DbItem::Comment(_) => {}
        }
    }
}

fn write_items<W: Write>(items: &[DbItem], out: &mut W) -> io::Result<()> {
    for item in items {
        match item {
            DbItem::Comment(c) => write!(out, "{}", c)?,
            DbItem::Record(r) => write!(out, "{}", r)?,
            DbItem::Nested { items, .. } => write_items(items, out)?,
        }
    }
    Ok(())
}

fn fmt_items(items: &[DbItem], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for item in items {
        match item {
            DbItem::Comment(c) => write!(f, "{}", c)?,
            DbItem::Record(r) => write!(f, "{}", r)?,
            DbItem::Nested { items, .. } => fmt_items(items, f)?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(a, b)| (a.to_string(), b.to_string())).collect()
    }

    #[test]
    fn record_rejects_duplicate_field() {
        let err = Record::new("ai", "r1", fields(&[("DESC", "a"), ("DESC", "b")]), "t.db", 1).unwrap_err();
        assert_eq!(err.field, "DESC");
        assert_eq!(err.record, "r1");
    }

    #[test]
    fn record_display_format() {
        let r = Record::new("ai", "foo", fields(&[("DESC", "hi"), ("SCAN", "1 second")]), "t.db", 1).unwrap();
        assert_eq!(
            r.to_string(),
            "record(ai, \"foo\") {\n  field(DESC, \"hi\")\n  field(SCAN, \"1 second\")\n}\n\n"
        );
    }

    #[test]
    fn database_flattens_nested() {
        let inner = Record::new("bo", "b", Vec::new(), "b.db", 2).unwrap();
        let outer = Record::new("ai", "a", Vec::new(), "a.db", 1).unwrap();
        let db = Database::new(vec![
            DbItem::Comment(Comment { lines: vec!["# top".to_string()] }),
            DbItem::Record(outer),
            DbItem::Nested {
                action: NestAction::Included,
                file: PathBuf::from("b.db"),
                items: vec![DbItem::Record(inner)],
            },
        ]);
        let names: Vec<_> = db.records().iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        let mut buf = Vec::new();
        db.write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("# top\nrecord(ai, \"a\") {\n}\n\n"));
        assert_eq!(text, db.to_string());
    }
}
