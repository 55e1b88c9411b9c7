//! Database definition (DBD) schema: menus, record types with typed fields, and devices.
//!
//! Parsing is two-pass. All files (the top-level DBD and anything it `include`s) are
//! read first; then menus are indexed and every `menu(...)` field parameter is resolved
//! to its [`Menu`], and device declarations are attached to their record type.
//!
//! [`Schema::load`] adds an optional JSON cache keyed on the source file's size and
//! modification time. The cache is only an optimization: a missing, stale, foreign or
//! unreadable cache is ignored and the schema is parsed again.

use crate::error::Location;
use indexmap::IndexMap;
use pest::Parser;
use pest_derive::Parser as PestParser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

#[derive(PestParser)]
#[grammar = "dbd.pest"]
struct DbdParser;

/// Bumped whenever the cached representation changes.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const MAX_INCLUDE_DEPTH: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum DbdError {
    #[error("{location}: syntax error: {message}")]
    Syntax { location: Location, message: String },
    #[error("{file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{location}: cannot find \"{name}\" in include path")]
    MissingInclude { location: Location, name: String },
    #[error("{location}: DBD include nesting deeper than {limit}")]
    IncludeTooDeep { location: Location, limit: usize },
    #[error("{location}: field {field}: unknown field type {type_tag}")]
    UnknownFieldType {
        location: Location,
        field: String,
        type_tag: String,
    },
    #[error("{location}: field {field}: invalid size({value})")]
    BadSize {
        location: Location,
        field: String,
        value: String,
    },
    #[error("record type {record_type}, field {field}: undefined menu {menu}")]
    UnknownMenu {
        record_type: String,
        field: String,
        menu: String,
    },
}

/// Field type tag (`DBF_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Char,
    UChar,
    Short,
    UShort,
    Long,
    ULong,
    Int64,
    UInt64,
    Float,
    Double,
    Enum,
    Menu,
    Device,
    InLink,
    OutLink,
    FwdLink,
    NoAccess,
}

impl FieldType {
    pub fn from_tag(tag: &str) -> Option<Self> {
        let t = match tag {
            "DBF_STRING" => FieldType::String,
            "DBF_CHAR" => FieldType::Char,
            "DBF_UCHAR" => FieldType::UChar,
            "DBF_SHORT" => FieldType::Short,
            "DBF_USHORT" => FieldType::UShort,
            "DBF_LONG" => FieldType::Long,
            "DBF_ULONG" => FieldType::ULong,
            "DBF_INT64" => FieldType::Int64,
            "DBF_UINT64" => FieldType::UInt64,
            "DBF_FLOAT" => FieldType::Float,
            "DBF_DOUBLE" => FieldType::Double,
            "DBF_ENUM" => FieldType::Enum,
            "DBF_MENU" => FieldType::Menu,
            "DBF_DEVICE" => FieldType::Device,
            "DBF_INLINK" => FieldType::InLink,
            "DBF_OUTLINK" => FieldType::OutLink,
            "DBF_FWDLINK" => FieldType::FwdLink,
            "DBF_NOACCESS" => FieldType::NoAccess,
            _ => return None,
        };
        Some(t)
    }

    /// `(bits, signed)` for integer types.
    pub fn integer_width(self) -> Option<(u32, bool)> {
        match self {
            FieldType::Char => Some((8, true)),
            FieldType::UChar => Some((8, false)),
            FieldType::Short => Some((16, true)),
            FieldType::UShort => Some((16, false)),
            FieldType::Long => Some((32, true)),
            FieldType::ULong => Some((32, false)),
            FieldType::Int64 => Some((64, true)),
            FieldType::UInt64 => Some((64, false)),
            _ => None,
        }
    }

    pub fn is_link(self) -> bool {
        matches!(self, FieldType::InLink | FieldType::OutLink | FieldType::FwdLink)
    }
}

/// Named enumeration: choice label → choice identifier, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Menu {
    pub name: String,
    pub choices: IndexMap<String, String>,
}

impl Menu {
    pub fn contains_label(&self, label: &str) -> bool {
        self.choices.contains_key(label)
    }

    pub fn len(&self) -> usize {
        self.choices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.choices.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    /// Raw declared parameters (`prompt`, `size`, `menu`, `special`, ...).
    pub params: IndexMap<String, String>,
    /// Declared `size(n)` of string fields.
    pub size: Option<usize>,
    /// Resolved `menu(...)` of `DBF_MENU` fields.
    pub menu: Option<Arc<Menu>>,
}

/// `device(RECTYPE, LINKTYPE, DSET, "label")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub record_type: String,
    pub link_type: String,
    pub dset: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordType {
    pub name: String,
    pub fields: IndexMap<String, FieldDef>,
    /// Devices keyed by label (the `DTYP` value).
    pub devices: IndexMap<String, Device>,
}

impl RecordType {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.get(name)
    }

    pub fn device(&self, label: &str) -> Option<&Device> {
        self.devices.get(label)
    }
}

/// Parsed and cross-linked schema.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub menus: IndexMap<String, Arc<Menu>>,
    pub record_types: IndexMap<String, RecordType>,
}

impl Schema {
    pub fn record_type(&self, name: &str) -> Option<&RecordType> {
        self.record_types.get(name)
    }

    pub fn menu(&self, name: &str) -> Option<&Menu> {
        self.menus.get(name).map(Arc::as_ref)
    }

    /// Parse a schema held in memory; `name` is used in error locations. `include`
    /// statements are resolved against the working directory.
    pub fn parse_str(source: &str, name: &str) -> Result<Schema, DbdError> {
        let mut raw = RawSchema::default();
        let mut reader = DbdReader {
            include_path: vec![PathBuf::from(".")],
            opened: Vec::new(),
        };
        reader.read_source(source, name, None, &mut raw, 0)?;
        raw.resolve()
    }

    /// Parse a DBD file and everything it includes. Includes are searched in the including
    /// file's directory first, then in `include_path`.
    pub fn parse_file(path: &Path, include_path: &[PathBuf]) -> Result<Schema, DbdError> {
        let (schema, _) = Self::parse_file_with_deps(path, include_path)?;
        Ok(schema)
    }

    /// Like [`Schema::parse_file`], also returning every file that was read.
    pub fn parse_file_with_deps(path: &Path, include_path: &[PathBuf]) -> Result<(Schema, Vec<PathBuf>), DbdError> {
        let mut raw = RawSchema::default();
        let mut reader = DbdReader {
            include_path: include_path.to_vec(),
            opened: Vec::new(),
        };
        reader.read_file(path, &mut raw, 0)?;
        log::debug!(
            "{}: {} menus, {} record types, {} devices",
            path.display(),
            raw.menus.len(),
            raw.record_types.len(),
            raw.devices.len()
        );
        Ok((raw.resolve()?, reader.opened))
    }

    /// Parse `path`, using `cache` when it is fresh and refreshing it otherwise.
    pub fn load(path: &Path, cache: Option<&Path>, include_path: &[PathBuf]) -> Result<Schema, DbdError> {
        let cache = match cache {
            Some(c) => c,
            None => return Self::parse_file(path, include_path),
        };
        let fingerprint = Fingerprint::of(path).map_err(|source| DbdError::Io {
            file: path.display().to_string(),
            source,
        })?;
        match read_cache(cache, &fingerprint) {
            Ok(schema) => {
                log::debug!("{}: using schema cache {}", path.display(), cache.display());
                return Ok(schema);
            }
            Err(reason) => log::debug!("{}: ignoring schema cache: {}", cache.display(), reason),
        }
        let schema = Self::parse_file(path, include_path)?;
        if let Err(e) = write_cache(cache, &fingerprint, &schema) {
            log::warn!("{}: could not write schema cache: {:#}", cache.display(), e);
        }
        Ok(schema)
    }
}

// ==================== Cache ====================

/// Identity of a source file for cache freshness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    pub modified_secs: u64,
    pub modified_nanos: u32,
}

impl Fingerprint {
    pub fn of(path: &Path) -> std::io::Result<Fingerprint> {
        let meta = fs::metadata(path)?;
        let modified = meta
            .modified()?
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Ok(Fingerprint {
            size: meta.len(),
            modified_secs: modified.as_secs(),
            modified_nanos: modified.subsec_nanos(),
        })
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    format_version: u32,
    source: Fingerprint,
    schema: Schema,
}

fn read_cache(cache: &Path, fingerprint: &Fingerprint) -> anyhow::Result<Schema> {
    let text = fs::read_to_string(cache)?;
    let file: CacheFile = serde_json::from_str(&text)?;
    if file.format_version != CACHE_FORMAT_VERSION {
        anyhow::bail!("format version {} (expected {})", file.format_version, CACHE_FORMAT_VERSION);
    }
    if &file.source != fingerprint {
        anyhow::bail!("stale");
    }
    Ok(file.schema)
}

fn write_cache(cache: &Path, fingerprint: &Fingerprint, schema: &Schema) -> anyhow::Result<()> {
    let file = CacheFile {
        format_version: CACHE_FORMAT_VERSION,
        source: fingerprint.clone(),
        schema: schema.clone(),
    };
    let text = serde_json::to_string(&file)?;
    fs::write(cache, text)?;
    Ok(())
}

// ==================== Parsing ====================

#[derive(Default)]
struct RawSchema {
    menus: IndexMap<String, Menu>,
    record_types: IndexMap<String, RawRecordType>,
    devices: Vec<Device>,
}

struct RawRecordType {
    name: String,
    fields: Vec<RawField>,
}

struct RawField {
    name: String,
    field_type: FieldType,
    params: IndexMap<String, String>,
    size: Option<usize>,
}

impl RawSchema {
    /// Second pass: menus first, then record types referencing them, then devices.
    fn resolve(self) -> Result<Schema, DbdError> {
        let menus: IndexMap<String, Arc<Menu>> = self
            .menus
            .into_iter()
            .map(|(name, menu)| (name, Arc::new(menu)))
            .collect();

        let mut record_types = IndexMap::new();
        for (rt_name, raw) in self.record_types {
            let mut fields = IndexMap::new();
            for f in raw.fields {
                let menu = match f.params.get("menu") {
                    Some(menu_name) => Some(menus.get(menu_name).cloned().ok_or_else(|| DbdError::UnknownMenu {
                        record_type: raw.name.clone(),
                        field: f.name.clone(),
                        menu: menu_name.clone(),
                    })?),
                    None => None,
                };
                fields.insert(
                    f.name.clone(),
                    FieldDef {
                        name: f.name,
                        field_type: f.field_type,
                        params: f.params,
                        size: f.size,
                        menu,
                    },
                );
            }
            record_types.insert(
                rt_name,
                RecordType {
                    name: raw.name,
                    fields,
                    devices: IndexMap::new(),
                },
            );
        }

        for device in self.devices {
            match record_types.get_mut(&device.record_type) {
                Some(rt) => {
                    rt.devices.insert(device.label.clone(), device);
                }
                None => log::warn!(
                    "device \"{}\" declared for undefined record type {}, ignored",
                    device.label,
                    device.record_type
                ),
            }
        }

        Ok(Schema { menus, record_types })
    }
}

struct DbdReader {
    include_path: Vec<PathBuf>,
    opened: Vec<PathBuf>,
}

impl DbdReader {
    fn read_file(&mut self, path: &Path, raw: &mut RawSchema, depth: usize) -> Result<(), DbdError> {
        let source = self.open(path)?;
        let name = path.display().to_string();
        self.read_source(&source, &name, path.parent(), raw, depth)
    }

    fn open(&mut self, path: &Path) -> Result<String, DbdError> {
        let source = fs::read_to_string(path).map_err(|source| DbdError::Io {
            file: path.display().to_string(),
            source,
        })?;
        self.opened.push(path.to_path_buf());
        Ok(source)
    }

    fn read_source(
        &mut self,
        source: &str,
        name: &str,
        dir: Option<&Path>,
        raw: &mut RawSchema,
        depth: usize,
    ) -> Result<(), DbdError> {
        let dbd = parse_rule(Rule::dbd, source, name)?;
        for inner in dbd.into_inner() {
            match inner.as_rule() {
                Rule::menu => {
                    let menu = build_menu(inner);
                    raw.menus.insert(menu.name.clone(), menu);
                }
                Rule::recordtype => {
                    let rt = self.build_record_type(inner, name, dir, depth)?;
                    raw.record_types.insert(rt.name.clone(), rt);
                }
                Rule::device => raw.devices.push(build_device(inner)),
                Rule::include => {
                    let path = self.include_target(inner, name, dir, depth)?;
                    self.read_file(&path, raw, depth + 1)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn build_record_type(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
        file: &str,
        dir: Option<&Path>,
        depth: usize,
    ) -> Result<RawRecordType, DbdError> {
        let mut name = String::new();
        let mut fields = Vec::new();
        for inner in pair.into_inner() {
            match inner.as_rule() {
                Rule::name => name = inner.as_str().to_string(),
                Rule::field_def => fields.push(build_field(inner, file)?),
                Rule::include => self.include_fields(inner, file, dir, depth, &mut fields)?,
                _ => {}
            }
        }
        Ok(RawRecordType { name, fields })
    }

    /// `include` inside a recordtype body: the file holds field definitions only.
    fn include_fields(
        &mut self,
        pair: pest::iterators::Pair<Rule>,
        file: &str,
        dir: Option<&Path>,
        depth: usize,
        fields: &mut Vec<RawField>,
    ) -> Result<(), DbdError> {
        let path = self.include_target(pair, file, dir, depth)?;
        let source = self.open(&path)?;
        let name = path.display().to_string();
        let list = parse_rule(Rule::field_list, &source, &name)?;
        for inner in list.into_inner() {
            match inner.as_rule() {
                Rule::field_def => fields.push(build_field(inner, &name)?),
                Rule::include => self.include_fields(inner, &name, path.parent(), depth + 1, fields)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Locate the file named by an `include` pair, enforcing the nesting limit.
    fn include_target(
        &self,
        pair: pest::iterators::Pair<Rule>,
        name: &str,
        dir: Option<&Path>,
        depth: usize,
    ) -> Result<PathBuf, DbdError> {
        let location = location_of(&pair, name);
        let target = pair.into_inner().next().map(string_value).unwrap_or_default();
        if depth >= MAX_INCLUDE_DEPTH {
            return Err(DbdError::IncludeTooDeep {
                location,
                limit: MAX_INCLUDE_DEPTH,
            });
        }
        self.find(&target, dir)
            .ok_or(DbdError::MissingInclude { location, name: target })
    }

    fn find(&self, target: &str, dir: Option<&Path>) -> Option<PathBuf> {
        let target_path = Path::new(target);
        if target_path.is_absolute() {
            return target_path.is_file().then(|| target_path.to_path_buf());
        }
        dir.into_iter()
            .chain(self.include_path.iter().map(PathBuf::as_path))
            .map(|d| d.join(target_path))
            .find(|p| p.is_file())
    }
}

fn parse_rule<'i>(rule: Rule, source: &'i str, name: &str) -> Result<pest::iterators::Pair<'i, Rule>, DbdError> {
    let mut pairs = DbdParser::parse(rule, source).map_err(|e| syntax_error(name, e))?;
    pairs.next().ok_or_else(|| DbdError::Syntax {
        location: Location::new(name, 1, 1),
        message: "empty parse".to_string(),
    })
}

fn syntax_error(name: &str, e: pest::error::Error<Rule>) -> DbdError {
    let (line, column) = match e.line_col {
        pest::error::LineColLocation::Pos(p) => p,
        pest::error::LineColLocation::Span(p, _) => p,
    };
    DbdError::Syntax {
        location: Location::new(name, line, column),
        message: e.variant.message().to_string(),
    }
}

fn location_of(pair: &pest::iterators::Pair<Rule>, name: &str) -> Location {
    let (line, column) = pair.as_span().start_pos().line_col();
    Location::new(name, line, column)
}

fn string_value(pair: pest::iterators::Pair<Rule>) -> String {
    match pair.as_rule() {
        Rule::string => pair
            .into_inner()
            .next()
            .map(|p| p.as_str().replace("\\\"", "\""))
            .unwrap_or_default(),
        _ => pair.as_str().to_string(),
    }
}

fn build_menu(pair: pest::iterators::Pair<Rule>) -> Menu {
    let mut name = String::new();
    let mut choices = IndexMap::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::name => name = inner.as_str().to_string(),
            Rule::choice => {
                let mut it = inner.into_inner();
                let id = it.next().map(|p| p.as_str().to_string()).unwrap_or_default();
                let label = it.next().map(string_value).unwrap_or_default();
                choices.insert(label, id);
            }
            _ => {}
        }
    }
    Menu { name, choices }
}

fn build_field(pair: pest::iterators::Pair<Rule>, file: &str) -> Result<RawField, DbdError> {
    let location = location_of(&pair, file);
    let mut name = String::new();
    let mut type_tag = String::new();
    let mut params = IndexMap::new();
    for inner in pair.into_inner() {
        match inner.as_rule() {
            Rule::name => name = inner.as_str().to_string(),
            Rule::type_tag => type_tag = inner.as_str().to_string(),
            Rule::param => {
                let mut it = inner.into_inner();
                let key = it.next().map(|p| p.as_str().to_string()).unwrap_or_default();
                let value = it.next().map(string_value).unwrap_or_default();
                params.insert(key, value);
            }
            _ => {}
        }
    }
    let field_type = FieldType::from_tag(&type_tag).ok_or_else(|| DbdError::UnknownFieldType {
        location: location.clone(),
        field: name.clone(),
        type_tag: type_tag.clone(),
    })?;
    let size = match params.get("size") {
        Some(s) => Some(s.trim().parse::<usize>().map_err(|_| DbdError::BadSize {
            location,
            field: name.clone(),
            value: s.clone(),
        })?),
        None => None,
    };
    Ok(RawField {
        name,
        field_type,
        params,
        size,
    })
}

fn build_device(pair: pest::iterators::Pair<Rule>) -> Device {
    let mut it = pair.into_inner();
    let mut next = || it.next().map(string_value).unwrap_or_default();
    let record_type = next();
    let link_type = next();
    let dset = next();
    let label = next();
    Device {
        record_type,
        link_type,
        dset,
        label,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMALL: &str = r#"
# comment
menu(menuYesNo) {
    choice(menuYesNoNO, "NO")
    choice(menuYesNoYES, "YES")
}
recordtype(ai) {
    %#include "epicsTypes.h"
    field(DESC, DBF_STRING) {
        prompt("Descriptor")
        size(41)
    }
    field(PINI, DBF_MENU) {
        menu(menuYesNo)
    }
    field(PREC, DBF_SHORT) {
        prompt("Display Precision")
    }
}
device(ai, CONSTANT, devAiSoft, "Soft Channel")
function(myFunc)
variable(myDebug, int)
registrar(myRegistrar)
driver(drvFoo)
"#;

    #[test]
    fn parse_small_schema() {
        let schema = Schema::parse_str(SMALL, "small.dbd").expect("parse");
        let ai = schema.record_type("ai").expect("ai");
        assert_eq!(ai.fields.len(), 3);
        let desc = ai.field("DESC").unwrap();
        assert_eq!(desc.field_type, FieldType::String);
        assert_eq!(desc.size, Some(41));
        assert_eq!(desc.params.get("prompt").map(String::as_str), Some("Descriptor"));
        let pini = ai.field("PINI").unwrap();
        let menu = pini.menu.as_ref().expect("menu resolved");
        assert_eq!(menu.name, "menuYesNo");
        assert!(menu.contains_label("YES"));
        assert!(ai.device("Soft Channel").is_some());
    }

    #[test]
    fn menu_may_follow_record_type() {
        let src = r#"
recordtype(x) { field(M, DBF_MENU) { menu(late) } }
menu(late) { choice(lateA, "A") }
"#;
        let schema = Schema::parse_str(src, "late.dbd").expect("parse");
        let m = schema.record_type("x").unwrap().field("M").unwrap();
        assert_eq!(m.menu.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn undefined_menu_is_error() {
        let src = "recordtype(x) { field(M, DBF_MENU) { menu(nope) } }";
        assert!(matches!(Schema::parse_str(src, "x.dbd"), Err(DbdError::UnknownMenu { .. })));
    }

    #[test]
    fn unknown_type_tag_is_error() {
        let src = "recordtype(x) {\n field(M, DBF_BOGUS) { }\n}";
        match Schema::parse_str(src, "x.dbd") {
            Err(DbdError::UnknownFieldType { location, type_tag, .. }) => {
                assert_eq!(type_tag, "DBF_BOGUS");
                assert_eq!(location.line, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn syntax_error_has_location() {
        let src = "menu(m) {\n  choice(a \"A\")\n}";
        match Schema::parse_str(src, "bad.dbd") {
            Err(DbdError::Syntax { location, .. }) => {
                assert_eq!(location.file, "bad.dbd");
                assert_eq!(location.line, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn device_for_unknown_record_type_is_skipped() {
        let src = r#"device(nothere, CONSTANT, devX, "X")"#;
        let schema = Schema::parse_str(src, "d.dbd").expect("parse");
        assert!(schema.record_types.is_empty());
    }
}
