//! Record validation against a [`Schema`].
//!
//! Validation is fail-fast: the first violation is returned. Checks run in order:
//! record type exists, then every field name exists, then each value (in declaration
//! order) suits its field's type.

use crate::ast::Record;
use crate::dbd::{FieldDef, FieldType, Menu, RecordType, Schema};
use std::fmt;

/// Sibling state fields selected by an `mbbi`/`mbbo` enum index 0..=15.
pub const MBB_STATE_FIELDS: [&str; 16] = [
    "ZRVL", "ONVL", "TWVL", "THVL", "FRVL", "FVVL", "SXVL", "SVVL", "EIVL", "NIVL", "TEVL", "ELVL", "TVVL", "TTVL",
    "FTVL", "FFVL",
];

const PROCESS_MODIFIERS: [&str; 5] = ["NPP", "PP", "CA", "CP", "CPP"];
const SEVERITY_MODIFIERS: [&str; 4] = ["NMS", "MS", "MSI", "MSS"];

/// Hook the template parser calls once per constructed record.
pub trait RecordValidator {
    fn validate(&self, record: &Record) -> Result<(), ValidationError>;
}

impl RecordValidator for Schema {
    fn validate(&self, record: &Record) -> Result<(), ValidationError> {
        validate_record(self, record)
    }
}

/// Why a field value was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueError {
    StringTooLong { size: usize },
    NotAnInteger,
    Negative,
    OutOfRange { bits: u32, signed: bool },
    NotAFloat,
    NotBinary,
    BadEnumIndex,
    MissingStateField { state: &'static str },
    NotInMenu { menu: String },
    UnknownDevice,
    BadLink,
    NoAccess,
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueError::StringTooLong { size } => write!(f, "string longer than size({})", size),
            ValueError::NotAnInteger => f.write_str("not an integer"),
            ValueError::Negative => f.write_str("negative value for unsigned field"),
            ValueError::OutOfRange { bits, signed } => write!(
                f,
                "out of range for {} {}-bit field",
                if *signed { "signed" } else { "unsigned" },
                bits
            ),
            ValueError::NotAFloat => f.write_str("not a floating point number"),
            ValueError::NotBinary => f.write_str("expected 0 or 1"),
            ValueError::BadEnumIndex => f.write_str("expected a state index 0..15"),
            ValueError::MissingStateField { state } => write!(f, "state field {} is not set", state),
            ValueError::NotInMenu { menu } => write!(f, "not a choice of menu {}", menu),
            ValueError::UnknownDevice => f.write_str("unknown device type"),
            ValueError::BadLink => f.write_str("malformed link"),
            ValueError::NoAccess => f.write_str("field may not be set"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("record \"{record}\": unknown record type {record_type}")]
    UnknownRecordType { record: String, record_type: String },
    #[error("record \"{record}\": undefined field {field} for record type {record_type}")]
    UndefinedField {
        record: String,
        record_type: String,
        field: String,
    },
    #[error("record \"{record}\": field {field}: invalid value \"{value}\": {reason}")]
    InvalidValue {
        record: String,
        field: String,
        value: String,
        reason: ValueError,
    },
}

/// Check one record against the schema.
pub fn validate_record(schema: &Schema, record: &Record) -> Result<(), ValidationError> {
    let rt = schema
        .record_type(&record.record_type)
        .ok_or_else(|| ValidationError::UnknownRecordType {
            record: record.name.clone(),
            record_type: record.record_type.clone(),
        })?;
    let mut defs = Vec::with_capacity(record.fields().len());
    for (field, _) in record.fields() {
        defs.push(rt.field(field).ok_or_else(|| ValidationError::UndefinedField {
            record: record.name.clone(),
            record_type: rt.name.clone(),
            field: field.clone(),
        })?);
    }
    for ((field, value), def) in record.fields().iter().zip(defs) {
        check_value(rt, def, record, value).map_err(|reason| ValidationError::InvalidValue {
            record: record.name.clone(),
            field: field.clone(),
            value: value.clone(),
            reason,
        })?;
    }
    Ok(())
}

fn check_value(rt: &RecordType, def: &FieldDef, record: &Record, value: &str) -> Result<(), ValueError> {
    match def.field_type {
        FieldType::String => check_string(def, value),
        FieldType::Float | FieldType::Double => check_float(value),
        FieldType::Enum => check_enum(rt, record, value),
        FieldType::Menu => match &def.menu {
            Some(menu) => check_menu(menu, value),
            None => Ok(()),
        },
        FieldType::Device => rt.device(value).map(|_| ()).ok_or(ValueError::UnknownDevice),
        FieldType::InLink | FieldType::OutLink | FieldType::FwdLink => check_link(value),
        FieldType::NoAccess => Err(ValueError::NoAccess),
        other => match other.integer_width() {
            Some((bits, signed)) => check_integer(value, bits, signed),
            None => Ok(()),
        },
    }
}

fn check_string(def: &FieldDef, value: &str) -> Result<(), ValueError> {
    match def.size {
        Some(size) if value.len() > size => Err(ValueError::StringTooLong { size }),
        _ => Ok(()),
    }
}

/// Parse decimal or `0x` hex, with an optional leading sign.
fn parse_integer(value: &str) -> Result<i128, ValueError> {
    let s = value.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let hex = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X"));
    // from_str_radix accepts a leading sign; reject "--1" and "0x-1".
    if digits.starts_with(['+', '-']) || hex.is_some_and(|h| h.starts_with(['+', '-'])) {
        return Err(ValueError::NotAnInteger);
    }
    let magnitude = match hex {
        Some(h) => i128::from_str_radix(h, 16),
        None => digits.parse::<i128>(),
    }
    .map_err(|_| ValueError::NotAnInteger)?;
    Ok(if negative { -magnitude } else { magnitude })
}

/// Unsigned: `0 <= v < 2^bits`. Signed: `|v| <= 2^(bits-1)`, hex or decimal alike.
fn check_integer(value: &str, bits: u32, signed: bool) -> Result<(), ValueError> {
    if value.trim().is_empty() {
        return Ok(());
    }
    let v = parse_integer(value)?;
    let in_range = if signed {
        v.abs() <= 1i128 << (bits - 1)
    } else if v < 0 {
        return Err(ValueError::Negative);
    } else {
        v < 1i128 << bits
    };
    if in_range {
        Ok(())
    } else {
        Err(ValueError::OutOfRange { bits, signed })
    }
}

fn check_float(value: &str) -> Result<(), ValueError> {
    value.trim().parse::<f64>().map(|_| ()).map_err(|_| ValueError::NotAFloat)
}

fn check_enum(rt: &RecordType, record: &Record, value: &str) -> Result<(), ValueError> {
    match rt.name.as_str() {
        "bi" | "bo" => match value.trim() {
            "0" | "1" => Ok(()),
            _ => Err(ValueError::NotBinary),
        },
        "mbbi" | "mbbo" => {
            let index: usize = value.trim().parse().map_err(|_| ValueError::BadEnumIndex)?;
            let state = *MBB_STATE_FIELDS.get(index).ok_or(ValueError::BadEnumIndex)?;
            if record.has_field(state) {
                Ok(())
            } else {
                Err(ValueError::MissingStateField { state })
            }
        }
        _ => Ok(()),
    }
}

fn check_menu(menu: &Menu, value: &str) -> Result<(), ValueError> {
    if menu.contains_label(value) {
        return Ok(());
    }
    match value.trim().parse::<usize>() {
        Ok(index) if index < menu.len() => Ok(()),
        _ => Err(ValueError::NotInMenu {
            menu: menu.name.clone(),
        }),
    }
}

fn check_link(value: &str) -> Result<(), ValueError> {
    let value = value.trim();
    if value.is_empty() || value.starts_with('@') {
        return Ok(());
    }
    let tokens: Vec<&str> = value.split_whitespace().collect();
    let is_process = |t: &str| PROCESS_MODIFIERS.contains(&t);
    let is_severity = |t: &str| SEVERITY_MODIFIERS.contains(&t);
    let ok = match tokens.as_slice() {
        [_] => true,
        [_, m] => is_process(m) || is_severity(m),
        [_, a, b] => (is_process(a) && is_severity(b)) || (is_severity(a) && is_process(b)),
        _ => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ValueError::BadLink)
    }
}
