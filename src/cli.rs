//! Command-line driver: read the schema, expand the template, validate, write the flat
//! database and optionally a Makefile dependency file.

use crate::dbd::{DbdError, Schema};
use crate::error::ParseError;
use crate::macros::{self, MacroError, MacroScope};
use crate::parser::{ParseOptions, ParserContext};
use anyhow::Context;
use clap::Parser;
use std::cell::RefCell;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// Expand a template database, resolving macros, includes and expands, and optionally
/// validate it against a DBD schema.
#[derive(Parser, Debug, Clone)]
#[command(name = "dbmsi", version)]
pub struct Cli {
    /// template file ('-' or omitted for stdin)
    pub input: Option<PathBuf>,

    /// output file (stdout if omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// DBD schema to validate records against
    #[arg(long)]
    pub dbd: Option<PathBuf>,

    /// cache file for the parsed DBD schema
    #[arg(long, requires = "dbd")]
    pub dbd_cache: Option<PathBuf>,

    /// include search path; repeatable and ':'-delimited
    #[arg(short = 'I', long = "include", value_name = "PATH")]
    pub include: Vec<String>,

    /// initial macro definitions "NAME=VALUE,NAME=VALUE"; repeatable
    #[arg(short = 'M', long = "macros", value_name = "DEFS")]
    pub macros: Vec<String>,

    /// substitute an empty string for undefined macros
    #[arg(short = 'm', long)]
    pub allow_missing: bool,

    /// omit comments from the output
    #[arg(short = 's', long)]
    pub strip_comments: bool,

    /// trace every record, include, expand and substitute on stderr
    #[arg(short, long)]
    pub verbose: bool,

    /// write Makefile dependencies to FILE (-MF)
    #[arg(long = "MF", value_name = "FILE", conflicts_with = "md")]
    pub mf: Option<PathBuf>,

    /// write Makefile dependencies next to the input, with a .d suffix (-MD)
    #[arg(long = "MD", id = "md")]
    pub md: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("usage: {0}")]
    Usage(String),
    #[error("{}", .0.render_chain())]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Schema(#[from] DbdError),
    #[error("invalid -M definitions: {0}")]
    Macros(#[from] MacroError),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl CliError {
    /// Process exit code: 1 for usage errors, 2 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => 1,
            _ => 2,
        }
    }
}

/// Map gcc-style `-MF`/`-MD` to the long options clap understands.
pub fn normalize_args<I: IntoIterator<Item = String>>(args: I) -> Vec<String> {
    args.into_iter()
        .map(|a| match a.as_str() {
            "-MF" => "--MF".to_string(),
            "-MD" => "--MD".to_string(),
            _ => a,
        })
        .collect()
}

impl Cli {
    /// Parse the process arguments.
    pub fn load() -> Result<Self, clap::Error> {
        Self::try_parse_from(normalize_args(std::env::args()))
    }

    fn input_path(&self) -> Option<&Path> {
        self.input.as_deref().filter(|p| p.as_os_str() != "-")
    }

    fn include_path(&self) -> Vec<PathBuf> {
        let dirs: Vec<PathBuf> = self
            .include
            .iter()
            .flat_map(|s| s.split(':'))
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect();
        if dirs.is_empty() {
            vec![PathBuf::from(".")]
        } else {
            dirs
        }
    }

    fn initial_macros(&self) -> Result<MacroScope, MacroError> {
        let mut scope = MacroScope::new();
        for defs in &self.macros {
            scope.extend(macros::parse_definitions(defs)?.iter());
        }
        Ok(scope)
    }

    /// Where to write the dependency file, if requested.
    pub fn dependency_file(&self) -> Result<Option<PathBuf>, CliError> {
        if self.mf.is_none() && !self.md {
            return Ok(None);
        }
        if self.output.is_none() {
            return Err(CliError::Usage("-MF/-MD need an output file (-o)".to_string()));
        }
        if let Some(mf) = &self.mf {
            return Ok(Some(mf.clone()));
        }
        match self.input_path() {
            Some(input) => {
                let mut name = input.as_os_str().to_os_string();
                name.push(".d");
                Ok(Some(PathBuf::from(name)))
            }
            None => Err(CliError::Usage("-MD needs an input file".to_string())),
        }
    }

    /// Run the driver. The dependency file is written even when parsing fails.
    pub fn run(&self) -> Result<(), CliError> {
        let dep_file = self.dependency_file()?;
        let include_path = self.include_path();
        let options = ParseOptions {
            allow_missing: self.allow_missing,
            strip_comments: self.strip_comments,
            ..ParseOptions::default()
        };
        let initial = self.initial_macros()?;
        let deps = RefCell::new(Vec::<PathBuf>::new());

        let outcome = self.expand(&include_path, options, initial, &deps);

        if let (Some(dep_file), Some(output)) = (&dep_file, &self.output) {
            write_dependencies(dep_file, output, &deps.borrow())?;
        }
        let text = outcome?;

        match &self.output {
            Some(path) => fs::write(path, text).with_context(|| format!("writing {}", path.display()))?,
            None => io::stdout()
                .write_all(text.as_bytes())
                .context("writing standard output")?,
        }
        Ok(())
    }

    fn expand(
        &self,
        include_path: &[PathBuf],
        options: ParseOptions,
        initial: MacroScope,
        deps: &RefCell<Vec<PathBuf>>,
    ) -> Result<String, CliError> {
        let schema = match &self.dbd {
            Some(dbd) => {
                log::debug!("loading schema {}", dbd.display());
                let schema = Schema::load(dbd, self.dbd_cache.as_deref(), include_path)?;
                deps.borrow_mut().push(dbd.clone());
                Some(schema)
            }
            None => None,
        };

        let mut ctx = ParserContext::new(options)
            .with_macros(initial)
            .with_include_path(include_path.to_vec())
            .on_dependency(|p| deps.borrow_mut().push(p.to_path_buf()));
        if let Some(schema) = &schema {
            ctx = ctx.with_validator(schema);
        }

        let database = match self.input_path() {
            Some(path) => ctx.parse_file(path)?,
            None => {
                let mut source = String::new();
                io::stdin()
                    .read_to_string(&mut source)
                    .context("reading standard input")?;
                ctx.parse_str(&source, "<stdin>")?
            }
        };
        log::debug!("{} record(s)", database.records().len());
        Ok(database.to_string())
    }
}

/// Write `TARGET: dep dep ...` in Makefile syntax.
pub fn write_dependencies(dep_file: &Path, target: &Path, deps: &[PathBuf]) -> anyhow::Result<()> {
    let mut line = format!("{}:", make_escape(&target.display().to_string()));
    for dep in deps {
        line.push(' ');
        line.push_str(&make_escape(&dep.display().to_string()));
    }
    line.push('\n');
    fs::write(dep_file, line).with_context(|| format!("writing {}", dep_file.display()))
}

fn make_escape(s: &str) -> String {
    s.replace(' ', "\\ ").replace('$', "$$")
}
