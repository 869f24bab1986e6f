use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Import delimited files into a typed schema with validation and provenance",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate a file against a schema and write it to the store in one transaction
    Import(ImportArgs),
    /// Run the full import, then roll back instead of committing
    Check(ImportArgs),
    /// Show how a file's columns map onto a schema
    Columns(ColumnsArgs),
    /// Register an entity that lookup fields can reference
    Entity(EntityArgs),
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Input file to import ('-' reads stdin)
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Schema YAML file describing the destination fields
    #[arg(short = 's', long = "schema")]
    pub schema: PathBuf,
    /// SQLite database holding entities, imported rows, and provenance
    #[arg(long = "db")]
    pub db: PathBuf,
    /// Report unexpected columns and require every field
    #[arg(long)]
    pub strict: bool,
    /// Accept an input file with no data rows
    #[arg(long = "allow-empty")]
    pub allow_empty: bool,
    /// Resolve text in integer lookup columns by entity name
    #[arg(long = "alternate-keys")]
    pub alternate_keys: bool,
    /// Keep unparseable values as text instead of rejecting them
    #[arg(long = "best-effort")]
    pub best_effort: bool,
    /// Container the rows belong to
    #[arg(long, default_value = "default")]
    pub container: String,
    /// Destination table name (defaults to the schema file stem)
    #[arg(long)]
    pub destination: Option<String>,
    /// User recorded as the creator of imported rows
    #[arg(long, default_value = "cli")]
    pub user: String,
    /// Directory that file-typed values are resolved against
    #[arg(long = "files-root")]
    pub files_root: Option<PathBuf>,
    /// Target context ids accepted for TargetStudy values, as `id` or `id=label`
    #[arg(long = "target-context", action = clap::ArgAction::Append)]
    pub target_contexts: Vec<String>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ColumnsArgs {
    /// Input file whose header is inspected
    #[arg(short = 'i', long = "input")]
    pub input: PathBuf,
    /// Schema YAML file describing the destination fields
    #[arg(short = 's', long = "schema")]
    pub schema: PathBuf,
    /// Report unexpected columns and require every field
    #[arg(long)]
    pub strict: bool,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of the input file (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct EntityArgs {
    /// SQLite database to register the entity in
    #[arg(long = "db")]
    pub db: PathBuf,
    /// Collection the entity belongs to (for example `Samples`)
    #[arg(long)]
    pub collection: String,
    /// Display name used by lookups
    #[arg(long)]
    pub name: String,
    /// Container the entity belongs to
    #[arg(long, default_value = "default")]
    pub container: String,
    /// Do not record this entity as a provenance input when referenced
    #[arg(long = "not-input")]
    pub not_input: bool,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}
