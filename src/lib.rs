pub mod cli;
pub mod dimension;
pub mod error;
pub mod files;
pub mod importer;
pub mod io_utils;
pub mod loader;
pub mod lookup;
pub mod memory;
pub mod provenance;
pub mod reconcile;
pub mod row;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod validate;
pub mod value;

use std::{env, path::Path, sync::OnceLock};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{LevelFilter, debug, info};

use crate::{
    cli::{Cli, ColumnsArgs, Commands, EntityArgs, ImportArgs},
    dimension::StaticDimensionResolver,
    files::RootedFileResolver,
    importer::{ImportSettings, Importer},
    loader::LoadOptions,
    reconcile::Reconciler,
    schema::Schema,
    sqlite::SqliteStore,
    store::ImportTarget,
};

static LOGGER: OnceLock<()> = OnceLock::new();

fn init_logging() {
    LOGGER.get_or_init(|| {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default());
        if env::var("RUST_LOG").is_err() {
            builder.filter_module("tabular_import", LevelFilter::Info);
        }
        let _ = builder.format_timestamp_millis().try_init();
    });
}

pub fn run() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Import(args) => handle_import(&args, false),
        Commands::Check(args) => handle_import(&args, true),
        Commands::Columns(args) => handle_columns(&args),
        Commands::Entity(args) => handle_entity(&args),
    }
}

fn handle_import(args: &ImportArgs, dry_run: bool) -> Result<()> {
    let schema = Schema::load(&args.schema)
        .with_context(|| format!("Loading schema from {:?}", args.schema))?;
    let destination = match &args.destination {
        Some(destination) => destination.clone(),
        None => schema_stem(&args.schema)?,
    };
    info!(
        "Reading '{}' with delimiter '{}'",
        args.input.display(),
        printable_delimiter(io_utils::resolve_input_delimiter(&args.input, args.delimiter))
    );
    let options = LoadOptions {
        delimiter: args.delimiter,
        encoding: args.input_encoding.clone(),
        best_effort: args.best_effort,
        alternate_keys: args.alternate_keys,
    };
    let data = loader::load_path(&args.input, &schema, &options)?;

    let settings = ImportSettings {
        strict: args.strict,
        allow_empty_data: args.allow_empty,
        allow_lookup_by_alternate_key: args.alternate_keys,
        best_effort_conversion: args.best_effort,
        dry_run,
    };
    let dimensions = dimension_resolver(&args.target_contexts);
    let files = args.files_root.as_ref().map(RootedFileResolver::new);
    let target = ImportTarget::new(&args.container, &args.user, &destination);

    let mut store =
        SqliteStore::open(&args.db).with_context(|| format!("Opening store {:?}", args.db))?;
    let mut importer = Importer::new(&mut store, settings).with_dimension_resolver(&dimensions);
    if let Some(files) = &files {
        importer = importer.with_file_resolver(files);
    }
    let outcome = importer.run(&schema, data, &target)?;
    debug!(
        "Lookup cache: {} hit(s), {} miss(es)",
        outcome.lookup_hits, outcome.lookup_misses
    );

    let verb = if outcome.dry_run {
        "Validated"
    } else {
        "Imported"
    };
    println!(
        "{verb} {} row(s) into {destination} with {} provenance edge(s) (run {})",
        outcome.rows.len(),
        outcome.edges,
        outcome.run_id
    );
    if !outcome.dropped_columns.is_empty() {
        println!("Ignored columns: {}", outcome.dropped_columns.join(", "));
    }
    if !outcome.run_inputs.is_empty() {
        let inputs = outcome
            .run_inputs
            .as_slice()
            .iter()
            .map(|input| match &input.role {
                Some(role) => format!("{} ({role})", input.lsid),
                None => input.lsid.clone(),
            })
            .collect::<Vec<_>>();
        println!("Run inputs: {}", inputs.join(", "));
    }
    Ok(())
}

fn handle_columns(args: &ColumnsArgs) -> Result<()> {
    let schema = Schema::load(&args.schema)
        .with_context(|| format!("Loading schema from {:?}", args.schema))?;
    let delimiter = io_utils::resolve_input_delimiter(&args.input, args.delimiter);
    let encoding = io_utils::resolve_encoding(args.input_encoding.as_deref())?;
    let mut reader = io_utils::open_csv_reader_from_path(&args.input, delimiter, true)?;
    let columns = io_utils::reader_headers(&mut reader, encoding)?;

    let reconciliation = Reconciler::new(&schema).reconcile(&columns, args.strict);
    for (column, field) in &reconciliation.mapped {
        println!("{column} -> {field}");
    }
    for column in &reconciliation.dropped {
        println!("{column} -> (ignored)");
    }
    for column in &reconciliation.shadowed {
        println!("{column} -> (shadowed)");
    }
    if !reconciliation.is_clean() {
        bail!("{}", reconciliation.describe());
    }
    Ok(())
}

fn handle_entity(args: &EntityArgs) -> Result<()> {
    let store =
        SqliteStore::open(&args.db).with_context(|| format!("Opening store {:?}", args.db))?;
    let entity =
        store.register_entity(&args.container, &args.collection, &args.name, !args.not_input)?;
    println!(
        "Registered {} '{}' with id {} ({})",
        entity.collection, entity.name, entity.row_id, entity.lsid
    );
    Ok(())
}

/// Builds the passthrough resolver from `id` or `id=label` arguments.
fn dimension_resolver(contexts: &[String]) -> StaticDimensionResolver {
    contexts
        .iter()
        .fold(StaticDimensionResolver::new(), |resolver, spec| {
            match spec.split_once('=') {
                Some((id, label)) => resolver.with_context(id.trim(), label.trim()),
                None => resolver.with_context(spec.trim(), spec.trim()),
            }
        })
}

fn schema_stem(path: &Path) -> Result<String> {
    match path.file_stem().and_then(|stem| stem.to_str()) {
        Some(stem) if !stem.is_empty() => Ok(stem.to_string()),
        _ => bail!("Cannot derive a destination name from {path:?}; pass --destination"),
    }
}

pub(crate) fn printable_delimiter(delimiter: u8) -> String {
    match delimiter {
        b',' => ",".to_string(),
        b'\t' => "\\t".to_string(),
        b'\n' => "\\n".to_string(),
        other => (other as char).to_string(),
    }
}
