//! Field catalog model, type tags, YAML persistence, and catalog providers.
//!
//! This module owns the [`Schema`] struct (the ordered set of destination
//! fields an import binds to), the [`FieldType`] enum (primitive storage
//! types), and [`Field`] metadata: aliases used during column reconciliation,
//! the required flag, missing-value-indicator support, lookup targets, and
//! declarative validators.
//!
//! ## Responsibilities
//!
//! - YAML schema loading and saving via `serde_yaml`
//! - Type tag parsing with common synonyms (`int`, `float`, `timestamp`, ...)
//! - Catalog invariants: unique names ignoring case, lookups only on
//!   text/integer fields, well-formed validator specs
//! - Recognition of the distinguished dimension fields
//! - [`FieldCatalog`] provider trait with a directory-backed implementation

use std::{
    fmt,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, Result, anyhow, ensure};
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{reconcile::normalize_key, validate::ValidatorSpec};

pub const MV_INDICATOR_SUFFIX: &str = "MVIndicator";
pub const CURRENT_SCHEMA_VERSION: &str = "1.0.0";

pub const PARTICIPANT_FIELD: &str = "ParticipantID";
pub const SPECIMEN_FIELD: &str = "SpecimenID";
pub const VISIT_FIELD: &str = "VisitID";
pub const DATE_FIELD: &str = "Date";
pub const TARGET_CONTEXT_FIELD: &str = "TargetStudy";

const DEFAULT_MV_INDICATORS: &[&str] = &["Q", "N"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    String,
    Integer,
    Double,
    Boolean,
    DateTime,
    FileLink,
    Attachment,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Integer => "Integer",
            FieldType::Double => "Double",
            FieldType::Boolean => "Boolean",
            FieldType::DateTime => "DateTime",
            FieldType::FileLink => "FileLink",
            FieldType::Attachment => "Attachment",
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &[
            "string",
            "integer",
            "double",
            "boolean",
            "datetime",
            "filelink",
            "attachment",
        ]
    }

    /// Name used in "must be of type" validation messages.
    pub fn friendly_name(&self) -> &'static str {
        match self {
            FieldType::String => "Text (String)",
            FieldType::Integer => "Integer",
            FieldType::Double => "Number (Double)",
            FieldType::Boolean => "True/False (Boolean)",
            FieldType::DateTime => "Date and Time",
            FieldType::FileLink | FieldType::Attachment => "File",
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, FieldType::FileLink | FieldType::Attachment)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, FieldType::String)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "string" | "text" | "varchar" => Ok(FieldType::String),
            "integer" | "int" => Ok(FieldType::Integer),
            "double" | "float" | "number" => Ok(FieldType::Double),
            "boolean" | "bool" => Ok(FieldType::Boolean),
            "datetime" | "date-time" | "date" | "timestamp" => Ok(FieldType::DateTime),
            "filelink" | "file-link" | "file" => Ok(FieldType::FileLink),
            "attachment" => Ok(FieldType::Attachment),
            _ => Err(anyhow!(
                "Unknown field type '{value}'. Supported types: {}",
                FieldType::variants().join(", ")
            )),
        }
    }
}

impl Serialize for FieldType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FieldType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let token = String::deserialize(deserializer)?;
        FieldType::from_str(&token).map_err(|err| de::Error::custom(err.to_string()))
    }
}

/// Identifies the class of stored entities a lookup field points at.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ReferenceTarget {
    /// Named collection; `None` searches every known collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
}

impl ReferenceTarget {
    pub fn any() -> Self {
        Self { collection: None }
    }

    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: Some(name.into()),
        }
    }

    pub fn class_key(&self) -> String {
        self.collection
            .as_deref()
            .map(|name| name.to_ascii_lowercase())
            .unwrap_or_else(|| "*".to_string())
    }
}

impl fmt::Display for ReferenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.collection {
            Some(name) => f.write_str(name),
            None => f.write_str("<any collection>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupMode {
    ByName,
    ById,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub datatype: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, rename = "aliases", skip_serializing_if = "Vec::is_empty")]
    pub import_aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub required: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub mv_enabled: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<ReferenceTarget>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validators: Vec<ValidatorSpec>,
}

impl Field {
    pub fn new(name: impl Into<String>, datatype: FieldType) -> Self {
        Self {
            name: name.into(),
            datatype,
            label: None,
            import_aliases: Vec::new(),
            required: false,
            mv_enabled: false,
            key: false,
            lookup: None,
            validators: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn mv_enabled(mut self) -> Self {
        self.mv_enabled = true;
        self
    }

    pub fn key(mut self) -> Self {
        self.key = true;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.import_aliases.extend(aliases.into_iter().map(Into::into));
        self
    }

    pub fn with_lookup(mut self, target: ReferenceTarget) -> Self {
        self.lookup = Some(target);
        self
    }

    pub fn with_validator(mut self, spec: ValidatorSpec) -> Self {
        self.validators.push(spec);
        self
    }

    /// Every name this field may be supplied under: name, label, import aliases.
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str())
            .chain(self.label.as_deref())
            .chain(self.import_aliases.iter().map(String::as_str))
            .filter(|alias| !alias.trim().is_empty())
    }

    pub fn mv_indicator_column(&self) -> String {
        format!("{}{}", self.name, MV_INDICATOR_SUFFIX)
    }

    pub fn lookup_mode(&self) -> Option<LookupMode> {
        self.lookup.as_ref()?;
        match self.datatype {
            FieldType::String => Some(LookupMode::ByName),
            FieldType::Integer => Some(LookupMode::ById),
            _ => None,
        }
    }

    fn is_named(&self, name: &str, datatype: FieldType) -> bool {
        self.name.eq_ignore_ascii_case(name) && self.datatype == datatype
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default = "Schema::default_mv_indicators")]
    pub mv_indicators: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub allow_empty_data: bool,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Self {
        Schema {
            fields,
            schema_version: None,
            mv_indicators: Self::default_mv_indicators(),
            allow_empty_data: false,
        }
    }

    pub fn default_mv_indicators() -> Vec<String> {
        DEFAULT_MV_INDICATORS
            .iter()
            .map(|code| code.to_string())
            .collect()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|field| field.name.eq_ignore_ascii_case(name))
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.field_index(name).map(|idx| &self.fields[idx])
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name.clone()).collect()
    }

    pub fn is_valid_mv_indicator(&self, code: &str) -> bool {
        let code = code.trim();
        self.mv_indicators
            .iter()
            .any(|valid| valid.eq_ignore_ascii_case(code))
    }

    pub fn has_key_fields(&self) -> bool {
        self.fields.iter().any(|field| field.key)
    }

    /// Finds the first field with the given well-known name and type.
    pub fn distinguished_field(&self, name: &str, datatype: FieldType) -> Option<usize> {
        self.fields
            .iter()
            .position(|field| field.is_named(name, datatype))
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for (idx, field) in self.fields.iter().enumerate() {
            ensure!(
                !field.name.trim().is_empty(),
                "Field at position {} has an empty name",
                idx + 1
            );
            ensure!(
                seen.insert(normalize_key(&field.name)),
                "Field name '{}' appears more than once (names are case-insensitive)",
                field.name
            );
            if field.lookup.is_some() {
                ensure!(
                    field.lookup_mode().is_some(),
                    "Field '{}' is a lookup but has type {}; lookups must be String or Integer",
                    field.name,
                    field.datatype
                );
            }
            for spec in &field.validators {
                spec.ensure_valid()
                    .with_context(|| format!("Field '{}'", field.name))?;
            }
        }
        for code in &self.mv_indicators {
            ensure!(
                !code.trim().is_empty(),
                "Missing value indicator codes cannot be blank"
            );
        }
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("Opening schema file {path:?}"))?;
        let reader = BufReader::new(file);
        let schema: Schema = serde_yaml::from_reader(reader).context("Parsing schema YAML")?;
        schema
            .validate()
            .with_context(|| format!("Validating schema {path:?}"))?;
        Ok(schema)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self> {
        let schema: Schema = serde_yaml::from_str(contents).context("Parsing schema YAML")?;
        schema.validate()?;
        Ok(schema)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        let mut schema = self.clone();
        if schema.schema_version.is_none() {
            schema.schema_version = Some(CURRENT_SCHEMA_VERSION.to_string());
        }
        schema.validate()?;
        serde_yaml::to_string(&schema).context("Serializing schema to YAML string")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = self.to_yaml_string()?;
        std::fs::write(path, contents).with_context(|| format!("Writing schema file {path:?}"))
    }
}

/// Supplies the destination schema for an import run.
pub trait FieldCatalog {
    fn fields(&self, schema_id: &str) -> Result<Schema>;
}

/// Catalog backed by a directory of `<schema-id>.yml` files.
#[derive(Debug, Clone)]
pub struct YamlCatalog {
    root: PathBuf,
}

impl YamlCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn candidate_paths(&self, schema_id: &str) -> [PathBuf; 2] {
        [
            self.root.join(format!("{schema_id}.yml")),
            self.root.join(format!("{schema_id}.yaml")),
        ]
    }
}

impl FieldCatalog for YamlCatalog {
    fn fields(&self, schema_id: &str) -> Result<Schema> {
        ensure!(
            !schema_id.contains(['/', '\\']),
            "Schema id '{schema_id}' must not contain path separators"
        );
        let path = self
            .candidate_paths(schema_id)
            .into_iter()
            .find(|path| path.is_file())
            .ok_or_else(|| anyhow!("No schema '{schema_id}' under {:?}", self.root))?;
        Schema::load(&path)
    }
}
