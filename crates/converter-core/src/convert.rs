//! Pluggable message to record conversion.
//!
//! The engine only knows the [`RawdataConverter`] contract. The reference
//! [`JsonEntryConverter`] parses one named entry of every message as a JSON
//! object and checks its scalar fields against the target schema.

use crate::config::{ConverterConfig, ConverterKind, EffectiveJobConfig};
use crate::error::ConversionError;
use crate::message::RawdataMessage;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// One converted record.
pub type Record = Map<String, Value>;

/// Name of the identity column carried by every record.
pub const ULID_COLUMN: &str = "ulid";

/// Outcome of converting one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversionResult {
    /// The converted record, possibly partial
    pub record: Record,
    /// Non-fatal per-field failures
    pub failures: Vec<String>,
    /// Free-form properties
    pub properties: BTreeMap<String, String>,
    /// Named counter deltas
    pub counters: BTreeMap<String, u64>,
}

impl ConversionResult {
    pub fn new(record: Record) -> Self {
        Self {
            record,
            ..Default::default()
        }
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        self.failures.push(failure.into());
    }

    pub fn increment_counter(&mut self, name: &str, delta: u64) {
        *self.counters.entry(name.to_string()).or_insert(0) += delta;
    }
}

/// Converts rawdata messages into records of one target schema.
pub trait RawdataConverter: Send {
    /// Called once before the first conversion with sampled messages from
    /// the start of the topic.
    fn init(&mut self, samples: &[RawdataMessage]) -> Result<(), ConversionError>;

    /// Whether a message should be converted at all.
    fn is_convertible(&self, message: &RawdataMessage) -> bool;

    /// Convert one message. An `Err` is fatal for the pipeline; partial
    /// failures belong in [`ConversionResult::failures`].
    fn convert(&mut self, message: &RawdataMessage) -> Result<ConversionResult, ConversionError>;

    /// Schema of the produced records.
    fn target_schema(&self) -> SchemaRef;
}

/// Builds a converter for a job.
pub trait ConverterFactory: Send + Sync {
    fn create(&self, config: &EffectiveJobConfig) -> Result<Box<dyn RawdataConverter>, ConversionError>;
}

/// Factory for the converter selected in the service configuration.
#[derive(Debug, Clone, Default)]
pub struct DefaultConverterFactory {
    config: ConverterConfig,
}

impl DefaultConverterFactory {
    pub fn new(config: ConverterConfig) -> Self {
        Self { config }
    }
}

impl ConverterFactory for DefaultConverterFactory {
    fn create(&self, config: &EffectiveJobConfig) -> Result<Box<dyn RawdataConverter>, ConversionError> {
        match self.config.kind {
            ConverterKind::JsonEntry => Ok(Box::new(JsonEntryConverter::from_job_config(
                &self.config.entry,
                &config.converter_config,
            )?)),
        }
    }
}

/// Declared column type for [`JsonEntryConverter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    String,
    Long,
    Double,
    Boolean,
}

impl ColumnType {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "string" | "utf8" => Some(ColumnType::String),
            "long" | "int" | "int64" => Some(ColumnType::Long),
            "double" | "float" | "float64" => Some(ColumnType::Double),
            "boolean" | "bool" => Some(ColumnType::Boolean),
            _ => None,
        }
    }

    fn data_type(self) -> DataType {
        match self {
            ColumnType::String => DataType::Utf8,
            ColumnType::Long => DataType::Int64,
            ColumnType::Double => DataType::Float64,
            ColumnType::Boolean => DataType::Boolean,
        }
    }
}

/// Parses a named entry as a JSON object.
///
/// Converter config keys:
/// - `entry`: entry name, overriding the service default
/// - `fields`: map of column name to `string`, `long`, `double` or `boolean`.
///   Without it the schema is inferred from the init samples.
pub struct JsonEntryConverter {
    entry: String,
    declared: Option<Vec<(String, ColumnType)>>,
    schema: SchemaRef,
}

impl JsonEntryConverter {
    /// Create a converter reading `entry` with an inferred schema.
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            declared: None,
            schema: ulid_only_schema(),
        }
    }

    /// Create a converter from a job's converter config.
    pub fn from_job_config(
        default_entry: &str,
        converter_config: &BTreeMap<String, Value>,
    ) -> Result<Self, ConversionError> {
        let entry = match converter_config.get("entry") {
            None => default_entry.to_string(),
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(other) => {
                return Err(ConversionError::Init(format!(
                    "'entry' must be a non-empty string, got {}",
                    other
                )))
            }
        };

        let mut converter = Self::new(entry);
        if let Some(fields) = converter_config.get("fields") {
            let fields = fields
                .as_object()
                .ok_or_else(|| ConversionError::Init("'fields' must be a map".into()))?;
            let mut declared = Vec::with_capacity(fields.len());
            for (name, ty) in fields {
                let ty = ty.as_str().and_then(ColumnType::parse).ok_or_else(|| {
                    ConversionError::Init(format!("unsupported type {} for field '{}'", ty, name))
                })?;
                declared.push((name.clone(), ty));
            }
            converter.schema = declared_schema(&declared);
            converter.declared = Some(declared);
        }
        Ok(converter)
    }

    /// Entry name read from each message.
    pub fn entry(&self) -> &str {
        &self.entry
    }

    fn parse_entry(&self, message: &RawdataMessage) -> Result<Record, ConversionError> {
        let content = message.get(&self.entry).ok_or_else(|| ConversionError::Convert {
            ulid: message.ulid,
            message: format!("missing entry '{}'", self.entry),
        })?;
        match serde_json::from_slice::<Value>(content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(ConversionError::Convert {
                ulid: message.ulid,
                message: format!("entry '{}' is not a JSON object", self.entry),
            }),
            Err(e) => Err(ConversionError::Convert {
                ulid: message.ulid,
                message: e.to_string(),
            }),
        }
    }
}

impl RawdataConverter for JsonEntryConverter {
    fn init(&mut self, samples: &[RawdataMessage]) -> Result<(), ConversionError> {
        if self.declared.is_some() || samples.is_empty() {
            return Ok(());
        }

        let values: Vec<Value> = samples
            .iter()
            .filter(|m| self.is_convertible(m))
            .filter_map(|m| self.parse_entry(m).ok())
            .map(Value::Object)
            .collect();
        let inferred =
            arrow::json::reader::infer_json_schema_from_iterator(values.into_iter().map(Ok))
                .map_err(|e| ConversionError::Init(format!("schema inference failed: {}", e)))?;

        let mut fields = vec![Field::new(ULID_COLUMN, DataType::Utf8, false)];
        fields.extend(
            inferred
                .fields()
                .iter()
                .filter(|f| f.name() != ULID_COLUMN)
                .map(|f| f.as_ref().clone().with_nullable(true)),
        );
        self.schema = Arc::new(Schema::new(fields));
        Ok(())
    }

    fn is_convertible(&self, message: &RawdataMessage) -> bool {
        message
            .get(&self.entry)
            .and_then(|content| content.iter().find(|b| !b.is_ascii_whitespace()))
            == Some(&b'{')
    }

    fn convert(&mut self, message: &RawdataMessage) -> Result<ConversionResult, ConversionError> {
        let mut parsed = self.parse_entry(message)?;
        let mut result = ConversionResult::default();
        result
            .record
            .insert(ULID_COLUMN.to_string(), Value::String(message.ulid.to_string()));

        for field in self.schema.fields().iter().filter(|f| f.name() != ULID_COLUMN) {
            let value = parsed.remove(field.name()).unwrap_or(Value::Null);
            let value = match check_scalar(field.data_type(), &value) {
                Ok(()) => value,
                Err(expected) => {
                    result.add_failure(format!(
                        "field '{}': expected {}, got {}",
                        field.name(),
                        expected,
                        value
                    ));
                    Value::Null
                }
            };
            result.record.insert(field.name().clone(), value);
        }

        if !parsed.is_empty() {
            result.increment_counter("unmapped_fields", parsed.len() as u64);
        }
        result.increment_counter("json_entries", 1);
        result
            .properties
            .insert("entry".to_string(), self.entry.clone());
        Ok(result)
    }

    fn target_schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }
}

fn ulid_only_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![Field::new(ULID_COLUMN, DataType::Utf8, false)]))
}

fn declared_schema(declared: &[(String, ColumnType)]) -> SchemaRef {
    let mut fields = vec![Field::new(ULID_COLUMN, DataType::Utf8, false)];
    fields.extend(
        declared
            .iter()
            .filter(|(name, _)| name != ULID_COLUMN)
            .map(|(name, ty)| Field::new(name, ty.data_type(), true)),
    );
    Arc::new(Schema::new(fields))
}

/// Checks a value against a scalar column type. Nested types are not checked.
fn check_scalar(data_type: &DataType, value: &Value) -> Result<(), &'static str> {
    match (data_type, value) {
        (_, Value::Null) => Ok(()),
        (DataType::Utf8, Value::String(_)) => Ok(()),
        (DataType::Utf8, _) => Err("string"),
        (DataType::Int64, Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(()),
        (DataType::Int64, _) => Err("long"),
        (DataType::Float64, Value::Number(_)) => Ok(()),
        (DataType::Float64, _) => Err("double"),
        (DataType::Boolean, Value::Bool(_)) => Ok(()),
        (DataType::Boolean, _) => Err("boolean"),
        _ => Ok(()),
    }
}
