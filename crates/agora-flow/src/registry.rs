//! Capability schema registry.
//!
//! Loads one JSON document per capability from a directory at startup. Each
//! document carries the capability's compiled input/output schemas plus its
//! price and deadline configuration, so capability tables can change without
//! code edits.
//!
//! ## Document shape
//!
//! ```json
//! {
//!   "price": 3,
//!   "deadline_seconds": 15,
//!   "properties": {
//!     "input_schema": { ... },
//!     "output_schema": { "oneOf": [ ... ] }
//!   }
//! }
//! ```
//!
//! The output schema must be a `oneOf` union discriminated by a `status`
//! field with values among `success`, `partial`, and `error`; every error
//! variant must carry an `error` object with `code` and `message`. These
//! contracts are checked at load time and violations abort startup.
//!
//! Input validation is a hard reject; output validation is a soft flag that
//! never aborts settlement. Compiled schemas are read-only after startup.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::Value;

use agora_core::{Error, Result};

const ALLOWED_STATUSES: [&str; 3] = ["success", "partial", "error"];
const MAX_DIAGNOSTICS: usize = 5;

/// Public capability listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CapabilityInfo {
    /// Capability name.
    pub name: String,
    /// Indicative price in credits per task.
    pub price: i64,
    /// Human-readable deadline description.
    pub deadline: String,
}

/// Deadline configuration for one capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeadlineSpec {
    /// One deadline for every task.
    Fixed(Duration),
    /// Deadline keyed by the input's `depth` field.
    DepthBased {
        quick: Duration,
        standard: Duration,
        deep: Duration,
    },
}

impl DeadlineSpec {
    fn resolve(self, input: &Value) -> Duration {
        match self {
            Self::Fixed(d) => d,
            Self::DepthBased {
                quick,
                standard,
                deep,
            } => match input.get("depth").and_then(Value::as_str) {
                Some("quick") => quick,
                Some("deep") => deep,
                _ => standard,
            },
        }
    }

    fn describe(self) -> String {
        match self {
            Self::Fixed(d) => format!("{}s", d.as_secs()),
            Self::DepthBased { quick, deep, .. } => {
                format!("{}s-{}s (depth-dependent)", quick.as_secs(), deep.as_secs())
            }
        }
    }
}

struct CapabilityEntry {
    input: JSONSchema,
    output: JSONSchema,
    price: i64,
    deadline: DeadlineSpec,
}

/// Compiled capability schemas plus price/deadline tables.
///
/// Constructed once at startup and shared read-only; no synchronization is
/// required afterwards.
pub struct SchemaRegistry {
    entries: BTreeMap<String, CapabilityEntry>,
}

impl std::fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("capabilities", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SchemaRegistry {
    /// Loads and compiles every `*.json` document in `dir`.
    ///
    /// The capability name is the file stem with a trailing `.v1` stripped.
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when a document is malformed, fails to compile,
    /// or violates the output union contract.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let mut entries = BTreeMap::new();

        let listing = std::fs::read_dir(dir).map_err(|e| {
            Error::InvalidInput(format!("cannot read schema dir {}: {e}", dir.display()))
        })?;
        for dirent in listing {
            let dirent = dirent.map_err(|e| {
                Error::InvalidInput(format!("cannot read schema dir {}: {e}", dir.display()))
            })?;
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let capability = stem.strip_suffix(".v1").unwrap_or(stem).to_string();

            let raw = std::fs::read_to_string(&path).map_err(|e| {
                Error::InvalidInput(format!("cannot read {}: {e}", path.display()))
            })?;
            let document: Value = serde_json::from_str(&raw).map_err(|e| {
                Error::InvalidInput(format!("cannot parse {}: {e}", path.display()))
            })?;

            let entry = compile_capability(&capability, &document)
                .map_err(|e| Error::InvalidInput(format!("{}: {e}", path.display())))?;
            tracing::info!(capability = %capability, "loaded capability schema");
            entries.insert(capability, entry);
        }

        if entries.is_empty() {
            return Err(Error::InvalidInput(format!(
                "no capability schemas found in {}",
                dir.display()
            )));
        }
        Ok(Self { entries })
    }

    /// Returns true when the capability is loaded (the admission allow-list).
    #[must_use]
    pub fn allows(&self, capability: &str) -> bool {
        self.entries.contains_key(capability)
    }

    /// Validates an input payload against the capability's input schema.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCapability` for unloaded capabilities and
    /// `ValidationFailed` on schema mismatch (hard reject).
    pub fn validate_input(&self, capability: &str, payload: &Value) -> Result<()> {
        let entry = self.entry(capability)?;
        let diagnostics = collect_errors(&entry.input, payload);
        if diagnostics.is_empty() {
            Ok(())
        } else {
            Err(Error::validation(diagnostics.join("; ")))
        }
    }

    /// Validates an output payload against the capability's output schema.
    ///
    /// Soft flag: returns a diagnostic instead of failing, so settlement is
    /// never aborted by a malformed output.
    #[must_use]
    pub fn validate_output(&self, capability: &str, payload: &Value) -> Option<String> {
        let Ok(entry) = self.entry(capability) else {
            return Some(format!("unknown capability {capability}"));
        };
        let diagnostics = collect_errors(&entry.output, payload);
        if diagnostics.is_empty() {
            None
        } else {
            Some(diagnostics.join("; "))
        }
    }

    /// Returns the wall-clock deadline for a task of this capability.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCapability` for unloaded capabilities.
    pub fn deadline(&self, capability: &str, input: &Value) -> Result<Duration> {
        Ok(self.entry(capability)?.deadline.resolve(input))
    }

    /// Returns the indicative price for a capability.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCapability` for unloaded capabilities.
    pub fn price(&self, capability: &str) -> Result<i64> {
        Ok(self.entry(capability)?.price)
    }

    /// Returns the public capability listing, sorted by name.
    #[must_use]
    pub fn capabilities(&self) -> Vec<CapabilityInfo> {
        self.entries
            .iter()
            .map(|(name, entry)| CapabilityInfo {
                name: name.clone(),
                price: entry.price,
                deadline: entry.deadline.describe(),
            })
            .collect()
    }

    fn entry(&self, capability: &str) -> Result<&CapabilityEntry> {
        self.entries
            .get(capability)
            .ok_or_else(|| Error::UnknownCapability {
                capability: capability.to_string(),
            })
    }
}

fn collect_errors(schema: &JSONSchema, payload: &Value) -> Vec<String> {
    match schema.validate(payload) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .take(MAX_DIAGNOSTICS)
            .map(|e| format!("{}: {e}", e.instance_path))
            .collect(),
    }
}

fn compile_capability(capability: &str, document: &Value) -> Result<CapabilityEntry> {
    let properties = document
        .get("properties")
        .ok_or_else(|| Error::InvalidInput("missing properties object".into()))?;
    let input_schema = properties
        .get("input_schema")
        .ok_or_else(|| Error::InvalidInput("missing input_schema".into()))?;
    let output_schema = properties
        .get("output_schema")
        .ok_or_else(|| Error::InvalidInput("missing output_schema".into()))?;

    check_output_contract(output_schema)?;

    let input = JSONSchema::compile(input_schema)
        .map_err(|e| Error::InvalidInput(format!("input schema does not compile: {e}")))?;
    let output = JSONSchema::compile(output_schema)
        .map_err(|e| Error::InvalidInput(format!("output schema does not compile: {e}")))?;

    let price = match document.get("price") {
        Some(v) => v
            .as_i64()
            .filter(|p| *p > 0)
            .ok_or_else(|| Error::InvalidInput("price must be a positive integer".into()))?,
        None => default_price(capability)
            .ok_or_else(|| Error::InvalidInput("price is required for this capability".into()))?,
    };

    let deadline = match document.get("deadline_seconds") {
        Some(v) => parse_deadline(v)?,
        None => default_deadline(capability).ok_or_else(|| {
            Error::InvalidInput("deadline_seconds is required for this capability".into())
        })?,
    };

    Ok(CapabilityEntry {
        input,
        output,
        price,
        deadline,
    })
}

fn parse_deadline(value: &Value) -> Result<DeadlineSpec> {
    if let Some(secs) = value.as_u64() {
        return Ok(DeadlineSpec::Fixed(Duration::from_secs(secs)));
    }
    let object = value.as_object().ok_or_else(|| {
        Error::InvalidInput("deadline_seconds must be a number or a depth object".into())
    })?;
    let depth_secs = |key: &str| -> Result<Duration> {
        object
            .get(key)
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .ok_or_else(|| {
                Error::InvalidInput(format!("deadline_seconds.{key} must be a number"))
            })
    };
    Ok(DeadlineSpec::DepthBased {
        quick: depth_secs("quick")?,
        standard: depth_secs("standard")?,
        deep: depth_secs("deep")?,
    })
}

/// Verifies the tagged-union contract on an output schema document.
fn check_output_contract(schema: &Value) -> Result<()> {
    let variants = schema
        .get("oneOf")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::InvalidInput("output_schema must be a oneOf union".into()))?;
    if variants.is_empty() {
        return Err(Error::InvalidInput(
            "output_schema union has no variants".into(),
        ));
    }

    for variant in variants {
        let status = variant_status(variant).ok_or_else(|| {
            Error::InvalidInput(
                "output_schema variant does not pin a status discriminator".into(),
            )
        })?;
        if !ALLOWED_STATUSES.contains(&status) {
            return Err(Error::InvalidInput(format!(
                "output_schema variant has invalid status {status:?}"
            )));
        }
        if status == "error" {
            check_error_variant(variant)?;
        }
    }
    Ok(())
}

fn variant_status(variant: &Value) -> Option<&str> {
    let status = variant.get("properties")?.get("status")?;
    if let Some(fixed) = status.get("const").and_then(Value::as_str) {
        return Some(fixed);
    }
    let values = status.get("enum")?.as_array()?;
    if values.len() == 1 {
        values[0].as_str()
    } else {
        None
    }
}

fn check_error_variant(variant: &Value) -> Result<()> {
    let error_props = variant
        .get("properties")
        .and_then(|p| p.get("error"))
        .and_then(|e| e.get("properties"))
        .ok_or_else(|| {
            Error::InvalidInput("error variant must carry an error object".into())
        })?;
    for field in ["code", "message"] {
        if error_props.get(field).is_none() {
            return Err(Error::InvalidInput(format!(
                "error variant's error object must define {field}"
            )));
        }
    }
    Ok(())
}

fn default_price(capability: &str) -> Option<i64> {
    match capability {
        "research" => Some(8),
        "summarize" => Some(3),
        "data_extraction" => Some(5),
        _ => None,
    }
}

fn default_deadline(capability: &str) -> Option<DeadlineSpec> {
    match capability {
        "research" => Some(DeadlineSpec::DepthBased {
            quick: Duration::from_secs(15),
            standard: Duration::from_secs(30),
            deep: Duration::from_secs(45),
        }),
        "summarize" => Some(DeadlineSpec::Fixed(Duration::from_secs(15))),
        "data_extraction" => Some(DeadlineSpec::Fixed(Duration::from_secs(20))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn research_document() -> Value {
        json!({
            "properties": {
                "input_schema": {
                    "type": "object",
                    "required": ["query"],
                    "properties": {
                        "query": {"type": "string", "minLength": 3},
                        "depth": {"enum": ["quick", "standard", "deep"]}
                    }
                },
                "output_schema": {
                    "oneOf": [
                        {
                            "type": "object",
                            "required": ["status", "findings"],
                            "properties": {
                                "status": {"const": "success"},
                                "findings": {"type": "array"}
                            }
                        },
                        {
                            "type": "object",
                            "required": ["status", "error"],
                            "properties": {
                                "status": {"const": "error"},
                                "error": {
                                    "type": "object",
                                    "required": ["code", "message"],
                                    "properties": {
                                        "code": {"type": "string"},
                                        "message": {"type": "string"}
                                    }
                                }
                            }
                        }
                    ]
                }
            }
        })
    }

    fn load_registry(documents: &[(&str, Value)]) -> Result<SchemaRegistry> {
        let dir = tempfile::tempdir().expect("tempdir");
        for (name, document) in documents {
            std::fs::write(
                dir.path().join(format!("{name}.json")),
                serde_json::to_string_pretty(document).expect("encode"),
            )
            .expect("write schema");
        }
        SchemaRegistry::load(dir.path())
    }

    #[test]
    fn loads_and_strips_version_suffix() {
        let registry =
            load_registry(&[("research.v1", research_document())]).expect("load");
        assert!(registry.allows("research"));
        assert!(!registry.allows("research.v1"));
    }

    #[test]
    fn input_validation_hard_rejects() {
        let registry = load_registry(&[("research", research_document())]).expect("load");

        registry
            .validate_input("research", &json!({"query": "rust crates"}))
            .expect("valid input");

        let err = registry
            .validate_input("research", &json!({"query": "ab"}))
            .unwrap_err();
        assert!(matches!(err, Error::ValidationFailed { .. }));

        let err = registry
            .validate_input("translate", &json!({}))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownCapability { .. }));
    }

    #[test]
    fn output_validation_is_soft() {
        let registry = load_registry(&[("research", research_document())]).expect("load");

        let ok = registry.validate_output(
            "research",
            &json!({"status": "success", "findings": []}),
        );
        assert!(ok.is_none());

        let diag = registry.validate_output("research", &json!({"status": "done"}));
        assert!(diag.is_some());
    }

    #[test]
    fn research_deadline_is_depth_sensitive() {
        let registry = load_registry(&[("research", research_document())]).expect("load");

        let quick = registry
            .deadline("research", &json!({"query": "abc", "depth": "quick"}))
            .expect("deadline");
        assert_eq!(quick, Duration::from_secs(15));

        let standard = registry
            .deadline("research", &json!({"query": "abc"}))
            .expect("deadline");
        assert_eq!(standard, Duration::from_secs(30));

        let deep = registry
            .deadline("research", &json!({"query": "abc", "depth": "deep"}))
            .expect("deadline");
        assert_eq!(deep, Duration::from_secs(45));
    }

    #[test]
    fn unknown_capability_deadline_fails() {
        let registry = load_registry(&[("research", research_document())]).expect("load");
        let err = registry.deadline("translate", &json!({})).unwrap_err();
        assert!(matches!(err, Error::UnknownCapability { .. }));
    }

    #[test]
    fn file_overrides_price_and_deadline() {
        let mut document = research_document();
        document["price"] = json!(12);
        document["deadline_seconds"] = json!(60);
        let registry = load_registry(&[("research", document)]).expect("load");

        assert_eq!(registry.price("research").expect("price"), 12);
        let deadline = registry
            .deadline("research", &json!({"depth": "deep"}))
            .expect("deadline");
        assert_eq!(deadline, Duration::from_secs(60));
    }

    #[test]
    fn output_union_without_status_is_rejected() {
        let mut document = research_document();
        document["properties"]["output_schema"] = json!({
            "oneOf": [{"type": "object", "properties": {"ok": {"type": "boolean"}}}]
        });
        let err = load_registry(&[("research", document)]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn error_variant_must_carry_code_and_message() {
        let mut document = research_document();
        document["properties"]["output_schema"]["oneOf"][1] = json!({
            "type": "object",
            "properties": {
                "status": {"const": "error"},
                "error": {"type": "object", "properties": {"code": {"type": "string"}}}
            }
        });
        let err = load_registry(&[("research", document)]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn unknown_capability_requires_explicit_tables() {
        let err = load_registry(&[("translate", research_document())]).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));

        let mut document = research_document();
        document["price"] = json!(4);
        document["deadline_seconds"] = json!(25);
        let registry = load_registry(&[("translate", document)]).expect("load");
        assert_eq!(registry.price("translate").expect("price"), 4);
    }

    #[test]
    fn capability_listing_renders_deadlines() {
        let registry = load_registry(&[("research", research_document())]).expect("load");
        let listing = registry.capabilities();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "research");
        assert_eq!(listing[0].price, 8);
        assert_eq!(listing[0].deadline, "15s-45s (depth-dependent)");
    }
}
