//! Multi-document manifest parsing.

use serde::Deserialize;
use serde_json::{Map, Value};
use serde_yaml::Value as YamlValue;
use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::resources::{ResourceDeclaration, ResourceKind, DEFAULT_NAMESPACE};

// Top-level fields that describe the object rather than its payload
const ENVELOPE_FIELDS: [&str; 4] = ["apiVersion", "kind", "metadata", "status"];

/// Parse `---` separated documents into declarations, in document order.
///
/// Empty and non-mapping documents are skipped. If the stream as a whole does
/// not parse, the input is retried as a single document before giving up with
/// [`EngineError::MalformedManifest`].
pub fn parse_manifest(text: &str) -> EngineResult<Vec<ResourceDeclaration>> {
    let documents = match split_documents(text) {
        Ok(documents) => documents,
        Err(stream_err) => {
            debug!("multi-document parse failed ({}), retrying as one document", stream_err);
            let single: YamlValue = serde_yaml::from_str(text)
                .map_err(|e| EngineError::MalformedManifest(e.to_string()))?;
            vec![single]
        }
    };

    let mut declarations = Vec::new();
    for (index, document) in documents.into_iter().enumerate() {
        let document = to_json(document)?;
        collect_declarations(index, document, &mut declarations)?;
    }
    Ok(declarations)
}

fn split_documents(text: &str) -> Result<Vec<YamlValue>, serde_yaml::Error> {
    serde_yaml::Deserializer::from_str(text)
        .map(YamlValue::deserialize)
        .collect()
}

fn to_json(document: YamlValue) -> EngineResult<Value> {
    serde_json::to_value(document).map_err(|e| EngineError::MalformedManifest(e.to_string()))
}

fn collect_declarations(
    index: usize,
    document: Value,
    out: &mut Vec<ResourceDeclaration>,
) -> EngineResult<()> {
    let Value::Object(mut object) = document else {
        return Ok(());
    };
    if object.is_empty() {
        return Ok(());
    }

    if object.get("kind").and_then(Value::as_str) == Some("List") {
        if let Some(Value::Array(items)) = object.remove("items") {
            for item in items {
                collect_declarations(index, item, out)?;
            }
        }
        return Ok(());
    }

    out.push(declaration_from(index, object)?);
    Ok(())
}

fn declaration_from(index: usize, mut object: Map<String, Value>) -> EngineResult<ResourceDeclaration> {
    let kind = object
        .get("kind")
        .and_then(Value::as_str)
        .map(ResourceKind::parse)
        .ok_or_else(|| EngineError::MalformedManifest(format!("document {index}: missing kind")))?;

    let metadata = object.get("metadata").cloned().unwrap_or(Value::Null);
    let name = metadata
        .get("name")
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            EngineError::MalformedManifest(format!("document {index}: {kind} is missing metadata.name"))
        })?
        .to_string();
    let namespace = metadata
        .get("namespace")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_NAMESPACE)
        .to_string();
    let labels: BTreeMap<String, String> = metadata
        .get("labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .map(|(k, v)| (k.clone(), v.as_str().map_or_else(|| v.to_string(), str::to_string)))
                .collect()
        })
        .unwrap_or_default();

    let spec = match object.remove("spec") {
        Some(spec) => spec,
        None => {
            for field in ENVELOPE_FIELDS {
                object.remove(field);
            }
            if object.is_empty() {
                Value::Null
            } else {
                Value::Object(object)
            }
        }
    };

    Ok(ResourceDeclaration {
        kind,
        name,
        namespace,
        labels,
        spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_document() {
        let manifest = "kind: Namespace\nmetadata:\n  name: prod\n";
        let decls = parse_manifest(manifest).unwrap();
        assert_eq!(decls.len(), 1);
        assert_eq!(decls[0].kind, ResourceKind::Namespace);
        assert_eq!(decls[0].namespace, DEFAULT_NAMESPACE);
        assert!(decls[0].spec.is_null());
    }

    #[test]
    fn test_configmap_keeps_data_payload() {
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\ndata:\n  LOG_LEVEL: debug\n";
        let decls = parse_manifest(manifest).unwrap();
        assert_eq!(decls[0].spec["data"]["LOG_LEVEL"], "debug");
        assert!(decls[0].spec.get("apiVersion").is_none());
    }

    #[test]
    fn test_list_is_flattened() {
        let manifest = r"
kind: List
items:
  - kind: Secret
    metadata: { name: a }
  - kind: Secret
    metadata: { name: b }
";
        let names: Vec<_> = parse_manifest(manifest)
            .unwrap()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_missing_kind_is_malformed() {
        let err = parse_manifest("metadata:\n  name: x\n").unwrap_err();
        assert!(matches!(err, EngineError::MalformedManifest(msg) if msg.contains("missing kind")));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = parse_manifest("kind: [unterminated\n").unwrap_err();
        assert!(matches!(err, EngineError::MalformedManifest(_)));
    }
}
