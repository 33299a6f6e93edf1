//! The unit of work passed through the copy queues

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// A folder to expand or a file to transfer
///
/// Encoded as a JSON object with PascalCase field names. `id` is assigned by the queue when the
/// item is dequeued and `succeeded` is set by the consumer; both travel in the message body but
/// are meaningless to the producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WorkItem {
    pub source_path: String,
    pub target_path: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub succeeded: bool,
    #[serde(default)]
    pub empty: bool,
}

impl WorkItem {
    pub fn new(source_path: &str, target_path: &str) -> Self {
        Self {
            source_path: source_path.to_string(),
            target_path: target_path.to_string(),
            ..Default::default()
        }
    }

    /// Sentinel for "no work available"
    pub fn empty() -> Self {
        Self {
            empty: true,
            ..Default::default()
        }
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        serde_json::to_string(self)
            .with_context(|| format!("failed encoding work item for {:?}", self.source_path))
    }

    pub fn decode(body: &str) -> anyhow::Result<Self> {
        serde_json::from_str(body).with_context(|| format!("failed decoding work item {body:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn wire_format_uses_pascal_case() -> anyhow::Result<()> {
        let item = WorkItem::new("/data/a", "a");
        let value: serde_json::Value = serde_json::from_str(&item.encode()?)?;
        assert_eq!(value["SourcePath"], "/data/a");
        assert_eq!(value["TargetPath"], "a");
        assert_eq!(value["Succeeded"], false);
        assert_eq!(value["Empty"], false);
        Ok(())
    }

    #[test]
    fn decode_tolerates_missing_optional_fields() -> anyhow::Result<()> {
        let item = WorkItem::decode(r#"{"SourcePath":"C:\\data","TargetPath":"data"}"#)?;
        assert_eq!(item.source_path, "C:\\data");
        assert!(!item.empty);
        assert!(item.id.is_empty());
        assert!(WorkItem::decode("not json").is_err());
        Ok(())
    }

    #[test]
    fn empty_sentinel_has_no_source() {
        let item = WorkItem::empty();
        assert!(item.empty);
        assert!(item.source_path.is_empty());
    }

    proptest! {
        #[test]
        fn encoding_preserves_fields(
            source in "\\PC*",
            target in "[a-zA-Z0-9/\\\\ ._ąęłżźöü-]*",
            succeeded: bool,
            empty: bool,
        ) {
            let item = WorkItem {
                source_path: source,
                target_path: target,
                id: String::new(),
                succeeded,
                empty,
            };
            let decoded = WorkItem::decode(&item.encode().unwrap()).unwrap();
            prop_assert_eq!(decoded, item);
        }
    }
}
