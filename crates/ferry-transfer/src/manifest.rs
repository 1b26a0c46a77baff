use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Key under which chunk `index` of a transfer is stored.
pub fn chunk_key(transfer_id: &str, index: u64) -> String {
    format!("files/{}/chunk_{}", transfer_id, index)
}

/// Key under which a transfer's manifest is stored.
pub fn manifest_key(transfer_id: &str) -> String {
    format!("files/{}/manifest.json", transfer_id)
}

/// Shape of a completed transfer. Its presence in the store is what makes a
/// transfer downloadable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "file_id")]
    pub transfer_id: String,
    pub file_name: String,
    pub total_chunks: u64,
}

impl Manifest {
    pub fn new(transfer_id: impl Into<String>, file_name: impl Into<String>, total_chunks: u64) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            file_name: file_name.into(),
            total_chunks,
        }
    }

    pub fn key(&self) -> String {
        manifest_key(&self.transfer_id)
    }

    pub fn chunk_key(&self, index: u64) -> String {
        chunk_key(&self.transfer_id, index)
    }

    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed_by_transfer() {
        assert_eq!(chunk_key("abc", 3), "files/abc/chunk_3");
        assert_eq!(manifest_key("abc"), "files/abc/manifest.json");
    }

    #[test]
    fn wire_format_uses_snake_case_fields() {
        let manifest = Manifest::new("abc", "report.pdf", 3);
        let json: serde_json::Value = serde_json::from_slice(&manifest.to_bytes().unwrap()).unwrap();
        assert_eq!(json["file_id"], "abc");
        assert_eq!(json["file_name"], "report.pdf");
        assert_eq!(json["total_chunks"], 3);
    }

    #[test]
    fn parses_manifest_written_by_other_producers() {
        let raw = br#"{"file_id":"x-1","file_name":"a b.txt","total_chunks":0}"#;
        let manifest = Manifest::from_slice(raw).unwrap();
        assert_eq!(manifest, Manifest::new("x-1", "a b.txt", 0));
    }

    #[test]
    fn rejects_malformed_manifest() {
        assert!(Manifest::from_slice(b"not json").is_err());
        assert!(Manifest::from_slice(br#"{"file_id":"x","total_chunks":-1}"#).is_err());
    }
}
