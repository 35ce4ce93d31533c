use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    pub max_payload_bytes: usize,
    pub max_tags: usize,
    pub max_tag_len: usize,
    pub retry_budget: u32,
    pub outbox_batch_size: usize,
    pub key_ttl_secs: u64,
    pub directory_ttl_secs: u64,
    pub vault_compaction_threshold: usize,
    pub inbound_batch_size: u32,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            max_tags: 16,
            max_tag_len: 64,
            retry_budget: 3,
            outbox_batch_size: 32,
            key_ttl_secs: 300,
            directory_ttl_secs: 600,
            vault_compaction_threshold: 8,
            inbound_batch_size: 64,
        }
    }
}
