use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    pub storage_path: String,
    pub namespace: String,
    pub user_handle: String,
    pub allow_ephemeral: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            storage_path: ".vesper".to_string(),
            namespace: "default".to_string(),
            user_handle: "@local".to_string(),
            allow_ephemeral: true,
        }
    }
}
