use serde::{Deserialize, Serialize};

/// The three NoCloud datasource documents carried per VM.
///
/// All fields are raw document strings; the engine never parses their
/// YAML, it only moves them into the seed image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudInitDocs {
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub meta_data: String,
    #[serde(default)]
    pub network_config: String,
}

impl CloudInitDocs {
    pub fn is_empty(&self) -> bool {
        self.user_data.is_empty() && self.meta_data.is_empty() && self.network_config.is_empty()
    }

    /// Merge an override on top of a base, field by field. A non-empty
    /// override field wins; empty fields fall through to the base.
    pub fn merged(base: &CloudInitDocs, over: &CloudInitDocs) -> CloudInitDocs {
        fn pick(over: &str, base: &str) -> String {
            if over.is_empty() { base } else { over }.to_string()
        }
        CloudInitDocs {
            user_data: pick(&over.user_data, &base.user_data),
            meta_data: pick(&over.meta_data, &base.meta_data),
            network_config: pick(&over.network_config, &base.network_config),
        }
    }
}

/// Synthesize a minimal meta-data document when the operator supplied
/// none: a stable instance-id plus the VM's hostname.
pub fn synthesize_meta_data(instance_id: &str, hostname: &str) -> String {
    format!(
        "instance-id: {}\nlocal-hostname: {}\n",
        instance_id, hostname
    )
}
