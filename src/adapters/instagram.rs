use super::meta::{MetaAdapter, MetaFlavor};
use crate::core::bot::Platform;
use crate::core::error::AdapterError;

const FLAVOR: MetaFlavor = MetaFlavor {
    platform: Platform::Instagram,
    object: "instagram",
    path: "/instagram/events",
    default_port: 3004,
};

/// Instagram professional account DMs, delivered through the linked Page.
pub fn adapter(config: &serde_json::Value) -> Result<MetaAdapter, AdapterError> {
    MetaAdapter::from_config(config, FLAVOR)
}
