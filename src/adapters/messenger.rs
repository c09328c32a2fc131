use super::meta::{MetaAdapter, MetaFlavor};
use crate::core::bot::Platform;
use crate::core::error::AdapterError;

const FLAVOR: MetaFlavor = MetaFlavor {
    platform: Platform::Messenger,
    object: "page",
    path: "/messenger/events",
    default_port: 3003,
};

/// Facebook Page inbox bot.
pub fn adapter(config: &serde_json::Value) -> Result<MetaAdapter, AdapterError> {
    MetaAdapter::from_config(config, FLAVOR)
}
