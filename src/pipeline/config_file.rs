//! Rendering of the `config.json` handed to each stage.

use serde_json::{Map, Value};

use crate::component::JobConfiguration;
use crate::image::ResolvedImage;

/// Top-level keys a rendered config file may carry.
pub const CONFIG_KEYS: [&str; 5] = [
    "parameters",
    "image_parameters",
    "authorization",
    "action",
    "storage",
];

/// Builds the config document for one stage.
///
/// Processors only see their own parameters. Storage mapping and
/// authorization belong to the main stage. Component state is never part of
/// the document; the main stage reads it from `in/state.json`.
pub fn render_config(job: &JobConfiguration, stage: &ResolvedImage, action: &str) -> Value {
    let mut document = Map::new();
    document.insert(
        "parameters".to_string(),
        Value::Object(stage.parameters.clone()),
    );
    document.insert(
        "image_parameters".to_string(),
        Value::Object(stage.descriptor.image_parameters.clone()),
    );

    if stage.is_main() {
        document.insert(
            "authorization".to_string(),
            Value::Object(job.authorization.clone()),
        );
        document.insert("action".to_string(), Value::String(action.to_string()));
        if !job.storage.is_empty() {
            document.insert("storage".to_string(), Value::Object(job.storage.clone()));
        }
    } else {
        document.insert("authorization".to_string(), Value::Object(Map::new()));
        document.insert("action".to_string(), Value::String("run".to_string()));
    }

    Value::Object(document)
}
