//! Built-in pipelines registered by the daemon and by process workers.

use serde_json::json;

use kiln_core::pipeline::{Pipeline, PipelineError, PipelineRegistry, Record};
use kiln_core::KilnError;

/// Register every built-in pipeline.
pub fn register_builtin(registry: &PipelineRegistry) -> Result<(), KilnError> {
    registry.register_fn("text_inference", || {
        Pipeline::new(vec![
            Pipeline::map_stage(preprocess),
            Pipeline::map_stage(model_call),
            Pipeline::map_stage(postprocess),
        ])
    })
}

fn preprocess(record: Record) -> Result<Record, PipelineError> {
    let prompt = record
        .get("prompt")
        .and_then(|v| v.as_str())
        .ok_or_else(|| PipelineError::fatal("payload is missing a string 'prompt'"))?;
    Ok(json!(prompt.trim()))
}

fn model_call(record: Record) -> Result<Record, PipelineError> {
    let text = record
        .as_str()
        .ok_or_else(|| PipelineError::stage("expected preprocessed text"))?;
    Ok(json!(format!("MODEL_OUTPUT({text})")))
}

fn postprocess(record: Record) -> Result<Record, PipelineError> {
    Ok(json!({ "result": record }))
}
