//! Where render queues go.

use tracing::info;

use crate::script::persistence;
use crate::script::ScriptValue;

/// Receives render queues submitted by game scripts.
///
/// A render queue is a sequence of node tables, each with a `type` field.
/// Interpreting it is up to the embedding GUI.
pub trait RenderSink {
    fn render(&self, instance_id: &str, queue: ScriptValue);
}

/// Sink for headless runs that only logs each queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRenderSink;

impl RenderSink for LogRenderSink {
    fn render(&self, instance_id: &str, queue: ScriptValue) {
        let nodes = queue.as_table().map_or(0, |t| t.sequence().len());
        info!(
            instance = instance_id,
            nodes,
            queue = %persistence::describe(&queue),
            "render queue submitted"
        );
    }
}
