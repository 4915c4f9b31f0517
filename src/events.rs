//! Event system for run lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe a run. The engine
//! emits events when a run, layer or node starts and finishes, and before
//! each transport retry. Implement [`EventHandler`] to receive them for
//! progress tracking or UIs. Structured logs go through `tracing` regardless.

use std::sync::Arc;

/// Events emitted during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A run has started.
    RunStart {
        /// Number of layers that will execute.
        layers: usize,
    },
    /// A layer has started executing.
    LayerStart {
        /// Position of the layer in execution order.
        index: usize,
        id: String,
    },
    /// A node has started its LLM call.
    NodeStart { node_id: String, layer_index: usize },
    /// A node has finished.
    NodeEnd { node_id: String, ok: bool },
    /// A layer has finished. `ok == false` means nothing from it was merged.
    LayerEnd { index: usize, id: String, ok: bool },
    /// A transport-level retry due to HTTP error.
    TransportRetry {
        node_id: String,
        /// The retry attempt number (1-indexed).
        attempt: u32,
        /// Delay before this retry attempt in milliseconds.
        delay_ms: u64,
        reason: String,
    },
    /// A run has finished.
    RunEnd { ok: bool },
}

/// Handler for run lifecycle events.
///
/// This is entirely optional -- runs work without an event handler.
///
/// # Example
///
/// ```
/// use llm_propagation::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         match event {
///             Event::LayerStart { index, id } => println!("[layer {}] {}", index, id),
///             Event::NodeEnd { node_id, ok } => println!("[node] {} ok={}", node_id, ok),
///             _ => {}
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use llm_propagation::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::RunEnd { ok } = event {
///         println!("run finished ok={}", ok);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_emit_without_handler_is_noop() {
        emit(&None, Event::RunStart { layers: 1 });
    }

    #[test]
    fn test_fn_handler_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn EventHandler> =
            Arc::new(FnEventHandler(move |e: Event| sink.lock().unwrap().push(e)));

        emit(&Some(handler.clone()), Event::RunStart { layers: 2 });
        emit(&Some(handler), Event::RunEnd { ok: true });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0], Event::RunStart { layers: 2 });
        assert_eq!(seen[1], Event::RunEnd { ok: true });
    }
}
