//! Example: running the bundled four-layer network against MockBackend.
//!
//! Run with: `RUST_LOG=llm_propagation=debug cargo run --example mock_network`
//!
//! Pass `--live` to call Groq instead (requires `GROQ_API_KEY`).

use anyhow::Context;
use llm_propagation::{ExecCtx, MockBackend, Pipeline};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let root = env!("CARGO_MANIFEST_DIR");
    let pipeline = Pipeline::from_paths(
        format!("{}/config/layers.json", root),
        format!("{}/config/templates.json", root),
    )
    .context("loading bundled network")?;

    let live = std::env::args().any(|a| a == "--live");
    let ctx = if live {
        ExecCtx::groq().build()?
    } else {
        // Echo the node and the first line of its prompt so routing is visible.
        let mock = MockBackend::responder(|req| {
            let first_line = req.prompt.lines().next().unwrap_or_default();
            Ok(format!("<{}: {}>", req.node_id, first_line))
        });
        ExecCtx::builder("http://unused").backend(Arc::new(mock)).build()?
    };

    let query = "What is knowledge?";
    let context = pipeline
        .process_with_progress(&ctx, query, |progress, _| {
            println!(
                "[{}/{}] {} -> {}",
                progress.layer_index + 1,
                progress.total_layers,
                progress.layer_id,
                progress.outputs.join(", ")
            );
        })
        .await?;

    println!();
    for (key, value) in context.iter() {
        println!("{:>26}: {}", key, value);
    }

    Ok(())
}
