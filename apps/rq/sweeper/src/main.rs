//! Reliable Queue Sweeper - Entry Point

#[tokio::main]
async fn main() -> eyre::Result<()> {
    core_config::tracing::install_color_eyre();
    rq_sweeper::run().await
}
