use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // Main entrypoint simply delegates control to CLI layer.
    // The CLI parses user commands, sets up tracing and calls into the runtime.
    mqtt_logger::cli::cli::run().await
}
