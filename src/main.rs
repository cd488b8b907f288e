use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    isolab::cli::run().await
}
