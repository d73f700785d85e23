#[tokio::main]
async fn main() -> anyhow::Result<()> {
    coderelay::run().await
}
