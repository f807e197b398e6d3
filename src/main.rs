#[tokio::main]
async fn main() -> anyhow::Result<()> {
    matrix_sync_lib::run().await
}
