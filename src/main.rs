#[tokio::main]
async fn main() -> anyhow::Result<()> {
    the_small_pos_dashboard_lib::run().await
}
