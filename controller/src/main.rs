mod api;
mod drivers;
mod host;
mod service;
mod sources;
mod store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    host::run().await
}
