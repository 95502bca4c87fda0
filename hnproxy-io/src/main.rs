use hnproxy::builder::Builder;
use hnproxy::server::Server;

#[tokio::main]
async fn main() {
    // Build a platform and enable all features...
    let platform = Builder::new().enable_all().build().await;

    // Setup the cache and start warming it up...
    let _ = hnproxy::query::install(&platform);

    platform.require::<Server>().event_loop().await;
}
