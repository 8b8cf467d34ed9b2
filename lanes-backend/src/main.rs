#[tokio::main]
async fn main() {
    if let Err(e) = lanes_backend::run().await {
        log::error!(target: "lanes.backend", "Backend failed: {}", e);
        std::process::exit(1);
    }
}
