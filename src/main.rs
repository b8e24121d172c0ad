#[tokio::main]
async fn main() {
    if let Err(e) = mailmirror::run().await {
        log::error!("{}", e);
        eprintln!("FATAL: {}", e);
        std::process::exit(1);
    }
}
