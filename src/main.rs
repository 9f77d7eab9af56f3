#[tokio::main]
async fn main() {
    let res = pst::app::run().await;
    if let Err(err) = res {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
