use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("demo-localfs") => {
            let dir = match args.next() {
                Some(p) => p,
                None => {
                    eprintln!("Usage: walarchive demo-localfs <dir>");
                    std::process::exit(2);
                }
            };
            match walarchive::archiver::demo::e2e_localfs_demo(dir).await {
                Ok(lines) => {
                    for line in lines {
                        println!("{line}");
                    }
                    println!("demo-localfs: OK");
                }
                Err(e) => {
                    eprintln!("demo-localfs failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        _ => {
            println!("walarchive: WAL segment archiving\nUsage:\n  walarchive demo-localfs <dir>");
        }
    }
}
