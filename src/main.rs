use std::sync::Arc;

use murex::config::Config;
use murex::server::Server;
use tracing::error;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_args(&args);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.loglevel.clone())),
        )
        .init();

    if config.tls && (config.cert.is_empty() || config.key.is_empty()) {
        error!("TLS mode requires both --cert and --key");
        std::process::exit(1);
    }

    let server = match Server::new(Arc::new(config)) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "initialization failed");
            std::process::exit(1);
        }
    };

    server.run().await
}
