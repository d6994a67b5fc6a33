use oxidis::config::Config;
use oxidis::server::Server;
use tracing::error;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = Config::from_args(&args);

    let mut server = match Server::bind(config) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start: {e}");
            std::process::exit(1);
        }
    };
    server.run();
}
