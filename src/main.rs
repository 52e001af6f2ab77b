use cgi_gateway::{config::RouteConfig, Config};
use clap::{clap_app, crate_description, crate_version};
use std::process;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = clap_app!(cgi_gateway =>
        (version: crate_version!())
        (about: crate_description!())
        (@arg port: -p --port +takes_value "Port to run (defaults to 8080)")
        (@arg config: -c --config +takes_value "YAML configuration file")
        (@arg root: -r --root +takes_value "Script directory served at / when no config is given (defaults to ./cgi-bin)")
    )
    .get_matches();

    let mut config = match args.value_of("config") {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error loading configuration from {}: {}", path, e);
                process::exit(1);
            }
        },
        None => {
            let mut config = Config::default();
            if let Some(root) = args.value_of("root") {
                config.routes = vec![RouteConfig::new("/", root)];
            }
            config
        }
    };

    if let Some(port) = args.value_of("port") {
        match port.parse::<u16>() {
            Ok(port) => config.listen.set_port(port),
            Err(_) => {
                eprintln!("Invalid port: {}", port);
                process::exit(1);
            }
        }
    }

    if let Err(e) = cgi_gateway::server::run(config).await {
        eprintln!("Server error: {}", e);
        process::exit(1);
    }
}
