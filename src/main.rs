use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

use relaymail::runtime::Runtime;
use relaymail::utils::config::{Config, ConfigLoader};

#[tokio::main]
async fn main() -> Result<()> {
    let mut config_path = String::from("/etc/relaymail/config.ini");
    let mut directory_mode = false;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = args.next().unwrap_or(config_path);
            }
            "--directory" | "-d" => {
                directory_mode = true;
            }
            "--hash-password" => {
                match args.next() {
                    Some(password) => {
                        println!("{}", relaymail::utils::hash_password(&password));
                        return Ok(());
                    }
                    None => {
                        eprintln!("--hash-password requires a password argument");
                        std::process::exit(1);
                    }
                }
            }
            _ => {}
        }
    }

    // Honor the CLI path, else fall back to the dev config
    let resolved_path = if std::path::Path::new(&config_path).exists() {
        config_path
    } else {
        let dev_path = "config/relaymail.conf";
        if std::path::Path::new(dev_path).exists() {
            dev_path.to_string()
        } else {
            config_path
        }
    };

    let loader = match ConfigLoader::new(resolved_path).load().await {
        Ok(loader) => loader,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    let config = Arc::new(loader.get_config().clone());

    init_tracing(&config);

    if directory_mode {
        return run_directory(&config).await;
    }

    let runtime = Arc::new(Runtime::new(config));
    let mut tasks: Vec<tokio::task::JoinHandle<()>> = Vec::new();

    info!("RelayMail starting for domain {}", runtime.domain());
    Arc::clone(&runtime).run(&mut tasks).await?;

    // wait forever (or until one fails)
    for task in tasks {
        task.await?;
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let level = match config
        .get_value("logging", "level")
        .unwrap_or("info")
        .to_lowercase()
        .as_str()
    {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        _ => LevelFilter::INFO,
    };
    if config.get_bool("logging", "json", false) {
        tracing_subscriber::fmt().with_max_level(level).json().init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }
}

async fn run_directory(config: &Config) -> Result<()> {
    let bind = config.get_value("directory", "bind").unwrap_or("0.0.0.0");
    let port = config.get_int("directory", "port", 8080);
    let table = PathBuf::from(
        config
            .get_value("directory", "table")
            .unwrap_or("directory.json"),
    );

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", bind, port)).await?;
    if let Err(e) = relaymail::directory::serve_directory(listener, table).await {
        error!("Directory service stopped: {}", e);
        std::process::exit(1);
    }
    Ok(())
}
