use actix_web::{middleware::Logger, web, App, HttpServer};
use everyfirst::config::Config;
use everyfirst::handlers::{self, AppState};
use log::{error, info};

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load configuration first
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.logging.level),
    )
    .init();

    info!("Starting EveryFirst v{}", env!("CARGO_PKG_VERSION"));
    info!("Server will listen on http://{}", config.bind_address());
    info!("Image byte budget: {} bytes", config.compression.max_image_bytes);
    info!("JPEG encoder: {}", config.compression.encoder);
    match &config.chain.contract_address {
        Some(address) => info!("Minting on contract {}", address),
        None => info!("No contract configured, minting is simulated"),
    }

    let bind_address = config.bind_address();
    let max_payload_size = config.max_upload_bytes();
    let worker_threads = config.server.worker_threads;
    let enable_cors = config.server.enable_cors;
    let request_logging = config.logging.enable_request_logging;
    let static_dir = config.server.static_dir.clone();

    let state = match AppState::from_config(config) {
        Ok(state) => web::Data::new(state),
        Err(e) => {
            error!("Failed to initialise application state: {}", e);
            return Err(std::io::Error::other(e.to_string()));
        }
    };

    let mut server = HttpServer::new(move || {
        let cors = actix_web::middleware::DefaultHeaders::new();
        let cors = if enable_cors {
            cors.add(("Access-Control-Allow-Origin", "*"))
                .add(("Access-Control-Allow-Methods", "GET, POST, OPTIONS"))
                .add(("Access-Control-Allow-Headers", "Content-Type, Authorization"))
        } else {
            cors
        };

        let mut app = App::new()
            .app_data(web::PayloadConfig::new(max_payload_size))
            .app_data(web::JsonConfig::default().limit(max_payload_size))
            .app_data(state.clone())
            .wrap(actix_web::middleware::Condition::new(request_logging, Logger::default()))
            .wrap(cors)
            .configure(handlers::configure);

        // registered last so it never shadows the API routes
        if let Some(dir) = &static_dir {
            app = app.service(actix_files::Files::new("/", dir).index_file("index.html"));
        }

        app
    });

    if let Some(workers) = worker_threads {
        server = server.workers(workers);
    }

    server.bind(&bind_address)?.run().await
}
