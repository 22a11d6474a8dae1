use std::sync::Arc;

use actix_request_identifier::{IdReuse, RequestIdentifier};
use actix_web::web::Data;

use tracing_actix_web::TracingLogger;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use crate::config::AppConfig;
use crate::database::connect::{create_db_connection_pool, run_migrations};
use crate::mailer::{LogMailer, Mailer};
use crate::provider::GatewayClient;
use crate::routes::{payment_init_handler, points_handler, webhook_handler};

mod config;
mod database;
mod errors;
mod mailer;
mod provider;
mod responses;
mod routes;
mod schema;
mod sweeper;

#[actix_web::main]
async fn main() {
    dotenvy::dotenv().ok();

    // setup tracing and use bunyan formatter
    let formatting_layer = BunyanFormattingLayer::new("seatpay".into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(filter_fn(|metadata| *metadata.level() <= tracing::Level::INFO))
        .with(JsonStorageLayer)
        .with(formatting_layer);
    tracing::subscriber::set_global_default(subscriber).unwrap();

    let config = AppConfig::from_env().expect("invalid configuration");

    let db = create_db_connection_pool();
    run_migrations(&db);

    let gateway = GatewayClient::new(&config).expect("failed to build gateway client");
    let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);

    sweeper::spawn(db.clone(), config.clone());

    let bind_address = config.bind_address.clone();
    let server = actix_web::HttpServer::new(move || {
        actix_web::App::new()
            .wrap(RequestIdentifier::with_uuid().use_incoming_id(IdReuse::UseIncoming))
            .wrap(TracingLogger::default())
            .app_data(Data::new(db.clone()))
            .app_data(Data::new(config.clone()))
            .app_data(Data::new(gateway.clone()))
            .app_data(Data::new(mailer.clone()))
            .service(webhook_handler)
            .service(payment_init_handler)
            .service(points_handler)
    });

    server.bind(bind_address).unwrap().run().await.unwrap();
}
