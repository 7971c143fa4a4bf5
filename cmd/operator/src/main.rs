use std::path::PathBuf;

use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use helmop_k8s_util::client::new_client_with_metrics;
use helmop_operator::controller::{self, State};
use helmop_operator::telemetry;
use helmop_operator::watches;

use clap::{crate_authors, crate_description, crate_version, Parser};
use kube::Config;
use prometheus_client::registry::Registry;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    match c.metrics() {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(metrics),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name="helmop",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Path to the watches file binding GVKs to charts
    #[arg(short, long, default_value = "./watches.yaml", env = "WATCHES_FILE")]
    watches_file: PathBuf,

    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u32,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,helmop=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// If not provided, tracing is disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing, between 0.0 and 1.0.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let watches = match watches::load_watches(&args.watches_file) {
        Ok(watches) => watches,
        Err(e) => {
            tracing::error!("invalid watches file {}: {e}", args.watches_file.display());
            std::process::exit(1);
        }
    };
    let namespaces = watches::watch_namespaces_from_env();

    let mut registry = Registry::with_prefix("helmop");
    let config = Config::infer().await?;
    let client = new_client_with_metrics(config.clone(), &mut registry).await?;
    let state = State::new(registry);

    let controllers = controller::run(state.clone(), client, config, watches, namespaces);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health)
            .service(metrics)
    })
    .bind(format!("0.0.0.0:{}", args.port))?
    .shutdown_timeout(5);

    // Both runtimes implement graceful shutdown, so poll until both are done
    tokio::join!(controllers, server.run()).1?;
    Ok(())
}
