//! Minimal hearth server.
//!
//! Run with:
//!
//! ```text
//! RUST_LOG=hearth=debug cargo run --example hello_world [config.json]
//! ```
//!
//! - `GET /` answers with a fixed greeting (sent with `Content-Length`).
//! - `GET /env` lists the request environment.
//! - `GET /stream` streams three sections from a background task (sent chunked).
//! - `POST /echo` answers with the request body.

use std::time::Duration;

use bytes::Bytes;
use hearth::app::{ResponseBody, Sections, Streamed};
use hearth::error::AppError;
use hearth::http::{Request, ResponseFramer, StatusCode};
use hearth::{Application, Server, ServerConfig, WorkerPool};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Demo;

/// Either kind of body, so one application can return both.
enum DemoBody {
    Fixed(Sections),
    Streamed(Streamed),
}

impl ResponseBody for DemoBody {
    fn section_count(&self) -> Option<usize> {
        match self {
            Self::Fixed(body) => body.section_count(),
            Self::Streamed(body) => body.section_count(),
        }
    }

    async fn next_section(&mut self) -> Option<Result<Bytes, AppError>> {
        match self {
            Self::Fixed(body) => body.next_section().await,
            Self::Streamed(body) => body.next_section().await,
        }
    }

    fn close(&mut self) {
        match self {
            Self::Fixed(body) => body.close(),
            Self::Streamed(body) => body.close(),
        }
    }
}

impl Application for Demo {
    type Body = DemoBody;

    async fn call(
        &self,
        request: &mut Request<'_>,
        response: &mut ResponseFramer<'_>,
    ) -> Result<DemoBody, AppError> {
        let text = [("Content-Type", "text/plain; charset=utf-8")];
        match request.path() {
            "/" => {
                response.start_response(StatusCode::OK, text)?;
                Ok(DemoBody::Fixed(Sections::from("Hello, World!\n")))
            }
            "/env" => {
                let listing: String = request
                    .environ()
                    .iter()
                    .map(|(key, value)| format!("{key}={value}\n"))
                    .collect();
                response.start_response(StatusCode::OK, text)?;
                Ok(DemoBody::Fixed(Sections::from(listing)))
            }
            "/stream" => {
                let (tx, body) = Streamed::channel(1);
                tokio::spawn(async move {
                    for n in 1..=3 {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        if tx.send(Ok(format!("section {n}\n").into())).await.is_err() {
                            break;
                        }
                    }
                });
                response.start_response(StatusCode::OK, text)?;
                Ok(DemoBody::Streamed(body))
            }
            "/echo" => {
                let body = request.body().read_to_end().await?;
                response.start_response(StatusCode::OK, [("Content-Type", "application/octet-stream")])?;
                Ok(DemoBody::Fixed(Sections::new([body])))
            }
            _ => {
                response.start_response(StatusCode::NOT_FOUND, text)?;
                Ok(DemoBody::Fixed(Sections::from("Not Found\n")))
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hearth=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => ServerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ServerConfig::default(),
    };

    let pool = WorkerPool::start(Demo, config)?;
    let server = Server::bind("127.0.0.1:8080").await?;
    tracing::info!(address = %server.local_addr(), "try: curl -v http://127.0.0.1:8080/");

    server
        .run_until(&pool, async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
            }
        })
        .await?;
    Ok(())
}
