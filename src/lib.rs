//! # hearth
//!
//! The request-serving core of an HTTP/1.1 application server.
//!
//! A [`WorkerPool`] of tokio tasks pulls accepted connections off a shared
//! queue. Each worker parses requests off the wire, hands them to an
//! [`Application`], and writes back a framed response, keeping the connection
//! open when both sides agree to it. Connections that go quiet between
//! requests are parked and watched instead of holding a worker.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hearth::{Application, ServerConfig, Server, WorkerPool};
//! use hearth::app::Sections;
//! use hearth::error::AppError;
//! use hearth::http::{Request, ResponseFramer, StatusCode};
//!
//! struct Hello;
//!
//! impl Application for Hello {
//!     type Body = Sections;
//!
//!     async fn call(
//!         &self,
//!         _request: &mut Request<'_>,
//!         response: &mut ResponseFramer<'_>,
//!     ) -> Result<Sections, AppError> {
//!         response.start_response(StatusCode::OK, [("Content-Type", "text/plain")])?;
//!         Ok(Sections::from("Hello, World!"))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = WorkerPool::start(Hello, ServerConfig::default())?;
//!     let server = Server::bind("127.0.0.1:8080").await?;
//!     println!("Listening on http://127.0.0.1:8080");
//!     server.run_until(&pool, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod server;

pub use app::{Application, ResponseBody};
pub use config::ServerConfig;
pub use error::{AppError, Error};
pub use http::{Headers, Method, Request, ResponseFramer, StatusCode};
pub use server::{Server, ServerError, WorkerPool};
