use anyhow::Result;
use salvo::prelude::*;
use tracing::info;

use crate::config::WebConfig;

pub mod handlers;

use self::handlers::health::alive;

pub fn create_router() -> Router {
    Router::new().get(alive)
}

#[derive(Clone)]
pub struct WebServer {
    bind_address: String,
    port: u16,
}

impl WebServer {
    pub fn new(config: &WebConfig) -> Self {
        Self {
            bind_address: config.bind_address.clone(),
            port: config.port,
        }
    }

    pub async fn start(&self) -> Result<()> {
        let bind_addr = format!("{}:{}", self.bind_address, self.port);
        info!("starting health endpoint on {}", bind_addr);

        let acceptor = TcpListener::new(bind_addr).bind().await;
        Server::new(acceptor).serve(create_router()).await;

        Ok(())
    }
}
