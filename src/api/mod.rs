//! API client module for the hosted backend

pub mod client;
#[cfg(test)]
pub mod fake;
mod gateway;
mod rest;
pub mod rows;
mod storage;

pub use client::BaasClient;
pub use gateway::{GatewayError, InsertFilter, MessagePage, RemoteDataGateway, Subscription};
pub use rest::RestGateway;
pub use storage::{content_type_for, upload_file};

use std::sync::Arc;

use crate::config::Config;

/// Build the REST-backed gateway from the stored session.
pub async fn connect() -> anyhow::Result<Arc<dyn RemoteDataGateway>> {
    let config = Config::load()?;
    let client = BaasClient::new().await?;
    Ok(Arc::new(RestGateway::new(client, &config.chat.media_bucket)))
}
