//! `RemoteDataGateway` backed by the hosted REST, storage and realtime endpoints.

use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use super::client::BaasClient;
use super::gateway::{GatewayError, InsertFilter, MessagePage, RemoteDataGateway, Subscription};
use super::rows::{decode_messages, SummaryRow, MESSAGE_SELECT};
use super::storage;
use crate::models::{ConversationSummary, Message, MessageEvent, NewMessage};
use crate::realtime::{self, RealtimeTarget};

const MESSAGES: &str = "messages";
const SUMMARIES_RPC: &str = "get_conversation_summaries";

pub struct RestGateway {
    client: BaasClient,
    media_bucket: String,
}

impl RestGateway {
    pub fn new(client: BaasClient, media_bucket: &str) -> Self {
        Self {
            client,
            media_bucket: media_bucket.to_string(),
        }
    }

    pub fn client(&self) -> &BaasClient {
        &self.client
    }
}

/// PostgREST `or` filter selecting both directions of a conversation.
fn pair_filter(user_a: &str, user_b: &str) -> String {
    format!(
        "(and(sender_id.eq.{a},receiver_id.eq.{b}),and(sender_id.eq.{b},receiver_id.eq.{a}))",
        a = user_a,
        b = user_b
    )
}

async fn json_rows(resp: reqwest::Response) -> Result<Vec<serde_json::Value>, GatewayError> {
    resp.json()
        .await
        .map_err(|e| GatewayError::Decode(format!("expected a JSON array of rows: {}", e)))
}

#[async_trait]
impl RemoteDataGateway for RestGateway {
    async fn fetch_messages_page(
        &self,
        user_a: &str,
        user_b: &str,
        offset: usize,
        limit: usize,
    ) -> Result<MessagePage, GatewayError> {
        let url = self.client.rest_url(
            MESSAGES,
            &[
                ("select", MESSAGE_SELECT.to_string()),
                ("or", pair_filter(user_a, user_b)),
                ("order", "created_at.asc".to_string()),
                ("offset", offset.to_string()),
                ("limit", limit.to_string()),
            ],
        )?;
        let rows = json_rows(self.client.rest_get(url).await?).await?;
        let row_count = rows.len();
        Ok(MessagePage {
            messages: decode_messages(rows),
            row_count,
        })
    }

    async fn insert_message(&self, new: &NewMessage) -> Result<Message, GatewayError> {
        let url = self
            .client
            .rest_url(MESSAGES, &[("select", MESSAGE_SELECT.to_string())])?;
        let body = serde_json::to_value(new)
            .map_err(|e| GatewayError::Decode(format!("cannot encode message: {}", e)))?;
        let resp = self
            .client
            .rest_post(url, &body, Some("return=representation"))
            .await?;
        decode_messages(json_rows(resp).await?)
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::Decode("insert returned no row".to_string()))
    }

    async fn mark_messages_read(
        &self,
        receiver_id: &str,
        sender_id: &str,
    ) -> Result<(), GatewayError> {
        let url = self.client.rest_url(
            MESSAGES,
            &[
                ("receiver_id", format!("eq.{}", receiver_id)),
                ("sender_id", format!("eq.{}", sender_id)),
                ("read", "eq.false".to_string()),
            ],
        )?;
        self.client
            .rest_patch(url, &serde_json::json!({ "read": true }))
            .await?;
        Ok(())
    }

    async fn fetch_conversation_summaries(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, GatewayError> {
        let resp = self
            .client
            .rpc(SUMMARIES_RPC, &serde_json::json!({ "p_user_id": user_id }))
            .await?;
        let rows: Vec<SummaryRow> = resp
            .json()
            .await
            .map_err(|e| GatewayError::Decode(format!("bad summary rows: {}", e)))?;
        Ok(rows.into_iter().map(ConversationSummary::from).collect())
    }

    async fn subscribe_to_message_inserts(
        &self,
        filter: InsertFilter,
        events: mpsc::UnboundedSender<MessageEvent>,
    ) -> Result<Subscription, GatewayError> {
        let target = RealtimeTarget {
            ws_url: self.client.realtime_url(),
            access_token: self.client.access_token().to_string(),
            topic: format!("realtime:messages-{}", self.client.user_id()),
        };
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(realtime::run_subscription(target, filter, events, cancel_rx));
        Ok(Subscription::new(cancel_tx, Some(task)))
    }

    async fn upload_binary_asset(&self, local_path: &Path) -> Result<String, GatewayError> {
        storage::upload_file(&self.client, &self.media_bucket, local_path).await
    }
}
