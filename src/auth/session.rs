//! Password and refresh-token grants against the backend auth service

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use super::tokens::jwt_subject;
use super::TokenStore;
use crate::config::Config;

/// Response from `/auth/v1/token`
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    user: Option<AuthUser>,
}

#[derive(Debug, Deserialize)]
struct AuthUser {
    id: String,
    email: Option<String>,
}

/// POST a grant to the auth endpoint and decode the token response.
async fn request_token(
    config: &Config,
    grant_type: &str,
    body: &serde_json::Value,
) -> Result<TokenResponse> {
    let url = format!(
        "{}/auth/v1/token?grant_type={}",
        config.project_url()?,
        grant_type
    );
    let anon_key = config.anon_key()?;

    tracing::debug!("Auth POST {}", url);

    let resp = reqwest::Client::new()
        .post(&url)
        .header("apikey", &anon_key)
        .json(body)
        .send()
        .await
        .with_context(|| format!("Auth POST {} failed", url))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        bail!("Token grant failed (HTTP {}): {}", status.as_u16(), body);
    }

    resp.json()
        .await
        .context("Failed to parse auth token response")
}

/// Persist a token response into the config.
fn store_tokens(config: &mut Config, tokens: TokenResponse) {
    let user_id = tokens
        .user
        .as_ref()
        .map(|u| u.id.clone())
        .or_else(|| jwt_subject(&tokens.access_token));
    if let Some(email) = tokens.user.and_then(|u| u.email) {
        config.email = Some(email);
    }
    config.user_id = user_id;
    config.set_access_token(tokens.access_token, tokens.expires_in);
    if let Some(rt) = tokens.refresh_token {
        config.set_refresh_token(rt);
    }
}

/// Refresh the session using the stored refresh token.
/// Returns Ok(true) if refresh succeeded, Ok(false) if no refresh token exists.
pub async fn refresh() -> Result<bool> {
    let mut config = Config::load()?;
    let refresh_token = match config.get_refresh_token() {
        Some(rt) => rt,
        None => return Ok(false),
    };

    tracing::info!("Refreshing session token...");
    let body = serde_json::json!({ "refresh_token": refresh_token });
    let tokens = request_token(&config, "refresh_token", &body)
        .await
        .context("Failed to refresh session")?;

    store_tokens(&mut config, tokens);
    config.save()?;
    Ok(true)
}

/// Sign in with email and password.
pub async fn login(email: &str, password: &str, force: bool) -> Result<()> {
    let mut config = Config::load()?;

    if !force {
        if let Some(token) = config.get_access_token() {
            if !token.is_expired() {
                println!("Already logged in (session valid). Use --force to re-authenticate.");
                return Ok(());
            }
            if config.get_refresh_token().is_some() {
                tracing::info!("Session expired, attempting refresh...");
                match refresh().await {
                    Ok(true) => {
                        println!("Session refreshed successfully.");
                        return Ok(());
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("Refresh failed, falling back to password login: {:#}", e);
                    }
                }
                config = Config::load()?;
            }
        }
    }

    let body = serde_json::json!({ "email": email, "password": password });
    let tokens = request_token(&config, "password", &body).await?;
    store_tokens(&mut config, tokens);
    config.save()?;

    println!(
        "Logged in as {} ({}).",
        config.email.as_deref().unwrap_or(email),
        config.user_id.as_deref().unwrap_or("unknown id")
    );
    Ok(())
}

/// Clear stored credentials
pub async fn logout() -> Result<()> {
    let mut config = Config::load()?;
    config.clear_tokens();
    config.save()?;
    println!("Logged out.");
    Ok(())
}

/// Display current auth status
pub async fn status() -> Result<()> {
    let config = Config::load()?;

    println!(
        "Project:     {}",
        config.project_url.as_deref().unwrap_or("(not configured)")
    );
    println!(
        "Anon key:    {}",
        if config.anon_key.is_some() { "present" } else { "none" }
    );

    match config.get_access_token() {
        Some(token) if !token.is_expired() => {
            println!("Session:     valid");
            if let Some(exp) = token.expires_at {
                println!("  expires_at: {}", exp);
            }
        }
        Some(_) => println!("Session:     expired"),
        None => println!("Session:     none"),
    }

    match config.get_refresh_token() {
        Some(_) => println!("Refresh tok: present"),
        None => println!("Refresh tok: none"),
    }

    if let Some(ref id) = config.user_id {
        println!("User:        {} ({})", id, config.email.as_deref().unwrap_or("?"));
    }

    if config.get_access_token().is_none() {
        println!("\nRun 'daremex login' to authenticate.");
    }

    Ok(())
}
