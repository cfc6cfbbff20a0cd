//-
// Copyright (c) 2025, Jason Lingle
//
// This file is part of Graphgate.
//
// Graphgate is free software: you can  redistribute it and/or modify it under
// the terms  of the GNU General  Public License as published  by the Free
// Software Foundation, either version 3 of  the License, or (at your option)
// any later version.
//
// Graphgate is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY;  without even the  implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Graphgate. If not, see <http://www.gnu.org/licenses/>.

//! OAuth2 token acquisition and renewal.
//!
//! First contact is the Device Code grant: the CLI surfaces the
//! verification URL and code through a callback while this module polls the
//! token endpoint. Afterwards the stored refresh token is used, proactively
//! when the access token has five minutes or less of life left and
//! reactively when Graph answers 401.
//!
//! Renewal is coalesced. All refreshes funnel through one mutex; a waiter
//! that acquires it re-checks whether the token it saw fail has already
//! been replaced and, if so, skips its own request. Under N concurrent 401
//! responses exactly one refresh request leaves the process.

use std::time::Duration;

use chrono::prelude::*;
use log::{info, warn};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::token_store::{TokenBundle, TokenStore};
use crate::support::error::Error;

pub const AUTHORITY: &str = "https://login.microsoftonline.com";

pub const SCOPES: &[&str] = &[
    "https://graph.microsoft.com/Mail.Send",
    "https://graph.microsoft.com/Mail.Send.Shared",
    "https://graph.microsoft.com/Mail.ReadWrite",
    "https://graph.microsoft.com/Mail.ReadWrite.Shared",
    "offline_access",
];

/// Refresh when the access token has this much life left, in seconds.
const REFRESH_MARGIN_SECS: i64 = 300;
/// Overall deadline for the device-code flow.
const DEVICE_CODE_DEADLINE: Duration = Duration::from_secs(15 * 60);

/// What the CLI shows the operator during a device-code login.
#[derive(Debug, Clone)]
pub struct DeviceCodePrompt {
    pub verification_uri: String,
    pub user_code: String,
    /// The preformatted sentence Microsoft returns; preferred for display.
    pub message: String,
}

pub struct Authenticator {
    http: reqwest::Client,
    authority: String,
    client_id: String,
    tenant_id: String,
    user: String,
    store: TokenStore,
    tokens: Mutex<Option<TokenBundle>>,
    refresh_lock: Mutex<()>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    message: Option<String>,
    interval: Option<u64>,
    expires_in: Option<u64>,
}

impl Authenticator {
    pub fn new(
        http: reqwest::Client,
        client_id: String,
        tenant_id: String,
        user: String,
        store: TokenStore,
    ) -> Self {
        let tokens = Mutex::new(store.load());
        Self {
            http,
            authority: AUTHORITY.to_owned(),
            client_id,
            tenant_id,
            user,
            store,
            tokens,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Point the token endpoints at a stand-in server.
    #[cfg(test)]
    fn set_authority(&mut self, authority: String) {
        self.authority = authority;
    }

    fn token_url(&self) -> String {
        format!("{}/{}/oauth2/v2.0/token", self.authority, self.tenant_id)
    }

    fn devicecode_url(&self) -> String {
        format!(
            "{}/{}/oauth2/v2.0/devicecode",
            self.authority, self.tenant_id,
        )
    }

    async fn fresh_access(&self) -> Option<String> {
        let tokens = self.tokens.lock().await;
        tokens
            .as_ref()
            .filter(|t| !t.expires_within(REFRESH_MARGIN_SECS))
            .map(|t| t.access_token.clone())
    }

    /// Return a usable access token, refreshing first if the cached one is
    /// within the proactive-refresh margin.
    pub async fn access_token(&self) -> Result<String, Error> {
        if let Some(token) = self.fresh_access().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // A waiter coalesces with whichever refresh ran while it was
        // parked on the lock.
        if let Some(token) = self.fresh_access().await {
            return Ok(token);
        }

        self.do_refresh().await?;
        self.fresh_access().await.ok_or(Error::LoginRequired)
    }

    /// Reactive refresh after a 401: exchange `stale` for a new access
    /// token unless another task already replaced it.
    pub async fn refresh_after(&self, stale: &str) -> Result<String, Error> {
        let _guard = self.refresh_lock.lock().await;
        {
            let tokens = self.tokens.lock().await;
            if let Some(t) = tokens.as_ref() {
                if t.access_token != stale {
                    return Ok(t.access_token.clone());
                }
            }
        }

        self.do_refresh().await?;
        let tokens = self.tokens.lock().await;
        tokens
            .as_ref()
            .map(|t| t.access_token.clone())
            .ok_or(Error::LoginRequired)
    }

    /// Must be called with `refresh_lock` held.
    async fn do_refresh(&self) -> Result<(), Error> {
        let refresh_token = {
            let tokens = self.tokens.lock().await;
            match tokens.as_ref() {
                Some(t) => t.refresh_token.clone(),
                None => match self.store.load() {
                    Some(t) => t.refresh_token,
                    None => return Err(Error::LoginRequired),
                },
            }
        };

        let scope = SCOPES.join(" ");
        let response = self
            .http
            .post(self.token_url())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", scope.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            if let Ok(err) =
                serde_json::from_str::<TokenErrorResponse>(&body)
            {
                // invalid_grant means the refresh token itself is dead;
                // anything else from the token endpoint may be transient.
                if "invalid_grant" == err.error {
                    warn!(
                        "Refresh token rejected: {}",
                        err.error_description
                    );
                    return Err(Error::LoginRequired);
                }
            }
            return Err(Error::GraphRetryable {
                status,
                message: truncate(&body),
            });
        }

        let parsed: TokenResponse = response.json().await?;
        self.install(parsed, refresh_token).await?;
        info!("Access token refreshed");
        Ok(())
    }

    async fn install(
        &self,
        parsed: TokenResponse,
        previous_refresh: String,
    ) -> Result<(), Error> {
        let bundle = TokenBundle {
            access_token: parsed.access_token,
            // The endpoint does not always roll the refresh token.
            refresh_token: parsed
                .refresh_token
                .unwrap_or(previous_refresh),
            expires_at: Utc::now()
                + chrono::Duration::seconds(
                    parsed.expires_in.unwrap_or(3600) as i64,
                ),
            scopes: SCOPES.iter().map(|&s| s.to_owned()).collect(),
            account: self.user.clone(),
        };
        self.store.save(&bundle)?;
        *self.tokens.lock().await = Some(bundle);
        Ok(())
    }

    /// Run the interactive Device Code flow, blocking until the operator
    /// completes authentication in a browser or the deadline passes.
    pub async fn device_login(
        &self,
        prompt: &dyn Fn(&DeviceCodePrompt),
    ) -> Result<(), Error> {
        let scope = SCOPES.join(" ");
        let response = self
            .http
            .post(self.devicecode_url())
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("scope", scope.as_str()),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::DeviceCodeFailed(format!(
                "{status}: {}",
                truncate(&body),
            )));
        }
        let flow: DeviceCodeResponse = response.json().await?;

        prompt(&DeviceCodePrompt {
            message: flow.message.clone().unwrap_or_else(|| {
                format!(
                    "To sign in, open {} and enter the code {}",
                    flow.verification_uri, flow.user_code,
                )
            }),
            verification_uri: flow.verification_uri,
            user_code: flow.user_code,
        });

        let deadline = tokio::time::Instant::now()
            + DEVICE_CODE_DEADLINE
                .min(Duration::from_secs(flow.expires_in.unwrap_or(900)));
        let mut interval = Duration::from_secs(flow.interval.unwrap_or(5));

        loop {
            if tokio::time::Instant::now() + interval > deadline {
                return Err(Error::DeviceCodeTimedOut);
            }
            tokio::time::sleep(interval).await;

            let response = self
                .http
                .post(self.token_url())
                .form(&[
                    ("client_id", self.client_id.as_str()),
                    (
                        "grant_type",
                        "urn:ietf:params:oauth:grant-type:device_code",
                    ),
                    ("device_code", flow.device_code.as_str()),
                ])
                .send()
                .await?;

            if response.status().is_success() {
                let parsed: TokenResponse = response.json().await?;
                self.install(parsed, String::new()).await?;
                info!("Device login completed for {}", self.user);
                return Ok(());
            }

            let body = response.text().await.unwrap_or_default();
            let err: TokenErrorResponse = serde_json::from_str(&body)
                .unwrap_or_else(|_| TokenErrorResponse {
                    error: "unknown".to_owned(),
                    error_description: truncate(&body),
                });
            match err.error.as_str() {
                "authorization_pending" => {},
                "slow_down" => interval += Duration::from_secs(5),
                _ => {
                    return Err(Error::DeviceCodeFailed(format!(
                        "{}: {}",
                        err.error, err.error_description,
                    )))
                },
            }
        }
    }
}

fn truncate(body: &str) -> String {
    let mut s = body.trim().to_owned();
    if let Some((ix, _)) = s.char_indices().nth(200) {
        s.truncate(ix);
    }
    s
}
