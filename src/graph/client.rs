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

//! The Microsoft Graph adapter.
//!
//! All mailbox traffic funnels through here: sending (raw MIME for small
//! messages, draft plus attachment upload sessions for large ones),
//! listing, raw fetch, mark-read and delete, plus the reachability probe.
//! Every response is classified into ok/retryable/auth/permanent so the
//! protocol engines and the queue can decide between inline failure,
//! enqueueing and backoff.

use std::time::Duration;

use log::{debug, info};
use serde_json::json;

use super::auth::Authenticator;
use super::mime;
use super::token_store::TokenStore;
use crate::pop3::MailStore;
use crate::support::{
    error::Error,
    system_config::GatewayConfig,
};

pub const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Messages whose serialized MIME exceeds this take the chunked-upload
/// path.
pub const LARGE_MESSAGE_THRESHOLD: usize = 3 * 1024 * 1024;
/// Upload-session range size.
const UPLOAD_RANGE: usize = 4 * 1024 * 1024;
/// Per-page message count when listing.
const LIST_PAGE_SIZE: u32 = 50;

const GRAPH_TIMEOUT: Duration = Duration::from_secs(60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// One row of a mailbox listing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMeta {
    /// The Graph message id; doubles as the POP3 UIDL.
    pub id: String,
    /// Approximate message size: the serialized Graph representation plus
    /// declared attachment sizes. Graph does not expose the raw octet
    /// count without fetching the MIME itself.
    pub size: u64,
}

pub struct GraphClient {
    http: reqwest::Client,
    probe_http: reqwest::Client,
    auth: Authenticator,
}

impl GraphClient {
    pub fn new(
        config: &GatewayConfig,
        store: TokenStore,
    ) -> Result<Self, Error> {
        let http = client_builder(config, GRAPH_TIMEOUT)?.build()?;
        let probe_http = client_builder(config, PROBE_TIMEOUT)?.build()?;
        let auth = Authenticator::new(
            http.clone(),
            config.client_id.clone(),
            config.tenant_id.clone(),
            config.user.clone(),
            store,
        );
        Ok(Self {
            http,
            probe_http,
            auth,
        })
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.auth
    }

    /// Make sure a usable access token exists, without touching any
    /// mailbox.
    pub async fn ensure_token(&self) -> Result<(), Error> {
        self.auth.access_token().await.map(drop)
    }

    /// Probe the Graph endpoint.
    ///
    /// Any HTTPS response at all, including 401/403/405, means the network
    /// path and TLS terminator are healthy; only transport-level failures
    /// count as unreachable.
    pub async fn probe(&self) -> bool {
        match self
            .probe_http
            .head(format!("{GRAPH_BASE}/me"))
            .send()
            .await
        {
            Ok(response) => {
                debug!("Graph probe: HTTP {}", response.status());
                true
            },
            Err(e) => {
                debug!("Graph probe failed: {e}");
                false
            },
        }
    }

    /// Send a message, choosing the raw or chunked path by size.
    pub async fn send_mail(
        &self,
        from: &str,
        raw_mime: &[u8],
    ) -> Result<(), Error> {
        if raw_mime.len() > LARGE_MESSAGE_THRESHOLD {
            return self.send_mail_large(from, raw_mime).await;
        }

        let body = base64::encode(raw_mime);
        let response = self
            .send_authed(|http, token| {
                http.post(format!("{GRAPH_BASE}/users/{from}/sendMail"))
                    .bearer_auth(token)
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(body.clone())
            })
            .await?;
        drop(response);
        info!("Sent mail as {from} via Graph");
        Ok(())
    }

    /// Send a large message: create a draft, push each attachment through
    /// an upload session in bounded ranges, then send the draft.
    pub async fn send_mail_large(
        &self,
        from: &str,
        raw_mime: &[u8],
    ) -> Result<(), Error> {
        let parsed = mime::Message::parse(raw_mime)?;

        let draft = json!({
            "subject": parsed.subject,
            "body": {
                "contentType": if parsed.html { "HTML" } else { "Text" },
                "content": parsed.body,
            },
            "toRecipients": recipient_list(&parsed.to),
            "ccRecipients": recipient_list(&parsed.cc),
            "bccRecipients": recipient_list(&parsed.bcc),
        });
        let response = self
            .send_authed(|http, token| {
                http.post(format!("{GRAPH_BASE}/users/{from}/messages"))
                    .bearer_auth(token)
                    .json(&draft)
            })
            .await?;
        let created: serde_json::Value = response.json().await?;
        let draft_id = created["id"]
            .as_str()
            .ok_or(Error::BadMime("draft creation returned no id"))?
            .to_owned();

        for attachment in &parsed.attachments {
            self.upload_attachment(from, &draft_id, attachment).await?;
        }

        self.send_authed(|http, token| {
            http.post(format!(
                "{GRAPH_BASE}/users/{from}/messages/{draft_id}/send"
            ))
            .bearer_auth(token)
            .header(reqwest::header::CONTENT_LENGTH, 0)
        })
        .await?;
        info!(
            "Sent large mail as {from} via Graph ({} attachments)",
            parsed.attachments.len(),
        );
        Ok(())
    }

    async fn upload_attachment(
        &self,
        from: &str,
        draft_id: &str,
        attachment: &mime::Attachment,
    ) -> Result<(), Error> {
        let total = attachment.data.len();
        let item = json!({
            "AttachmentItem": {
                "attachmentType": "file",
                "name": attachment.name,
                "contentType": attachment.content_type,
                "size": total,
            },
        });
        let response = self
            .send_authed(|http, token| {
                http.post(format!(
                    "{GRAPH_BASE}/users/{from}/messages/{draft_id}\
                     /attachments/createUploadSession"
                ))
                .bearer_auth(token)
                .json(&item)
            })
            .await?;
        let session: serde_json::Value = response.json().await?;
        let upload_url = session["uploadUrl"]
            .as_str()
            .ok_or(Error::BadMime("upload session returned no URL"))?
            .to_owned();

        let mut offset = 0usize;
        while offset < total {
            let end = (offset + UPLOAD_RANGE).min(total);
            let chunk = attachment.data[offset..end].to_vec();
            // Upload URLs are pre-authenticated; no bearer token here.
            let response = self
                .http
                .put(&upload_url)
                .header(
                    reqwest::header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", offset, end - 1, total),
                )
                .body(chunk)
                .send()
                .await?;
            ensure_success(response).await?;
            debug!(
                "Uploaded {}..{} of {} for {}",
                offset, end, total, attachment.name,
            );
            offset = end;
        }

        Ok(())
    }

    /// List the messages of `folder` in `mailbox`, oldest page first.
    pub async fn list_messages(
        &self,
        mailbox: &str,
        folder: &str,
        since: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<Vec<MessageMeta>, Error> {
        let mut url = format!(
            "{GRAPH_BASE}/users/{mailbox}/mailFolders/{folder}/messages\
             ?$top={LIST_PAGE_SIZE}&$select=id,hasAttachments"
        );
        if let Some(since) = since {
            url.push_str(&format!(
                "&$filter=receivedDateTime ge {}",
                since.format("%Y-%m-%dT%H:%M:%SZ"),
            ));
        }

        let mut messages = Vec::<MessageMeta>::new();
        loop {
            let response = self
                .send_authed(|http, token| {
                    http.get(&url).bearer_auth(token)
                })
                .await?;
            let page: serde_json::Value = response.json().await?;

            for item in page["value"].as_array().into_iter().flatten() {
                let Some(id) = item["id"].as_str() else { continue };
                let mut size = self.message_detail_size(mailbox, id).await?;
                if item["hasAttachments"].as_bool().unwrap_or(false) {
                    size += self.attachment_sizes(mailbox, id).await?;
                }
                messages.push(MessageMeta {
                    id: id.to_owned(),
                    size,
                });
            }

            match page["@odata.nextLink"].as_str() {
                Some(next) => url = next.to_owned(),
                None => break,
            }
        }

        debug!("Listed {} messages in {mailbox}/{folder}", messages.len());
        Ok(messages)
    }

    async fn message_detail_size(
        &self,
        mailbox: &str,
        id: &str,
    ) -> Result<u64, Error> {
        let response = self
            .send_authed(|http, token| {
                http.get(format!(
                    "{GRAPH_BASE}/users/{mailbox}/messages/{id}"
                ))
                .bearer_auth(token)
            })
            .await?;
        Ok(response.bytes().await?.len() as u64)
    }

    async fn attachment_sizes(
        &self,
        mailbox: &str,
        id: &str,
    ) -> Result<u64, Error> {
        let response = self
            .send_authed(|http, token| {
                http.get(format!(
                    "{GRAPH_BASE}/users/{mailbox}/messages/{id}\
                     /attachments?$select=id,size"
                ))
                .bearer_auth(token)
            })
            .await?;
        let page: serde_json::Value = response.json().await?;
        Ok(page["value"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|a| a["size"].as_u64())
            .sum())
    }

    /// Fetch the raw RFC 5322 bytes of a message.
    pub async fn fetch_mime(
        &self,
        mailbox: &str,
        id: &str,
    ) -> Result<Vec<u8>, Error> {
        let response = self
            .send_authed(|http, token| {
                http.get(format!(
                    "{GRAPH_BASE}/users/{mailbox}/messages/{id}/$value"
                ))
                .bearer_auth(token)
            })
            .await?;
        Ok(response.bytes().await?.to_vec())
    }

    pub async fn mark_read(
        &self,
        mailbox: &str,
        id: &str,
    ) -> Result<(), Error> {
        self.send_authed(|http, token| {
            http.patch(format!(
                "{GRAPH_BASE}/users/{mailbox}/messages/{id}"
            ))
            .bearer_auth(token)
            .json(&json!({ "isRead": true }))
        })
        .await
        .map(drop)
    }

    pub async fn delete(
        &self,
        mailbox: &str,
        id: &str,
    ) -> Result<(), Error> {
        self.send_authed(|http, token| {
            http.delete(format!(
                "{GRAPH_BASE}/users/{mailbox}/messages/{id}"
            ))
            .bearer_auth(token)
        })
        .await
        .map(drop)
    }

    /// Issue an authenticated request, refreshing and retrying once on
    /// 401.
    async fn send_authed<F>(&self, build: F) -> Result<reqwest::Response, Error>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let token = self.auth.access_token().await?;
        let response = build(&self.http, &token).send().await?;
        if reqwest::StatusCode::UNAUTHORIZED == response.status() {
            let token = self.auth.refresh_after(&token).await?;
            let response = build(&self.http, &token).send().await?;
            return ensure_success(response).await;
        }
        ensure_success(response).await
    }
}

impl MailStore for GraphClient {
    async fn list(
        &self,
        mailbox: &str,
        folder: &str,
    ) -> Result<Vec<MessageMeta>, Error> {
        self.list_messages(mailbox, folder, None).await
    }

    async fn fetch(&self, mailbox: &str, id: &str) -> Result<Vec<u8>, Error> {
        self.fetch_mime(mailbox, id).await
    }

    async fn mark_read(&self, mailbox: &str, id: &str) -> Result<(), Error> {
        GraphClient::mark_read(self, mailbox, id).await
    }

    async fn delete(&self, mailbox: &str, id: &str) -> Result<(), Error> {
        GraphClient::delete(self, mailbox, id).await
    }
}

fn client_builder(
    config: &GatewayConfig,
    timeout: Duration,
) -> Result<reqwest::ClientBuilder, Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("graphgate/", env!("CARGO_PKG_VERSION")));
    if let Some(ref proxy) = config.https_proxy {
        let mut p = reqwest::Proxy::https(&proxy.url)?;
        if let Some(ref username) = proxy.username {
            p = p.basic_auth(
                username,
                proxy.password.as_deref().unwrap_or(""),
            );
        }
        builder = builder.proxy(p);
    }
    Ok(builder)
}

fn recipient_list(addresses: &[String]) -> serde_json::Value {
    serde_json::Value::Array(
        addresses
            .iter()
            .map(|addr| {
                json!({ "emailAddress": { "address": addr.trim() } })
            })
            .collect(),
    )
}

/// Map an HTTP response to the error taxonomy.
///
/// A 401 reaching this point already survived a refresh attempt.
async fn ensure_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let code = status.as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = snippet(&body);
    Err(match code {
        401 | 403 => Error::GraphAuth(format!("{code}: {message}")),
        429 => Error::GraphRetryable {
            status: code,
            message,
        },
        code if code >= 500 => Error::GraphRetryable {
            status: code,
            message,
        },
        _ => Error::GraphPermanent {
            status: code,
            message,
        },
    })
}

fn snippet(body: &str) -> String {
    let mut s = body.trim().to_owned();
    if let Some((ix, _)) = s.char_indices().nth(200) {
        s.truncate(ix);
    }
    s
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::support::error::ErrorClass;

    #[test]
    fn recipient_list_shape() {
        let list =
            recipient_list(&["a@b.com".to_owned(), " c@d.com ".to_owned()]);
        assert_eq!(
            json!([
                { "emailAddress": { "address": "a@b.com" } },
                { "emailAddress": { "address": "c@d.com" } },
            ]),
            list,
        );
    }

    #[test]
    fn error_classes() {
        let retryable = Error::GraphRetryable {
            status: 503,
            message: String::new(),
        };
        assert_eq!(ErrorClass::Retryable, retryable.class());

        let auth = Error::GraphAuth("401: nope".to_owned());
        assert_eq!(ErrorClass::Auth, auth.class());

        let permanent = Error::GraphPermanent {
            status: 413,
            message: String::new(),
        };
        assert_eq!(ErrorClass::Permanent, permanent.class());
    }
}
