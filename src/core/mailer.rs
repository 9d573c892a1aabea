// src/core/mailer.rs

//! Outbound e-mail through an HTTP mail gateway. Escalation paths (integrity
//! scrubber, disk and quota alerts) hand fully-formed messages to this
//! component; when no gateway is configured every send is a logged no-op.

use crate::config::MailerConfig;
use crate::core::OpalError;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

const MAIL_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct MailPayload<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    body: &'a str,
}

#[derive(Debug)]
pub struct Mailer {
    gateway_url: Option<String>,
    from_address: String,
    http: reqwest::Client,
}

impl Mailer {
    pub fn new(config: &MailerConfig) -> Self {
        Self {
            gateway_url: config.gateway_url.clone(),
            from_address: config.from_address.clone(),
            http: reqwest::Client::builder()
                .timeout(MAIL_REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.gateway_url.is_some()
    }

    /// Sends one message to all recipients. Delivery failures are returned
    /// to the caller, which decides whether they are fatal; every current
    /// caller logs and continues.
    pub async fn send(
        &self,
        to: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), OpalError> {
        let Some(gateway) = &self.gateway_url else {
            debug!("Mail gateway not configured; dropping e-mail '{}'.", subject);
            return Ok(());
        };
        if to.is_empty() {
            warn!("No recipients for e-mail '{}'; nothing to send.", subject);
            return Ok(());
        }

        let payload = MailPayload {
            from: &self.from_address,
            to,
            subject,
            body,
        };
        let response = self.http.post(gateway).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(OpalError::HttpClient(format!(
                "mail gateway returned {} for '{}'",
                response.status(),
                subject
            )));
        }
        debug!("Sent e-mail '{}' to {} recipient(s).", subject, to.len());
        Ok(())
    }
}
