use crate::error::ReportError;
use crate::retry::RetryPolicy;
use crate::store::ReportArtifact;
use crate::workbook::XLSX_CONTENT_TYPE;
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart};
use rusoto_core::Region;
use rusoto_ses::{RawMessage, SendRawEmailRequest, Ses, SesClient};
use std::sync::Arc;
use tracing::{info, warn};

const MEGABYTE: f64 = 1024.0 * 1024.0;
const BASE64_LINE: usize = 76;

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Sends a complete MIME message and returns the provider's message id.
    async fn send_raw(&self, sender: &str, recipients: &[String], raw: Vec<u8>) -> Result<String, ReportError>;
}

pub struct SesMailTransport {
    client: SesClient,
}

impl SesMailTransport {
    pub fn new(region: Region) -> Self {
        Self::new_with_client(SesClient::new(region))
    }

    pub fn new_with_client(client: SesClient) -> Self {
        SesMailTransport { client }
    }
}

#[async_trait]
impl MailTransport for SesMailTransport {
    async fn send_raw(&self, sender: &str, recipients: &[String], raw: Vec<u8>) -> Result<String, ReportError> {
        let output = self
            .client
            .send_raw_email(SendRawEmailRequest {
                source: Some(sender.to_string()),
                destinations: Some(recipients.to_vec()),
                raw_message: RawMessage { data: raw.into() },
                ..Default::default()
            })
            .await?;
        Ok(output.message_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recipients {
    pub accepted: Vec<Mailbox>,
    pub rejected: Vec<String>,
}

/// Splits a `,`/`;` delimited address list. Entries that do not parse as a
/// mailbox are returned in `rejected`.
pub fn parse_recipients(raw: &str) -> Recipients {
    let mut recipients = Recipients {
        accepted: vec![],
        rejected: vec![],
    };
    for entry in raw.split(|c| c == ',' || c == ';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match entry.parse::<Mailbox>() {
            Ok(mailbox) => {
                if !recipients.accepted.contains(&mailbox) {
                    recipients.accepted.push(mailbox);
                }
            }
            Err(error) => {
                warn!(recipient = entry, error = %error, "dropping malformed recipient");
                recipients.rejected.push(entry.to_string());
            }
        }
    }
    recipients
}

/// Size of `len` bytes once base64 encoded into 76 character CRLF lines.
pub fn encoded_size(len: usize) -> usize {
    let encoded = (len + 2) / 3 * 4;
    let lines = (encoded + BASE64_LINE - 1) / BASE64_LINE;
    encoded + lines * 2
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttachmentPolicy {
    pub attach: bool,
    pub max_encoded_bytes: usize,
}

impl AttachmentPolicy {
    pub fn new(attach: bool, max_megabytes: f64) -> Self {
        AttachmentPolicy {
            attach,
            max_encoded_bytes: (max_megabytes.max(0.0) * MEGABYTE) as usize,
        }
    }

    pub fn allows(&self, len: usize) -> bool {
        self.attach && encoded_size(len) <= self.max_encoded_bytes
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportAttachment {
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailEnvelope {
    pub sender: Mailbox,
    pub recipients: Vec<Mailbox>,
    pub subject: String,
    pub body: String,
    pub attachment: Option<ReportAttachment>,
    pub link: Option<String>,
}

impl EmailEnvelope {
    pub fn to_mime(&self) -> Result<Vec<u8>, ReportError> {
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(self.subject.clone());
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        let text = SinglePart::plain(self.body.clone());
        let message = match &self.attachment {
            Some(attachment) => {
                let content_type = ContentType::parse(XLSX_CONTENT_TYPE)
                    .map_err(|error| ReportError::DispatchFailure(error.to_string()))?;
                builder.multipart(
                    MultiPart::mixed().singlepart(text).singlepart(
                        Attachment::new(attachment.filename.clone())
                            .body(attachment.bytes.clone(), content_type),
                    ),
                )?
            }
            None => builder.singlepart(text)?,
        };
        Ok(message.formatted())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub message_id: String,
    pub attached: bool,
    pub message_bytes: usize,
}

pub struct Dispatcher {
    transport: Arc<dyn MailTransport>,
    sender: Mailbox,
    policy: AttachmentPolicy,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn MailTransport>,
        sender: Mailbox,
        policy: AttachmentPolicy,
        retry: RetryPolicy,
    ) -> Self {
        Dispatcher {
            transport,
            sender,
            policy,
            retry,
        }
    }

    /// Builds the single report email: the workbook is attached when the
    /// policy allows it, otherwise the body links to the stored copy.
    pub fn compose(
        &self,
        recipients: &[Mailbox],
        subject: &str,
        summary: &[String],
        workbook: &[u8],
        filename: &str,
        artifact: Option<&ReportArtifact>,
    ) -> EmailEnvelope {
        let attach = self.policy.allows(workbook.len());
        let size_mb = workbook.len() as f64 / MEGABYTE;
        let mut body: Vec<String> = summary.to_vec();
        body.push(String::new());

        let link = artifact.map(|artifact| artifact.link.clone());
        match (attach, artifact) {
            (true, Some(artifact)) => {
                body.push(format!("The report is attached as {} ({:.2} MB).", filename, size_mb));
                body.push(format!("Stored copy: {}", artifact.uri()));
            }
            (true, None) => {
                body.push(format!("The report is attached as {} ({:.2} MB).", filename, size_mb));
                body.push("The report could not be stored; the attachment is the only copy.".to_string());
            }
            (false, Some(artifact)) => {
                if self.policy.attach {
                    body.push(format!(
                        "The report ({:.2} MB) is too large to attach (limit {:.2} MB).",
                        size_mb,
                        self.policy.max_encoded_bytes as f64 / MEGABYTE
                    ));
                }
                body.push(format!("Download the report: {}", artifact.link));
                body.push(format!("Stored copy: {}", artifact.uri()));
            }
            (false, None) => {
                body.push(format!(
                    "The report ({:.2} MB) could not be attached or stored. See the job logs.",
                    size_mb
                ));
            }
        }

        EmailEnvelope {
            sender: self.sender.clone(),
            recipients: recipients.to_vec(),
            subject: subject.to_string(),
            body: body.join("\n"),
            attachment: if attach {
                Some(ReportAttachment {
                    filename: filename.to_string(),
                    bytes: workbook.to_vec(),
                })
            } else {
                None
            },
            link: if attach { None } else { link },
        }
    }

    pub async fn send(&self, envelope: &EmailEnvelope) -> Result<DeliveryResult, ReportError> {
        if envelope.recipients.is_empty() {
            return Err(ReportError::EmptyRecipients);
        }
        let raw = envelope.to_mime()?;
        let message_bytes = raw.len();
        let destinations: Vec<String> = envelope
            .recipients
            .iter()
            .map(|mailbox| mailbox.email.to_string())
            .collect();
        let sender = envelope.sender.email.to_string();
        let message_id = self
            .retry
            .run("send_raw_email", || {
                self.transport.send_raw(&sender, &destinations, raw.clone())
            })
            .await
            .map_err(|error| match error {
                ReportError::DispatchFailure(_) => error,
                other => ReportError::DispatchFailure(other.to_string()),
            })?;
        info!(
            message_id = message_id.as_str(),
            recipients = destinations.len(),
            attached = envelope.attachment.is_some(),
            bytes = message_bytes,
            "report email sent"
        );
        Ok(DeliveryResult {
            message_id,
            attached: envelope.attachment.is_some(),
            message_bytes,
        })
    }
}
