//! Message parsing with mail-parser
//!
//! Works on full messages and on bare header blocks alike.

use crate::mail::{MailError, MailResult};
use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Display name and address of one participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: Option<String>,
}

/// Attachment or inline part metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub index: usize,
    pub filename: String,
    pub content_type: String,
    pub size: usize,
    pub content_id: Option<String>,
    /// Saved copy on disk when an attachments directory is configured
    pub path: Option<String>,
}

/// Fields extracted from a message or header block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub subject: Option<String>,
    pub from: Vec<Mailbox>,
    pub to: Vec<Mailbox>,
    pub cc: Vec<Mailbox>,
    pub bcc: Vec<Mailbox>,
    pub reply_to: Vec<Mailbox>,
    pub sender: Vec<Mailbox>,
    /// Date header as RFC 3339
    pub date: Option<String>,
    /// Message-ID without angle brackets
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub html: Option<String>,
    pub text: Option<String>,
    pub attachments: Vec<Attachment>,
    pub embedded: Vec<Attachment>,
}

fn mailboxes(address: Option<&Address<'_>>) -> Vec<Mailbox> {
    let to_mailbox = |addr: &mail_parser::Addr<'_>| Mailbox {
        name: addr.name.as_ref().map(|n| n.to_string()),
        address: addr.address.as_ref().map(|a| a.to_string()),
    };
    match address {
        Some(Address::List(list)) => list.iter().map(to_mailbox).collect(),
        Some(Address::Group(groups)) => groups
            .iter()
            .flat_map(|g| g.addresses.iter().map(to_mailbox))
            .collect(),
        None => Vec::new(),
    }
}

fn text_list(value: &HeaderValue<'_>) -> Vec<String> {
    match value {
        HeaderValue::Text(text) => vec![text.to_string()],
        HeaderValue::TextList(list) => list.iter().map(|t| t.to_string()).collect(),
        _ => Vec::new(),
    }
}

fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match cleaned.trim_matches('.') {
        "" => "attachment".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn save_part(dir: &Path, msgid: &str, index: usize, filename: &str, data: &[u8]) -> MailResult<PathBuf> {
    let folder = dir.join(safe_filename(msgid)).join(index.to_string());
    std::fs::create_dir_all(&folder)?;
    let path = folder.join(safe_filename(filename));
    std::fs::write(&path, data)?;
    Ok(path)
}

/// Message-ID of a header block, without angle brackets
pub fn message_id(header: &[u8]) -> Option<String> {
    MessageParser::default()
        .parse(header)
        .and_then(|msg| msg.message_id().map(|id| id.to_string()))
}

/// Parse a raw message or header block.
///
/// `msgid` names the directory attachments are saved under when
/// `attachments_dir` is set.
pub fn parse(raw: &[u8], msgid: &str, attachments_dir: Option<&Path>) -> MailResult<ParsedMessage> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailError::Parse(format!("unparseable message {}", msgid)))?;

    let mut parsed = ParsedMessage {
        subject: message.subject().map(|s| s.to_string()),
        from: mailboxes(message.from()),
        to: mailboxes(message.to()),
        cc: mailboxes(message.cc()),
        bcc: mailboxes(message.bcc()),
        reply_to: mailboxes(message.reply_to()),
        sender: mailboxes(message.sender()),
        date: message.date().map(|d| d.to_rfc3339()),
        message_id: message.message_id().map(|s| s.to_string()),
        in_reply_to: text_list(message.in_reply_to()).into_iter().next(),
        references: text_list(message.references()),
        html: message.body_html(0).map(|s| s.to_string()),
        text: message.body_text(0).map(|s| s.to_string()),
        ..Default::default()
    };

    for (index, part) in message.attachments().enumerate() {
        let filename = part
            .attachment_name()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("attachment_{}", index));
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let contents = part.contents();
        let path = match attachments_dir {
            Some(dir) => Some(
                save_part(dir, msgid, index, &filename, contents)?
                    .to_string_lossy()
                    .into_owned(),
            ),
            None => None,
        };

        let attachment = Attachment {
            index,
            filename,
            content_type,
            size: contents.len(),
            content_id: part.content_id().map(|id| id.to_string()),
            path,
        };
        if attachment.content_id.is_some() {
            parsed.embedded.push(attachment);
        } else {
            parsed.attachments.push(attachment);
        }
    }

    // Header-only input has no body parts
    if parsed.text.as_deref() == Some("") {
        parsed.text = None;
    }

    Ok(parsed)
}
