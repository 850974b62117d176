//! Pure conversion from adapter-native listing entries into the canonical
//! [`Email`] model. No network, no storage, no side effects.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{TimeZone, Utc};
use mailparse::{addrparse, dateparse, parse_mail, MailAddr, MailHeaderMap, ParsedMail};
use sha2::{Digest, Sha256};

use crate::adapter::{RawMessageEvent, RawMeta, RemoteFlags};
use crate::error::SyncError;
use crate::model::{Attachment, Email, EmailAddress};

/// Outcome of normalizing one listing entry, keyed by `(account_id, id)`.
#[derive(Debug, Clone)]
pub enum NormalizedEvent {
    Upsert(Email),
    Flags { id: String, flags: RemoteFlags },
    Present { id: String },
    Removed { id: String },
}

/// Derive the server-stable message id.
///
/// IMAP ids are scoped to the folder's UID-validity epoch; an epoch change
/// invalidates every id previously issued for the account. POP3 falls back
/// to a content hash of the header block when the server has no UIDL; the
/// message size is folded into the hash so equal headers with different
/// sizes stay distinct until proven identical.
pub fn stable_id(meta: &RawMeta, raw: &[u8]) -> String {
    match meta {
        RawMeta::Imap { uid_validity, uid } => format!("imap:{}:{}", uid_validity, uid),
        RawMeta::Pop3 { uidl: Some(token), .. } => format!("pop3:{}", token),
        RawMeta::Pop3 { uidl: None, size } => {
            let headers = header_block(raw);
            let mut hasher = Sha256::new();
            hasher.update(headers);
            hasher.update(size.to_be_bytes());
            format!("pop3:h{}", URL_SAFE_NO_PAD.encode(hasher.finalize()))
        }
    }
}

/// Parse the epoch and UID back out of an id this module issued.
pub fn imap_parts(id: &str) -> Option<(u32, u32)> {
    let rest = id.strip_prefix("imap:")?;
    let (validity, uid) = rest.split_once(':')?;
    Some((validity.parse().ok()?, uid.parse().ok()?))
}

fn header_block(raw: &[u8]) -> &[u8] {
    match raw.windows(4).position(|w| w == b"\r\n\r\n") {
        Some(pos) => &raw[..pos],
        None => raw,
    }
}

pub fn normalize_event(
    account_id: &str,
    event: RawMessageEvent,
) -> Result<NormalizedEvent, SyncError> {
    match event {
        RawMessageEvent::Message {
            meta,
            raw,
            flags,
            labels,
        } => {
            let email = normalize_message(account_id, &meta, &raw, flags, labels)?;
            Ok(NormalizedEvent::Upsert(email))
        }
        RawMessageEvent::FlagsChanged { meta, flags } => Ok(NormalizedEvent::Flags {
            id: stable_id(&meta, &[]),
            flags,
        }),
        RawMessageEvent::Present { id } => Ok(NormalizedEvent::Present { id }),
        RawMessageEvent::Expunged { id } => Ok(NormalizedEvent::Removed { id }),
    }
}

/// Build a canonical [`Email`] from raw RFC822 bytes. Attachment content is
/// left out; only metadata travels through the sync path.
pub fn normalize_message(
    account_id: &str,
    meta: &RawMeta,
    raw: &[u8],
    flags: RemoteFlags,
    labels: Vec<String>,
) -> Result<Email, SyncError> {
    let parsed = parse_mail(raw).map_err(|e| SyncError::Parse(e.to_string()))?;

    let from = parsed
        .headers
        .get_first_value("From")
        .and_then(|v| parse_single_address(&v))
        .ok_or_else(|| SyncError::Parse("message has no From header".to_string()))?;

    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
    let to = parsed
        .headers
        .get_first_value("To")
        .map(|v| parse_address_list(&v))
        .unwrap_or_default();
    let cc = parsed
        .headers
        .get_first_value("Cc")
        .map(|v| parse_address_list(&v))
        .filter(|list| !list.is_empty());
    let bcc = parsed
        .headers
        .get_first_value("Bcc")
        .map(|v| parse_address_list(&v))
        .filter(|list| !list.is_empty());
    let date = parsed
        .headers
        .get_first_value("Date")
        .map(|v| normalize_date(&v))
        .unwrap_or_default();

    let body = extract_part(&parsed, "text/plain")?.unwrap_or_default();
    let html_body = extract_part(&parsed, "text/html")?;
    let attachments = extract_attachments(&parsed)?;

    Ok(Email {
        id: stable_id(meta, raw),
        account_id: account_id.to_string(),
        subject,
        from,
        to,
        cc,
        bcc,
        date,
        body,
        html_body,
        attachments: if attachments.is_empty() {
            None
        } else {
            Some(attachments)
        },
        is_read: flags.seen,
        is_starred: flags.flagged,
        labels: if labels.is_empty() { None } else { Some(labels) },
        ai_classification: None,
    })
}

fn normalize_date(header: &str) -> String {
    match dateparse(header) {
        Ok(ts) => match Utc.timestamp_opt(ts, 0).single() {
            Some(dt) => dt.to_rfc2822(),
            None => header.to_string(),
        },
        Err(_) => header.to_string(),
    }
}

fn parse_single_address(value: &str) -> Option<EmailAddress> {
    parse_address_list(value).into_iter().next()
}

fn parse_address_list(value: &str) -> Vec<EmailAddress> {
    let Ok(parsed) = addrparse(value) else {
        // Keep the raw value rather than dropping the recipient
        return vec![EmailAddress {
            name: None,
            address: value.trim().to_string(),
        }];
    };
    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => out.push(EmailAddress {
                name: info.display_name.clone(),
                address: info.addr.clone(),
            }),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(EmailAddress {
                        name: info.display_name.clone(),
                        address: info.addr.clone(),
                    });
                }
            }
        }
    }
    out
}

fn extract_part(parsed: &ParsedMail, mime: &str) -> Result<Option<String>, SyncError> {
    fn find_part(part: &ParsedMail, mime: &str) -> Result<Option<String>, SyncError> {
        if part.ctype.mimetype.eq_ignore_ascii_case(mime) {
            let body = part
                .get_body()
                .map_err(|e| SyncError::Parse(e.to_string()))?;
            return Ok(Some(body));
        }

        // Recursively search subparts
        for subpart in &part.subparts {
            if let Some(text) = find_part(subpart, mime)? {
                return Ok(Some(text));
            }
        }

        Ok(None)
    }

    find_part(parsed, mime)
}

fn extract_attachments(parsed: &ParsedMail) -> Result<Vec<Attachment>, SyncError> {
    let mut attachments = Vec::new();

    fn process_part(
        part: &ParsedMail,
        attachments: &mut Vec<Attachment>,
    ) -> Result<(), SyncError> {
        let disposition = part.get_content_disposition();

        if disposition.disposition == mailparse::DispositionType::Attachment {
            let filename = disposition
                .params
                .get("filename")
                .cloned()
                .unwrap_or_else(|| "unnamed_attachment".to_string());

            let size = part
                .get_body_raw()
                .map_err(|e| SyncError::Parse(e.to_string()))?
                .len() as u64;

            attachments.push(Attachment {
                id: format!("part-{}", attachments.len()),
                filename,
                mime_type: part.ctype.mimetype.clone(),
                size,
                // Content fetched on demand, never during sync
                content: None,
            });
        }

        // Recursively process subparts
        for subpart in &part.subparts {
            process_part(subpart, attachments)?;
        }

        Ok(())
    }

    process_part(parsed, &mut attachments)?;
    Ok(attachments)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: bob@example.com, Carol <carol@example.com>\r\n\
Subject: Lunch\r\n\
Date: Tue, 01 Jul 2025 10:00:00 +0000\r\n\
Content-Type: text/plain\r\n\
\r\n\
See you at noon.\r\n";

    #[test]
    fn normalizes_plain_message() {
        let meta = RawMeta::Imap {
            uid_validity: 7,
            uid: 42,
        };
        let email = normalize_message(
            "acct-1",
            &meta,
            SAMPLE,
            RemoteFlags {
                seen: true,
                flagged: false,
            },
            vec![],
        )
        .unwrap();

        assert_eq!(email.id, "imap:7:42");
        assert_eq!(email.account_id, "acct-1");
        assert_eq!(email.subject, "Lunch");
        assert_eq!(email.from.address, "alice@example.com");
        assert_eq!(email.from.name.as_deref(), Some("Alice"));
        assert_eq!(email.to.len(), 2);
        assert_eq!(email.body.trim(), "See you at noon.");
        assert!(email.is_read);
        assert!(!email.is_starred);
        assert!(email.ai_classification.is_none());
    }

    #[test]
    fn imap_id_is_epoch_scoped() {
        let a = stable_id(
            &RawMeta::Imap {
                uid_validity: 7,
                uid: 42,
            },
            &[],
        );
        let b = stable_id(
            &RawMeta::Imap {
                uid_validity: 8,
                uid: 42,
            },
            &[],
        );
        assert_ne!(a, b);
        assert_eq!(imap_parts(&a), Some((7, 42)));
    }

    #[test]
    fn pop3_hash_id_distinguishes_by_size() {
        let meta_a = RawMeta::Pop3 {
            uidl: None,
            size: 100,
        };
        let meta_b = RawMeta::Pop3 {
            uidl: None,
            size: 200,
        };
        // Same headers, different sizes: distinct until proven identical
        assert_ne!(stable_id(&meta_a, SAMPLE), stable_id(&meta_b, SAMPLE));
        assert_eq!(stable_id(&meta_a, SAMPLE), stable_id(&meta_a, SAMPLE));
    }

    #[test]
    fn pop3_uidl_wins_over_hash() {
        let meta = RawMeta::Pop3 {
            uidl: Some("tok123".into()),
            size: 100,
        };
        assert_eq!(stable_id(&meta, SAMPLE), "pop3:tok123");
    }

    #[test]
    fn attachment_content_stays_lazy() {
        let raw = b"From: a@b.c\r\n\
Subject: files\r\n\
Content-Type: multipart/mixed; boundary=\"xyz\"\r\n\
\r\n\
--xyz\r\n\
Content-Type: text/plain\r\n\
\r\n\
body text\r\n\
--xyz\r\n\
Content-Type: application/pdf\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
\r\n\
%PDF-1.4 fake\r\n\
--xyz--\r\n";
        let meta = RawMeta::Imap {
            uid_validity: 1,
            uid: 1,
        };
        let email =
            normalize_message("a", &meta, raw, RemoteFlags::default(), vec![]).unwrap();
        let atts = email.attachments.unwrap();
        assert_eq!(atts.len(), 1);
        assert_eq!(atts[0].filename, "report.pdf");
        assert_eq!(atts[0].mime_type, "application/pdf");
        assert!(atts[0].size > 0);
        assert!(atts[0].content.is_none());
        assert_eq!(email.body.trim(), "body text");
    }
}
