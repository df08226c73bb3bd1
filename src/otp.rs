//! One-time login codes delivered by email.
//!
//! The login flow asks a [`CodeOracle`] for a code sent by the site after
//! the login started. [`MaildirCodeOracle`] polls a local maildir that a
//! mail fetcher keeps in sync.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use regex::Regex;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info};

static CODE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:confirmation|verification) code(?: is|:)?\s*([A-Za-z0-9]{6,12})")
        .expect("code pattern is valid")
});

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("Mailbox error: {0}")]
    Mailbox(#[from] std::io::Error),
    #[error("Mailbox task failed: {0}")]
    Task(String),
}

/// Which messages may carry the code.
#[derive(Debug, Clone)]
pub struct CodeFilter {
    /// Sender domain; subdomains also match.
    pub domain: String,
    /// Ignore messages dated before this instant.
    pub since: DateTime<Utc>,
}

/// Blocking poll for a login code.
#[async_trait]
pub trait CodeOracle: Send + Sync {
    /// Wait up to `timeout` for a code. `Ok(None)` when none arrived in time.
    async fn wait_for_code(
        &self,
        filter: &CodeFilter,
        timeout: Duration,
    ) -> Result<Option<String>, OtpError>;
}

/// Pull a code out of a subject or body.
///
/// Prefers an explicit "verification code: XXXX" phrase, then any line that
/// is a bare 6-12 character alphanumeric token mixing letters and digits.
pub fn extract_code(text: &str) -> Option<String> {
    if let Some(code) = CODE_PATTERN.captures(text).and_then(|c| c.get(1)) {
        return Some(code.as_str().to_string());
    }

    text.lines().map(str::trim).find_map(|line| {
        let plausible = (6..=12).contains(&line.len())
            && line.chars().all(|c| c.is_ascii_alphanumeric())
            && line.chars().any(|c| c.is_ascii_alphabetic())
            && line.chars().any(|c| c.is_ascii_digit());
        plausible.then(|| line.to_string())
    })
}

/// Whether `address` was sent from `domain` or one of its subdomains.
fn sender_matches(address: &str, domain: &str) -> bool {
    let Some((_, sender)) = address.rsplit_once('@') else {
        return false;
    };
    let sender = sender.to_lowercase();
    let expected = domain.to_lowercase();
    sender == expected || sender.ends_with(&format!(".{}", expected))
}

/// Code from one raw RFC 822 message, if it passes the filter.
/// Returns the message date alongside so callers can prefer newer mail.
fn code_from_message(raw: &[u8], filter: &CodeFilter) -> Option<(i64, String)> {
    let message = MessageParser::default().parse(raw)?;

    let from = message.from()?.first()?.address()?;
    if !sender_matches(from, &filter.domain) {
        return None;
    }

    // Undated mail is treated as recent.
    let sent_at = message
        .date()
        .map(|d| d.to_timestamp())
        .unwrap_or(i64::MAX);
    if sent_at < filter.since.timestamp() {
        return None;
    }

    let code = message
        .subject()
        .and_then(extract_code)
        .or_else(|| message.body_text(0).and_then(|body| extract_code(&body)))?;
    Some((sent_at, code))
}

/// Polls a maildir (`new/` and `cur/`, or a flat directory of messages).
#[derive(Debug, Clone)]
pub struct MaildirCodeOracle {
    root: PathBuf,
    poll_interval: Duration,
}

impl MaildirCodeOracle {
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            root: root.into(),
            poll_interval,
        }
    }

    /// Newest matching code currently in the mailbox.
    pub fn scan(root: &Path, filter: &CodeFilter) -> Result<Option<String>, OtpError> {
        let subdirs: Vec<PathBuf> = ["new", "cur"]
            .iter()
            .map(|d| root.join(d))
            .filter(|d| d.is_dir())
            .collect();
        let dirs = if subdirs.is_empty() {
            vec![root.to_path_buf()]
        } else {
            subdirs
        };

        let mut best: Option<(i64, String)> = None;
        for dir in dirs {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if !path.is_file() {
                    continue;
                }
                let raw = std::fs::read(&path)?;
                if let Some((sent_at, code)) = code_from_message(&raw, filter) {
                    debug!("Found candidate code in {}", path.display());
                    if best.as_ref().is_none_or(|(t, _)| sent_at > *t) {
                        best = Some((sent_at, code));
                    }
                }
            }
        }
        Ok(best.map(|(_, code)| code))
    }
}

#[async_trait]
impl CodeOracle for MaildirCodeOracle {
    async fn wait_for_code(
        &self,
        filter: &CodeFilter,
        timeout: Duration,
    ) -> Result<Option<String>, OtpError> {
        let deadline = Instant::now() + timeout;
        info!(
            "Waiting up to {:?} for a code from {} in {}",
            timeout,
            filter.domain,
            self.root.display()
        );

        loop {
            let root = self.root.clone();
            let scan_filter = filter.clone();
            let code = tokio::task::spawn_blocking(move || Self::scan(&root, &scan_filter))
                .await
                .map_err(|e| OtpError::Task(e.to_string()))??;
            if code.is_some() {
                return Ok(code);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(from: &str, date: &str, subject: &str, body: &str) -> String {
        format!(
            "From: {from}\r\nTo: me@example.test\r\nDate: {date}\r\nSubject: {subject}\r\n\
             Content-Type: text/plain; charset=utf-8\r\n\r\n{body}\r\n"
        )
    }

    fn filter() -> CodeFilter {
        CodeFilter {
            domain: "x.com".to_string(),
            since: Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_extract_code_phrases() {
        assert_eq!(
            extract_code("Your X confirmation code is abc123xy").as_deref(),
            Some("abc123xy")
        );
        assert_eq!(
            extract_code("Verification code: 884412").as_deref(),
            Some("884412")
        );
        assert_eq!(
            extract_code("Hello\n\n  k4j2h9p1  \nThanks").as_deref(),
            Some("k4j2h9p1")
        );
        assert_eq!(extract_code("Hello there\n123456\nsignature"), None);
        assert_eq!(extract_code(""), None);
    }

    #[test]
    fn test_sender_matches_subdomains() {
        assert!(sender_matches("info@x.com", "x.com"));
        assert!(sender_matches("verify@mail.X.com", "x.com"));
        assert!(!sender_matches("info@notx.com", "x.com"));
        assert!(!sender_matches("no-at-sign", "x.com"));
    }

    #[test]
    fn test_scan_prefers_newest_matching_message() {
        let dir = tempfile::tempdir().unwrap();
        let new = dir.path().join("new");
        std::fs::create_dir_all(&new).unwrap();
        std::fs::create_dir_all(dir.path().join("cur")).unwrap();

        std::fs::write(
            new.join("1"),
            message(
                "X <info@x.com>",
                "Sun, 01 Feb 2026 01:00:00 +0000",
                "Your confirmation code is older111",
                "",
            ),
        )
        .unwrap();
        std::fs::write(
            new.join("2"),
            message(
                "X <info@x.com>",
                "Sun, 01 Feb 2026 02:00:00 +0000",
                "Login attempt",
                "Your verification code is newer222",
            ),
        )
        .unwrap();
        std::fs::write(
            new.join("3"),
            message(
                "Someone <a@elsewhere.test>",
                "Sun, 01 Feb 2026 03:00:00 +0000",
                "Your confirmation code is wrong333",
                "",
            ),
        )
        .unwrap();
        std::fs::write(
            new.join("4"),
            message(
                "X <info@x.com>",
                "Sat, 31 Jan 2026 23:00:00 +0000",
                "Your confirmation code is stale444",
                "",
            ),
        )
        .unwrap();

        let code = MaildirCodeOracle::scan(dir.path(), &filter()).unwrap();
        assert_eq!(code.as_deref(), Some("newer222"));
    }

    #[tokio::test]
    async fn test_wait_for_code_times_out_on_empty_mailbox() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = MaildirCodeOracle::new(dir.path(), Duration::from_millis(10));
        let code = oracle
            .wait_for_code(&filter(), Duration::from_millis(30))
            .await
            .unwrap();
        assert!(code.is_none());
    }
}
