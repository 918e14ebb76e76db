//! Sent folder discovery and best-effort sent-copy archival
//!
//! IMAP defines no standard name for the folder holding sent mail, so the
//! resolver works through provider-specific candidate names, then the raw
//! folder listing, then a default. Providers are plain [`ProviderProfile`]
//! values selected by a host-name fingerprint; supporting a new provider
//! means adding a profile, not touching the resolution flow.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use crate::errors::{AppError, AppResult};
use crate::session::{FolderEntry, MailSession, Mailbox, SessionFactory, display_name};

/// Keywords marking a folder as holding sent mail in the raw listing
const SENT_KEYWORDS: [&str; 2] = ["sent", "envoy"];

/// Grace period for CLOSE/LOGOUT once the save budget is spent
const RELEASE_GRACE: Duration = Duration::from_secs(2);

/// Folder naming conventions of one mail provider
#[derive(Debug, Clone)]
pub struct ProviderProfile {
    pub name: &'static str,
    /// Lowercase substring of the IMAP host; empty matches every host
    pub host_fingerprint: &'static str,
    /// Names tried in order with a read-only SELECT
    pub candidates: &'static [&'static str],
    /// Used when neither candidates nor the listing yield a folder
    pub default_folder: &'static str,
    /// Absolute-path APPEND targets tried after the generic variants
    pub extra_append_targets: &'static [&'static str],
}

impl ProviderProfile {
    pub fn matches(&self, host: &str) -> bool {
        host.to_ascii_lowercase().contains(self.host_fingerprint)
    }
}

pub const INFOMANIAK: ProviderProfile = ProviderProfile {
    name: "infomaniak",
    host_fingerprint: "infomaniak",
    candidates: &[
        "Sent",
        "Sent Messages",
        "Sent Items",
        "INBOX.Sent",
        "INBOX.Sent Messages",
        "INBOX.Sent Items",
        "\"Sent Messages\"",
        "\"Sent\"",
        "\"Sent Items\"",
        "INBOX/\"Sent Messages\"",
        "INBOX/\"Sent\"",
        "INBOX/\"Sent Items\"",
        "/Sent Messages",
        "/Sent",
        "/Sent Items",
    ],
    default_folder: "Sent",
    extra_append_targets: &[
        "/INBOX/Sent",
        "/Sent",
        "/INBOX/Sent Messages",
        "/INBOX/\"Sent Messages\"",
    ],
};

pub const GMAIL: ProviderProfile = ProviderProfile {
    name: "gmail",
    host_fingerprint: "gmail",
    candidates: &["[Gmail]/Sent Mail", "[Google Mail]/Sent Mail", "Sent"],
    default_folder: "[Gmail]/Sent Mail",
    extra_append_targets: &[],
};

pub const GENERIC: ProviderProfile = ProviderProfile {
    name: "generic",
    host_fingerprint: "",
    candidates: &[
        "Sent",
        "\"Sent Messages\"",
        "Sent Items",
        "SENT",
        "\"Sent Mail\"",
        "Sent Mail",
        "\"Sent Items\"",
        "OUTBOX",
        "Outbox",
        "Sent-Mail",
    ],
    default_folder: "Sent",
    extra_append_targets: &[],
};

/// How a sent folder name was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A profile candidate accepted a read-only SELECT
    Candidate,
    /// Picked from the folder listing by attribute or keyword
    Listing,
    /// Nothing matched; the profile default
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFolder {
    pub name: String,
    pub via: Resolution,
}

/// One APPEND attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendTarget {
    pub folder: String,
    pub flags: Option<&'static str>,
}

/// Result of the best-effort sent-copy step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentCopyOutcome {
    Saved { folder: String },
    Failed { reason: String },
    Skipped,
}

/// Finds the sent folder on a live session and appends copies to it
#[derive(Debug, Clone)]
pub struct SentFolderResolver {
    profiles: Vec<ProviderProfile>,
    fallback: ProviderProfile,
}

impl Default for SentFolderResolver {
    fn default() -> Self {
        Self::new(vec![INFOMANIAK, GMAIL], GENERIC)
    }
}

impl SentFolderResolver {
    pub fn new(profiles: Vec<ProviderProfile>, fallback: ProviderProfile) -> Self {
        Self { profiles, fallback }
    }

    /// First profile whose fingerprint occurs in `host`, else the fallback
    pub fn profile_for(&self, host: &str) -> &ProviderProfile {
        self.profiles
            .iter()
            .find(|p| !p.host_fingerprint.is_empty() && p.matches(host))
            .unwrap_or(&self.fallback)
    }

    /// Determine the sent folder name for this server
    ///
    /// Order: profile candidates (read-only SELECT, closed right after),
    /// then listing entries flagged `\Sent` or named like a sent folder,
    /// then the profile default.
    ///
    /// # Errors
    ///
    /// - `Timeout` if the server stops answering mid-probe
    pub async fn resolve(
        &self,
        session: &mut dyn MailSession,
        profile: &ProviderProfile,
    ) -> AppResult<ResolvedFolder> {
        let listing = match session.list_folders().await {
            Ok(listing) => listing,
            Err(e @ AppError::Timeout(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "folder listing failed, trying candidates blind");
                Vec::new()
            }
        };
        for entry in &listing {
            debug!(folder = %entry.name, attributes = ?entry.attributes, "available folder");
        }

        for candidate in dedup(profile.candidates.iter().map(|c| normalize(c))) {
            match session.examine(&candidate).await {
                Ok(()) => {
                    if let Err(e) = session.close().await {
                        debug!(error = %e, "CLOSE after probing sent folder failed");
                    }
                    info!(folder = %candidate, profile = profile.name, "matched sent folder");
                    return Ok(ResolvedFolder {
                        name: candidate,
                        via: Resolution::Candidate,
                    });
                }
                Err(e @ AppError::Timeout(_)) => return Err(e),
                Err(e) => debug!(folder = %candidate, error = %e, "sent folder candidate rejected"),
            }
        }

        if let Some(name) = scan_listing(&listing) {
            info!(folder = %name, "found sent folder in listing");
            return Ok(ResolvedFolder {
                name,
                via: Resolution::Listing,
            });
        }

        info!(
            folder = profile.default_folder,
            profile = profile.name,
            "using default sent folder"
        );
        Ok(ResolvedFolder {
            name: profile.default_folder.to_owned(),
            via: Resolution::Default,
        })
    }

    /// APPEND variants for `folder`, in the order they are attempted
    pub fn append_targets(&self, profile: &ProviderProfile, folder: &str) -> Vec<AppendTarget> {
        let mut targets = vec![
            AppendTarget {
                folder: folder.to_owned(),
                flags: Some("\\Seen"),
            },
            AppendTarget {
                folder: folder.to_owned(),
                flags: None,
            },
        ];
        if !folder.starts_with("INBOX") {
            targets.push(AppendTarget {
                folder: format!("INBOX.{folder}"),
                flags: Some("\\Seen"),
            });
        }
        targets.extend(profile.extra_append_targets.iter().map(|t| AppendTarget {
            folder: (*t).to_owned(),
            flags: Some("\\Seen"),
        }));

        let mut unique: Vec<AppendTarget> = Vec::with_capacity(targets.len());
        for target in targets {
            let target = AppendTarget {
                folder: normalize(&target.folder),
                flags: target.flags,
            };
            if !unique.contains(&target) {
                unique.push(target);
            }
        }
        unique
    }

    /// Try each APPEND variant until the server accepts one
    ///
    /// # Errors
    ///
    /// - `Timeout` as soon as one attempt times out
    /// - `Protocol` listing every rejected attempt when all fail
    pub async fn append_copy(
        &self,
        session: &mut dyn MailSession,
        profile: &ProviderProfile,
        folder: &str,
        content: &[u8],
    ) -> AppResult<AppendTarget> {
        let mut errors = Vec::new();
        for (attempt, target) in self.append_targets(profile, folder).into_iter().enumerate() {
            match session.append(&target.folder, target.flags, content).await {
                Ok(()) => {
                    debug!(attempt = attempt + 1, folder = %target.folder, "sent copy appended");
                    return Ok(target);
                }
                Err(e @ AppError::Timeout(_)) => return Err(e),
                Err(e) => {
                    debug!(attempt = attempt + 1, folder = %target.folder, error = %e, "append attempt failed");
                    errors.push(format!("attempt {} ({}): {e}", attempt + 1, target.folder));
                }
            }
        }
        Err(AppError::Protocol(format!(
            "all append attempts failed: {}",
            errors.join(", ")
        )))
    }
}

/// Save a copy of an already-sent message on its own session and budget
///
/// Never fails: every problem, including the budget running out, is logged
/// and reported as [`SentCopyOutcome::Failed`].
pub async fn save_sent_copy(
    factory: Arc<dyn SessionFactory>,
    resolver: &SentFolderResolver,
    content: &[u8],
    budget: Duration,
) -> SentCopyOutcome {
    let deadline = Instant::now() + budget;
    let mut mailbox = match timeout_at(deadline, Mailbox::open(factory)).await {
        Ok(Ok(mailbox)) => mailbox,
        Ok(Err(e)) => return failed(format!("cannot open mail session: {e}")),
        Err(_) => return failed("timed out connecting to the IMAP server".to_owned()),
    };

    let outcome = match timeout_at(deadline, resolve_and_append(resolver, &mut mailbox, content)).await
    {
        Ok(Ok(target)) => {
            info!(folder = %target.folder, "saved copy to sent folder");
            SentCopyOutcome::Saved {
                folder: display_name(&target.folder),
            }
        }
        Ok(Err(e)) => failed(e.to_string()),
        Err(_) => failed(format!(
            "timed out after {}s saving to the sent folder",
            budget.as_secs_f32()
        )),
    };

    mailbox.release(RELEASE_GRACE).await;
    outcome
}

async fn resolve_and_append(
    resolver: &SentFolderResolver,
    mailbox: &mut Mailbox,
    content: &[u8],
) -> AppResult<AppendTarget> {
    let profile = resolver.profile_for(mailbox.host()).clone();
    debug!(profile = profile.name, host = mailbox.host(), "selected provider profile");
    let resolved = resolver.resolve(mailbox.session(), &profile).await?;
    debug!(folder = %resolved.name, via = ?resolved.via, "resolved sent folder");
    resolver
        .append_copy(mailbox.session(), &profile, &resolved.name, content)
        .await
}

fn failed(reason: String) -> SentCopyOutcome {
    warn!(%reason, "message was sent but could not be saved to the sent folder");
    SentCopyOutcome::Failed { reason }
}

/// The transport quotes folder names itself, so literal quotes are dropped
fn normalize(name: &str) -> String {
    name.replace('"', "")
}

fn dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for name in names {
        if !unique.contains(&name) {
            unique.push(name);
        }
    }
    unique
}

/// Listing fallback: a `\Sent` special-use folder, else a name with a sent keyword
fn scan_listing(listing: &[FolderEntry]) -> Option<String> {
    listing
        .iter()
        .find(|entry| {
            entry
                .attributes
                .iter()
                .any(|a| a.eq_ignore_ascii_case("\\Sent"))
        })
        .or_else(|| {
            listing.iter().find(|entry| {
                let lower = entry.display_name().to_lowercase();
                SENT_KEYWORDS.iter().any(|k| lower.contains(k))
            })
        })
        .map(|entry| entry.name.clone())
}
