//! Host profile configuration.
//!
//! This module loads the list of connectable hosts from a plain-text file.
//! Each whitespace-delimited record is a comma-separated list of `key=value`
//! tokens, for example:
//!
//! ```text
//! host=web1.example.com,port=22,user=alice,pass=secret,label=web
//! host=db1.example.com,port=2222,user=bob,key=/home/bob/.ssh/id_ed25519,label=db
//! ```
//!
//! A malformed or duplicate record is skipped with a diagnostic naming the
//! record; it never aborts the rest of the load.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that abort a profile load entirely.
///
/// Per-record problems are not in here; they are reported as
/// [`RecordError`] entries in the [`LoadOutcome`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read at all.
    #[error("cannot read host config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A diagnosable problem with one config record.
#[derive(Debug, Clone)]
pub struct RecordError {
    /// Zero-based index of the record within the file.
    pub index: usize,
    /// The offending record text (truncated for display).
    pub record: String,
    /// Why the record was rejected.
    pub reason: String,
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "record {} ({:?}) rejected: {}",
            self.index, self.record, self.reason
        )
    }
}

/// Result of loading a profile file: the usable profiles plus diagnostics
/// for every record that was skipped.
#[derive(Debug)]
pub struct LoadOutcome {
    /// Profiles that parsed and validated, in file order.
    pub profiles: Vec<HostProfile>,
    /// Records that were rejected, with the reason for each.
    pub skipped: Vec<RecordError>,
}

/// Authentication material for one host.
///
/// Treated as an opaque handle everywhere outside the SSH dialer. The
/// `Debug` impl redacts secret content so profiles can be logged safely.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Password authentication.
    Password(String),
    /// Private key file authentication.
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => write!(f, "Password(<redacted>)"),
            Credential::KeyFile { path, .. } => write!(f, "KeyFile({})", path.display()),
        }
    }
}

/// A validated, immutable descriptor of one connectable remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostProfile {
    /// Unique identifier within one load. Defaults to the host name when the
    /// record carries no explicit `id=` token.
    pub id: String,
    /// Host name or address to dial.
    pub host: String,
    /// TCP port, 1-65535.
    pub port: u16,
    /// Remote user name.
    pub username: String,
    /// Authentication material.
    pub credential: Credential,
    /// Human-facing label shown next to output.
    pub label: String,
}

impl HostProfile {
    /// Convenience constructor for password-authenticated profiles.
    pub fn password(
        id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            host: host.into(),
            port,
            username: username.into(),
            credential: Credential::Password(password.into()),
        }
    }

    /// The `host:port` dial address.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Loads host profiles from `path`.
///
/// The path is an explicit parameter; nothing is derived from the
/// executable location or other process-wide state.
pub fn load_profiles(path: impl AsRef<Path>) -> Result<LoadOutcome, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let outcome = parse_profiles(&text);
    tracing::info!(
        path = %path.display(),
        loaded = outcome.profiles.len(),
        skipped = outcome.skipped.len(),
        "Loaded host profiles"
    );
    Ok(outcome)
}

/// Parses profile records from text.
///
/// Records are whitespace-delimited; `#` starts a comment that runs to the
/// end of the line. Duplicate ids reject the later record, never silently
/// overwrite the earlier one.
pub fn parse_profiles(text: &str) -> LoadOutcome {
    let mut profiles = Vec::new();
    let mut skipped = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    let records = text
        .lines()
        .map(|line| line.split('#').next().unwrap_or(""))
        .flat_map(|line| line.split_whitespace())
        .enumerate();

    for (index, raw) in records {
        match parse_record(raw) {
            Ok(profile) => {
                if seen.contains(&profile.id) {
                    let err = RecordError {
                        index,
                        record: excerpt(raw),
                        reason: format!("duplicate profile id {:?}", profile.id),
                    };
                    tracing::warn!(%err, "Skipping host record");
                    skipped.push(err);
                } else {
                    seen.insert(profile.id.clone());
                    profiles.push(profile);
                }
            }
            Err(reason) => {
                let err = RecordError {
                    index,
                    record: excerpt(raw),
                    reason,
                };
                tracing::warn!(%err, "Skipping host record");
                skipped.push(err);
            }
        }
    }

    LoadOutcome { profiles, skipped }
}

/// Longest record excerpt kept in diagnostics.
const EXCERPT_LEN: usize = 64;

fn excerpt(raw: &str) -> String {
    if raw.len() <= EXCERPT_LEN {
        return raw.to_string();
    }
    // Back off to a char boundary so multi-byte text never splits.
    let cut = (0..=EXCERPT_LEN)
        .rev()
        .find(|&i| raw.is_char_boundary(i))
        .unwrap_or(0);
    format!("{}...", &raw[..cut])
}

/// Parses one comma-separated `key=value` record.
///
/// Keys may appear in any order. `host`, `port`, `user` and one of
/// `pass`/`key` are required; `id`, `label` and `passphrase` are optional.
fn parse_record(raw: &str) -> Result<HostProfile, String> {
    let mut id = None;
    let mut host = None;
    let mut port = None;
    let mut username = None;
    let mut password = None;
    let mut key_path: Option<PathBuf> = None;
    let mut passphrase = None;
    let mut label = None;

    for token in raw.split(',') {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| format!("token {:?} is not key=value", token))?;
        let value = value.trim();
        match key.trim() {
            "id" => id = Some(value.to_string()),
            "host" => host = Some(value.to_string()),
            "port" => {
                let parsed: u16 = value
                    .parse()
                    .map_err(|_| format!("port {:?} is not a number in 1-65535", value))?;
                if parsed == 0 {
                    return Err("port 0 is not dialable".to_string());
                }
                port = Some(parsed);
            }
            "user" => username = Some(value.to_string()),
            "pass" => password = Some(value.to_string()),
            "key" => key_path = Some(PathBuf::from(value)),
            "passphrase" => passphrase = Some(value.to_string()),
            "label" => label = Some(value.to_string()),
            other => return Err(format!("unknown key {:?}", other)),
        }
    }

    let host = host.ok_or("missing host=")?;
    let port = port.ok_or("missing port=")?;
    let username = username.ok_or("missing user=")?;
    if host.is_empty() {
        return Err("empty host=".to_string());
    }
    if username.is_empty() {
        return Err("empty user=".to_string());
    }

    let credential = match (password, key_path) {
        (Some(_), Some(_)) => return Err("both pass= and key= given".to_string()),
        (Some(pass), None) => Credential::Password(pass),
        (None, Some(path)) => Credential::KeyFile { path, passphrase },
        (None, None) => return Err("missing pass= or key=".to_string()),
    };

    let id = id.unwrap_or_else(|| host.clone());
    let label = label.unwrap_or_else(|| id.clone());

    Ok(HostProfile {
        id,
        host,
        port,
        username,
        credential,
        label,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_single_record() {
        let outcome = parse_profiles("host=host1,port=22,user=alice,pass=secretA,label=lbl1");
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.profiles.len(), 1);

        let p = &outcome.profiles[0];
        assert_eq!(p.id, "host1");
        assert_eq!(p.host, "host1");
        assert_eq!(p.port, 22);
        assert_eq!(p.username, "alice");
        assert_eq!(p.credential, Credential::Password("secretA".to_string()));
        assert_eq!(p.label, "lbl1");
        assert_eq!(p.addr(), "host1:22");
    }

    #[test]
    fn test_parse_key_order_insensitive() {
        let outcome = parse_profiles("user=bob,label=db,host=db1,pass=pw,port=2222");
        assert_eq!(outcome.profiles.len(), 1);
        assert_eq!(outcome.profiles[0].port, 2222);
    }

    #[test]
    fn test_parse_multiple_records_and_comments() {
        let text = "\
# fleet hosts
host=host1,port=22,user=alice,pass=secretA,label=lbl1
host=host2,port=2222,user=bob,pass=secretB,label=lbl2  # staging
";
        let outcome = parse_profiles(text);
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.profiles.len(), 2);
        assert_eq!(outcome.profiles[0].id, "host1");
        assert_eq!(outcome.profiles[1].id, "host2");
    }

    #[test]
    fn test_malformed_record_skipped_load_continues() {
        let text = "host=good1,port=22,user=a,pass=p not-a-record host=good2,port=22,user=b,pass=q";
        let outcome = parse_profiles(text);
        assert_eq!(outcome.profiles.len(), 2);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].record, "not-a-record");
        assert!(outcome.skipped[0].reason.contains("key=value"));
    }

    #[test]
    fn test_long_multibyte_record_skipped_without_panic() {
        // The diagnostic excerpt cut must land on a char boundary even
        // when the length limit falls inside a multi-byte character.
        let record = format!("{}日本語のラベル", "x".repeat(63));
        let outcome = parse_profiles(&record);
        assert!(outcome.profiles.is_empty());
        assert_eq!(outcome.skipped.len(), 1);
        let excerpted = &outcome.skipped[0].record;
        assert!(excerpted.ends_with("..."));
        assert!(excerpted.len() <= EXCERPT_LEN + 3);
    }

    #[test]
    fn test_duplicate_id_rejected_not_overwritten() {
        let text = "host=h1,port=22,user=first,pass=p host=h1,port=22,user=second,pass=q";
        let outcome = parse_profiles(text);
        assert_eq!(outcome.profiles.len(), 1);
        assert_eq!(outcome.profiles[0].username, "first");
        assert_eq!(outcome.skipped.len(), 1);
        assert!(outcome.skipped[0].reason.contains("duplicate"));
    }

    #[test]
    fn test_port_validation() {
        let zero = parse_profiles("host=h,port=0,user=a,pass=p");
        assert!(zero.profiles.is_empty());
        assert!(zero.skipped[0].reason.contains("not dialable"));

        let huge = parse_profiles("host=h,port=70000,user=a,pass=p");
        assert!(huge.profiles.is_empty());
        assert!(huge.skipped[0].reason.contains("1-65535"));
    }

    #[test]
    fn test_missing_fields() {
        for (text, needle) in [
            ("port=22,user=a,pass=p", "missing host="),
            ("host=h,user=a,pass=p", "missing port="),
            ("host=h,port=22,pass=p", "missing user="),
            ("host=h,port=22,user=a", "missing pass= or key="),
        ] {
            let outcome = parse_profiles(text);
            assert!(outcome.profiles.is_empty(), "{} parsed", text);
            assert!(
                outcome.skipped[0].reason.contains(needle),
                "{:?} missing {:?}",
                outcome.skipped[0].reason,
                needle
            );
        }
    }

    #[test]
    fn test_key_file_credential() {
        let outcome =
            parse_profiles("host=h,port=22,user=a,key=/tmp/id_ed25519,passphrase=hunter2");
        assert_eq!(outcome.profiles.len(), 1);
        match &outcome.profiles[0].credential {
            Credential::KeyFile { path, passphrase } => {
                assert_eq!(path, &PathBuf::from("/tmp/id_ed25519"));
                assert_eq!(passphrase.as_deref(), Some("hunter2"));
            }
            other => panic!("unexpected credential {:?}", other),
        }
    }

    #[test]
    fn test_conflicting_credentials_rejected() {
        let outcome = parse_profiles("host=h,port=22,user=a,pass=p,key=/tmp/k");
        assert!(outcome.profiles.is_empty());
        assert!(outcome.skipped[0].reason.contains("both"));
    }

    #[test]
    fn test_debug_redacts_password() {
        let p = HostProfile::password("h1", "h1", 22, "alice", "supersecret");
        let dump = format!("{:?}", p);
        assert!(!dump.contains("supersecret"));
        assert!(dump.contains("<redacted>"));
    }

    #[test]
    fn test_load_profiles_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host=host1,port=22,user=alice,pass=secretA,label=lbl1").unwrap();
        writeln!(file, "host=host2,port=2222,user=bob,pass=secretB,label=lbl2").unwrap();
        file.flush().unwrap();

        let outcome = load_profiles(file.path()).unwrap();
        assert_eq!(outcome.profiles.len(), 2);
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn test_load_profiles_missing_file() {
        let result = load_profiles(Path::new("/nonexistent/hosts.conf"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }
}
