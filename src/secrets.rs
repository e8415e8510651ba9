// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Secrets package retrieval.
//!
//! Sensitive dotfiles are not tracked with the rest of the configuration
//! bundle. They live in a password protected ZIP archive on a remote host
//! behind HTTP Basic Authentication. Fetching them takes three pieces of
//! information: a username and password for the remote host, and a separate
//! passphrase for the archive itself.
//!
//! Credentials are obtained through a [`CredentialProvider`], and the
//! download itself goes through a [`Fetch`] implementation, so neither the
//! terminal nor the network are required to exercise this module.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    fmt::{Debug, Formatter, Result as FmtResult},
    fs::{create_dir_all, write},
    io::{Cursor, Read},
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, instrument};
use zip::{result::ZipError, ZipArchive};

/// Default upper bound on the size of a downloaded secrets package.
pub const MAX_PACKAGE_SIZE: u64 = 256 * 1024 * 1024;

/// Credentials needed to download and unpack the secrets package.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Basic authentication username.
    pub username: String,

    /// Basic authentication password.
    pub password: String,

    /// Passphrase of the archive itself.
    pub passphrase: String,
}

impl Credentials {
    /// Construct new set of credentials.
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            passphrase: passphrase.into(),
        }
    }

    /// Value of the `Authorization` header for these credentials.
    pub fn basic_auth(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {token}")
    }
}

impl Debug for Credentials {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}

/// Source of credentials for the secrets package.
pub trait CredentialProvider {
    /// Obtain username, password, and archive passphrase.
    fn provide(&self) -> Result<Credentials>;
}

/// Prompt user for credentials on the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct InquirePrompter;

impl CredentialProvider for InquirePrompter {
    fn provide(&self) -> Result<Credentials> {
        let username = Text::new("Basic auth username:").prompt()?;
        let password = Password::new("Basic auth password:")
            .without_confirmation()
            .prompt()?;
        let passphrase = Password::new("Secrets package password:")
            .without_confirmation()
            .prompt()?;

        Ok(Credentials {
            username,
            password,
            passphrase,
        })
    }
}

/// Hand out a fixed set of credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedCredentials(pub Credentials);

impl CredentialProvider for FixedCredentials {
    fn provide(&self) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}

/// Raw response of a secrets package request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// HTTP status code.
    pub status: u16,

    /// HTTP reason phrase.
    pub reason: String,

    /// Response body.
    pub body: Vec<u8>,
}

/// Perform authenticated GET request.
pub trait Fetch {
    /// Fetch `url` sending `authorization` as the `Authorization` header.
    ///
    /// Non-success status codes are not errors at this layer. They are
    /// reported through [`Payload::status`].
    fn get(&self, url: &str, authorization: &str) -> Result<Payload>;
}

/// Blocking HTTP client through ureq.
#[derive(Debug, Clone)]
pub struct UreqFetch {
    agent: ureq::Agent,
    max_size: u64,
}

impl UreqFetch {
    /// Construct new HTTP client.
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            max_size: MAX_PACKAGE_SIZE,
        }
    }

    /// Refuse response bodies larger than `max_size` bytes.
    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }
}

impl Default for UreqFetch {
    fn default() -> Self {
        Self::new()
    }
}

impl Fetch for UreqFetch {
    fn get(&self, url: &str, authorization: &str) -> Result<Payload> {
        let response = match self
            .agent
            .get(url)
            .set("Authorization", authorization)
            .call()
        {
            Ok(response) => response,
            Err(ureq::Error::Status(_, response)) => response,
            Err(err) => {
                return Err(SecretsError::Transport {
                    source: Box::new(err),
                    url: url.into(),
                })
            }
        };

        let status = response.status();
        let reason = response.status_text().to_string();
        let mut body = Vec::new();
        response
            .into_reader()
            .take(self.max_size.saturating_add(1))
            .read_to_end(&mut body)
            .map_err(|err| SecretsError::ReadBody {
                source: err,
                url: url.into(),
            })?;

        // INVARIANT: Never hand a truncated package to extraction.
        if body.len() as u64 > self.max_size {
            return Err(SecretsError::TooLarge {
                url: url.into(),
                limit: self.max_size,
            });
        }

        Ok(Payload {
            status,
            reason,
            body,
        })
    }
}

/// Normalize secrets package location into a full URL.
///
/// Locations without a scheme are treated as plain HTTP.
pub fn normalize_url(url: impl AsRef<str>) -> String {
    let url = url.as_ref().trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }

    format!("http://{url}")
}

/// Download secrets package.
///
/// # Errors
///
/// - Return [`SecretsError::Download`] if the server answers with anything
///   other than 200.
/// - Return [`SecretsError::Transport`] if no answer could be obtained.
#[instrument(skip(fetcher, credentials), level = "debug")]
pub fn download(fetcher: &impl Fetch, url: &str, credentials: &Credentials) -> Result<Vec<u8>> {
    let url = normalize_url(url);
    info!("download secrets package from {url}");
    let payload = fetcher.get(&url, &credentials.basic_auth())?;
    if payload.status != 200 {
        return Err(SecretsError::Download {
            status: payload.status,
            reason: payload.reason,
        });
    }

    debug!("received {} bytes", payload.body.len());
    Ok(payload.body)
}

/// Extract password protected archive into `target`.
///
/// Entries that are not encrypted are accepted as well. Entries whose names
/// would escape `target` are rejected. Each entry is fully read and checked
/// before anything is written for it.
///
/// # Errors
///
/// - Return [`SecretsError::Extract`] if archive is corrupt, passphrase is
///   wrong, or an entry fails its integrity check.
/// - Return [`SecretsError::ExtractEntry`] if an entry cannot be written.
/// - Return [`SecretsError::UnsafeEntry`] if an entry escapes `target`.
#[instrument(skip(archive, passphrase, target), level = "debug")]
pub fn extract(archive: &[u8], passphrase: &str, target: &Path) -> Result<()> {
    info!("extract secrets package into {:?}", target.display());
    let mut archive = ZipArchive::new(Cursor::new(archive))?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index_decrypt(index, passphrase.as_bytes())?;
        let Some(name) = entry.enclosed_name() else {
            return Err(SecretsError::UnsafeEntry(entry.name().to_string()));
        };
        let path = target.join(name);
        let entry_err = |err| SecretsError::ExtractEntry {
            source: err,
            path: path.clone(),
        };

        if entry.is_dir() {
            debug!("create {:?}", path.display());
            create_dir_all(&path).map_err(entry_err)?;
            continue;
        }

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).map_err(ZipError::Io)?;

        if let Some(parent) = path.parent() {
            create_dir_all(parent).map_err(entry_err)?;
        }

        debug!("write {:?}", path.display());
        write(&path, &contents).map_err(entry_err)?;
    }

    Ok(())
}

/// Fetch secrets package and unpack it into `target`.
///
/// Prompts for credentials through `provider`, downloads the package at
/// `url`, then extracts it with the archive passphrase. Nothing is written
/// to disk unless the download succeeds.
///
/// # Errors
///
/// - Return [`SecretsError`] for any prompt, download, or extraction
///   failure.
#[instrument(skip(fetcher, provider, target), level = "debug")]
pub fn fetch_secrets(
    fetcher: &impl Fetch,
    provider: &impl CredentialProvider,
    url: &str,
    target: &Path,
) -> Result<()> {
    let credentials = provider.provide()?;

    let style = ProgressStyle::with_template("{spinner:.green} {elapsed_precise:.green}  {msg}")?;
    let bar = ProgressBar::new_spinner().with_style(style);
    bar.set_message(normalize_url(url));
    bar.enable_steady_tick(Duration::from_millis(100));
    let archive = download(fetcher, url, &credentials);
    bar.finish_and_clear();

    extract(&archive?, &credentials.passphrase, target)
}

/// Secrets package error types.
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    /// Interactive prompt failed or was cancelled.
    #[error(transparent)]
    Prompt(#[from] inquire::InquireError),

    /// Request could not be completed.
    #[error("failed to request secrets package at {url}")]
    Transport {
        #[source]
        source: Box<ureq::Error>,
        url: String,
    },

    /// Response body could not be read.
    #[error("failed to read secrets package from {url}")]
    ReadBody {
        #[source]
        source: std::io::Error,
        url: String,
    },

    /// Response body exceeds size limit.
    #[error("secrets package at {url} is larger than {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    /// Server refused to hand out the secrets package.
    #[error("error during secrets package download: {status} {reason}")]
    Download { status: u16, reason: String },

    /// Archive is corrupt or cannot be decrypted.
    #[error("error during secrets package extraction")]
    Extract(#[from] zip::result::ZipError),

    /// Archive entry cannot be unpacked.
    #[error("failed to extract secrets package entry to {:?}", path.display())]
    ExtractEntry {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Archive entry points outside of the extraction directory.
    #[error("secrets package entry {0:?} escapes extraction directory")]
    UnsafeEntry(String),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),
}

/// Friendly result alias :3
pub type Result<T, E = SecretsError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use simple_test_case::test_case;
    use std::{
        cell::RefCell,
        fs::read_to_string,
        io::{BufRead, BufReader, Write},
        net::TcpListener,
        thread::{self, JoinHandle},
    };
    use zip::{unstable::write::FileOptionsExt, write::SimpleFileOptions, ZipWriter};

    struct CannedFetch {
        payload: Payload,
        seen: RefCell<Vec<(String, String)>>,
    }

    impl CannedFetch {
        fn new(status: u16, reason: &str, body: Vec<u8>) -> Self {
            Self {
                payload: Payload {
                    status,
                    reason: reason.into(),
                    body,
                },
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl Fetch for CannedFetch {
        fn get(&self, url: &str, authorization: &str) -> Result<Payload> {
            self.seen
                .borrow_mut()
                .push((url.to_string(), authorization.to_string()));
            Ok(self.payload.clone())
        }
    }

    fn credentials() -> FixedCredentials {
        FixedCredentials(Credentials::new("user", "pass", "hunter2"))
    }

    fn encrypted_archive(passphrase: &[u8]) -> anyhow::Result<Vec<u8>> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().with_deprecated_encryption(passphrase);
        writer.start_file("ssh/config", options)?;
        writer.write_all(b"Host homeserver\n")?;
        writer.start_file("netrc", options)?;
        writer.write_all(b"machine homeserver\n")?;

        Ok(writer.finish()?.into_inner())
    }

    fn passes_check_byte(archive: &[u8], passphrase: &str) -> bool {
        let Ok(mut zip) = ZipArchive::new(Cursor::new(archive)) else {
            return false;
        };
        let passes = zip.by_index_decrypt(0, passphrase.as_bytes()).is_ok();
        passes
    }

    fn serve_once(body: Vec<u8>) -> anyhow::Result<(String, JoinHandle<std::io::Result<()>>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let url = format!("http://{}/secrets.zip", listener.local_addr()?);
        let server = thread::spawn(move || -> std::io::Result<()> {
            let (mut stream, _) = listener.accept()?;
            let mut reader = BufReader::new(stream.try_clone()?);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line)? == 0 || line == "\r\n" {
                    break;
                }
            }

            let head = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            stream.write_all(head.as_bytes())?;
            stream.write_all(&body)?;
            Ok(())
        });

        Ok((url, server))
    }

    #[test_case("http://secrets.homeserver.lc/secrets.zip", "http://secrets.homeserver.lc/secrets.zip"; "plain http kept")]
    #[test_case("https://host/a/b.zip", "https://host/a/b.zip"; "https and nested path kept")]
    #[test_case("host/secrets.zip", "http://host/secrets.zip"; "missing scheme defaults to http")]
    #[test]
    fn normalize_secrets_url(url: &str, expect: &str) {
        assert_eq!(normalize_url(url), expect);
    }

    #[test]
    fn basic_auth_header() {
        let creds = Credentials::new("user", "pass", "whatever");
        assert_eq!(creds.basic_auth(), "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let output = format!("{:?}", Credentials::new("user", "pass", "hunter2"));
        assert!(output.contains("user"));
        assert!(!output.contains("pass\""));
        assert!(!output.contains("hunter2"));
    }

    #[test]
    fn unauthorized_download_skips_extraction() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = root.path().join("dotfiles");
        let fetcher = CannedFetch::new(401, "Unauthorized", Vec::new());

        let result = fetch_secrets(&fetcher, &credentials(), "host/secrets.zip", &target);

        assert!(matches!(
            result,
            Err(SecretsError::Download { status: 401, ref reason }) if reason == "Unauthorized"
        ));
        assert!(!target.exists());
        assert_eq!(
            fetcher.seen.borrow().as_slice(),
            &[("http://host/secrets.zip".to_string(), "Basic dXNlcjpwYXNz".to_string())]
        );

        Ok(())
    }

    #[test]
    fn garbage_body_fails_extraction() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = root.path().join("dotfiles");
        let fetcher = CannedFetch::new(200, "OK", b"definitely not a zip".to_vec());

        let result = fetch_secrets(&fetcher, &credentials(), "host/secrets.zip", &target);

        assert!(matches!(result, Err(SecretsError::Extract(_))));
        assert!(!target.exists());

        Ok(())
    }

    #[test]
    fn encrypted_archive_is_unpacked() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let target = root.path().join("dotfiles");
        let fetcher = CannedFetch::new(200, "OK", encrypted_archive(b"hunter2")?);

        fetch_secrets(&fetcher, &credentials(), "host/secrets.zip", &target)?;

        assert_eq!(
            read_to_string(target.join("ssh").join("config"))?,
            "Host homeserver\n"
        );
        assert_eq!(read_to_string(target.join("netrc"))?, "machine homeserver\n");

        Ok(())
    }

    #[test]
    fn wrong_passphrase_fails_extraction() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let archive = encrypted_archive(b"correct horse")?;

        let result = extract(&archive, "battery staple", root.path());

        assert!(matches!(result, Err(SecretsError::Extract(_))));

        Ok(())
    }

    #[test]
    fn corrupt_entry_behind_lucky_passphrase_is_not_written() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let archive = encrypted_archive(b"correct horse")?;

        // ZipCrypto only checks one byte of the key up front, so some wrong
        // passphrases get through to the integrity check.
        let lucky = (0..100_000)
            .map(|attempt| format!("wrong-{attempt}"))
            .find(|passphrase| passes_check_byte(&archive, passphrase))
            .ok_or_else(|| anyhow::anyhow!("no passphrase got past the check byte"))?;

        let result = extract(&archive, &lucky, root.path());

        assert!(matches!(result, Err(SecretsError::Extract(_))));
        assert!(!root.path().join("ssh").exists());

        Ok(())
    }

    #[test]
    fn oversized_package_is_refused() -> anyhow::Result<()> {
        let (url, server) = serve_once(vec![b'x'; 32])?;

        let result = UreqFetch::new().with_max_size(16).get(&url, "Basic dXNlcjpwYXNz");

        assert!(matches!(result, Err(SecretsError::TooLarge { limit: 16, .. })));
        server
            .join()
            .map_err(|_| anyhow::anyhow!("server panicked"))??;

        Ok(())
    }

    #[test]
    fn package_at_size_limit_is_accepted() -> anyhow::Result<()> {
        let (url, server) = serve_once(vec![b'x'; 16])?;

        let payload = UreqFetch::new().with_max_size(16).get(&url, "Basic dXNlcjpwYXNz")?;

        assert_eq!(payload.status, 200);
        assert_eq!(payload.body, vec![b'x'; 16]);
        server
            .join()
            .map_err(|_| anyhow::anyhow!("server panicked"))??;

        Ok(())
    }
}
