//! IMAP client using async-imap
//!
//! Implements [`MailClient`] over a single TLS session. On servers that
//! advertise `X-GM-EXT-1` the native id is `X-GM-MSGID` and labels come from
//! `X-GM-LABELS`; elsewhere the native id is `UIDVALIDITY:UID` and only flags
//! are reconciled.

use crate::mail::{
    config::{ImapConfig, SecurityType},
    uid_set, BodyRow, FolderStatus, HeaderRow, IdleEvent, LabelRow, MailClient, MailError,
    MailResult, MsgidRow, RemoteFolder,
};
use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Fetch, Flag, NameAttribute};
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncWrite};
use futures::TryStreamExt;
use std::fmt::Debug;
use std::time::Duration;
use tokio_util::compat::TokioAsyncReadCompatExt;

type TlsStream = async_native_tls::TlsStream<tokio_util::compat::Compat<tokio::net::TcpStream>>;

const MSGID_QUERY: &str = "(UID BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])";
const HEADERS_QUERY: &str = "(UID INTERNALDATE RFC822.SIZE RFC822.HEADER)";
const GMAIL_HEADERS_QUERY: &str = "(UID INTERNALDATE RFC822.SIZE RFC822.HEADER X-GM-MSGID)";
const BODIES_QUERY: &str = "(UID BODY.PEEK[])";
const LABELS_QUERY: &str = "(UID FLAGS)";
const GMAIL_LABELS_QUERY: &str = "(UID FLAGS X-GM-LABELS)";
const GMAIL_CAPABILITY: &str = "X-GM-EXT-1";

fn imap_err(e: async_imap::error::Error) -> MailError {
    MailError::Imap(e.to_string())
}

/// Reject folder names that could smuggle extra IMAP commands
fn check_folder_name(folder: &str) -> MailResult<&str> {
    if folder.is_empty() || folder.contains(['\r', '\n', '\0']) {
        return Err(MailError::Imap(format!("invalid folder name {:?}", folder)));
    }
    Ok(folder)
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

#[allow(unreachable_patterns)]
fn attribute_name(attr: &NameAttribute<'_>) -> String {
    match attr {
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::All => "\\All".to_string(),
        NameAttribute::Archive => "\\Archive".to_string(),
        NameAttribute::Drafts => "\\Drafts".to_string(),
        NameAttribute::Flagged => "\\Flagged".to_string(),
        NameAttribute::Junk => "\\Junk".to_string(),
        NameAttribute::Sent => "\\Sent".to_string(),
        NameAttribute::Trash => "\\Trash".to_string(),
        NameAttribute::Extension(name) => name.to_string(),
        other => format!("{:?}", other),
    }
}

/// Async IMAP session wrapper, over TLS unless built on another stream
pub struct ImapClient<T = TlsStream>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    session: Option<Session<T>>,
    config: ImapConfig,
    selected: Option<String>,
    uid_validity: Option<u32>,
    gmail: bool,
}

/// Native id of a fetched message: `X-GM-MSGID` when present
fn native_id(fetch: &Fetch, uid_validity: u32, uid: u32) -> String {
    match fetch.gmail_msg_id() {
        Some(id) => id.to_string(),
        None => format!("{}:{}", uid_validity, uid),
    }
}

fn gmail_labels(fetch: &Fetch) -> Vec<String> {
    fetch
        .gmail_labels()
        .map(|labels| labels.iter().map(|l| l.to_string()).collect())
        .unwrap_or_default()
}

impl<T> ImapClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send,
{
    fn unconnected(config: ImapConfig) -> Self {
        Self {
            session: None,
            config,
            selected: None,
            uid_validity: None,
            gmail: false,
        }
    }

    /// Authenticate over an established stream and check for Gmail extensions
    async fn login(&mut self, stream: T) -> MailResult<()> {
        let client = Client::new(stream);
        let mut session = client
            .login(&self.config.username, &self.config.password)
            .await
            .map_err(|e| MailError::Authentication(e.0.to_string()))?;

        let capabilities = session.capabilities().await.map_err(imap_err)?;
        self.gmail = capabilities.has_str(GMAIL_CAPABILITY);

        self.session = Some(session);
        self.selected = None;
        log::info!(
            "IMAP connected to: {} (gmail extensions: {})",
            self.config.host,
            self.gmail
        );
        Ok(())
    }

    fn session(&mut self) -> MailResult<&mut Session<T>> {
        self.session.as_mut().ok_or(MailError::NotConnected)
    }

    async fn uid_fetch(&mut self, uids: &[u32], query: &str) -> MailResult<Vec<Fetch>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        if self.selected.is_none() {
            return Err(MailError::NoFolderSelected);
        }
        let set = uid_set(uids);
        let session = self.session()?;
        let fetches: Vec<Fetch> = session
            .uid_fetch(&set, query)
            .await
            .map_err(imap_err)?
            .try_collect()
            .await
            .map_err(imap_err)?;
        log::debug!("uid_fetch {} -> {} rows", query, fetches.len());
        Ok(fetches)
    }
}

impl ImapClient {
    /// Create a new, unconnected client
    pub fn new(config: ImapConfig) -> Self {
        Self::unconnected(config)
    }

    /// Create a client and log in
    pub async fn connect(config: ImapConfig) -> MailResult<Self> {
        let mut client = Self::new(config);
        client.open().await?;
        Ok(client)
    }

    /// Connect to the IMAP server and authenticate
    pub async fn open(&mut self) -> MailResult<()> {
        if let Err(problems) = self.config.validate() {
            return Err(MailError::Config(problems.join(", ")));
        }

        let tls = if self.config.accept_invalid_certs {
            log::warn!("Accepting invalid SSL certificates for {}", self.config.host);
            async_native_tls::TlsConnector::new().danger_accept_invalid_certs(true)
        } else {
            async_native_tls::TlsConnector::new()
        };

        let address = match self.config.security {
            SecurityType::SSL => format!("{}:{}", self.config.host, self.config.port),
            SecurityType::STARTTLS => {
                // STARTTLS upgrade is not supported by the session type; use implicit TLS
                log::warn!(
                    "STARTTLS requested for {}, connecting with SSL on 993",
                    self.config.host
                );
                format!("{}:993", self.config.host)
            }
            SecurityType::NONE => {
                return Err(MailError::Connection(
                    "Unencrypted IMAP connections are not supported, use SSL".to_string(),
                ));
            }
        };

        let stream = tokio::net::TcpStream::connect(&address)
            .await
            .map_err(|e| MailError::Connection(e.to_string()))?;

        let tls_stream = tls
            .connect(&self.config.host, stream.compat())
            .await
            .map_err(|e| MailError::Connection(e.to_string()))?;

        self.login(tls_stream).await
    }
}

#[async_trait]
impl<T> MailClient for ImapClient<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Debug + Send + 'static,
{
    async fn folders(&mut self) -> MailResult<Vec<RemoteFolder>> {
        let session = self.session()?;
        let names: Vec<_> = session
            .list(Some(""), Some("*"))
            .await
            .map_err(imap_err)?
            .try_collect()
            .await
            .map_err(imap_err)?;

        Ok(names
            .iter()
            .map(|name| RemoteFolder {
                attrs: name.attributes().iter().map(attribute_name).collect(),
                delimiter: name.delimiter().map(|d| d.to_string()),
                name: name.name().to_string(),
            })
            .collect())
    }

    async fn select(&mut self, folder: &str) -> MailResult<FolderStatus> {
        let folder = check_folder_name(folder)?;
        let session = self.session()?;
        let mailbox = session.select(folder).await.map_err(imap_err)?;

        self.selected = Some(folder.to_string());
        self.uid_validity = mailbox.uid_validity;
        Ok(FolderStatus {
            exists: mailbox.exists,
            uid_next: mailbox.uid_next,
            uid_validity: mailbox.uid_validity,
        })
    }

    async fn status(&mut self, folder: &str) -> MailResult<FolderStatus> {
        let folder = check_folder_name(folder)?;
        let session = self.session()?;
        let mailbox = session
            .status(folder, "(MESSAGES UIDNEXT UIDVALIDITY)")
            .await
            .map_err(imap_err)?;
        Ok(FolderStatus {
            exists: mailbox.exists,
            uid_next: mailbox.uid_next,
            uid_validity: mailbox.uid_validity,
        })
    }

    async fn search(&mut self, folder: &str) -> MailResult<Vec<u32>> {
        self.select(folder).await?;
        let session = self.session()?;
        let uids = session.uid_search("ALL").await.map_err(imap_err)?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        Ok(uids)
    }

    async fn fetch_msgids(&mut self, uids: &[u32]) -> MailResult<Vec<MsgidRow>> {
        let fetches = self.uid_fetch(uids, MSGID_QUERY).await?;
        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                let header = fetch.header().or_else(|| fetch.body()).unwrap_or_default();
                Some(MsgidRow {
                    uid,
                    header: header.to_vec(),
                })
            })
            .collect())
    }

    async fn fetch_headers(&mut self, uids: &[u32]) -> MailResult<Vec<HeaderRow>> {
        let query = if self.gmail { GMAIL_HEADERS_QUERY } else { HEADERS_QUERY };
        let fetches = self.uid_fetch(uids, query).await?;
        let validity = self.uid_validity.unwrap_or(0);
        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                let uid = fetch.uid?;
                Some(HeaderRow {
                    uid,
                    internal_date: fetch.internal_date(),
                    size: fetch.size.unwrap_or(0),
                    header: fetch.header().unwrap_or_default().to_vec(),
                    native_id: native_id(fetch, validity, uid),
                })
            })
            .collect())
    }

    async fn fetch_bodies(&mut self, uids: &[u32]) -> MailResult<Vec<BodyRow>> {
        let fetches = self.uid_fetch(uids, BODIES_QUERY).await?;
        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                Some(BodyRow {
                    uid: fetch.uid?,
                    raw: fetch.body()?.to_vec(),
                })
            })
            .collect())
    }

    async fn fetch_labels(&mut self, uids: &[u32]) -> MailResult<Vec<LabelRow>> {
        let query = if self.gmail { GMAIL_LABELS_QUERY } else { LABELS_QUERY };
        let fetches = self.uid_fetch(uids, query).await?;
        Ok(fetches
            .iter()
            .filter_map(|fetch| {
                Some(LabelRow {
                    uid: fetch.uid?,
                    labels: gmail_labels(fetch),
                    flags: fetch.flags().map(|f| flag_name(&f)).collect(),
                })
            })
            .collect())
    }

    async fn idle(&mut self, folder: &str, timeout: Duration) -> MailResult<IdleEvent> {
        self.select(folder).await?;
        let session = self.session.take().ok_or(MailError::NotConnected)?;

        let mut handle = session.idle();
        handle.init().await.map_err(imap_err)?;
        let response = {
            let (wait, _interrupt) = handle.wait_with_timeout(timeout);
            wait.await.map_err(imap_err)?
        };
        let session = handle.done().await.map_err(imap_err)?;
        self.session = Some(session);

        Ok(match response {
            IdleResponse::Timeout => IdleEvent::Timeout,
            IdleResponse::NewData(_) | IdleResponse::ManualInterrupt => IdleEvent::Changed,
        })
    }

    async fn logout(&mut self) -> MailResult<()> {
        if let Some(mut session) = self.session.take() {
            session.logout().await.map_err(imap_err)?;
        }
        self.selected = None;
        Ok(())
    }
}
