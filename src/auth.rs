use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::types::{ClientId, HashMap};
use crate::Result;

///Credential check run during CONNECT.
#[async_trait]
pub trait Authenticator: Sync + Send {
    async fn check_valid(&self, client_id: &ClientId, username: &str, password: Option<&[u8]>) -> bool;
}

///ACL check for publishes and subscriptions.
#[async_trait]
pub trait Authorizator: Sync + Send {
    async fn can_write(&self, topic: &str, username: Option<&str>, client_id: &ClientId) -> bool;

    async fn can_read(&self, topic_filter: &str, username: Option<&str>, client_id: &ClientId) -> bool;
}

pub struct AcceptAllAuthenticator;

#[async_trait]
impl Authenticator for AcceptAllAuthenticator {
    #[inline]
    async fn check_valid(&self, _client_id: &ClientId, _username: &str, _password: Option<&[u8]>) -> bool {
        true
    }
}

pub struct PermitAllAuthorizator;

#[async_trait]
impl Authorizator for PermitAllAuthorizator {
    #[inline]
    async fn can_write(&self, _topic: &str, _username: Option<&str>, _client_id: &ClientId) -> bool {
        true
    }

    #[inline]
    async fn can_read(&self, _topic_filter: &str, _username: Option<&str>, _client_id: &ClientId) -> bool {
        true
    }
}

pub struct DenyAllAuthorizator;

#[async_trait]
impl Authorizator for DenyAllAuthorizator {
    #[inline]
    async fn can_write(&self, _topic: &str, _username: Option<&str>, _client_id: &ClientId) -> bool {
        false
    }

    #[inline]
    async fn can_read(&self, _topic_filter: &str, _username: Option<&str>, _client_id: &ClientId) -> bool {
        false
    }
}

///Line-oriented credential file, `username:SHA256-hex(password)` per
///line, `#` starts a comment. Loaded once at startup.
pub struct FileAuthenticator {
    identities: HashMap<String, String>,
}

impl FileAuthenticator {
    pub fn from_file(path: &str) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Ok(Self::parse(&source))
    }

    pub fn parse(source: &str) -> Self {
        let mut identities = HashMap::default();
        for line in source.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((username, digest)) = line.split_once(':') {
                identities.insert(username.trim().to_owned(), digest.trim().to_ascii_lowercase());
            } else {
                log::warn!("password file entry without a digest, ignored: {}", line);
            }
        }
        Self { identities }
    }

    #[inline]
    pub(crate) fn sha256_hex(data: &[u8]) -> String {
        let digest = Sha256::digest(data);
        let mut out = String::with_capacity(digest.len() * 2);
        for b in digest.iter() {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

#[async_trait]
impl Authenticator for FileAuthenticator {
    #[inline]
    async fn check_valid(&self, _client_id: &ClientId, username: &str, password: Option<&[u8]>) -> bool {
        let password = match password {
            Some(p) => p,
            None => return false,
        };
        self.identities.get(username).map(|digest| digest == &Self::sha256_hex(password)).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_authenticator_accepts_known_user() {
        let source = format!(
            "# test users\nalice:{}\n\nbob:{}\n",
            FileAuthenticator::sha256_hex(b"wonderland"),
            FileAuthenticator::sha256_hex(b"builder")
        );
        let auth = FileAuthenticator::parse(&source);
        let cid = ClientId::from("c1");

        assert!(auth.check_valid(&cid, "alice", Some(b"wonderland")).await);
        assert!(auth.check_valid(&cid, "bob", Some(b"builder")).await);
        assert!(!auth.check_valid(&cid, "alice", Some(b"builder")).await);
        assert!(!auth.check_valid(&cid, "alice", None).await);
        assert!(!auth.check_valid(&cid, "mallory", Some(b"wonderland")).await);
    }

    #[tokio::test]
    async fn file_authenticator_ignores_garbage_lines() {
        let auth = FileAuthenticator::parse("not-an-entry\n# comment\n");
        assert!(!auth.check_valid(&ClientId::from("c1"), "not-an-entry", Some(b"x")).await);
    }
}
