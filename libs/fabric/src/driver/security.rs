use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Certificate, key and optional key password
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsCredentials {
    pub certificate: PathBuf,
    pub private_key: PathBuf,
    pub password: Option<String>,
}

impl TlsCredentials {
    pub fn validate(&self) -> Result<()> {
        require_file(&self.certificate)?;
        require_file(&self.private_key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PeerVerification {
    #[default]
    Anonymous,
    /// Verify the peer against a trusted CA database
    Verify { trusted_certificates: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientTls {
    pub credentials: Option<TlsCredentials>,
    pub verification: PeerVerification,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Sasl {
    #[default]
    Anonymous,
    Plain {
        user: String,
        password: String,
    },
}

/// Security settings for an outbound connector
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientSecurity {
    pub tls: Option<ClientTls>,
    pub sasl: Sasl,
}

impl ClientSecurity {
    pub fn validate(&self) -> Result<()> {
        if let Some(tls) = &self.tls {
            if let Some(credentials) = &tls.credentials {
                credentials.validate()?;
            }
            if let PeerVerification::Verify {
                trusted_certificates,
            } = &tls.verification
            {
                require_file(trusted_certificates)?;
            }
        }
        if let Sasl::Plain { user, .. } = &self.sasl {
            if user.is_empty() {
                return Err(Error::Credentials("empty SASL user".to_string()));
            }
        }
        Ok(())
    }
}

/// Security settings for a listener
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerSecurity {
    pub tls: Option<TlsCredentials>,
    pub trusted_certificates: Option<PathBuf>,
}

impl ServerSecurity {
    pub fn validate(&self) -> Result<()> {
        if let Some(tls) = &self.tls {
            tls.validate()?;
        }
        if let Some(path) = &self.trusted_certificates {
            require_file(path)?;
        }
        Ok(())
    }
}

fn require_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(Error::Credentials(format!("{} is not readable", path.display())))
    }
}
