//! Client and server certificates used to reach `https` remotes.

use camino::{Utf8Path, Utf8PathBuf};

use super::ResolveError;
use crate::config::{ConfigError, read_optional_bytes};

const CLIENT_CERT: &str = "client.crt";
const CLIENT_KEY: &str = "client.key";
const SERVER_CERTS: &str = "servercerts";

/// PEM material loaded from the configuration directory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TrustMaterial {
    /// Client certificate presented to the daemon.
    pub client_cert: Vec<u8>,
    /// Private key matching the client certificate.
    pub client_key: Vec<u8>,
    /// Pinned server certificate, when one has been recorded.
    pub server_cert: Option<Vec<u8>>,
}

impl TrustMaterial {
    /// Loads the client pair and the optional pinned certificate for
    /// `remote` from `config_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`ResolveError::Trust`] when the client certificate or key is
    /// missing or unreadable.
    pub fn load(config_dir: &Utf8Path, remote: &str) -> Result<Self, ResolveError> {
        let client_cert = required(config_dir.join(CLIENT_CERT), remote)?;
        let client_key = required(config_dir.join(CLIENT_KEY), remote)?;
        let pinned = config_dir.join(SERVER_CERTS).join(format!("{remote}.crt"));
        let server_cert = read_optional_bytes(&pinned).map_err(|err| trust_error(remote, &pinned, &err))?;
        Ok(Self {
            client_cert,
            client_key,
            server_cert,
        })
    }

    /// Concatenates certificate and key into the PEM bundle TLS clients
    /// expect for an identity.
    #[must_use]
    pub fn identity_pem(&self) -> Vec<u8> {
        let mut bundle = self.client_cert.clone();
        if !bundle.ends_with(b"\n") {
            bundle.push(b'\n');
        }
        bundle.extend_from_slice(&self.client_key);
        bundle
    }
}

fn required(path: Utf8PathBuf, remote: &str) -> Result<Vec<u8>, ResolveError> {
    match read_optional_bytes(&path) {
        Ok(Some(bytes)) if !bytes.is_empty() => Ok(bytes),
        Ok(_) => Err(ResolveError::Trust {
            remote: remote.to_owned(),
            path,
            message: String::from("file is missing or empty; generate a client certificate first"),
        }),
        Err(err) => Err(trust_error(remote, &path, &err)),
    }
}

fn trust_error(remote: &str, path: &Utf8Path, err: &ConfigError) -> ResolveError {
    ResolveError::Trust {
        remote: remote.to_owned(),
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
