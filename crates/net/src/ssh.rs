//! SSH plumbing shared by the podman forward and exec sessions.
//!
//! The guest runs sshd as root on its fixed address; we authenticate with
//! the instance key and skip host-key pinning (the endpoint is our own
//! virtual network, not a routable host).

use crate::error::{NetError, Result};
use russh::client;
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg, load_secret_key};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub struct Acceptor;

impl client::Handler for Acceptor {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Loads the instance private key.
pub fn load_identity(path: &Path) -> Result<Arc<PrivateKey>> {
    Ok(Arc::new(load_secret_key(path, None)?))
}

/// Opens an authenticated session as `user` over an arbitrary transport.
pub async fn session_over<S>(
    stream: S,
    user: &str,
    key: Arc<PrivateKey>,
) -> Result<client::Handle<Acceptor>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = Arc::new(client::Config::default());
    let mut handle = client::connect_stream(config, stream, Acceptor).await?;

    let auth = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, None))
        .await?;
    if !auth.success() {
        return Err(NetError::SshAuth(user.to_string()));
    }

    Ok(handle)
}
