use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use russh::client;
use russh_keys::key::PublicKey;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::RusshTransport;

pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub config: client::Config,
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> ConnectOptions {
        ConnectOptions {
            host: host.into(),
            port: 22,
            user: user.into(),
            password: password.into(),
            connect_timeout: Duration::from_secs(10),
            config: client::Config::default(),
        }
    }

    pub fn port(mut self, port: u16) -> ConnectOptions {
        self.port = port;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> ConnectOptions {
        self.connect_timeout = timeout;
        self
    }
}

/// Trusts whatever host key the server presents.
#[derive(Debug, Default)]
pub struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Connects and logs in with a password. Any failure on the way is an [`Error::AuthFailure`].
pub async fn connect(options: ConnectOptions) -> Result<RusshTransport> {
    let ConnectOptions {
        host,
        port,
        user,
        password,
        connect_timeout,
        config,
    } = options;
    let auth_failure = |reason: String| {
        warn!(%user, %host, port, %reason, "login failed");
        Error::AuthFailure {
            user: user.clone(),
            host: host.clone(),
            reason,
        }
    };

    let login = async {
        let mut handle = client::connect(Arc::new(config), (host.as_str(), port), AcceptAnyHostKey)
            .await
            .map_err(|err| format!("could not connect: {err}"))?;
        let accepted = handle
            .authenticate_password(user.as_str(), password.as_str())
            .await
            .map_err(|err| format!("authentication error: {err}"))?;
        if !accepted {
            return Err("credentials rejected".to_string());
        }
        Ok(handle)
    };

    let handle = match tokio::time::timeout(connect_timeout, login).await {
        Ok(Ok(handle)) => handle,
        Ok(Err(reason)) => return Err(auth_failure(reason)),
        Err(_) => return Err(auth_failure(format!("timed out after {connect_timeout:?}"))),
    };

    let label = format!("{user}@{host}:{port}");
    info!(transport = %label, "logged in");
    Ok(RusshTransport::new(handle, label))
}
