//! `-L`, `-R` and `-D` port forwards.

use std::sync::{Arc, PoisonError};

use russh::{
    Channel,
    client::{Handle, Msg},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, copy_bidirectional},
    net::{TcpListener, TcpStream},
};
use tokio_util::sync::CancellationToken;

use super::{
    SshError,
    connection::{ClientHandler, RemoteTargets},
    options::{DynamicForward, Endpoint, LocalForward, RemoteForward},
    socks,
};

async fn bind(flag: &str, endpoint: &Endpoint) -> Result<TcpListener, SshError> {
    let listener = TcpListener::bind((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| SshError::Forward {
            spec: format!("{flag} {endpoint}"),
            reason: e.to_string(),
        })?;
    tracing::info!(%endpoint, "{flag} forward listening");
    Ok(listener)
}

/// Bind every `-L` listener, paired with its target.
pub async fn bind_local(
    forwards: &[LocalForward],
) -> Result<Vec<(TcpListener, Endpoint)>, SshError> {
    let mut listeners = Vec::with_capacity(forwards.len());
    for forward in forwards {
        listeners.push((bind("-L", &forward.listen).await?, forward.target.clone()));
    }
    Ok(listeners)
}

/// Bind every `-D` listener.
pub async fn bind_dynamic(forwards: &[DynamicForward]) -> Result<Vec<TcpListener>, SshError> {
    let mut listeners = Vec::with_capacity(forwards.len());
    for forward in forwards {
        listeners.push(bind("-D", &forward.listen).await?);
    }
    Ok(listeners)
}

/// Ask the server to listen for every `-R` forward.
pub async fn request_remote(
    handle: &mut Handle<ClientHandler>,
    forwards: &[RemoteForward],
    targets: &RemoteTargets,
) -> Result<(), SshError> {
    for forward in forwards {
        let bind = forward.bind();
        handle
            .tcpip_forward(bind.host.clone(), u32::from(bind.port))
            .await
            .map_err(|e| SshError::Forward {
                spec: format!("-R {bind}"),
                reason: e.to_string(),
            })?;
        targets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(u32::from(bind.port), forward.clone());
        tracing::info!(%bind, "-R forward listening");
    }
    Ok(())
}

/// Accept `-L` connections until shutdown.
pub async fn serve_local(
    handle: Arc<Handle<ClientHandler>>,
    listener: TcpListener,
    target: Endpoint,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(?e, "-L accept failed");
                    continue;
                }
            },
        };
        let handle = Arc::clone(&handle);
        let target = target.clone();
        tokio::spawn(async move {
            match handle
                .channel_open_direct_tcpip(
                    target.host.clone(),
                    u32::from(target.port),
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await
            {
                Ok(channel) => bridge(stream, channel.into_stream(), &target).await,
                Err(e) => tracing::warn!(%target, ?e, "-L channel open failed"),
            }
        });
    }
}

/// Accept `-D` SOCKS connections until shutdown.
pub async fn serve_dynamic(
    handle: Arc<Handle<ClientHandler>>,
    listener: TcpListener,
    shutdown: CancellationToken,
) {
    loop {
        let (mut stream, peer) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(?e, "-D accept failed");
                    continue;
                }
            },
        };
        let handle = Arc::clone(&handle);
        tokio::spawn(async move {
            let target = match socks::handshake(&mut stream).await {
                Ok(target) => target,
                Err(e) => {
                    tracing::debug!(%peer, ?e, "SOCKS handshake failed");
                    return;
                }
            };
            let channel = handle
                .channel_open_direct_tcpip(
                    target.host.clone(),
                    u32::from(target.port),
                    peer.ip().to_string(),
                    u32::from(peer.port()),
                )
                .await;
            let connected = channel.is_ok();
            if socks::reply(&mut stream, connected).await.is_err() {
                return;
            }
            match channel {
                Ok(channel) => bridge(stream, channel.into_stream(), &target).await,
                Err(e) => tracing::warn!(%target, ?e, "-D channel open failed"),
            }
        });
    }
}

/// Serve one connection the server accepted for a `-R` forward.
pub async fn serve_remote(channel: Channel<Msg>, forward: RemoteForward) {
    let mut remote = channel.into_stream();
    let (target, is_socks) = match forward {
        RemoteForward::Tcp { target, .. } => (target, false),
        RemoteForward::Socks { .. } => match socks::handshake(&mut remote).await {
            Ok(target) => (target, true),
            Err(e) => {
                tracing::debug!(?e, "SOCKS handshake failed");
                return;
            }
        },
    };
    let local = TcpStream::connect((target.host.as_str(), target.port)).await;
    if is_socks && socks::reply(&mut remote, local.is_ok()).await.is_err() {
        return;
    }
    match local {
        Ok(local) => bridge(local, remote, &target).await,
        Err(e) => tracing::warn!(%target, ?e, "-R connect failed"),
    }
}

async fn bridge<A, B>(mut a: A, mut b: B, target: &Endpoint)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    match copy_bidirectional(&mut a, &mut b).await {
        Ok((sent, received)) => tracing::debug!(%target, sent, received, "Forward closed"),
        Err(e) => tracing::debug!(%target, ?e, "Forward closed with error"),
    }
}
