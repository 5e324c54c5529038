use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mesh_meeting::config::ClientConfig;
use mesh_meeting::media::{MediaDevices, NoDevices, SampleTrackDevices};
use mesh_meeting::room::{Reconnect, RoomNotice, RoomSession, SessionHandle};
use mesh_meeting::signaling::{SignalingClient, SignalingSink};
use mesh_meeting::transport::WebRtcPeerFactory;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ClientConfig::parse();
    let request = config.join_request()?;
    info!("Joining room {} as {}", request.room_id, request.display_name);

    let factory = Arc::new(
        WebRtcPeerFactory::new(&config.ice_servers).context("failed to set up WebRTC")?,
    );
    let devices: Box<dyn MediaDevices> = if config.receive_only {
        Box::new(NoDevices)
    } else {
        Box::new(SampleTrackDevices)
    };

    let (client, inbound) = SignalingClient::connect(&config.relay_url)
        .await
        .with_context(|| format!("could not reach relay at {}", config.relay_url))?;
    let session = RoomSession::join(request, devices.as_ref(), factory, Box::new(client)).await?;
    let (handle, task) = SessionHandle::spawn(session, inbound);

    let mut notices = handle.notices();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; leaving room");
                break;
            }
            notice = notices.recv() => match notice {
                Ok(RoomNotice::RelayLost) => match reconnect(&config, &handle).await {
                    Ok(Reconnect::Restored) => {}
                    Ok(Reconnect::Interrupted) => {
                        info!("Interrupted; leaving room");
                        break;
                    }
                    Err(e) => {
                        error!("{:#}", e);
                        break;
                    }
                },
                Ok(RoomNotice::Chat { display_name, message }) => {
                    info!("[chat] {}: {}", display_name, message)
                }
                Ok(RoomNotice::Participants(participants)) => {
                    info!("{} participant(s) in room", participants.len())
                }
                Ok(RoomNotice::PeerFailed { participant, reason }) => {
                    warn!("Lost {}: {}", participant, reason)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Skipped {} room notices", skipped),
                Err(RecvError::Closed) => break,
            },
        }
    }

    handle.leave().await?;
    task.await?;
    Ok(())
}

/// Retries the relay with a fixed delay; live media links stay up meanwhile.
async fn reconnect(config: &ClientConfig, handle: &SessionHandle) -> anyhow::Result<Reconnect> {
    let outcome = handle
        .reconnect_relay(
            config.max_reconnect_attempts,
            config.reconnect_delay(),
            tokio::signal::ctrl_c(),
            move || async move {
                let (client, inbound) = SignalingClient::connect(&config.relay_url).await?;
                Ok::<_, mesh_meeting::error::Error>((
                    Box::new(client) as Box<dyn SignalingSink>,
                    inbound,
                ))
            },
        )
        .await?;
    Ok(outcome)
}
