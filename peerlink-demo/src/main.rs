// peerlink demo: two connection managers linked through the in-process loopback hub.

mod config;

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use peerlink_core::{
    ConnectionType, Delivery, EventInfo, EventValue, LoopbackHub, ManagerMode,
    PeerConnectionEvent, PeerConnectionManager, PeerStatus, DEFAULT_INVITE_TIMEOUT,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("peerlink-demo {}", VERSION);
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,peerlink_core=debug")),
        )
        .init();

    let cfg = config::load();
    info!(?cfg, "configuration loaded");

    let hub = LoopbackHub::new();
    let local = Arc::new(PeerConnectionManager::new(
        cfg.manager("local", ManagerMode::Node),
        hub.transport(),
    )?);
    let remote = Arc::new(PeerConnectionManager::new(
        cfg.manager("remote", ManagerMode::Master),
        hub.transport(),
    )?);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        // The local side drives invites itself unless the automatic policy does.
        let invites = cfg.connection_type != ConnectionType::Automatic;
        wire("local", &local, invites);
        wire("remote", &remote, false);

        remote.start()?;
        local.start()?;

        let mut ticker = tokio::time::interval(Duration::from_millis(cfg.pump_interval_ms));
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    hub.pump();
                }
                r = &mut shutdown => {
                    r?;
                    break;
                }
            }
        }
        info!("shutting down");
        Ok::<_, anyhow::Error>(())
    })?;

    local.stop();
    remote.stop();
    hub.pump();
    Ok(())
}

/// Log every event of `manager`, greet newly connected peers and, when `invite_found`
/// is set, invite every discovered peer.
fn wire(side: &'static str, manager: &Arc<PeerConnectionManager>, invite_found: bool) {
    manager.listen_on("demo.log", Delivery::Background, move |event| {
        info!(side, event = ?event, "event");
    });

    manager.observe_events("demo.greetings", move |event_info, _session, peer| {
        let text = event_info
            .get("greeting")
            .and_then(EventValue::as_text)
            .unwrap_or("<none>");
        info!(side, from = %peer.display_name(), greeting = text, "greeting received");
    });

    let weak: Weak<PeerConnectionManager> = Arc::downgrade(manager);
    manager.listen_on("demo.greeter", Delivery::Inline, move |event| {
        let Some(manager) = weak.upgrade() else {
            return;
        };
        match event {
            PeerConnectionEvent::DevicesChanged { peer, .. }
                if peer.status() == PeerStatus::Connected =>
            {
                if let Err(e) = manager.send_event(&greeting(&manager), &[peer.clone()]) {
                    warn!(side, error = %e, "greeting not sent");
                }
            }
            PeerConnectionEvent::FoundPeer { peer, .. } if invite_found => {
                if let Err(e) = manager.invite_peer(peer, None, DEFAULT_INVITE_TIMEOUT) {
                    warn!(side, peer = %peer.display_name(), error = %e, "invite failed");
                }
            }
            _ => {}
        }
    });
}

fn greeting(manager: &PeerConnectionManager) -> EventInfo {
    let sent_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let mut info = EventInfo::new();
    info.insert(
        "greeting".to_string(),
        EventValue::from(format!("hello from {}", manager.local_peer().display_name())),
    );
    info.insert("sent_at_ms".to_string(), EventValue::Int(sent_at));
    info
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
