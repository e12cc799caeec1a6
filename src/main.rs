use std::env;
use std::path::Path;

use piano_lights::hub::CoreEvent;
use piano_lights::source::{PeerService, UdpPeerService};
use piano_lights::{Command, LightsContext, Settings};
use tokio::sync::broadcast::error::RecvError;

const DEFAULT_SETTINGS: &str = "piano_lights.json";

fn load_settings(path: &str) -> piano_lights::Result<Settings> {
    if Path::new(path).exists() {
        log::info!("loading settings from {path}");
        Settings::load(path)
    } else {
        log::warn!("{path} not found, using default settings");
        Ok(Settings::default())
    }
}

#[tokio::main]
async fn main() -> piano_lights::Result<()> {
    env_logger::init();

    // piano-lights [settings.json] [timeline.json]
    let mut args = env::args().skip(1);
    let settings_path = args.next().unwrap_or_else(|| DEFAULT_SETTINGS.to_string());
    let timeline = args.next();

    let settings = load_settings(&settings_path)?;
    let device = settings.live.device.clone();
    let udp_bind = settings.live.udp_bind;

    let ctx = LightsContext::new(settings)?;
    ctx.start();

    let mut events = ctx.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CoreEvent::Note(unified)) => log::debug!(
                    "{:?} {:?} {} from {}",
                    unified.source,
                    unified.event.kind,
                    unified.event.note,
                    unified.event.source_id
                ),
                Ok(CoreEvent::Source(status)) => log::info!(
                    "{:?} source {:?} {}",
                    status.source,
                    status.state,
                    status.detail.unwrap_or_default()
                ),
                Ok(CoreEvent::Playback(_)) => {}
                Err(RecvError::Lagged(skipped)) => log::debug!("event log skipped {skipped}"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    match ctx.devices() {
        Ok(ports) if !ports.is_empty() => {
            if let Err(e) = ctx.execute(Command::SelectDevice(device)).await {
                log::warn!("live input disabled: {e}");
            }
        }
        Ok(_) => log::info!("no MIDI input devices found"),
        Err(e) => log::warn!("could not list MIDI devices: {e}"),
    }

    let mut udp = udp_bind.map(UdpPeerService::new);
    if let Some(service) = udp.as_mut() {
        if let Err(e) = service.start(ctx.network().clone()) {
            log::warn!("{} peers disabled: {e}", service.name());
        }
    }

    if let Some(path) = timeline {
        ctx.execute(Command::Load(path.into())).await?;
        ctx.execute(Command::Start).await?;
    }

    log::info!("running, press ctrl-c to exit");
    tokio::signal::ctrl_c().await?;

    if let Some(service) = udp.as_mut() {
        service.stop();
    }
    ctx.shutdown().await;
    Ok(())
}
