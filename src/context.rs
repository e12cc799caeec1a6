//! Ownership of every component and the command surface the transport
//! layer talks to.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::broadcast;

use crate::config::Settings;
use crate::error::{LightsError, Result};
use crate::hub::{CoreEvent, EventHub};
use crate::keymap::KeyMapper;
use crate::led::{LedRenderer, OutputArbiter};
use crate::note::ActiveNoteRecord;
use crate::playback::timeline::{JsonTimelineParser, MidiFileParser};
use crate::playback::{PlaybackScheduler, PlaybackStatus};
use crate::source::{default_backend, DeviceBackend, LocalDeviceAdapter, NetworkPeerAdapter, PeerSession};
use crate::unifier::{EventUnifier, UnifierStats};

/// Requests from the transport layer.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", content = "args", rename_all = "snake_case")]
pub enum Command {
    Load(PathBuf),
    Start,
    Pause,
    Resume,
    Stop,
    Seek(f64),
    SetTempo(f64),
    SetVolume(f64),
    SetLoop { enabled: bool, start: f64, end: f64 },
    SelectDevice(Option<String>),
    StopDevice,
    ConnectPeer { name: String, address: IpAddr, port: u16 },
    DisconnectPeer(String),
}

/// Components rebuilt on reconfiguration, in dependency order.
struct Output {
    renderer: Arc<LedRenderer>,
    mapper: Arc<KeyMapper>,
    playback: PlaybackScheduler,
    local: Arc<LocalDeviceAdapter>,
}

pub struct LightsContext {
    settings: Settings,
    hub: EventHub,
    arbiter: Arc<OutputArbiter>,
    unifier: Arc<EventUnifier>,
    network: Arc<NetworkPeerAdapter>,
    backend: Arc<dyn DeviceBackend>,
    parser: Arc<dyn MidiFileParser>,
    output: Output,
}

impl LightsContext {
    /// Context on the build's device backend and the JSON timeline parser.
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_collaborators(settings, default_backend(), Arc::new(JsonTimelineParser))
    }

    pub fn with_collaborators(
        settings: Settings,
        backend: Arc<dyn DeviceBackend>,
        parser: Arc<dyn MidiFileParser>,
    ) -> Result<Self> {
        settings.validate()?;
        let hub = EventHub::new();
        let arbiter = Arc::new(OutputArbiter::new());
        let unifier = Arc::new(EventUnifier::new(&settings.unifier, hub.clone()));
        let network = Arc::new(NetworkPeerAdapter::new(
            settings.live.max_peers,
            Arc::clone(&unifier),
            hub.clone(),
        ));
        let output = build_output(&settings, &hub, &arbiter, &unifier, &backend, &parser);

        Ok(Self {
            settings,
            hub,
            arbiter,
            unifier,
            network,
            backend,
            parser,
            output,
        })
    }

    /// Start the unifier. Must run inside a tokio runtime.
    pub fn start(&self) {
        self.unifier.start();
    }

    pub async fn execute(&self, command: Command) -> Result<()> {
        log::debug!("command: {command:?}");
        let playback = &self.output.playback;
        match command {
            Command::Load(path) => playback.load(&path).await?,
            Command::Start => playback.start()?,
            Command::Pause => playback.pause(),
            Command::Resume => playback.resume(),
            Command::Stop => playback.stop().await,
            Command::Seek(time) => {
                playback.seek(time);
            }
            Command::SetTempo(multiplier) => {
                playback.set_tempo(multiplier);
            }
            Command::SetVolume(volume) => {
                playback.set_volume(volume);
            }
            Command::SetLoop {
                enabled,
                start,
                end,
            } => {
                playback.set_loop(enabled, start, end);
            }
            Command::SelectDevice(name) => {
                self.on_local(move |local| {
                    local.stop();
                    local.start(name.as_deref())
                })
                .await?;
            }
            Command::StopDevice => self.stop_local().await,
            Command::ConnectPeer {
                name,
                address,
                port,
            } => self.network.connect_peer(&name, address, port)?,
            Command::DisconnectPeer(name) => {
                self.network.disconnect_peer(&name);
            }
        }
        Ok(())
    }

    /// Run a call on the local adapter on the blocking pool. Opening and
    /// closing a device can wait on the driver and the worker thread.
    async fn on_local<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&LocalDeviceAdapter) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let local = Arc::clone(&self.output.local);
        tokio::task::spawn_blocking(move || f(&local))
            .await
            .map_err(|e| LightsError::Device(format!("device task failed: {e}")))?
    }

    async fn stop_local(&self) {
        let stopped = self
            .on_local(|local| {
                local.stop();
                Ok(())
            })
            .await;
        if let Err(e) = stopped {
            log::error!("could not stop MIDI input: {e}");
        }
    }

    /// Swap in new settings, rebuilding the output side in order:
    /// renderer, key map, scheduler, local adapter.
    ///
    /// The hub, the unifier and connected peers are kept. A running local
    /// device is reopened on the same port; a loaded timeline is not.
    pub async fn reconfigure(&mut self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let device = self.output.local.port_name();

        self.stop_local().await;
        self.output.playback.stop().await;
        self.output.renderer.cleanup();

        self.output = build_output(
            &settings,
            &self.hub,
            &self.arbiter,
            &self.unifier,
            &self.backend,
            &self.parser,
        );
        self.network.set_max_peers(settings.live.max_peers);
        self.settings = settings;
        log::info!("reconfigured for {} LEDs", self.output.renderer.num_pixels());

        if let Some(port) = device {
            let reopened = {
                let port = port.clone();
                self.on_local(move |local| local.start(Some(&port))).await
            };
            if let Err(e) = reopened {
                log::warn!("could not reopen {port} after reconfiguration: {e}");
            }
        }
        Ok(())
    }

    /// Stop everything and release the strip.
    pub async fn shutdown(&self) {
        self.stop_local().await;
        self.output.playback.stop().await;
        self.unifier.stop().await;
        self.output.renderer.cleanup();
        log::info!("shut down");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.hub.subscribe()
    }

    pub fn hub(&self) -> &EventHub {
        &self.hub
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn renderer(&self) -> &Arc<LedRenderer> {
        &self.output.renderer
    }

    pub fn mapper(&self) -> &Arc<KeyMapper> {
        &self.output.mapper
    }

    pub fn playback(&self) -> &PlaybackScheduler {
        &self.output.playback
    }

    pub fn local(&self) -> &LocalDeviceAdapter {
        &self.output.local
    }

    pub fn network(&self) -> &Arc<NetworkPeerAdapter> {
        &self.network
    }

    pub fn unifier(&self) -> &Arc<EventUnifier> {
        &self.unifier
    }

    pub fn playback_status(&self) -> PlaybackStatus {
        self.output.playback.status()
    }

    pub fn active_notes(&self) -> Vec<ActiveNoteRecord> {
        self.unifier.active_notes()
    }

    pub fn unifier_stats(&self) -> UnifierStats {
        self.unifier.stats()
    }

    pub fn peers(&self) -> Vec<PeerSession> {
        self.network.peers()
    }

    pub fn devices(&self) -> Result<Vec<String>> {
        self.output.local.list_devices()
    }
}

fn build_output(
    settings: &Settings,
    hub: &EventHub,
    arbiter: &Arc<OutputArbiter>,
    unifier: &Arc<EventUnifier>,
    backend: &Arc<dyn DeviceBackend>,
    parser: &Arc<dyn MidiFileParser>,
) -> Output {
    let renderer = Arc::new(LedRenderer::open(&settings.led));
    let mapper = Arc::new(KeyMapper::new(settings));
    let playback = PlaybackScheduler::new(
        settings.playback.clone(),
        Arc::clone(&renderer),
        Arc::clone(&mapper),
        Arc::clone(arbiter),
        hub.clone(),
        Arc::clone(parser),
    );
    let local = Arc::new(LocalDeviceAdapter::new(
        Arc::clone(backend),
        Arc::clone(&renderer),
        Arc::clone(&mapper),
        Arc::clone(arbiter),
        Arc::clone(unifier),
        hub.clone(),
        Duration::from_millis(settings.live.stop_timeout_ms),
    ));
    Output {
        renderer,
        mapper,
        playback,
        local,
    }
}
