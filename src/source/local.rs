//! Live input from a locally attached MIDI device.
//!
//! The device callback only pushes raw bytes into a channel. A dedicated
//! worker thread polls that channel, lights the strip for every note-on and
//! forwards each note to the unifier.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::error::{LightsError, Result};
use crate::hub::{EventHub, SourceState};
use crate::keymap::KeyMapper;
use crate::led::{note_color, LedRenderer, OutputArbiter, Rgb};
use crate::note::{NoteEvent, SourceKind};
use crate::unifier::EventUnifier;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// An open device. Dropping it closes the port.
pub trait DeviceConnection {
    fn port_name(&self) -> &str;
}

/// Access to the platform's MIDI inputs.
pub trait DeviceBackend: Send + Sync {
    fn list_ports(&self) -> Result<Vec<String>>;

    /// Open the first port whose name contains `name`, or the first port at
    /// all when `name` is `None`. Raw messages are sent to `sink`.
    ///
    /// Called on the worker thread that later owns the connection.
    fn open(&self, name: Option<&str>, sink: Sender<Vec<u8>>) -> Result<Box<dyn DeviceConnection>>;
}

/// Backend for builds without device support.
#[derive(Debug, Default)]
pub struct NoDeviceBackend;

impl DeviceBackend for NoDeviceBackend {
    fn list_ports(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn open(&self, _name: Option<&str>, _sink: Sender<Vec<u8>>) -> Result<Box<dyn DeviceConnection>> {
        Err(LightsError::NoDevice)
    }
}

#[cfg(feature = "midi-device")]
pub use midir_backend::MidirBackend;

#[cfg(feature = "midi-device")]
mod midir_backend {
    use super::*;
    use midir::{Ignore, MidiInput, MidiInputConnection};

    pub struct MidirBackend {
        client_name: String,
    }

    impl MidirBackend {
        pub fn new(client_name: impl Into<String>) -> Self {
            Self {
                client_name: client_name.into(),
            }
        }

        fn input(&self) -> Result<MidiInput> {
            let mut midi_in =
                MidiInput::new(&self.client_name).map_err(|e| LightsError::Device(e.to_string()))?;
            midi_in.ignore(Ignore::None);
            Ok(midi_in)
        }
    }

    impl Default for MidirBackend {
        fn default() -> Self {
            Self::new("piano-lights")
        }
    }

    struct MidirConnection {
        _connection: MidiInputConnection<()>,
        port_name: String,
    }

    impl DeviceConnection for MidirConnection {
        fn port_name(&self) -> &str {
            &self.port_name
        }
    }

    impl DeviceBackend for MidirBackend {
        fn list_ports(&self) -> Result<Vec<String>> {
            let midi_in = self.input()?;
            Ok(midi_in
                .ports()
                .iter()
                .filter_map(|p| midi_in.port_name(p).ok())
                .collect())
        }

        fn open(
            &self,
            name: Option<&str>,
            sink: Sender<Vec<u8>>,
        ) -> Result<Box<dyn DeviceConnection>> {
            let midi_in = self.input()?;
            let ports = midi_in.ports();
            let port = match name {
                Some(wanted) => ports
                    .iter()
                    .find(|p| {
                        midi_in
                            .port_name(p)
                            .map(|n| n.contains(wanted))
                            .unwrap_or(false)
                    })
                    .ok_or_else(|| LightsError::Device(format!("no MIDI port matching '{wanted}'")))?,
                None => ports.first().ok_or(LightsError::NoDevice)?,
            };
            let port_name = midi_in
                .port_name(port)
                .unwrap_or_else(|_| "<unknown>".to_string());

            let connection = midi_in
                .connect(
                    port,
                    "piano-lights-input",
                    move |_, message, _| {
                        let _ = sink.send(message.to_vec());
                    },
                    (),
                )
                .map_err(|e| LightsError::Device(e.to_string()))?;

            Ok(Box::new(MidirConnection {
                _connection: connection,
                port_name,
            }))
        }
    }
}

/// The backend this build was compiled with.
pub fn default_backend() -> Arc<dyn DeviceBackend> {
    #[cfg(feature = "midi-device")]
    {
        Arc::new(MidirBackend::default())
    }
    #[cfg(not(feature = "midi-device"))]
    {
        Arc::new(NoDeviceBackend)
    }
}

type LitTable = Arc<Mutex<HashMap<u8, Vec<usize>>>>;

fn lock_lit(lit: &LitTable) -> MutexGuard<'_, HashMap<u8, Vec<usize>>> {
    lit.lock().unwrap_or_else(|e| e.into_inner())
}

struct Running {
    port: String,
    stop: Arc<AtomicBool>,
    done: Receiver<()>,
    thread: JoinHandle<()>,
}

pub struct LocalDeviceAdapter {
    backend: Arc<dyn DeviceBackend>,
    renderer: Arc<LedRenderer>,
    mapper: Arc<KeyMapper>,
    arbiter: Arc<OutputArbiter>,
    unifier: Arc<EventUnifier>,
    hub: EventHub,
    stop_timeout: Duration,
    lit: LitTable,
    running: Mutex<Option<Running>>,
}

impl LocalDeviceAdapter {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        renderer: Arc<LedRenderer>,
        mapper: Arc<KeyMapper>,
        arbiter: Arc<OutputArbiter>,
        unifier: Arc<EventUnifier>,
        hub: EventHub,
        stop_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            renderer,
            mapper,
            arbiter,
            unifier,
            hub,
            stop_timeout,
            lit: Arc::new(Mutex::new(HashMap::new())),
            running: Mutex::new(None),
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn list_devices(&self) -> Result<Vec<String>> {
        self.backend.list_ports()
    }

    /// Open a device and start the worker. Returns the opened port name.
    ///
    /// On failure the adapter stays idle.
    pub fn start(&self, name: Option<&str>) -> Result<String> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(LightsError::AlreadyRunning);
        }

        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<String>>(1);
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        let stop = Arc::new(AtomicBool::new(false));

        let worker = InputWorker {
            renderer: Arc::clone(&self.renderer),
            mapper: Arc::clone(&self.mapper),
            arbiter: Arc::clone(&self.arbiter),
            unifier: Arc::clone(&self.unifier),
            lit: Arc::clone(&self.lit),
            stop: Arc::clone(&stop),
        };
        let backend = Arc::clone(&self.backend);
        let wanted = name.map(str::to_owned);

        let thread = thread::Builder::new()
            .name("midi-input".into())
            .spawn(move || {
                let (sink, messages) = crossbeam_channel::unbounded();
                let connection = match backend.open(wanted.as_deref(), sink) {
                    Ok(connection) => connection,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let port = connection.port_name().to_owned();
                let _ = ready_tx.send(Ok(port.clone()));
                worker.run(&port, &messages);
                drop(connection);
                let _ = done_tx.send(());
            })?;

        let opened = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(LightsError::Device("input worker exited".into())));
        match opened {
            Ok(port) => {
                log::info!("listening for MIDI input from {port}");
                self.hub.source_status(
                    SourceKind::LocalDevice,
                    SourceState::Running,
                    Some(port.clone()),
                );
                *running = Some(Running {
                    port: port.clone(),
                    stop,
                    done: done_rx,
                    thread,
                });
                Ok(port)
            }
            Err(e) => {
                let _ = thread.join();
                log::error!("could not open MIDI device: {e}");
                self.hub.source_status(
                    SourceKind::LocalDevice,
                    SourceState::Error,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Stop the worker and turn off every LED this adapter lit.
    ///
    /// The wait for the worker is bounded; the LEDs and the note table are
    /// cleared even when it times out.
    pub fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };
        running.stop.store(true, Ordering::SeqCst);
        match running.done.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if running.thread.join().is_err() {
                    log::error!("MIDI input worker panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!(
                    "MIDI input worker for {} did not stop within {:?}, detaching",
                    running.port,
                    self.stop_timeout
                );
            }
        }

        let lit: Vec<usize> = lock_lit(&self.lit).drain().flat_map(|(_, leds)| leds).collect();
        if self.arbiter.live_may_render() {
            self.renderer.set_many(lit.into_iter().map(|i| (i, Rgb::BLACK)));
        }
        log::info!("MIDI input from {} stopped", running.port);
        self.hub
            .source_status(SourceKind::LocalDevice, SourceState::Idle, None);
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    pub fn port_name(&self) -> Option<String> {
        self.lock_running().as_ref().map(|r| r.port.clone())
    }

    /// Notes this adapter currently shows on the strip.
    pub fn lit_notes(&self) -> Vec<u8> {
        let mut notes: Vec<u8> = lock_lit(&self.lit).keys().copied().collect();
        notes.sort_unstable();
        notes
    }
}

impl Drop for LocalDeviceAdapter {
    fn drop(&mut self) {
        if let Some(running) = self.lock_running().as_ref() {
            running.stop.store(true, Ordering::SeqCst);
        }
    }
}

struct InputWorker {
    renderer: Arc<LedRenderer>,
    mapper: Arc<KeyMapper>,
    arbiter: Arc<OutputArbiter>,
    unifier: Arc<EventUnifier>,
    lit: LitTable,
    stop: Arc<AtomicBool>,
}

impl InputWorker {
    fn run(&self, port: &str, messages: &Receiver<Vec<u8>>) {
        while !self.stop.load(Ordering::SeqCst) {
            match messages.recv_timeout(POLL_INTERVAL) {
                Ok(message) => self.handle(port, &message),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    log::warn!("MIDI device {port} went away");
                    break;
                }
            }
        }
    }

    fn handle(&self, port: &str, message: &[u8]) {
        let Some(event) = NoteEvent::from_midi(message, port) else {
            return;
        };
        log::debug!("{port}: {:?} {} vel {}", event.kind, event.note, event.velocity);

        if event.starts_note() {
            let leds = self.mapper.leds_for(event.note);
            if !leds.is_empty() && self.arbiter.live_may_render() {
                let color = note_color(event.note, event.velocity);
                self.renderer.set_many(leds.iter().map(|&i| (i, color)));
                lock_lit(&self.lit).insert(event.note, leds.to_vec());
            }
        } else if let Some(leds) = lock_lit(&self.lit).remove(&event.note) {
            if self.arbiter.live_may_render() {
                self.renderer.set_many(leds.into_iter().map(|i| (i, Rgb::BLACK)));
            }
        }

        self.unifier.ingest(SourceKind::LocalDevice, event);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// In-memory backend; the test feeds raw messages through `send`.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        pub ports: Vec<String>,
        sink: Mutex<Option<Sender<Vec<u8>>>>,
        close_delay: Duration,
    }

    impl FakeBackend {
        pub fn with_ports(ports: &[&str]) -> Self {
            Self {
                ports: ports.iter().map(|p| p.to_string()).collect(),
                ..Self::default()
            }
        }

        /// Connections from this backend block for `delay` when closed.
        pub fn closing_after(mut self, delay: Duration) -> Self {
            self.close_delay = delay;
            self
        }

        pub fn send(&self, message: &[u8]) {
            if let Some(sink) = self.sink.lock().unwrap().as_ref() {
                sink.send(message.to_vec()).unwrap();
            }
        }
    }

    struct FakeConnection {
        port: String,
        close_delay: Duration,
    }

    impl DeviceConnection for FakeConnection {
        fn port_name(&self) -> &str {
            &self.port
        }
    }

    impl Drop for FakeConnection {
        fn drop(&mut self) {
            thread::sleep(self.close_delay);
        }
    }

    impl DeviceBackend for FakeBackend {
        fn list_ports(&self) -> Result<Vec<String>> {
            Ok(self.ports.clone())
        }

        fn open(
            &self,
            name: Option<&str>,
            sink: Sender<Vec<u8>>,
        ) -> Result<Box<dyn DeviceConnection>> {
            let port = match name {
                Some(wanted) => self
                    .ports
                    .iter()
                    .find(|p| p.contains(wanted))
                    .ok_or_else(|| LightsError::Device(format!("no port matching '{wanted}'")))?,
                None => self.ports.first().ok_or(LightsError::NoDevice)?,
            };
            *self.sink.lock().unwrap() = Some(sink);
            Ok(Box::new(FakeConnection {
                port: port.clone(),
                close_delay: self.close_delay,
            }))
        }
    }

    pub(crate) fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..1000 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }
}
