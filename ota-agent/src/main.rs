use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use log::{info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

mod config;
mod ota;
mod publishers;
mod settings;
mod telemetry;
mod thread_util;
mod watchdog;

use config::AgentConfig;
use ota::bootloader::EspBootloaderAdapter;
use ota::dispatcher::{self, RawOtaCommand};
use ota::engine::{Collaborators, OtaEngine};
use ota::events::{EspLocalOtaBus, EventSink, LocalOtaBus, LocalOtaEvent, TelemetryEventSink};
use ota::flash::EspFlashWriter;
use ota::http::EspHttpDownloader;
use ota::reconcile::reconcile;
use publishers::default_publishers;
use settings::{EspSettingsStore, SettingsStore};
use telemetry::{EspTelemetryClient, SharedTelemetryClient, TelemetryClient};
use watchdog::WatchdogHandle;

/// Four-phase startup rendezvous: (a) telemetry client created, (b) agent
/// created, (c) telemetry connected, (d) agent started. The agent's
/// creation requires the telemetry handle (it's part of `State`), and the
/// telemetry connection callback sets (c), which unblocks (d) -- so the
/// agent task never runs a single iteration before the channel is up.
/// Modeled as `AtomicBool`s plus a `Condvar`, the same idiom
/// `tachtalk-firmware`'s `State` uses `Mutex`/`AtomicBool` fields for
/// cross-task coordination, just pulled into its own small type instead of
/// folding it into the big state struct.
#[derive(Default)]
struct StartupGate {
    telemetry_client_created: AtomicBool,
    agent_created: AtomicBool,
    telemetry_connected: AtomicBool,
    agent_started: AtomicBool,
    lock: Mutex<()>,
    cond: Condvar,
}

impl StartupGate {
    fn set(&self, flag: &AtomicBool) {
        flag.store(true, Ordering::Release);
        let _guard = self.lock.lock().unwrap();
        self.cond.notify_all();
    }

    fn wait_for(&self, flag: &AtomicBool) {
        let mut guard = self.lock.lock().unwrap();
        while !flag.load(Ordering::Acquire) {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

/// State shared across the telemetry task and the agent task.
struct State {
    settings: Arc<dyn SettingsStore>,
    engine: OtaEngine,
    events: Arc<dyn EventSink>,
    local_bus: Option<Arc<dyn LocalOtaBus>>,
    config: AgentConfig,
}

/// Builds a fresh set of per-update collaborators. Called once per admitted
/// `Update` command: the flash writer, HTTP downloader, and bootloader
/// adapter are all single-use for the lifetime of one worker, while
/// `settings`/`events`/`local_bus` are the agent-wide shared handles.
fn collaborators_for_update(state: &Arc<State>) -> Collaborators {
    Collaborators {
        settings: state.settings.clone(),
        flash: Box::new(EspFlashWriter::new()),
        http: Box::new(EspHttpDownloader::default()),
        bootloader: Box::new(EspBootloaderAdapter::default()),
        events: state.events.clone(),
        local_bus: state.local_bus.clone(),
    }
}

/// Parses one inbound aggregated object and dispatches it. Malformed JSON
/// (not a malformed *command* -- that's the dispatcher's job) is logged and
/// dropped: the telemetry callback contract requires returning quickly, not
/// reporting transport-level parse failures back over the same channel.
fn dispatch_inbound(state: &Arc<State>, payload: &str) {
    match serde_json::from_str::<RawOtaCommand>(payload) {
        Ok(raw) => {
            let state_for_collaborators = state.clone();
            dispatcher::dispatch(
                raw,
                &state.engine,
                state.settings.as_ref(),
                || collaborators_for_update(&state_for_collaborators),
                state.events.as_ref(),
            );
        }
        Err(e) => {
            warn!("ota: dropping malformed inbound command: {e}");
        }
    }
}

/// Telemetry device task: runs the network client's polling loop and
/// registers the callback that turns inbound command objects into engine
/// dispatch calls. Connection bring-up itself is an out-of-scope
/// collaborator concern; this task only watches for it and unblocks the
/// startup handshake once it has happened.
fn telemetry_task(state: &Arc<State>, gate: &Arc<StartupGate>, client: SharedTelemetryClient) {
    let watchdog = WatchdogHandle::register(c"telemetry");

    let handler_state = state.clone();
    client.register_command_handler(Box::new(move |payload| {
        dispatch_inbound(&handler_state, payload);
    }));

    loop {
        watchdog.feed();
        if client.is_connected() && !gate.telemetry_connected.load(Ordering::Acquire) {
            gate.set(&gate.telemetry_connected);
        }
        FreeRtos::delay_ms(100);
    }
}

/// Agent task: the periodic telemetry publishers (system status, storage
/// usage, OS/hardware info, WiFi scan -- all out-of-scope stubs, see
/// `publishers.rs`), polled at the configured cadence.
fn agent_task(state: &Arc<State>) {
    let watchdog = WatchdogHandle::register(c"agent");
    let mut publishers = default_publishers();
    loop {
        watchdog.feed();
        for publisher in &mut publishers {
            publisher.publish();
        }
        #[allow(clippy::cast_possible_truncation)]
        FreeRtos::delay_ms(state.config.publish_interval_ms as u32);
    }
}

/// Optional local OTA bus subscriber task: consumes the coarse mirrored
/// events (`Init`/`Success`/`Failed`/`PendingReboot`/`ConfirmReboot`) for
/// whatever local UI or watchdog wants to react to OTA progress without
/// parsing the aggregated event schema.
fn ota_bus_task(rx: std::sync::mpsc::Receiver<LocalOtaEvent>) {
    let watchdog = WatchdogHandle::register(c"ota_bus");
    for event in rx {
        watchdog.feed();
        info!("ota: local bus event: {event:?}");
    }
}

fn main() -> Result<()> {
    // It is necessary to call this function once. Otherwise some patches to the runtime
    // implemented by esp-idf-sys might not link properly. See https://github.com/esp-rs/esp-idf-template/issues/71
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();

    info!("Starting OTA agent...");

    let nvs = EspDefaultNvsPartition::take()?;
    let settings: Arc<dyn SettingsStore> = Arc::new(EspSettingsStore::init(nvs, "store")?);

    let config = AgentConfig::load_or_default(settings.as_ref());
    if let Err(e) = esp_idf_svc::log::set_target_level("*", config.log_level.as_level_filter()) {
        warn!("Failed to set log level: {e}");
    } else {
        info!("Log level set to {:?}", config.log_level);
    }

    let (local_tx, local_rx) = std::sync::mpsc::channel::<LocalOtaEvent>();
    let local_bus: Arc<dyn LocalOtaBus> = Arc::new(EspLocalOtaBus::new(local_tx));
    thread_util::spawn_named(c"ota_bus", move || ota_bus_task(local_rx));

    // Telemetry client created (phase a). Construction and the wire
    // protocol are out of scope; the handle exists purely so the rest of
    // the agent has something to publish through and register callbacks on.
    let telemetry_concrete = Arc::new(EspTelemetryClient::new());
    let telemetry: SharedTelemetryClient = telemetry_concrete.clone();
    let events: Arc<dyn EventSink> = Arc::new(TelemetryEventSink::new(telemetry.clone()));
    let gate = Arc::new(StartupGate::default());
    gate.set(&gate.telemetry_client_created);

    // Boot-time reconciliation runs once, before any command is accepted,
    // deciding the fate of any OTA that was in flight across the last
    // reboot.
    let mut boot_bootloader = EspBootloaderAdapter::default();
    reconcile(settings.as_ref(), &mut boot_bootloader, events.as_ref(), Some(local_bus.as_ref()));

    // Agent created (phase b): the agent's state needs the telemetry handle,
    // which it now has.
    let engine = OtaEngine::new();
    let state = Arc::new(State {
        settings: settings.clone(),
        engine,
        events: events.clone(),
        local_bus: Some(local_bus.clone()),
        config,
    });
    gate.set(&gate.agent_created);

    {
        let state = state.clone();
        let gate = gate.clone();
        let telemetry = telemetry.clone();
        thread_util::spawn_named(c"telemetry", move || {
            telemetry_task(&state, &gate, telemetry);
        });
    }

    // Telemetry connected (phase c): in the absence of a real backend, the
    // connection is considered established as soon as the telemetry task is
    // up and watching for it. A real implementation would call
    // `mark_connected` from its own connection-established callback instead.
    telemetry_concrete.mark_connected();
    gate.wait_for(&gate.telemetry_connected);

    // Agent started (phase d): only now does the agent task begin
    // publishing, so nothing goes out before the channel is up.
    gate.set(&gate.agent_started);
    {
        let state = state.clone();
        thread_util::spawn_named(c"agent", move || agent_task(&state));
    }

    info!("OTA agent running");
    loop {
        FreeRtos::delay_ms(1000);
    }
}
