use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    gpio::{Output, PinDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver, LEDC},
    units::Hertz,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{gpio::AnyOutputPin, modem::Modem, prelude::Peripherals},
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::{EspSntp, SyncStatus},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};

use irrigation_common::{
    config::{MotorPins, NetworkConfig},
    store::decode_record,
    Actuator, Clock, ControlCommand, ControlReply, ControlService, DriverError, LineDirection,
    MotorActuator, MotorDriver, PersistedRecord, RuntimeConfig, ScheduleStore, ScheduleWorker,
    Scheduler, ShutdownSignal, StoreError, SystemClock, TimeSync, TimeSyncError, CORS_HEADERS,
    MAX_BODY_BYTES,
};

const NVS_NAMESPACE: &str = "irrigation";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const NVS_SCHEDULE_KEY: &str = "schedule_json";
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SNTP_SYNC_TIMEOUT: Duration = Duration::from_secs(15);
const SNTP_POLL_MS: u64 = 250;
const MANUAL_RUN_STACK_BYTES: usize = 8 * 1024;

struct NvsStore {
    partition: Mutex<EspDefaultNvsPartition>,
}

struct EspMotorDriver {
    speed: LedcDriver<'static>,
    dir1: PinDriver<'static, AnyOutputPin, Output>,
    dir2: PinDriver<'static, AnyOutputPin, Output>,
}

struct SntpTimeSync {
    timeout: Duration,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = Arc::new(NvsStore {
        partition: Mutex::new(nvs_partition.clone()),
    });

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);
    let config = runtime.controller.clone();

    info!(
        "NVS config loaded: ssid=`{}`, motor pins speed={} dir={}/{}",
        runtime.network.wifi_ssid,
        runtime.motor.speed_pin,
        runtime.motor.dir1_pin,
        runtime.motor.dir2_pin,
    );

    let Peripherals { modem, ledc, .. } = Peripherals::take()?;

    // Bring the bridge up first so its outputs are forced off before anything
    // else can fail.
    let motor = init_motor_driver(ledc, &runtime.motor).context("motor driver startup failed")?;
    let actuator: Arc<dyn Actuator> = Arc::new(MotorActuator::new(
        Box::new(motor),
        Duration::from_millis(config.fault_check_interval_ms),
    ));

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let mut time_sync = SntpTimeSync {
        timeout: SNTP_SYNC_TIMEOUT,
    };
    if let Err(err) = time_sync.sync() {
        warn!("initial time sync failed, scheduling on local clock: {err}");
    }
    let boot_epoch = clock.now_epoch();

    let store: Arc<dyn ScheduleStore> = nvs_store.clone();
    let scheduler = Arc::new(Scheduler::restore(
        &config,
        actuator.clone(),
        store,
        boot_epoch,
    ));
    let control = Arc::new(ControlService::new(
        scheduler.clone(),
        actuator.clone(),
        clock.clone(),
        config.manual_run_default_secs,
    ));

    let server = create_http_server(control)?;

    let shutdown = Arc::new(ShutdownSignal::new());
    let schedule_loop = ScheduleWorker::new(
        scheduler,
        clock,
        Box::new(time_sync),
        config.time_sync_interval_secs,
        Duration::from_millis(config.poll_interval_ms),
    )
    .synced_at(boot_epoch)
    .spawn(shutdown)
    .context("failed to spawn schedule loop")?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    let joined = schedule_loop.join();
    actuator.shutdown();
    joined.map_err(|_| anyhow!("schedule loop panicked"))
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn init_motor_driver(ledc: LEDC, pins: &MotorPins) -> anyhow::Result<EspMotorDriver> {
    let timer = LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig::default().frequency(Hertz(pins.pwm_frequency_hz)),
    )
    .context("failed to configure LEDC timer")?;

    let speed = unsafe { LedcDriver::new(ledc.channel0, timer, AnyOutputPin::new(pins.speed_pin)) }
        .with_context(|| format!("failed to attach PWM to GPIO{}", pins.speed_pin))?;
    let dir1 = unsafe { PinDriver::output(AnyOutputPin::new(pins.dir1_pin)) }
        .with_context(|| format!("failed to configure GPIO{}", pins.dir1_pin))?;
    let dir2 = unsafe { PinDriver::output(AnyOutputPin::new(pins.dir2_pin)) }
        .with_context(|| format!("failed to configure GPIO{}", pins.dir2_pin))?;

    info!(
        "motor driver on GPIO{} @ {}Hz, direction GPIO{}/{}",
        pins.speed_pin, pins.pwm_frequency_hz, pins.dir1_pin, pins.dir2_pin
    );
    Ok(EspMotorDriver { speed, dir1, dir2 })
}

impl MotorDriver for EspMotorDriver {
    fn set_direction(&mut self, direction: LineDirection) -> Result<(), DriverError> {
        let (dir1, dir2) = match direction {
            LineDirection::Forward => (true, false),
            LineDirection::Reverse => (false, true),
            LineDirection::Stopped => (false, false),
        };
        self.dir1
            .set_level(dir1.into())
            .and_then(|()| self.dir2.set_level(dir2.into()))
            .map_err(|err| DriverError::Write(format!("direction lines: {err}")))
    }

    fn set_duty(&mut self, duty: u16) -> Result<(), DriverError> {
        let max = u64::from(self.speed.get_max_duty());
        let scaled = u64::from(duty) * max / u64::from(u16::MAX);
        self.speed
            .set_duty(scaled as u32)
            .map_err(|err| DriverError::Write(format!("speed duty: {err}")))
    }
}

impl TimeSync for SntpTimeSync {
    fn sync(&mut self) -> Result<(), TimeSyncError> {
        let sntp =
            EspSntp::new_default().map_err(|err| TimeSyncError::Unavailable(err.to_string()))?;
        let deadline = Instant::now() + self.timeout;
        while sntp.get_sync_status() != SyncStatus::Completed {
            if Instant::now() >= deadline {
                return Err(TimeSyncError::Timeout(self.timeout));
            }
            thread::sleep(Duration::from_millis(SNTP_POLL_MS));
        }
        info!("SNTP time sync completed");
        Ok(())
    }
}

impl NvsStore {
    fn open(&self) -> Result<EspNvs<esp_idf_svc::nvs::NvsDefault>, StoreError> {
        let partition = self
            .partition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        EspNvs::new(partition, NVS_NAMESPACE, true)
            .map_err(|err| StoreError::Backend(format!("open NVS namespace: {err}")))
    }

    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; 2048];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }
}

impl ScheduleStore for NvsStore {
    fn load(&self) -> Option<PersistedRecord> {
        let nvs = match self.open() {
            Ok(nvs) => nvs,
            Err(err) => {
                warn!("failed to load schedule from NVS: {err}");
                return None;
            }
        };

        let mut buffer = vec![0_u8; 256];
        match nvs.get_str(NVS_SCHEDULE_KEY, &mut buffer) {
            Ok(Some(value)) => decode_record(value.as_bytes()),
            Ok(None) => None,
            Err(err) => {
                warn!("failed to read schedule from NVS: {err}");
                None
            }
        }
    }

    fn save(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        // NVS commits each key atomically, so a torn write leaves the old value.
        let mut nvs = self.open()?;
        let payload = serde_json::to_string(record)?;
        nvs.set_str(NVS_SCHEDULE_KEY, &payload)
            .map_err(|err| StoreError::Backend(format!("write schedule: {err}")))
    }
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<BlockingWifi<EspWifi<'static>>> {
    let ssid = network.wifi_ssid.trim();
    if ssid.is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{ssid}`");

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                return Ok(wifi);
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    let _ = wifi.stop();
    Err(anyhow!(
        "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed: {last_err:?}"
    ))
}

fn create_http_server(control: Arc<ControlService>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 10 * 1024,
        uri_match_wildcard: true,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    for (method, name) in [
        (Method::Get, "GET"),
        (Method::Post, "POST"),
        (Method::Options, "OPTIONS"),
    ] {
        let control = control.clone();
        server.fn_handler::<anyhow::Error, _>("/*", method, move |mut req| {
            let body = read_request_body(&mut req)?;
            let command = ControlCommand::parse(name, req.uri(), &body);
            let reply = dispatch(&control, command);
            write_reply(req, &reply)
        })?;
    }

    Ok(server)
}

// The HTTP task serves one request at a time, so runs are detached.
fn dispatch(control: &Arc<ControlService>, command: ControlCommand) -> ControlReply {
    if !command.is_motor_run() {
        return control.handle(command);
    }
    if control.actuator().state().is_running() {
        return ControlReply::error("Motor busy");
    }

    let runner = control.clone();
    let spawned = thread::Builder::new()
        .name("manual-run".into())
        .stack_size(MANUAL_RUN_STACK_BYTES)
        .spawn(move || {
            let reply = runner.handle(command);
            info!("manual run finished: {}", reply.to_body());
        });

    match spawned {
        Ok(_) => ControlReply::status("Motor started"),
        Err(err) => {
            warn!("failed to spawn manual run thread: {err}");
            ControlReply::error("Motor busy")
        }
    }
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    // One byte past the limit is enough for the parser to refuse it.
    let len = (req.content_len().unwrap_or(0) as usize).min(MAX_BODY_BYTES + 1);

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_reply(
    req: Request<&mut EspHttpConnection<'_>>,
    reply: &ControlReply,
) -> anyhow::Result<()> {
    let mut headers = CORS_HEADERS.to_vec();
    if let ControlReply::Json(_) = reply {
        headers.push(("Content-Type", "application/json"));
    }

    req.into_response(200, Some("OK"), &headers)?
        .write_all(reply.to_body().as_bytes())?;
    Ok(())
}
