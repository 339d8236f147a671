use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    netatmo: Netatmo,
    monitor: Monitor,
    message: Message,
    speech: Speech,
    speaker: Speaker,
    resilience: Resilience,
    network: Network,
    status: Status,
    trigger: Trigger,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Netatmo {
    token_url: String,
    api_url: String,
    client_id: String,
    client_secret: String,
    username: String,
    password: String,
    scope: String,
    device_id: String,
}

#[derive(Deserialize)]
struct Monitor {
    target_location: String,
    warning_level: i64,
    interval_minutes: u64,
}

#[derive(Deserialize)]
struct Message {
    report: String,
    advice: String,
}

#[derive(Deserialize)]
struct Speech {
    endpoint: String,
    language: String,
    plain_http: bool,
    max_chars: usize,
}

#[derive(Deserialize)]
struct Speaker {
    name: String,
    executable: String,
    timeout_ms: u64,
}

#[derive(Deserialize)]
struct Resilience {
    initial_fuse: u32,
    link_retry_secs: u64,
    compose_retry_secs: u64,
    synthesis_retry_secs: u64,
    playback_retry_secs: u64,
}

#[derive(Deserialize)]
struct Network {
    probe_host: String,
    probe_port: u16,
    probe_timeout_ms: u64,
    http_timeout_secs: u64,
}

#[derive(Deserialize)]
struct Status {
    local_ip: String,
    local_port: u16,
    remote_ip: String,
    remote_port: u16,
}

#[derive(Deserialize)]
struct Trigger {
    local_ip: String,
    local_port: u16,
    buffer_size: usize,
}

// config.toml is baked into the binary; the device reloads it only by restarting
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // Netatmo account
    println!("cargo:rustc-env=NETATMO_TOKEN_URL={}", config.netatmo.token_url);
    println!("cargo:rustc-env=NETATMO_API_URL={}", config.netatmo.api_url);
    println!("cargo:rustc-env=NETATMO_CLIENT_ID={}", config.netatmo.client_id);
    println!("cargo:rustc-env=NETATMO_CLIENT_SECRET={}", config.netatmo.client_secret);
    println!("cargo:rustc-env=NETATMO_USERNAME={}", config.netatmo.username);
    println!("cargo:rustc-env=NETATMO_PASSWORD={}", config.netatmo.password);
    println!("cargo:rustc-env=NETATMO_SCOPE={}", config.netatmo.scope);
    println!("cargo:rustc-env=NETATMO_DEVICE_ID={}", config.netatmo.device_id);

    println!("cargo:rustc-env=TARGET_LOCATION={}", config.monitor.target_location);
    println!("cargo:rustc-env=WARNING_LEVEL={}", config.monitor.warning_level);
    println!("cargo:rustc-env=INTERVAL_MINUTES={}", config.monitor.interval_minutes);

    println!("cargo:rustc-env=MESSAGE_REPORT={}", config.message.report);
    println!("cargo:rustc-env=MESSAGE_ADVICE={}", config.message.advice);

    println!("cargo:rustc-env=SPEECH_ENDPOINT={}", config.speech.endpoint);
    println!("cargo:rustc-env=SPEECH_LANGUAGE={}", config.speech.language);
    println!("cargo:rustc-env=SPEECH_PLAIN_HTTP={}", config.speech.plain_http);
    println!("cargo:rustc-env=SPEECH_MAX_CHARS={}", config.speech.max_chars);

    println!("cargo:rustc-env=SPEAKER_NAME={}", config.speaker.name);
    println!("cargo:rustc-env=SPEAKER_EXECUTABLE={}", config.speaker.executable);
    println!("cargo:rustc-env=SPEAKER_TIMEOUT_MS={}", config.speaker.timeout_ms);

    // fuse and per-stage retry delays
    println!("cargo:rustc-env=INITIAL_FUSE={}", config.resilience.initial_fuse);
    println!("cargo:rustc-env=LINK_RETRY_SECS={}", config.resilience.link_retry_secs);
    println!("cargo:rustc-env=COMPOSE_RETRY_SECS={}", config.resilience.compose_retry_secs);
    println!("cargo:rustc-env=SYNTHESIS_RETRY_SECS={}", config.resilience.synthesis_retry_secs);
    println!("cargo:rustc-env=PLAYBACK_RETRY_SECS={}", config.resilience.playback_retry_secs);

    println!("cargo:rustc-env=PROBE_HOST={}", config.network.probe_host);
    println!("cargo:rustc-env=PROBE_PORT={}", config.network.probe_port);
    println!("cargo:rustc-env=PROBE_TIMEOUT_MS={}", config.network.probe_timeout_ms);
    println!("cargo:rustc-env=HTTP_TIMEOUT_SECS={}", config.network.http_timeout_secs);

    println!("cargo:rustc-env=STATUS_LOCAL_IP={}", config.status.local_ip);
    println!("cargo:rustc-env=STATUS_LOCAL_PORT={}", config.status.local_port);
    println!("cargo:rustc-env=STATUS_REMOTE_IP={}", config.status.remote_ip);
    println!("cargo:rustc-env=STATUS_REMOTE_PORT={}", config.status.remote_port);

    println!("cargo:rustc-env=TRIGGER_LOCAL_IP={}", config.trigger.local_ip);
    println!("cargo:rustc-env=TRIGGER_LOCAL_PORT={}", config.trigger.local_port);
    println!("cargo:rustc-env=TRIGGER_BUFFER_SIZE={}", config.trigger.buffer_size);
}
