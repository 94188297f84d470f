use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    network: Network,
    audio: Audio,
    call: Call,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Network {
    api_url: String,
    ws_url: String,
    ws_token: String,
    connect_timeout_secs: u64,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    sample_rate: u32,
    frame_samples: usize,
    dsp_block_ms: u32,
    noise_suppress_db: i32,
    agc_level: f32,
    echo_tail_ms: u32,
    playback_buffer_ms: u32,
    vad_threshold: f32,
}

#[derive(Deserialize)]
struct Call {
    outbound_queue: usize,
    response_sample_rate: u32,
    greeting: String,
}

// 在编译时读取 config.toml 并设置环境变量
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

    // 网络配置
    println!("cargo:rustc-env=API_URL={}", config.network.api_url);
    println!("cargo:rustc-env=WS_URL={}", config.network.ws_url);
    println!("cargo:rustc-env=WS_TOKEN={}", config.network.ws_token);
    println!("cargo:rustc-env=CONNECT_TIMEOUT_SECS={}", config.network.connect_timeout_secs);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=AUDIO_FRAME_SAMPLES={}", config.audio.frame_samples);
    println!("cargo:rustc-env=AUDIO_DSP_BLOCK_MS={}", config.audio.dsp_block_ms);
    println!("cargo:rustc-env=AUDIO_NOISE_SUPPRESS_DB={}", config.audio.noise_suppress_db);
    println!("cargo:rustc-env=AUDIO_AGC_LEVEL={}", config.audio.agc_level);
    println!("cargo:rustc-env=AUDIO_ECHO_TAIL_MS={}", config.audio.echo_tail_ms);
    println!(
        "cargo:rustc-env=AUDIO_PLAYBACK_BUFFER_MS={}",
        config.audio.playback_buffer_ms
    );
    println!("cargo:rustc-env=AUDIO_VAD_THRESHOLD={}", config.audio.vad_threshold);

    // 通话配置
    println!("cargo:rustc-env=CALL_OUTBOUND_QUEUE={}", config.call.outbound_queue);
    println!("cargo:rustc-env=CALL_RESPONSE_SAMPLE_RATE={}", config.call.response_sample_rate);
    println!("cargo:rustc-env=CALL_GREETING={}", config.call.greeting);

    // speexdsp 只在启用 device 特性时需要
    if std::env::var_os("CARGO_FEATURE_DEVICE").is_none() {
        return;
    }

    let target = std::env::var("TARGET").unwrap_or_default();
    if target.contains("musl") {
        // musl 目标：使用手动编译的静态库，不依赖 pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
