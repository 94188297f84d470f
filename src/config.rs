use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Path appended to the backend base URL to reach the voice socket.
pub const VOICE_SOCKET_PATH: &str = "/webrtc-voice";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    // 网络配置
    pub api_url: String,
    pub ws_url: String,
    pub ws_token: String,
    pub connect_timeout_secs: u64,

    // 音频配置
    pub capture_device: String,
    pub playback_device: String,
    pub sample_rate: u32,
    pub frame_samples: usize,
    pub dsp_block_ms: u32,
    pub noise_suppress_db: i32,
    pub agc_level: f32,
    pub echo_tail_ms: u32,
    /// Output ring size; bounds how far the echo reference runs ahead of the speaker
    pub playback_buffer_ms: u32,
    pub vad_threshold: f32,

    // 通话配置
    pub outbound_queue: usize,
    pub response_sample_rate: u32,
    pub greeting: Option<String>,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        let greeting = env!("CALL_GREETING");
        Ok(Self {
            api_url: env!("API_URL").to_string(),
            ws_url: env!("WS_URL").to_string(),
            ws_token: env!("WS_TOKEN").to_string(),
            connect_timeout_secs: env!("CONNECT_TIMEOUT_SECS").parse()
                .map_err(|_| "Failed to parse CONNECT_TIMEOUT_SECS")?,

            capture_device: env!("CAPTURE_DEVICE").to_string(),
            playback_device: env!("PLAYBACK_DEVICE").to_string(),
            sample_rate: env!("AUDIO_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse AUDIO_SAMPLE_RATE")?,
            frame_samples: env!("AUDIO_FRAME_SAMPLES").parse()
                .map_err(|_| "Failed to parse AUDIO_FRAME_SAMPLES")?,
            dsp_block_ms: env!("AUDIO_DSP_BLOCK_MS").parse()
                .map_err(|_| "Failed to parse AUDIO_DSP_BLOCK_MS")?,
            noise_suppress_db: env!("AUDIO_NOISE_SUPPRESS_DB").parse()
                .map_err(|_| "Failed to parse AUDIO_NOISE_SUPPRESS_DB")?,
            agc_level: env!("AUDIO_AGC_LEVEL").parse()
                .map_err(|_| "Failed to parse AUDIO_AGC_LEVEL")?,
            echo_tail_ms: env!("AUDIO_ECHO_TAIL_MS").parse()
                .map_err(|_| "Failed to parse AUDIO_ECHO_TAIL_MS")?,
            playback_buffer_ms: env!("AUDIO_PLAYBACK_BUFFER_MS").parse()
                .map_err(|_| "Failed to parse AUDIO_PLAYBACK_BUFFER_MS")?,
            vad_threshold: env!("AUDIO_VAD_THRESHOLD").parse()
                .map_err(|_| "Failed to parse AUDIO_VAD_THRESHOLD")?,

            outbound_queue: env!("CALL_OUTBOUND_QUEUE").parse()
                .map_err(|_| "Failed to parse CALL_OUTBOUND_QUEUE")?,
            response_sample_rate: env!("CALL_RESPONSE_SAMPLE_RATE").parse()
                .map_err(|_| "Failed to parse CALL_RESPONSE_SAMPLE_RATE")?,
            greeting: (!greeting.trim().is_empty()).then(|| greeting.to_string()),
        })
    }

    /// WebSocket endpoint of the voice backend.
    ///
    /// An explicit `ws_url` wins; otherwise `api_url` is rewritten from
    /// http(s) to ws(s) and the voice socket path is appended.
    pub fn voice_url(&self) -> Result<Url, url::ParseError> {
        if !self.ws_url.trim().is_empty() {
            return Url::parse(self.ws_url.trim());
        }
        derive_ws_url(&self.api_url)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}

fn derive_ws_url(api_url: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(api_url.trim())?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    if url.scheme() != scheme {
        let rest = &url.as_str()[url.scheme().len()..];
        url = Url::parse(&format!("{}{}", scheme, rest))?;
    }
    let path = format!("{}{}", url.path().trim_end_matches('/'), VOICE_SOCKET_PATH);
    url.set_path(&path);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_time_config_parses() {
        let config = Config::new().unwrap();
        assert!(config.frame_samples > 0);
        assert!(config.sample_rate > 0);
        assert!(config.outbound_queue > 0);
    }

    #[test]
    fn test_playback_buffer_fits_echo_tail() {
        let config = Config::new().unwrap();
        assert!(config.playback_buffer_ms > 0);
        assert!(config.playback_buffer_ms < config.echo_tail_ms);
    }

    #[test]
    fn test_shipped_config_leaves_greeting_to_backend() {
        assert_eq!(Config::new().unwrap().greeting, None);
    }

    #[test]
    fn test_https_becomes_wss() {
        let url = derive_ws_url("https://voice.example.com").unwrap();
        assert_eq!(url.as_str(), "wss://voice.example.com/webrtc-voice");
    }

    #[test]
    fn test_http_becomes_ws_and_keeps_port() {
        let url = derive_ws_url("http://localhost:3001/").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:3001/webrtc-voice");
    }

    #[test]
    fn test_explicit_ws_url_wins() {
        let mut config = Config::default();
        config.ws_url = "ws://127.0.0.1:9000/custom".into();
        assert_eq!(config.voice_url().unwrap().as_str(), "ws://127.0.0.1:9000/custom");
    }
}
