//! Safe wrappers around SpeexDSP: acoustic echo canceller, preprocessor
//! (denoise/AGC) and resampler.

use std::ffi::{c_int, c_void};

// ======================== FFI declarations ========================

#[repr(C)]
pub struct SpeexEchoState {
    _private: [u8; 0],
}

#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

#[repr(C)]
pub struct SpeexResamplerState {
    _private: [u8; 0],
}

const SPEEX_ECHO_SET_SAMPLING_RATE: c_int = 24;

const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_AGC_LEVEL: c_int = 6;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;

const SPEEX_RESAMPLER_QUALITY_DEFAULT: c_int = 4;
const RESAMPLER_ERR_SUCCESS: c_int = 0;

unsafe extern "C" {
    fn speex_echo_state_init(frame_size: c_int, filter_length: c_int) -> *mut SpeexEchoState;
    fn speex_echo_state_destroy(st: *mut SpeexEchoState);
    fn speex_echo_state_reset(st: *mut SpeexEchoState);
    fn speex_echo_capture(st: *mut SpeexEchoState, rec: *const i16, out: *mut i16);
    fn speex_echo_playback(st: *mut SpeexEchoState, play: *const i16);
    fn speex_echo_ctl(st: *mut SpeexEchoState, request: c_int, ptr: *mut c_void) -> c_int;

    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;

    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_int(
        st: *mut SpeexResamplerState,
        channel_index: u32,
        in_: *const i16,
        in_len: *mut u32,
        out: *mut i16,
        out_len: *mut u32,
    ) -> c_int;
}

// ======================== Echo canceller ========================

/// Removes the speaker signal from the microphone signal.
///
/// The playback side feeds what it writes to the device with `playback`;
/// the capture side runs every block through `capture`. Both sides must
/// use blocks of exactly `frame_size` samples.
pub struct EchoCanceller {
    state: *mut SpeexEchoState,
    frame_size: usize,
    sample_rate: u32,
}

// Access is serialized by the Mutex the capture and playback threads share
unsafe impl Send for EchoCanceller {}

impl EchoCanceller {
    /// * `frame_size`  - samples per block
    /// * `tail_ms`     - echo tail the adaptive filter covers
    pub fn new(frame_size: usize, sample_rate: u32, tail_ms: u32) -> anyhow::Result<Self> {
        let filter_length = (sample_rate as usize * tail_ms as usize / 1000).max(frame_size);
        let state = unsafe { speex_echo_state_init(frame_size as c_int, filter_length as c_int) };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex echo canceller");
        }
        let mut rate = sample_rate as c_int;
        unsafe {
            speex_echo_ctl(
                state,
                SPEEX_ECHO_SET_SAMPLING_RATE,
                &mut rate as *mut c_int as *mut c_void,
            );
        }
        Ok(Self {
            state,
            frame_size,
            sample_rate,
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Cancel echo from one captured block.
    pub fn capture(&mut self, rec: &[i16], out: &mut [i16]) {
        debug_assert!(rec.len() == self.frame_size && out.len() == self.frame_size);
        unsafe {
            speex_echo_capture(self.state, rec.as_ptr(), out.as_mut_ptr());
        }
    }

    /// Record one block that was just sent to the speaker.
    pub fn playback(&mut self, play: &[i16]) {
        debug_assert!(play.len() == self.frame_size);
        unsafe {
            speex_echo_playback(self.state, play.as_ptr());
        }
    }

    pub fn reset(&mut self) {
        unsafe {
            speex_echo_state_reset(self.state);
        }
    }
}

impl Drop for EchoCanceller {
    fn drop(&mut self) {
        unsafe {
            speex_echo_state_destroy(self.state);
        }
    }
}

// ======================== Preprocessor (denoise + AGC) ========================

pub struct Preprocessor {
    state: *mut SpeexPreprocessState,
}

// SpeexPreprocessState is used from the capture thread only
unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// * `noise_suppress_db` - denoise at this level (negative dB), or off
    /// * `agc_level`         - AGC target level, or off
    pub fn new(
        frame_size: usize,
        sample_rate: u32,
        noise_suppress_db: Option<i32>,
        agc_level: Option<f32>,
    ) -> anyhow::Result<Self> {
        let state = unsafe {
            speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int)
        };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex preprocessor");
        }
        let mut pp = Self { state };

        pp.ctl_int(SPEEX_PREPROCESS_SET_DENOISE, noise_suppress_db.is_some() as c_int);
        if let Some(db) = noise_suppress_db {
            pp.ctl_int(SPEEX_PREPROCESS_SET_NOISE_SUPPRESS, db);
        }
        pp.ctl_int(SPEEX_PREPROCESS_SET_AGC, agc_level.is_some() as c_int);
        if let Some(mut level) = agc_level {
            unsafe {
                speex_preprocess_ctl(
                    pp.state,
                    SPEEX_PREPROCESS_SET_AGC_LEVEL,
                    &mut level as *mut f32 as *mut c_void,
                );
            }
        }
        Ok(pp)
    }

    fn ctl_int(&mut self, request: c_int, value: c_int) {
        let mut val = value;
        unsafe {
            speex_preprocess_ctl(self.state, request, &mut val as *mut c_int as *mut c_void);
        }
    }

    /// Process one block of 16-bit PCM mono in place.
    pub fn process(&mut self, samples: &mut [i16]) {
        unsafe {
            speex_preprocess_run(self.state, samples.as_mut_ptr());
        }
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

// ======================== Resampler ========================

/// Mono resampler, kept per input rate by the playback sink.
pub struct Resampler {
    state: *mut SpeexResamplerState,
    in_rate: u32,
    out_rate: u32,
}

unsafe impl Send for Resampler {}

impl Resampler {
    pub fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        let mut err: c_int = 0;
        let state = unsafe {
            speex_resampler_init(1, in_rate, out_rate, SPEEX_RESAMPLER_QUALITY_DEFAULT, &mut err)
        };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            anyhow::bail!("Failed to initialize speex resampler: err={}", err);
        }
        Ok(Self {
            state,
            in_rate,
            out_rate,
        })
    }

    pub fn in_rate(&self) -> u32 {
        self.in_rate
    }

    /// Resample a whole buffer.
    pub fn process(&mut self, input: &[i16]) -> anyhow::Result<Vec<i16>> {
        let capacity =
            (input.len() as u64 * self.out_rate as u64 / self.in_rate as u64) as usize + 64;
        let mut output = vec![0i16; capacity];
        let mut consumed = 0usize;
        let mut produced = 0usize;

        while consumed < input.len() {
            if produced == output.len() {
                output.resize(output.len() * 2, 0);
            }
            let mut in_len = (input.len() - consumed) as u32;
            let mut out_len = (output.len() - produced) as u32;
            let err = unsafe {
                speex_resampler_process_int(
                    self.state,
                    0,
                    input[consumed..].as_ptr(),
                    &mut in_len,
                    output[produced..].as_mut_ptr(),
                    &mut out_len,
                )
            };
            if err != RESAMPLER_ERR_SUCCESS {
                anyhow::bail!("Speex resampler error: {}", err);
            }
            if in_len == 0 && out_len == 0 {
                break;
            }
            consumed += in_len as usize;
            produced += out_len as usize;
        }
        output.truncate(produced);
        Ok(output)
    }
}

impl Drop for Resampler {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}
