use thiserror::Error;

/// All errors produced by wakelink-core.
#[derive(Debug, Error)]
pub enum WakelinkError {
    #[error("microphone permission has not been granted")]
    PermissionDenied,

    #[error("audio device init failed: {0}")]
    DeviceInit(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("codec error: {0}")]
    Codec(String),

    /// The keyword engine handed back a null stream: listening cannot proceed.
    #[error("keyword engine configuration failed: {0}")]
    EngineConfig(String),

    #[error("keyword engine error: {0}")]
    Engine(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("audio session is not initialized")]
    NotInitialized,

    #[error("already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by the engine's recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PermissionDenied,
    DeviceInitFailure,
    CodecFailure,
    EngineConfigFailure,
    TransientIoFailure,
    Other,
}

impl WakelinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PermissionDenied => ErrorKind::PermissionDenied,
            Self::DeviceInit(_)
            | Self::AudioDevice(_)
            | Self::AudioStream(_)
            | Self::NoDefaultInputDevice
            | Self::NoDefaultOutputDevice => ErrorKind::DeviceInitFailure,
            Self::Codec(_) => ErrorKind::CodecFailure,
            Self::EngineConfig(_) => ErrorKind::EngineConfigFailure,
            Self::TransientIo(_) | Self::Io(_) => ErrorKind::TransientIoFailure,
            Self::Engine(_)
            | Self::NotInitialized
            | Self::AlreadyRunning
            | Self::Wav(_)
            | Self::Other(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Whether the supervisor should attempt one reinitialisation before
    /// surfacing this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::DeviceInitFailure | ErrorKind::TransientIoFailure
        )
    }
}

pub type Result<T> = std::result::Result<T, WakelinkError>;
