use thiserror::Error;

/// Stable machine-readable codes for model-output failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiErrorCode {
    NoJsonBlock,
    Unbalanced,
    IncompleteSentence,
    MissingFieldsContent,
    MissingFieldsTitle,
    InvalidKeywords,
    Malformed,
    ProviderTruncation,
    ProviderTruncationFlag,
    EmptyOrInvalid,
    ArcNoUsableArcs,
}

impl AiErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoJsonBlock => "NO_JSON_BLOCK",
            Self::Unbalanced => "UNBALANCED",
            Self::IncompleteSentence => "INCOMPLETE_SENTENCE",
            Self::MissingFieldsContent => "MISSING_FIELDS_CONTENT",
            Self::MissingFieldsTitle => "MISSING_FIELDS_TITLE",
            Self::InvalidKeywords => "INVALID_KEYWORDS",
            Self::Malformed => "MALFORMED",
            Self::ProviderTruncation => "PROVIDER_TRUNCATION",
            Self::ProviderTruncationFlag => "PROVIDER_TRUNCATION_FLAG",
            Self::EmptyOrInvalid => "EMPTY_OR_INVALID",
            Self::ArcNoUsableArcs => "ARC_NO_USABLE_ARCS",
        }
    }

    /// Only a prose-only answer is worth re-sampling with the same budget.
    pub fn recoverable(self) -> bool {
        matches!(self, Self::NoJsonBlock)
    }

    /// Next step shown to the operator on terminal failure.
    pub fn remedy(self) -> &'static str {
        match self {
            Self::NoJsonBlock => "retry; the model answered without JSON",
            Self::Unbalanced
            | Self::IncompleteSentence
            | Self::ProviderTruncation
            | Self::ProviderTruncationFlag => {
                "raise the response length budget or repair the JSON manually"
            }
            Self::MissingFieldsContent
            | Self::MissingFieldsTitle
            | Self::InvalidKeywords
            | Self::Malformed
            | Self::EmptyOrInvalid
            | Self::ArcNoUsableArcs => "edit the raw response and submit it through manual repair",
        }
    }
}

impl std::fmt::Display for AiErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct AiResponseError {
    pub code: AiErrorCode,
    pub message: String,
    pub recoverable: bool,
    pub raw: String,
}

impl AiResponseError {
    pub fn new(code: AiErrorCode, message: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            recoverable: code.recoverable(),
            raw: raw.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StmbError {
    #[error("{0} is already in progress")]
    Busy(&'static str),
    #[error("scene is ~{tokens} tokens, above the warning threshold of {threshold}; shrink the range or raise the threshold")]
    TokenWarning { tokens: u64, threshold: u64 },
    #[error("invalid profile: {0}")]
    InvalidProfile(String),
    #[error("invalid scene: {0}")]
    InvalidScene(String),
    #[error("Scene overlaps with existing memory: \"{title}\" (messages {start}-{end})")]
    SceneOverlap { title: String, start: i64, end: i64 },
    #[error("invalid lorebook: {0}")]
    Lorebook(String),
    #[error("invalid memory result: {0}")]
    InvalidMemory(String),
    #[error("side prompt: {0}")]
    SidePrompt(String),
    #[error(transparent)]
    AiResponse(#[from] AiResponseError),
    #[error("completion transport failed: {0:#}")]
    Transport(anyhow::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StmbError {
    /// Retry policy for the automatic loops.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::AiResponse(err) => err.recoverable,
            Self::Transport(_) | Self::Other(_) => true,
            Self::Busy(_)
            | Self::TokenWarning { .. }
            | Self::InvalidProfile(_)
            | Self::InvalidScene(_)
            | Self::SceneOverlap { .. }
            | Self::Lorebook(_)
            | Self::InvalidMemory(_)
            | Self::SidePrompt(_) => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Busy(_) => "BUSY",
            Self::TokenWarning { .. } => "TOKEN_WARNING",
            Self::InvalidProfile(_) => "INVALID_PROFILE",
            Self::InvalidScene(_) => "INVALID_SCENE",
            Self::SceneOverlap { .. } => "SCENE_OVERLAP",
            Self::Lorebook(_) => "INVALID_LOREBOOK",
            Self::InvalidMemory(_) => "INVALID_MEMORY",
            Self::SidePrompt(_) => "INVALID_SIDE_PROMPT",
            Self::AiResponse(err) => err.code.as_str(),
            Self::Transport(_) => "TRANSPORT",
            Self::Other(_) => "INTERNAL",
        }
    }
}
