use ipld_core::cid::Cid;
use std::io;
use thiserror::Error;

/// Errors produced by the validation pipeline and its collaborators.
///
/// Every variant that can abort event verification maps to a short reason
/// mnemonic via [`RelayError::reason`]; the slurper uses those mnemonics as
/// `(hostname, reason)` metric labels.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("invalid DID: {0}")]
    BadDid(String),

    #[error("invalid rev TID: {0}")]
    BadRev(String),

    #[error("invalid timestamp: {0}")]
    BadTime(String),

    #[error("invalid record path: {0}")]
    BadPath(String),

    #[error("malformed CAR: {0}")]
    BadCar(String),

    #[error("block not present in CAR: {0}")]
    IncompleteCar(Cid),

    #[error("message rev does not match commit: msg={msg} car={car}")]
    CommitRevMismatch { msg: String, car: String },

    #[error("message DID does not match commit: msg={msg} car={car}")]
    CommitDidMismatch { msg: String, car: String },

    #[error("record op does not match MST value at {path}: op={op} tree={tree}")]
    OpCidMismatch { path: String, op: Cid, tree: Cid },

    #[error("record not present in MST: {0}")]
    RecordNotFound(String),

    #[error("record block missing from CAR: {0}")]
    MissingRecord(Cid),

    #[error("invalid repo op: {0}")]
    BadOp(String),

    #[error("ops do not compose: {0}")]
    InconsistentOps(String),

    #[error("op inconsistent with tree: {0}")]
    InconsistentOp(String),

    #[error("inverted tree root: {0}")]
    InvertedRoot(String),

    #[error("inverted tree root {computed} does not match claimed prevData {claimed}")]
    PrevDataMismatch { computed: Cid, claimed: Cid },

    #[error("new rev is before previous rev by {behind_us}us")]
    RevOutOfOrder { behind_us: i64 },

    #[error("new rev is more than {max_future_secs}s in the future")]
    RevTooFarFuture { max_future_secs: i64 },

    #[error("bad commit DID: {0}")]
    BadCommitDid(String),

    #[error("DID lookup failed: {0}")]
    DidResolutionFailed(String),

    #[error("identity not found: {0}")]
    DidNotFound(String),

    #[error("no atproto signing key for {0}")]
    NoSigningKey(String),

    #[error("invalid signature")]
    BadSignature,

    #[error("invalid public key: {0}")]
    InvalidKey(String),

    #[error("account {did} belongs to host {expected}, event came from {got}")]
    WrongHost { did: String, expected: String, got: String },

    #[error("host {host} is at its account limit ({limit})")]
    RepoLimitExceeded { host: String, limit: i64 },

    #[error("domain banned: {0}")]
    DomainBanned(String),

    #[error("cancelled")]
    Cancelled,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("storage error during {operation}: {details}")]
    Storage { operation: String, details: String },

    #[error("{format} serialization error: {details}")]
    Serialization { format: String, details: String },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Short mnemonic used as the `reason` label on verification counters.
    pub fn reason(&self) -> &'static str {
        match self {
            RelayError::BadDid(_) => "did",
            RelayError::BadRev(_) => "tid",
            RelayError::BadTime(_) => "time",
            RelayError::BadPath(_) => "opp",
            RelayError::BadCar(_) | RelayError::IncompleteCar(_) => "car",
            RelayError::CommitRevMismatch { .. } => "rev",
            RelayError::CommitDidMismatch { .. } => "did2",
            RelayError::OpCidMismatch { .. } => "opc",
            RelayError::RecordNotFound(_) => "rcid",
            RelayError::MissingRecord(_) => "rec",
            RelayError::BadOp(_) => "pop",
            RelayError::InconsistentOps(_) => "nop",
            RelayError::InconsistentOp(_) => "inv",
            RelayError::InvertedRoot(_) => "it",
            RelayError::PrevDataMismatch { .. } => "pd",
            RelayError::RevOutOfOrder { .. } => "revb",
            RelayError::RevTooFarFuture { .. } => "revf",
            RelayError::BadCommitDid(_) => "sig1",
            RelayError::DidResolutionFailed(_) | RelayError::DidNotFound(_) => "sig2",
            RelayError::NoSigningKey(_) => "sig3",
            RelayError::BadSignature | RelayError::InvalidKey(_) => "sig4",
            RelayError::WrongHost { .. } => "host",
            RelayError::RepoLimitExceeded { .. } => "quota",
            RelayError::DomainBanned(_) => "ban",
            RelayError::Cancelled => "cancel",
            RelayError::Transient(_) => "net",
            RelayError::Storage { .. } => "db",
            RelayError::Serialization { .. } => "ser",
            RelayError::Config(_) => "config",
        }
    }

    /// Transient errors are retried by the slurper; everything else drops the event.
    pub fn is_transient(&self) -> bool {
        matches!(self, RelayError::Transient(_) | RelayError::Storage { .. })
    }

    pub fn storage(operation: impl Into<String>, err: impl std::fmt::Display) -> Self {
        RelayError::Storage { operation: operation.into(), details: err.to_string() }
    }
}

impl From<io::Error> for RelayError {
    fn from(err: io::Error) -> Self {
        RelayError::Storage { operation: "io".to_string(), details: err.to_string() }
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Serialization { format: "json".to_string(), details: err.to_string() }
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        RelayError::Storage { operation: "sqlite".to_string(), details: err.to_string() }
    }
}
