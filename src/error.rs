use thiserror::Error;

/// Failures raised by the webservice collaborators (site reads/writes,
/// cache, course directory).
#[derive(Error, Debug, Clone)]
pub enum WsError {
    /// The remote function executed and explicitly declined the request.
    #[error("webservice rejected ({errorcode}): {message}")]
    Rejected { errorcode: String, message: String },
    /// The request never produced a well-formed answer.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("unexpected http status {0}")]
    Http(u16),
    #[error("undecodable webservice response: {0}")]
    Decode(String),
    /// No live answer and nothing usable in the request cache.
    #[error("no cached response for {0}")]
    CacheMiss(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("unknown site {0}")]
    UnknownSite(String),
}

impl WsError {
    /// True only for a confirmed server-side decline. Transport, decode and
    /// cache failures are ambiguous and must not be read as "feature off".
    pub fn is_server_rejection(&self) -> bool {
        matches!(self, WsError::Rejected { .. })
    }
}

/// Errors surfaced by the completion resolver itself.
#[derive(Error, Debug)]
pub enum CompletionError {
    /// The server reported no completion status for this course/user.
    #[error("no completion status available")]
    NoStatusAvailable,
    #[error("a course id is required")]
    InvalidArgument,
    /// The server did not acknowledge the self-completion mark. No further
    /// detail is attached; callers must not assume a message is present.
    #[error("self completion was not accepted")]
    SubmissionRejected,
    #[error(transparent)]
    Ws(#[from] WsError),
}

impl CompletionError {
    pub fn is_server_rejection(&self) -> bool {
        matches!(self, CompletionError::Ws(ws) if ws.is_server_rejection())
    }
}
