//! Reserved variable and function names understood by the RPC engine itself.

/// The mandatory variable naming the function to invoke on the receiving side.
pub const FUNC: &str = "func";

/// Sent once per connection, before the first application message.
pub const PROTOCOL: &str = "protocol";

/// Flow marker carrying the sender's forward/reverse sequence counters.
pub const FLUSH1: &str = "flush1";

/// Acknowledgement of a [`FLUSH1`], echoing its counters back.
pub const FLUSH2: &str = "flush2";

/// No further requests will be sent, the peer may finalize.
pub const RELEASE: &str = "release";

/// Final release, sent once the sender is about to disconnect.
pub const RELEASE2: &str = "release2";

/// Fallback handler looked up when a function name has no registered handler.
pub const FUNC_HANDLER: &str = "funcHandler";

/// Handler receiving per-message errors raised while dispatching.
pub const ERROR_HANDLER: &str = "errorHandler";

/// Names the function a handler's reply should invoke on the requester.
pub const CONFIRM: &str = "confirm";

/// Function used to report a message that could not be sent.
pub const CLIENT_MESSAGE: &str = "client-Message";

pub const HIMARK: &str = "himark";
pub const FSEQ: &str = "fseq";
pub const RSEQ: &str = "rseq";
pub const FLUSH_HARD: &str = "flushHard";
pub const SNDBUF: &str = "sndbuf";
pub const RCVBUF: &str = "rcvbuf";
pub const FMT0: &str = "fmt0";
