//! Protocol defines -- fixed wire lengths and timing parameters.
//!
//! Every length in here must match the chat server byte for byte. A mismatch
//! is a fatal handshake error, never something to retry with other values.

/// Fixed protocol parameters shared by the client and the chat server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolDefines {
    // -- Handshake --
    /// Random cookie chosen by each side.
    pub cookie_len: usize,
    /// `client_temp_pk || client_cookie`.
    pub client_hello_len: usize,
    /// `server_cookie || box(server_temp_pk || client_cookie)`.
    pub server_hello_len: usize,
    pub server_hello_box_len: usize,
    /// Plaintext login data.
    pub login_len: usize,
    /// `"threema-clever-extension-field" || u16 LE extensions box length`.
    pub extension_indicator_len: usize,
    pub reserved1_len: usize,
    pub vouch_len: usize,
    pub reserved2_len: usize,
    /// Boxed login ack.
    pub login_ack_len: usize,

    // -- Frames --
    /// Maximum box length of a post-handshake frame.
    pub max_frame_len: usize,
    /// `[payload type][3 reserved]`.
    pub frame_header_len: usize,

    // -- Task engine --
    /// Attempts before a failing task is surfaced to the caller.
    pub max_task_attempts: u32,
    /// First reconnect delay after a task protocol error.
    pub task_reconnect_min_delay_ms: u64,
    /// Upper bound of the doubling reconnect delay.
    pub task_reconnect_max_delay_ms: u64,

    // -- Connection --
    /// Reconnect backoff: min(base^min(attempts-1, saturation), max) seconds.
    pub reconnect_backoff_base: u64,
    pub reconnect_backoff_saturation: u32,
    pub reconnect_backoff_max_secs: u64,

    // -- Rendezvous --
    pub rendezvous_max_frame_before_nomination: usize,
    pub rendezvous_max_frame_after_nomination: usize,
    /// How long each candidate path may take to connect or be accepted.
    pub rendezvous_connect_timeout_ms: u64,
}

pub const DEFINES: ProtocolDefines = ProtocolDefines {
    // Handshake
    cookie_len: 16,
    client_hello_len: 32 + 16,
    server_hello_len: 16 + 64,
    server_hello_box_len: 32 + 16 + 16,
    login_len: 128,
    extension_indicator_len: EXTENSION_MAGIC.len() + 2,
    reserved1_len: 24,
    vouch_len: 32,
    reserved2_len: 16,
    login_ack_len: 16 + 16,

    // Frames
    max_frame_len: 8192,
    frame_header_len: 4,

    // Task engine
    max_task_attempts: 5,
    task_reconnect_min_delay_ms: 2_000,
    task_reconnect_max_delay_ms: 512_000,

    // Connection
    reconnect_backoff_base: 2,
    reconnect_backoff_saturation: 10,
    reconnect_backoff_max_secs: 10,

    // Rendezvous
    rendezvous_max_frame_before_nomination: 16 * 1024,
    rendezvous_max_frame_after_nomination: 100 * 1024 * 1024,
    rendezvous_connect_timeout_ms: 10_000,
};

/// Marks the login data as carrying an extensions box.
pub const EXTENSION_MAGIC: &str = "threema-clever-extension-field";

/// Identity length in the login data.
pub const IDENTITY_LEN: usize = 8;
