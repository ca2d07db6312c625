//! Shared protocol constants for the Kraken control channel

// Every control frame is ASCII wrapped in these sentinels
pub const FRAME_OPEN: u8 = b'<';
pub const FRAME_CLOSE: u8 = b'>';

// Separates path from decimal size inside a frame body
pub const FIELD_SEP: char = ':';

// Upper bound on one control frame, sentinels included. A path plus a decimal
// size never gets close; anything longer is a broken or hostile peer.
pub const MAX_FRAME_LEN: usize = 4096;

// Width of the big-endian signed port field that follows START_TRANSFER
pub const PORT_FIELD_LEN: usize = 4;

// Frame spellings (bit-exact on the wire)
pub mod frame {
    pub const TRANSFER_REQUEST: &str = "<TRANSFER_REQUEST>";
    pub const END_TRANSFER: &str = "<END_TRANSFER>";
    pub const PROCESSING_COMPLETE: &str = "<PROCESSING_COMPLETE>";

    // Parameterised frames: PREFIX <path> ':' <size> SUFFIX
    pub const START_TRANSFER: &str = "<START_TRANSFER:";
    pub const START_HASHES_TRANSFER: &str = "<START_HASHES_TRANSFER:";
    pub const PROCESSING_OUTPUT: &str = "<PROCESSING_OUTPUT:";
    pub const SUFFIX: &str = ">";
}

// Centralized timeout defaults, overridable from config
pub mod timeouts {
    // Remainder of a frame (or a fixed trailer) once its first byte has arrived (ms)
    pub const FRAME_MS: u64 = 5_000;

    // Coordinator reply to a worker request, and the port field after START_TRANSFER (ms)
    pub const REPLY_MS: u64 = 30_000;

    // Worker data-plane listener waiting for its single connection (ms)
    pub const ACCEPT_MS: u64 = 30_000;

    // Dialing a control or data-plane peer (ms)
    pub const CONNECT_MS: u64 = 10_000;

    // TLS handshake on a dialed socket (ms)
    pub const HANDSHAKE_MS: u64 = 10_000;

    // Coordinator wait for the next worker frame; covers one wordlist's processing (s)
    pub const IDLE_SECS: u64 = 86_400;

    // Disk budget re-check interval while a worker is backing off (ms)
    pub const BUDGET_POLL_MS: u64 = 5_000;
}
