//! Server epoch validation, used to detect loss of server state.

use tracing::trace;

/// Tracks the server's epoch time across responses.
///
/// Per [RFC 6887 §8.5], every response carries the server's epoch time; a
/// client compares how far the epoch advanced against its own clock. An
/// epoch running noticeably behind means the server restarted and lost its
/// mapping state, and every active mapping must be re-sent.
///
/// [RFC 6887 §8.5]: https://datatracker.ietf.org/doc/html/rfc6887#section-8.5
#[derive(Debug, Default)]
pub(crate) struct ClientEpoch {
    prev_server_time: u32,
    prev_client_time: i64,
}

impl ClientEpoch {
    /// Checks a received epoch against the previous observation and records
    /// it. Returns false when the server appears to have lost state.
    ///
    /// `client_time` is in seconds on any monotonic clock; only deltas are
    /// used.
    pub fn validate(&mut self, client_time: i64, server_time: u32) -> bool {
        let valid = if self.prev_server_time == 0 {
            // first observation, nothing to compare against
            true
        } else {
            let client_delta = client_time - self.prev_client_time;
            let expected = i64::from(self.prev_server_time) + client_delta;
            if expected - i64::from(server_time) > 1 {
                // the epoch lags the client clock: the server reset
                false
            } else {
                // in sync so far; reject clock rates diverging by over 1/16
                let server_delta = i64::from(server_time) - i64::from(self.prev_server_time);
                client_delta + 2 >= server_delta - server_delta / 16
                    && server_delta + 2 >= client_delta - client_delta / 16
            }
        };
        trace!(
            prev_server_time = self.prev_server_time,
            prev_client_time = self.prev_client_time,
            server_time,
            client_time,
            valid,
            "epoch check"
        );
        self.prev_server_time = server_time;
        self.prev_client_time = client_time;
        valid
    }
}
