//! Client implementation of the Port Control Protocol (PCP,
//! [RFC 6887](https://datatracker.ietf.org/doc/html/rfc6887)).
//!
//! A PCP client runs behind a NAT or firewall and negotiates with the
//! network's gateway to create, refresh and tear down port mappings. The
//! [`Client`] keeps every confirmed mapping alive with the randomized
//! refresh schedule of RFC 6887 §11.2.1, watches the server's epoch to
//! detect state loss, and publishes an [`Event`] for every state change.
//!
//! # Quick start
//!
//! ```no_run
//! use pcp_client::{Client, Config, Protocol};
//!
//! # async fn example() -> Result<(), pcp_client::Error> {
//! let (client, mut events) = Client::new(Config::default()).await?;
//!
//! // make local port 8080 reachable for an hour
//! client.add_map(Protocol::Tcp, 8080, 0, None, 3600).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod epoch;
mod error;
mod event;
pub mod interfaces;
mod mapping;
pub mod protocol;
#[cfg(test)]
mod test_utils;
pub mod transport;
mod util;

pub use client::{Client, Config};
pub use error::Error;
pub use event::Event;
pub use mapping::{PeerMapping, PortMapping, RefreshTime};
pub use protocol::{Protocol, ResultCode};
