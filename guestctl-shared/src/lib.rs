//! Shared building blocks for guest control.
//!
//! Both sides of the channel depend on this crate:
//! - `guestctl` (host service) encodes commands and decodes guest reports
//! - `guestctl-guest` (guest agent) decodes commands and encodes reports
//!
//! The wire format is an HGCM-style positional parameter list, see
//! [`protocol::HgcmParam`] and [`protocol::codec`].

pub mod constants;
pub mod errors;
pub mod logging;
pub mod protocol;
pub mod transport;

pub use errors::{GuestCtlError, GuestCtlResult};
pub use transport::{ClientId, ContextId, HgcmTransport};
