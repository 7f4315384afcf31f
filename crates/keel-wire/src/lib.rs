//! Git wire protocol for keel.
//!
//! This crate owns everything between "a connected byte stream" and "a
//! verified pack plus ref updates": pkt-line framing, side-band
//! multiplexing, protocol v1/v2 capability discovery and ref advertisement
//! parsing, and the fetch/push negotiation state machines. The carrier
//! itself (HTTP, SSH, a pipe, an in-memory buffer in tests) stays outside —
//! anything `Read + Write` will do.
//!
//! # Crate layout
//!
//! - [`pkt`] — the frame codec and the [`PktReader`](pkt::PktReader)
//!   cursor.
//! - [`sideband`] — demux/mux over channels 1/2/3.
//! - [`advert`] — discovery response parsing (v1 and v2).
//! - [`fetch`] — wants/haves negotiation and pack streaming.
//! - [`push`] — receive-pack commands and report-status.
//! - [`error`] — the [`WireError`] enum returned throughout.

pub mod advert;
pub mod error;
pub mod fetch;
pub mod pkt;
pub mod push;
pub mod sideband;

pub use advert::{Advertisement, RefRecord};
pub use error::WireError;
pub use fetch::{Deadline, FetchOptions, FetchState, FetchSummary};
pub use pkt::{Packet, PktReader};
pub use push::{PushCommand, RefUpdateStatus, ReportStatus};
pub use sideband::SideBandLimit;
