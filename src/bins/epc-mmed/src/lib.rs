//! EPCCore MME (Mobility Management Entity)
//!
//! Control-plane core of the MME: UE context store, EMM procedures (attach,
//! identification, authentication, security mode, detach), session and
//! bearer management over S11, S1 mobility, and the timers driving them.
//! Wire codecs and transports sit outside this crate; inbound messages reach
//! `MmeApp::dispatch` as decoded events and outbound messages leave through a
//! `PeerSink`.

pub mod app;
pub mod bearer;
pub mod config;
pub mod context;
pub mod dedicated_bearer;
pub mod emm_attach;
pub mod emm_common;
pub mod emm_detach;
pub mod error;
pub mod event;
pub mod handover;
pub mod metrics;
pub mod nas_build;
pub mod path;
pub mod procedure;
pub mod s11_build;
pub mod s1ap_build;
pub mod s6a_build;
pub mod session;
pub mod sgsap_build;
pub mod timer;
pub mod ue_store;

pub use app::MmeApp;
pub use config::MmeConfig;
pub use error::{MmeError, MmeResult};
pub use event::MmeEvent;

#[cfg(test)]
mod testing;
