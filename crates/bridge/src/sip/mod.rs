pub mod message;
pub mod offer;
pub mod registrar;
pub mod uac;

pub use offer::build_sip_offer;
pub use registrar::Registrar;
pub use uac::{Dialog, SipTransport};
