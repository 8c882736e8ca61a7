//! The reliable sub-stream: sequence numbering, in-order delivery, acknowledgement, and
//! retransmission timing (§4.2).

mod rtt;
mod sequence;
mod window;

pub use rtt::RttEstimator;
pub use sequence::Seq;
pub use window::{Accept, InWindow};
