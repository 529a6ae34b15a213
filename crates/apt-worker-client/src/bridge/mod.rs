//! Wire layer between the client and apt-worker.

pub mod codec;
pub mod protocol;
pub mod transport;
