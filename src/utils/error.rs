//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;

/// Customized error type for paxoskv.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PaxosError(pub(crate) String);

impl PaxosError {
    pub fn msg(msg: impl ToString) -> Self {
        PaxosError(msg.to_string())
    }
}

impl fmt::Display for PaxosError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for PaxosError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `PaxosError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for PaxosError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                PaxosError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::de::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);
impl_from_error!(tokio::task::JoinError);
