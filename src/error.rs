//! Error reporting.
//!
//! Every failure flowing through the pipeline is an `Error`, which carries a `Kind` (the category
//! used for policy decisions such as retrying) and a human readable description.

use std::fmt;

/// The category of an error.
///
/// This enum contains variants representing general categories of pipeline errors. The order of
/// the variants is irrelevant; severity is defined by `Kind::severity()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    /// A transient device error.
    ///
    /// This is the only kind of error the device stage will retry.
    Io,
    /// The device is missing, detached or otherwise unreachable.
    Unavailable,
    /// Data corruption.
    ///
    /// Checksum mismatches, invalid gang headers and undecodable compressed data all fall in this
    /// category. These are never silently retried.
    Corruption,
    /// No more space to use.
    OutOfSpace,
    /// Implementation issue.
    ///
    /// A protocol violation which could be detected and reported, such as a double free or a
    /// malformed request.
    Implementation,
    /// The request was cancelled because the pipeline is shutting down.
    Cancelled,
}

impl Kind {
    /// The severity of the kind.
    ///
    /// When two errors are folded into one (e.g. a child error into its parent), the more severe
    /// one wins.
    fn severity(self) -> u8 {
        match self {
            Kind::Cancelled => 0,
            Kind::Implementation => 1,
            Kind::OutOfSpace => 2,
            Kind::Io => 3,
            Kind::Unavailable => 4,
            Kind::Corruption => 5,
        }
    }

    /// Is this error worth retrying at the device level?
    pub fn is_retryable(self) -> bool {
        self == Kind::Io
    }
}

/// A pipeline error.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    /// The type ("kind") of the error.
    pub kind: Kind,
    /// Description of the error.
    desc: Box<str>,
}

impl Error {
    /// Create a new error of kind `kind`.
    pub fn new<S: Into<String>>(kind: Kind, desc: S) -> Error {
        Error {
            kind: kind,
            desc: desc.into().into_boxed_str(),
        }
    }

    /// The description of the error.
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// Fold two errors into the more severe one.
    ///
    /// On equal severity, `self` (the error observed first) is kept.
    pub fn worse(self, other: Error) -> Error {
        if other.kind.severity() > self.kind.severity() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.desc)
    }
}

impl std::error::Error for Error {}

/// Create a pipeline error.
///
/// This constructs a value of type `Error` defined by the given parameter.
///
/// The first argument defines the kind (`Kind`) of the error. There is no need for importing the
/// type, as it is already prefixed with the enum.
///
/// The rest arguments are the usual formatting syntax (like `println!()`) representing the
/// description of the error.
#[macro_export]
macro_rules! err {
    ($kind:ident, $($rest:tt)*) => {
        $crate::error::Error::new($crate::error::Kind::$kind, format!($($rest)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worse_prefers_corruption() {
        let io = err!(Io, "sector {} unreadable", 7);
        let cksum = err!(Corruption, "checksum mismatch");

        assert_eq!(io.clone().worse(cksum.clone()).kind, Kind::Corruption);
        assert_eq!(cksum.worse(io).kind, Kind::Corruption);
    }

    #[test]
    fn worse_keeps_first_on_tie() {
        let a = err!(Io, "first");
        let b = err!(Io, "second");

        assert_eq!(a.worse(b).desc(), "first");
    }

    #[test]
    fn only_io_is_retryable() {
        assert!(Kind::Io.is_retryable());
        assert!(!Kind::Corruption.is_retryable());
        assert!(!Kind::Unavailable.is_retryable());
        assert!(!Kind::OutOfSpace.is_retryable());
    }

    #[test]
    fn display() {
        assert_eq!(err!(OutOfSpace, "need {} bytes", 512).to_string(), "OutOfSpace: need 512 bytes");
    }
}
