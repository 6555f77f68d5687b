//! Optional ABI capabilities negotiated between guest and host.

use std::fmt;
use std::ops::{BitAnd, BitOr};

/// A bitset of optional ABI capabilities.
///
/// A guest requests features once, during the prewarm invocation of `handle`;
/// the host answers with the subset it supports and the result is fixed for
/// the lifetime of the middleware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Features(u64);

impl Features {
    /// Buffer the request body so the guest can read it without starving the
    /// upstream handler.
    pub const BUFFER_REQUEST: Features = Features(1 << 0);

    /// Capture the upstream response so the guest can read and mutate it
    /// after `next`.
    pub const BUFFER_RESPONSE: Features = Features(1 << 1);

    /// Enable request/response trailer access.
    pub const TRAILERS: Features = Features(1 << 2);

    /// The empty feature set.
    pub const fn none() -> Features {
        Features(0)
    }

    /// Every feature this ABI defines.
    pub const fn all() -> Features {
        Features(1 << 0 | 1 << 1 | 1 << 2)
    }

    /// Build a feature set from raw bits, discarding unknown flags.
    pub const fn from_bits(bits: u64) -> Features {
        Features(bits & Features::all().0)
    }

    /// The raw bit representation, as exchanged over the ABI.
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Returns `true` if every flag in `other` is present in `self`.
    pub const fn contains(self, other: Features) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flag is set.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Features {
    type Output = Features;

    fn bitor(self, rhs: Features) -> Features {
        Features(self.0 | rhs.0)
    }
}

impl BitAnd for Features {
    type Output = Features;

    fn bitand(self, rhs: Features) -> Features {
        Features(self.0 & rhs.0)
    }
}

impl fmt::Display for Features {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (flag, name) in [
            (Features::BUFFER_REQUEST, "buffer_request"),
            (Features::BUFFER_RESPONSE, "buffer_response"),
            (Features::TRAILERS, "trailers"),
        ] {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits() {
        assert_eq!(Features::BUFFER_REQUEST.bits(), 1);
        assert_eq!(Features::BUFFER_RESPONSE.bits(), 2);
        assert_eq!(Features::TRAILERS.bits(), 4);
        assert_eq!(Features::all().bits(), 7);
        assert_eq!(Features::none().bits(), 0);
    }

    #[test]
    fn test_from_bits_discards_unknown() {
        let f = Features::from_bits(0xFF);
        assert_eq!(f, Features::all());

        let f = Features::from_bits(1 << 63 | 1);
        assert_eq!(f, Features::BUFFER_REQUEST);
    }

    #[test]
    fn test_contains() {
        let f = Features::BUFFER_REQUEST | Features::TRAILERS;
        assert!(f.contains(Features::BUFFER_REQUEST));
        assert!(f.contains(Features::TRAILERS));
        assert!(!f.contains(Features::BUFFER_RESPONSE));
        assert!(f.contains(Features::none()));
    }

    #[test]
    fn test_intersection() {
        let requested = Features::all();
        let supported = Features::BUFFER_REQUEST | Features::BUFFER_RESPONSE;
        assert_eq!(requested & supported, supported);
    }

    #[test]
    fn test_display() {
        assert_eq!(Features::none().to_string(), "");
        assert_eq!(Features::BUFFER_REQUEST.to_string(), "buffer_request");
        assert_eq!(
            Features::all().to_string(),
            "buffer_request|buffer_response|trailers"
        );
        assert_eq!(
            (Features::BUFFER_REQUEST | Features::TRAILERS).to_string(),
            "buffer_request|trailers"
        );
    }
}
