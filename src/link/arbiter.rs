//! Connection direction arbiter
//!
//! Both sides of a potential link see each other's advertisements, so
//! without coordination both would dial and the attempts would collide.
//! The arbiter breaks the symmetry deterministically: the side with the
//! numerically lower MAC dials as central, the other waits as peripheral.

use crate::identity::MacAddress;
use tracing::warn;

/// Which side of a potential link we take
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    /// We dial as central
    Initiate,
    /// The remote is expected to dial us
    Wait,
}

/// Decide our role for a link to `remote`.
///
/// Returns None when both addresses are equal: that is either our own
/// advertisement reflected back or a misbehaving stack, and dialing it
/// would loop.
pub fn choose_role(local: MacAddress, remote: MacAddress) -> Option<LinkRole> {
    let local_val = local.to_u64();
    let remote_val = remote.to_u64();

    if local_val == remote_val {
        warn!(mac = %local, "local and remote address identical, refusing link");
        return None;
    }

    if local_val < remote_val {
        Some(LinkRole::Initiate)
    } else {
        Some(LinkRole::Wait)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_mac_initiates() {
        let local: MacAddress = "B8:27:EB:10:28:CD".parse().expect("Valid MAC");
        let remote: MacAddress = "B8:27:EB:A8:A7:22".parse().expect("Valid MAC");

        assert_eq!(choose_role(local, remote), Some(LinkRole::Initiate));
        assert_eq!(choose_role(remote, local), Some(LinkRole::Wait));
    }

    #[test]
    fn test_roles_are_complementary() {
        let a = MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let b = MacAddress::new([0x00, 0x11, 0x22, 0x33, 0x44, 0x56]);

        let ours = choose_role(a, b).expect("distinct addresses");
        let theirs = choose_role(b, a).expect("distinct addresses");
        assert_ne!(ours, theirs);
    }

    #[test]
    fn test_equal_mac_refuses() {
        let mac = MacAddress::new([0xAA; 6]);
        assert_eq!(choose_role(mac, mac), None);
    }

    #[test]
    fn test_comparison_is_numeric_over_full_width() {
        // Differs only in the last octet
        let low = MacAddress::new([0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
        let high = MacAddress::new([0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x01]);
        assert_eq!(choose_role(low, high), Some(LinkRole::Initiate));

        // Differs only in the first octet
        let low = MacAddress::new([0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        let high = MacAddress::new([0x01, 0x00, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(choose_role(low, high), Some(LinkRole::Initiate));
    }
}
