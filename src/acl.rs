//! NFSv4 access control lists.
//!
//! An ACL is an ordered sequence of access control entries evaluated
//! first-match per requested bit. `chmod` does not discard named entries:
//! [`project_mode`] rewrites only the OWNER@/GROUP@/EVERYONE@ entries from
//! the mode bits, which keeps a round-trip of set-ACL / chmod / get-ACL
//! stable for named principals.

use smallvec::SmallVec;

use crate::ident::Principal;

/// Entry disposition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AceType {
    Allow,
    Deny,
    Audit,
    Alarm,
}

/// ACE inheritance and qualifier flags.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct AceFlags(pub u32);

impl AceFlags {
    pub const FILE_INHERIT: AceFlags = AceFlags(0x0000_0001);
    pub const DIR_INHERIT: AceFlags = AceFlags(0x0000_0002);
    pub const NO_PROPAGATE: AceFlags = AceFlags(0x0000_0004);
    pub const INHERIT_ONLY: AceFlags = AceFlags(0x0000_0008);
    pub const IDENTIFIER_GROUP: AceFlags = AceFlags(0x0000_0040);

    pub fn contains(&self, other: AceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for AceFlags {
    type Output = AceFlags;
    fn bitor(self, rhs: AceFlags) -> AceFlags {
        AceFlags(self.0 | rhs.0)
    }
}

/// ACE permission mask bits (RFC 7530 6.2.1.3).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct AceMask(pub u32);

impl AceMask {
    pub const READ_DATA: AceMask = AceMask(0x0000_0001);
    pub const WRITE_DATA: AceMask = AceMask(0x0000_0002);
    pub const APPEND_DATA: AceMask = AceMask(0x0000_0004);
    pub const EXECUTE: AceMask = AceMask(0x0000_0020);
    pub const DELETE_CHILD: AceMask = AceMask(0x0000_0040);
    pub const READ_ATTRIBUTES: AceMask = AceMask(0x0000_0080);
    pub const WRITE_ATTRIBUTES: AceMask = AceMask(0x0000_0100);
    pub const DELETE: AceMask = AceMask(0x0001_0000);
    pub const READ_ACL: AceMask = AceMask(0x0002_0000);
    pub const WRITE_ACL: AceMask = AceMask(0x0004_0000);
    pub const WRITE_OWNER: AceMask = AceMask(0x0008_0000);
    pub const SYNCHRONIZE: AceMask = AceMask(0x0010_0000);

    pub fn empty() -> AceMask {
        AceMask(0)
    }

    pub fn contains(&self, other: AceMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(&self, other: AceMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for AceMask {
    type Output = AceMask;
    fn bitor(self, rhs: AceMask) -> AceMask {
        AceMask(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for AceMask {
    fn bitor_assign(&mut self, rhs: AceMask) {
        self.0 |= rhs.0;
    }
}

/// Principal an ACE applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Who {
    /// OWNER@
    Owner,
    /// GROUP@
    Group,
    /// EVERYONE@
    Everyone,
    /// A named user or (with [`AceFlags::IDENTIFIER_GROUP`]) group,
    /// carrying the resolved numeric id.
    Named(u32),
}

/// One access control entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ace {
    pub ace_type: AceType,
    pub flags: AceFlags,
    pub mask: AceMask,
    pub who: Who,
}

impl Ace {
    pub fn allow(who: Who, mask: AceMask) -> Ace {
        Ace { ace_type: AceType::Allow, flags: AceFlags::default(), mask, who }
    }

    pub fn deny(who: Who, mask: AceMask) -> Ace {
        Ace { ace_type: AceType::Deny, flags: AceFlags::default(), mask, who }
    }
}

/// An ACL: a short ordered list of entries.
pub type Acl = SmallVec<[Ace; 6]>;

fn mode_to_mask(bits: u32) -> AceMask {
    let mut mask = AceMask::READ_ATTRIBUTES | AceMask::READ_ACL | AceMask::SYNCHRONIZE;
    if bits & 0o4 != 0 {
        mask |= AceMask::READ_DATA;
    }
    if bits & 0o2 != 0 {
        mask |= AceMask::WRITE_DATA | AceMask::APPEND_DATA;
    }
    if bits & 0o1 != 0 {
        mask |= AceMask::EXECUTE;
    }
    mask
}

fn is_special_allow(ace: &Ace, who: &Who) -> bool {
    ace.ace_type == AceType::Allow && &ace.who == who
}

/// Projects mode bits onto the OWNER@/GROUP@/EVERYONE@ allow entries.
///
/// Named entries are preserved in place. The special entries are rewritten
/// (or appended if absent) with masks derived from the owner/group/other
/// permission triples.
pub fn project_mode(acl: &mut Acl, mode: u32) {
    let triples = [
        (Who::Owner, (mode >> 6) & 0o7),
        (Who::Group, (mode >> 3) & 0o7),
        (Who::Everyone, mode & 0o7),
    ];
    for (who, bits) in triples {
        let mask = mode_to_mask(bits);
        match acl.iter_mut().find(|a| is_special_allow(a, &who)) {
            Some(ace) => ace.mask = mask,
            None => acl.push(Ace::allow(who, mask)),
        }
    }
}

/// Builds the canonical three-entry ACL for a plain mode.
pub fn acl_from_mode(mode: u32) -> Acl {
    let mut acl = Acl::new();
    project_mode(&mut acl, mode);
    acl
}

fn ace_matches(ace: &Ace, principal: &Principal, owner_uid: u32, owner_gid: u32) -> bool {
    match &ace.who {
        Who::Owner => principal.uid == owner_uid,
        Who::Group => principal.gid == owner_gid || principal.groups.contains(&owner_gid),
        Who::Everyone => true,
        Who::Named(id) => {
            if ace.flags.contains(AceFlags::IDENTIFIER_GROUP) {
                principal.gid == *id || principal.groups.contains(id)
            } else {
                principal.uid == *id
            }
        }
    }
}

/// Evaluates an ACL for a principal, first-match per bit.
///
/// Returns true when every requested bit is granted by an allow entry
/// before any deny entry covers it.
pub fn evaluate(
    acl: &[Ace],
    principal: &Principal,
    owner_uid: u32,
    owner_gid: u32,
    requested: AceMask,
) -> bool {
    let mut remaining = requested;
    for ace in acl {
        if remaining.0 == 0 {
            break;
        }
        if ace.flags.contains(AceFlags::INHERIT_ONLY) {
            continue;
        }
        if !ace_matches(ace, principal, owner_uid, owner_gid) {
            continue;
        }
        match ace.ace_type {
            AceType::Allow => remaining = AceMask(remaining.0 & !ace.mask.0),
            AceType::Deny => {
                if ace.mask.intersects(remaining) {
                    return false;
                }
            }
            AceType::Audit | AceType::Alarm => {}
        }
    }
    remaining.0 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(uid: u32, gid: u32) -> Principal {
        Principal { uid, gid, groups: vec![gid] }
    }

    #[test]
    fn mode_projection_keeps_named_entries() {
        let mut acl = Acl::new();
        acl.push(Ace::allow(Who::Named(1007), AceMask::READ_DATA));
        project_mode(&mut acl, 0o640);
        assert_eq!(acl.len(), 4);
        assert!(acl.iter().any(|a| a.who == Who::Named(1007)));

        // re-projection rewrites in place, no duplicates
        project_mode(&mut acl, 0o600);
        assert_eq!(acl.len(), 4);
        let group = acl.iter().find(|a| a.who == Who::Group).unwrap();
        assert!(!group.mask.contains(AceMask::READ_DATA));
    }

    #[test]
    fn deny_entry_blocks_before_later_allow() {
        let mut acl = Acl::new();
        acl.push(Ace::deny(Who::Named(500), AceMask::WRITE_DATA));
        acl.push(Ace::allow(Who::Everyone, AceMask::READ_DATA | AceMask::WRITE_DATA));
        assert!(!evaluate(&acl, &principal(500, 500), 0, 0, AceMask::WRITE_DATA));
        assert!(evaluate(&acl, &principal(500, 500), 0, 0, AceMask::READ_DATA));
        assert!(evaluate(&acl, &principal(501, 501), 0, 0, AceMask::WRITE_DATA));
    }

    #[test]
    fn owner_matches_by_uid() {
        let acl = acl_from_mode(0o700);
        assert!(evaluate(&acl, &principal(42, 42), 42, 42, AceMask::READ_DATA));
        assert!(!evaluate(&acl, &principal(43, 43), 42, 42, AceMask::READ_DATA));
    }
}
