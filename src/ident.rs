//! Identity resolution.
//!
//! Every request enters the core carrying transport credentials; the
//! resolver turns them into a numeric principal `(uid, gid, gids)` plus a
//! per-share permission level. The Kerberos context cache and the token
//! machinery live outside the core; what arrives here is already a
//! verified name or a unix credential triple.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};

/// Access level a principal holds on a share.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Permission {
    None,
    Read,
    ReadWrite,
    Admin,
}

impl Permission {
    pub fn allows_read(&self) -> bool {
        *self >= Permission::Read
    }

    pub fn allows_write(&self) -> bool {
        *self >= Permission::ReadWrite
    }
}

/// Resolved request principal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Principal {
    /// The superuser principal used by internal maintenance operations.
    pub fn superuser() -> Principal {
        Principal { uid: 0, gid: 0, groups: vec![0] }
    }

    pub fn is_superuser(&self) -> bool {
        self.uid == 0
    }

    pub fn in_group(&self, gid: u32) -> bool {
        self.gid == gid || self.groups.contains(&gid)
    }
}

/// Transport credentials as decoded by the wire layer.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// AUTH_SYS / AUTH_UNIX: the client asserts its ids.
    Unix { uid: u32, gid: u32, gids: Vec<u32> },
    /// RPCSEC_GSS: a verified Kerberos principal name.
    Krb5 { principal: String },
    /// SMB2 session setup: username plus challenge/response proof.
    Smb { user: String, challenge: [u8; 8], proof: [u8; 32] },
    /// No credentials presented.
    Anonymous,
}

/// A configured user.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub member_groups: Vec<u32>,
    /// SHA-256 of the user's password, for the SMB challenge/response.
    pub password_hash: Option<[u8; 32]>,
    /// Per-share permission overrides; absent shares fall back to the
    /// share's default permission.
    pub share_permissions: HashMap<String, Permission>,
}

/// A configured group.
#[derive(Debug, Clone)]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

/// Computes the challenge/response proof for an SMB session setup.
///
/// The proof binds the session challenge to the stored password hash so
/// the cleartext password never crosses the wire.
pub fn smb_proof(challenge: &[u8; 8], password_hash: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(password_hash);
    hasher.finalize().into()
}

/// Resolves credentials against a snapshot of the user table.
#[derive(Debug, Default, Clone)]
pub struct IdentResolver {
    by_name: HashMap<String, Arc<User>>,
    by_uid: HashMap<u32, Arc<User>>,
}

impl IdentResolver {
    pub fn new(users: impl IntoIterator<Item = Arc<User>>) -> IdentResolver {
        let mut by_name = HashMap::new();
        let mut by_uid = HashMap::new();
        for user in users {
            by_uid.insert(user.uid, user.clone());
            by_name.insert(user.name.clone(), user);
        }
        IdentResolver { by_name, by_uid }
    }

    /// Resolves credentials to a principal.
    ///
    /// Unix credentials pass through as asserted. Kerberos principals are
    /// mapped by user name (the realm part is stripped by the GSS layer).
    /// SMB credentials must prove knowledge of the stored password hash.
    pub fn resolve(&self, creds: &Credentials) -> EngineResult<Principal> {
        match creds {
            Credentials::Unix { uid, gid, gids } => Ok(Principal {
                uid: *uid,
                gid: *gid,
                groups: gids.clone(),
            }),
            Credentials::Krb5 { principal } => {
                let user = self.by_name.get(principal).ok_or(EngineError::Perm)?;
                Ok(Principal {
                    uid: user.uid,
                    gid: user.gid,
                    groups: user.member_groups.clone(),
                })
            }
            Credentials::Smb { user, challenge, proof } => {
                let user = self.by_name.get(user).ok_or(EngineError::Perm)?;
                let hash = user.password_hash.as_ref().ok_or(EngineError::Perm)?;
                if &smb_proof(challenge, hash) != proof {
                    return Err(EngineError::Perm);
                }
                Ok(Principal {
                    uid: user.uid,
                    gid: user.gid,
                    groups: user.member_groups.clone(),
                })
            }
            Credentials::Anonymous => Err(EngineError::Perm),
        }
    }

    /// Permission the principal holds on the named share.
    ///
    /// A user-level override wins; otherwise the share default applies.
    pub fn permission_for(
        &self,
        principal: &Principal,
        share_name: &str,
        share_default: Permission,
    ) -> Permission {
        if let Some(user) = self.by_uid.get(&principal.uid) {
            if let Some(p) = user.share_permissions.get(share_name) {
                return *p;
            }
        }
        share_default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, uid: u32, password: &[u8]) -> Arc<User> {
        let mut hasher = Sha256::new();
        hasher.update(password);
        Arc::new(User {
            name: name.to_string(),
            uid,
            gid: uid,
            member_groups: vec![uid],
            password_hash: Some(hasher.finalize().into()),
            share_permissions: HashMap::from([("/export".to_string(), Permission::ReadWrite)]),
        })
    }

    #[test]
    fn unix_credentials_pass_through() {
        let resolver = IdentResolver::default();
        let p = resolver
            .resolve(&Credentials::Unix { uid: 1000, gid: 100, gids: vec![100, 20] })
            .unwrap();
        assert_eq!(p.uid, 1000);
        assert!(p.in_group(20));
    }

    #[test]
    fn smb_proof_must_match() {
        let resolver = IdentResolver::new([user("alice", 1000, b"secret")]);
        let challenge = [7u8; 8];
        let mut hasher = Sha256::new();
        hasher.update(b"secret");
        let hash: [u8; 32] = hasher.finalize().into();
        let good = smb_proof(&challenge, &hash);

        let ok = resolver.resolve(&Credentials::Smb {
            user: "alice".into(),
            challenge,
            proof: good,
        });
        assert!(ok.is_ok());

        let bad = resolver.resolve(&Credentials::Smb {
            user: "alice".into(),
            challenge,
            proof: [0u8; 32],
        });
        assert_eq!(bad.unwrap_err(), EngineError::Perm);
    }

    #[test]
    fn share_permission_falls_back_to_default() {
        let resolver = IdentResolver::new([user("alice", 1000, b"x")]);
        let alice = Principal { uid: 1000, gid: 1000, groups: vec![] };
        assert_eq!(
            resolver.permission_for(&alice, "/export", Permission::Read),
            Permission::ReadWrite
        );
        assert_eq!(
            resolver.permission_for(&alice, "/other", Permission::Read),
            Permission::Read
        );
    }
}
